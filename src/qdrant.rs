//! Vector-store client over the Qdrant HTTP API, plus the indexing sink.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::document::Document;
use crate::flow::Sink;
use crate::netutil::truncate_chars;

/// Collection holding document points.
pub const COLLECTION_NAME: &str = "documents";
/// Embedding dimensionality of the collection.
pub const VECTOR_DIM: usize = 768;

/// Payload stored alongside every point.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PointPayload {
    /// Source URL.
    pub url: String,
    /// Page title.
    pub title: String,
    /// Short human-readable snippet.
    pub snippet: String,
}

/// One nearest-neighbor hit.
#[derive(Debug, Clone, Deserialize)]
pub struct ScoredPoint {
    /// Similarity score.
    pub score: f32,
    /// Stored payload.
    #[serde(default)]
    pub payload: PointPayload,
}

#[derive(Serialize)]
struct CreateCollectionRequest {
    vectors: VectorParams,
}

#[derive(Serialize)]
struct VectorParams {
    size: usize,
    distance: &'static str,
}

#[derive(Serialize)]
struct UpsertRequest<'a> {
    points: Vec<Point<'a>>,
}

#[derive(Serialize)]
struct Point<'a> {
    id: String,
    vector: &'a [f32],
    payload: &'a PointPayload,
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    vector: &'a [f32],
    limit: usize,
    with_payload: bool,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    result: Vec<ScoredPoint>,
}

/// Thin JSON client for the vector store.
#[derive(Clone)]
pub struct QdrantClient {
    base_url: String,
    client: reqwest::Client,
}

impl QdrantClient {
    /// Builds a client; an empty URL falls back to localhost.
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = if base_url.is_empty() {
            "http://localhost:6333"
        } else {
            base_url
        };
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .context("failed to build qdrant client")?,
        })
    }

    /// Deterministic point id: UUIDv5 of the document id in the URL namespace.
    pub fn point_id(doc_id: &str) -> String {
        Uuid::new_v5(&Uuid::NAMESPACE_URL, doc_id.as_bytes()).to_string()
    }

    /// Creates the collection when missing (768-dim cosine).
    pub async fn ensure_collection(&self, name: &str) -> Result<()> {
        let url = format!("{}/collections/{name}", self.base_url);
        let exists = self.client.get(&url).send().await?.status().is_success();
        if exists {
            return Ok(());
        }

        let response = self
            .client
            .put(&url)
            .json(&CreateCollectionRequest {
                vectors: VectorParams {
                    size: VECTOR_DIM,
                    distance: "Cosine",
                },
            })
            .send()
            .await
            .context("qdrant collection create failed")?;
        if !response.status().is_success() {
            bail!(
                "qdrant collection create returned status {}",
                response.status().as_u16()
            );
        }
        Ok(())
    }

    /// Upserts one point keyed by the document id.
    pub async fn upsert(
        &self,
        collection: &str,
        doc_id: &str,
        payload: &PointPayload,
        vector: &[f32],
    ) -> Result<()> {
        let url = format!(
            "{}/collections/{collection}/points?wait=true",
            self.base_url
        );
        let response = self
            .client
            .put(&url)
            .json(&UpsertRequest {
                points: vec![Point {
                    id: Self::point_id(doc_id),
                    vector,
                    payload,
                }],
            })
            .send()
            .await
            .context("qdrant upsert failed")?;
        if !response.status().is_success() {
            bail!("qdrant upsert returned status {}", response.status().as_u16());
        }
        Ok(())
    }

    /// Nearest-neighbor search with payloads.
    pub async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredPoint>> {
        let url = format!("{}/collections/{collection}/points/search", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&SearchRequest {
                vector,
                limit,
                with_payload: true,
            })
            .send()
            .await
            .context("qdrant query failed")?;
        if !response.status().is_success() {
            bail!("qdrant query returned status {}", response.status().as_u16());
        }
        let body: SearchResponse = response
            .json()
            .await
            .context("failed to decode qdrant response")?;
        Ok(body.result)
    }
}

/// Indexes documents carrying `metadata.vector` into the vector store.
pub struct QdrantSink {
    client: Arc<QdrantClient>,
    collection: String,
}

impl QdrantSink {
    /// Builds a sink over a collection.
    pub fn new(client: Arc<QdrantClient>, collection: &str) -> Self {
        Self {
            client,
            collection: collection.to_string(),
        }
    }
}

#[async_trait]
impl Sink<Document<String>> for QdrantSink {
    async fn write(&self, doc: Document<String>) -> Result<()> {
        let Some(vector) = doc.metadata.get("vector").and_then(|v| v.as_vector()) else {
            bail!("document {} missing vector data", doc.id);
        };

        let snippet = match doc.meta_str("summary") {
            Some(summary) if !summary.is_empty() => summary.to_string(),
            _ => truncate_chars(&doc.content, 200).to_string(),
        };
        let payload = PointPayload {
            url: doc.id.clone(),
            title: doc.meta_str("title").unwrap_or_default().to_string(),
            snippet,
        };

        self.client
            .upsert(&self.collection, &doc.id, &payload, vector)
            .await
    }
}
