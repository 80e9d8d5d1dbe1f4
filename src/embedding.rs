//! Dense-vector computation against a remote embeddings endpoint.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::document::Document;
use crate::flow::Processor;

const EMBEDDING_MODEL: &str = "nomic-ai/nomic-embed-text-v1.5";
const EMBEDDING_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Serialize)]
struct EmbedRequest<'a> {
    input: Vec<&'a str>,
    model: &'a str,
    task: &'a str,
}

#[derive(Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    data: Vec<EmbedData>,
}

#[derive(Deserialize)]
struct EmbedData {
    embedding: Vec<f32>,
}

/// HTTP client for the `/embeddings` endpoint, shared by the indexing path
/// (documents) and the query path (searches).
#[derive(Clone)]
pub struct Embedder {
    base_url: String,
    client: reqwest::Client,
}

impl Embedder {
    /// Builds an embedder against a base URL such as `http://host:7997/v1`.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let mut base_url = base_url.into();
        if base_url.is_empty() {
            base_url = "http://localhost:7997/v1".to_string();
        }
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(EMBEDDING_TIMEOUT)
                .build()
                .context("failed to build embedding client")?,
        })
    }

    /// Computes one embedding; `is_query` selects the asymmetric query task.
    pub async fn compute(&self, text: &str, is_query: bool) -> Result<Vec<f32>> {
        let task = if is_query {
            "search_query"
        } else {
            "search_document"
        };

        let url = if self.base_url.ends_with("/embeddings") {
            self.base_url.clone()
        } else {
            format!("{}/embeddings", self.base_url)
        };

        let response = self
            .client
            .post(&url)
            .json(&EmbedRequest {
                input: vec![text],
                model: EMBEDDING_MODEL,
                task,
            })
            .send()
            .await
            .with_context(|| format!("embedding service unreachable at {url}"))?;

        if !response.status().is_success() {
            bail!(
                "embedding service returned status {}",
                response.status().as_u16()
            );
        }

        let body: EmbedResponse = response
            .json()
            .await
            .context("failed to decode embedding response")?;
        match body.data.into_iter().next() {
            Some(data) => Ok(data.embedding),
            None => bail!("empty embedding response"),
        }
    }
}

/// Attaches `metadata.vector` to documents, preferring cleaned content.
///
/// Documents without any text pass through untouched.
pub struct EmbeddingProcessor {
    embedder: Embedder,
}

impl EmbeddingProcessor {
    /// Builds a processor against the embeddings endpoint.
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        Ok(Self {
            embedder: Embedder::new(endpoint)?,
        })
    }
}

#[async_trait]
impl Processor<Document<String>> for EmbeddingProcessor {
    async fn process(&self, doc: Document<String>) -> Result<Vec<Document<String>>> {
        let mut out = doc.clone();
        let text = if out.cleaned_content.is_empty() {
            out.content.clone()
        } else {
            out.cleaned_content.clone()
        };

        if text.is_empty() {
            return Ok(vec![out]);
        }

        let vector = self.embedder.compute(&text, false).await?;
        out.set_meta("vector", vector);
        Ok(vec![out])
    }
}
