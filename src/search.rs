//! Query path: vector search and prefix autocomplete over the indexed corpus.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::warn;

use crate::cache::RankingStore;
use crate::embedding::Embedder;
use crate::qdrant::{QdrantClient, COLLECTION_NAME};

/// One search result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    /// Source URL.
    pub url: String,
    /// Page title.
    pub title: String,
    /// Similarity score.
    pub score: f32,
}

/// Search response payload.
#[derive(Debug, Clone, Serialize, Default)]
pub struct SearchResults {
    /// Ranked hits.
    pub results: Vec<SearchHit>,
    /// Number of hits returned.
    pub total_hits: usize,
}

/// Autocomplete response payload.
#[derive(Debug, Clone, Serialize, Default)]
pub struct AutocompleteResult {
    /// Ranked suggestions.
    pub suggestions: Vec<String>,
    /// Server-side latency in milliseconds.
    pub duration_ms: f64,
}

/// Serves vector search and autocomplete.
pub struct SearchService {
    ranking: Arc<dyn RankingStore>,
    vectors: Arc<QdrantClient>,
    embedder: Embedder,
}

impl SearchService {
    /// Wires the query path together.
    pub fn new(ranking: Arc<dyn RankingStore>, vectors: Arc<QdrantClient>, embedder: Embedder) -> Self {
        Self {
            ranking,
            vectors,
            embedder,
        }
    }

    /// Embeds the query and returns nearest neighbors.
    ///
    /// Every non-empty query also bumps the global popularity score that
    /// autocomplete ranks by; a ranking-store failure never fails a search.
    pub async fn search(&self, query: &str, limit: usize) -> Result<SearchResults> {
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return Ok(SearchResults::default());
        }

        if let Err(err) = self.ranking.bump_query_score(&query).await {
            warn!(error = %err, "query score bump failed");
        }

        let vector = self
            .embedder
            .compute(&query, true)
            .await
            .context("embedding failed")?;

        let limit = if limit == 0 { 10 } else { limit };
        let points = self
            .vectors
            .query(COLLECTION_NAME, &vector, limit)
            .await
            .context("vector query failed")?;

        let results: Vec<SearchHit> = points
            .into_iter()
            .map(|point| SearchHit {
                url: point.payload.url,
                title: point.payload.title,
                score: point.score,
            })
            .collect();

        Ok(SearchResults {
            total_hits: results.len(),
            results,
        })
    }

    /// Prefix scan over the autocomplete set, ranked by query popularity with
    /// lexicographic tie-breaks.
    pub async fn autocomplete(&self, prefix: &str, limit: usize) -> Result<AutocompleteResult> {
        let start = Instant::now();
        let prefix = prefix.trim().to_lowercase();
        if prefix.is_empty() {
            return Ok(AutocompleteResult::default());
        }

        let limit = if limit == 0 { 10 } else { limit };
        let terms = self.ranking.terms_with_prefix(&prefix, limit * 2).await?;
        if terms.is_empty() {
            return Ok(AutocompleteResult {
                suggestions: Vec::new(),
                duration_ms: start.elapsed().as_secs_f64() * 1000.0,
            });
        }

        let scores = self.ranking.term_scores(&terms).await?;
        let mut scored: Vec<(String, f64)> = terms.into_iter().zip(scores).collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });

        Ok(AutocompleteResult {
            suggestions: scored.into_iter().take(limit).map(|(term, _)| term).collect(),
            duration_ms: start.elapsed().as_secs_f64() * 1000.0,
        })
    }
}
