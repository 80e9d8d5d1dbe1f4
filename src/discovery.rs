//! Link discovery: turns fetched pages into fresh seed documents.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use scraper::{Html, Selector};
use tracing::debug;
use url::Url;

use crate::document::{Document, SOURCE_API_TRIGGER, SOURCE_DISCOVERY, SOURCE_WEB};
use crate::flow::Processor;
use crate::netutil::base_domain;

const MAX_URL_LEN: usize = 2048;
const BLOCKED_EXTENSIONS: [&str; 11] = [
    ".jpg", ".jpeg", ".png", ".gif", ".pdf", ".zip", ".webp", ".mp4", ".mp3", ".js", ".css",
];

// Metadata carried from parent to discovered children so the politeness gate
// and the job counters keep working across hops.
const INHERITED_KEYS: [&str; 4] = ["job_id", "max_depth", "mode", "allowed_domain"];

/// Resolves a reference against a base URL, dropping oversized results.
pub fn resolve_url(base: &str, reference: &str) -> Option<String> {
    if reference.len() > MAX_URL_LEN {
        return None;
    }
    let base = Url::parse(base).ok()?;
    if base.scheme().is_empty() || base.host_str().is_none() {
        return None;
    }
    let resolved = base.join(reference).ok()?.to_string();
    (resolved.len() <= MAX_URL_LEN).then_some(resolved)
}

/// Heuristic filter: HTTP(S) URLs whose path does not end in a known
/// non-HTML asset extension.
pub fn is_likely_html(url: &str) -> bool {
    let lower = url.to_lowercase();
    if !lower.starts_with("http") {
        return false;
    }
    !BLOCKED_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Emits one fresh document per viable link found in the page content.
pub struct DiscoveryProcessor;

impl DiscoveryProcessor {
    /// Builds the processor.
    pub fn new() -> Self {
        Self
    }
}

impl Default for DiscoveryProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Processor<Document<String>> for DiscoveryProcessor {
    async fn process(&self, doc: Document<String>) -> Result<Vec<Document<String>>> {
        let source_allowed = matches!(
            doc.source.as_str(),
            SOURCE_WEB | SOURCE_DISCOVERY | SOURCE_API_TRIGGER
        );
        if !source_allowed || doc.content.is_empty() {
            return Ok(Vec::new());
        }

        // max_depth of 0 means unlimited.
        let max_depth = doc.meta_i64("max_depth").unwrap_or(0);
        if max_depth > 0 && i64::from(doc.depth) >= max_depth {
            return Ok(Vec::new());
        }

        let allowed_domain = doc.meta_str("allowed_domain").unwrap_or("").to_string();

        let html = Html::parse_document(&doc.content);
        let selector = Selector::parse("a[href]").expect("anchor selector");

        let mut discovered = Vec::new();
        for anchor in html.select(&selector) {
            let Some(href) = anchor.value().attr("href") else {
                continue;
            };
            let Some(resolved) = resolve_url(&doc.id, href) else {
                continue;
            };
            if !is_likely_html(&resolved) {
                continue;
            }
            if !allowed_domain.is_empty() {
                match base_domain(&resolved) {
                    Ok(base) if base == allowed_domain => {}
                    _ => continue,
                }
            }

            let mut child: Document<String> = Document::new(resolved, SOURCE_DISCOVERY);
            child.depth = doc.depth + 1;
            child.created_at = Utc::now();
            for key in INHERITED_KEYS {
                if let Some(value) = doc.metadata.get(key) {
                    child.metadata.insert(key.to_string(), value.clone());
                }
            }
            discovered.push(child);
        }

        debug!(url = %doc.id, links = discovered.len(), "link discovery complete");
        Ok(discovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(source: &str, depth: u32, max_depth: i64, content: &str) -> Document<String> {
        let mut doc: Document<String> = Document::new("https://example.com", source);
        doc.depth = depth;
        doc.content = content.to_string();
        doc.set_meta("max_depth", max_depth);
        doc
    }

    #[tokio::test]
    async fn depth_at_max_short_circuits() {
        let proc = DiscoveryProcessor::new();
        let results = proc
            .process(page(SOURCE_WEB, 5, 5, "<a href='/link'></a>"))
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn unknown_source_short_circuits() {
        let proc = DiscoveryProcessor::new();
        let results = proc
            .process(page("unknown", 0, 5, "<a href='/link'></a>"))
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn resolves_relative_and_absolute_links() {
        let proc = DiscoveryProcessor::new();
        let results = proc
            .process(page(
                SOURCE_WEB,
                4,
                5,
                "<html><body><a href='/link'>Link</a><a href='http://external.com'>Ext</a></body></html>",
            ))
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "https://example.com/link");
        assert_eq!(results[0].source, SOURCE_DISCOVERY);
        assert_eq!(results[0].depth, 5);
    }

    #[tokio::test]
    async fn max_depth_zero_means_unlimited() {
        let proc = DiscoveryProcessor::new();
        let results = proc
            .process(page(SOURCE_WEB, 0, 0, "<a href='/link'></a>"))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn float_max_depth_tolerated() {
        let proc = DiscoveryProcessor::new();
        let mut doc = page(SOURCE_WEB, 4, 0, "<a href='/link'></a>");
        doc.metadata.insert(
            "max_depth".to_string(),
            crate::document::MetaValue::Float(5.0),
        );
        let results = proc.process(doc).await.unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn asset_links_filtered() {
        let proc = DiscoveryProcessor::new();
        let results = proc
            .process(page(
                SOURCE_WEB,
                0,
                5,
                "<a href='/photo.JPG'></a><a href='/app.js'></a>\
                 <a href='mailto:x@example.com'></a><a href='/page'></a>",
            ))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "https://example.com/page");
    }

    #[tokio::test]
    async fn allowed_domain_restricts_discovery() {
        let proc = DiscoveryProcessor::new();
        let mut doc = page(
            SOURCE_WEB,
            0,
            5,
            "<a href='/inside'></a><a href='http://other.com/out'></a>",
        );
        doc.set_meta("allowed_domain", "example.com");
        doc.set_meta("job_id", "job-7");

        let results = proc.process(doc).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "https://example.com/inside");
        assert_eq!(results[0].meta_str("job_id"), Some("job-7"));
        assert_eq!(results[0].meta_str("allowed_domain"), Some("example.com"));
    }

    #[test]
    fn oversized_references_dropped() {
        let long = format!("/{}", "a".repeat(3000));
        assert!(resolve_url("https://example.com", &long).is_none());
        assert_eq!(
            resolve_url("https://example.com/dir/", "page").as_deref(),
            Some("https://example.com/dir/page")
        );
    }
}
