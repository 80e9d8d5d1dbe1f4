//! Page fetching: the standard crawler processor, HTML text extraction and
//! the smart dispatcher that falls back to a headless render service.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::CONTENT_TYPE;
use scraper::{ElementRef, Html, Node, Selector};
use tracing::info;

use crate::document::{Document, SOURCE_WEB};
use crate::flow::Processor;
use crate::netutil::{read_capped, ClientConfig, SafeHttpClient};

/// User agent announced on every page fetch.
pub const USER_AGENT: &str = "RarefactorBot/2.0";
/// Body cap for full-page fetches.
pub const MAX_PAGE_BYTES: usize = 5 * 1024 * 1024;
/// Body cap for text-only fetches (in-process engine).
pub const MAX_TEXT_BYTES: usize = 2 * 1024 * 1024;

const STRIP_TAGS: [&str; 8] = [
    "script", "style", "noscript", "iframe", "svg", "nav", "footer", "header",
];
const CONTENT_SELECTOR: &str = "h1, h2, h3, p, li, td, blockquote, article, main";

fn is_stripped(tag: &str) -> bool {
    STRIP_TAGS.contains(&tag)
}

fn has_stripped_ancestor(el: ElementRef<'_>) -> bool {
    el.ancestors()
        .filter_map(|node| node.value().as_element())
        .any(|element| is_stripped(element.name()))
}

fn collect_text(el: ElementRef<'_>, out: &mut String) {
    for child in el.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(element) => {
                if is_stripped(element.name()) {
                    continue;
                }
                if let Some(child_el) = ElementRef::wrap(child) {
                    collect_text(child_el, out);
                }
            }
            _ => {}
        }
    }
}

/// Extracts the trimmed `<title>`, if present and non-empty.
pub fn extract_title(html: &Html) -> Option<String> {
    let selector = Selector::parse("title").expect("title selector");
    let title: String = html.select(&selector).next()?.text().collect();
    let title = title.trim().to_string();
    (!title.is_empty()).then_some(title)
}

/// Whitespace-collapsed text of the content-bearing elements.
///
/// Boilerplate containers (`script`, `style`, `nav`, ...) are removed both
/// as matches and as descendants of matches.
pub fn extract_text(html: &Html) -> String {
    let selector = Selector::parse(CONTENT_SELECTOR).expect("content selector");
    let mut raw = String::new();
    for el in html.select(&selector) {
        if has_stripped_ancestor(el) {
            continue;
        }
        collect_text(el, &mut raw);
        raw.push(' ');
    }
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whitespace-collapsed text of the whole `<body>`, boilerplate stripped.
///
/// Used by the in-process engine, which indexes full page text rather than
/// the content-element subset.
pub fn extract_body_text(html: &Html) -> String {
    let selector = Selector::parse("body").expect("body selector");
    let mut raw = String::new();
    if let Some(body) = html.select(&selector).next() {
        collect_text(body, &mut raw);
    }
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Fetches a document's URL and replaces its content with extracted text.
pub struct CrawlerProcessor {
    client: SafeHttpClient,
}

impl CrawlerProcessor {
    /// Builds a crawler with SSRF protection enabled.
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: SafeHttpClient::new(ClientConfig {
                timeout: Duration::from_secs(10),
                allow_internal: false,
                user_agent: USER_AGENT.to_string(),
            })?,
        })
    }

    /// Builds a crawler over a caller-provided client (tests, engine reuse).
    pub fn with_client(client: SafeHttpClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Processor<Document<String>> for CrawlerProcessor {
    async fn process(&self, doc: Document<String>) -> Result<Vec<Document<String>>> {
        let response = self.client.get(&doc.id).await?;
        let status = response.status();
        if !status.is_success() {
            bail!("status {}", status.as_u16());
        }

        if let Some(content_type) = response.headers().get(CONTENT_TYPE) {
            let value = content_type.to_str().unwrap_or_default();
            if !value.contains("html") {
                bail!("non-html content type: {value}");
            }
        }

        let body = read_capped(response, MAX_PAGE_BYTES).await?;
        let body = String::from_utf8_lossy(&body);
        let html = Html::parse_document(&body);

        let title = extract_title(&html).unwrap_or_else(|| doc.id.clone());
        let text = extract_text(&html);

        let mut out = doc.clone();
        out.content = text;
        out.source = SOURCE_WEB.to_string();
        out.set_meta("title", title);
        out.set_meta("http_status", status.as_u16() as i64);
        out.set_meta("crawled_at", Utc::now().timestamp());

        Ok(vec![out])
    }
}

/// Renders a URL through an external headless-browser HTTP service.
pub struct RenderServiceProcessor {
    endpoint: String,
    client: reqwest::Client,
}

#[derive(serde::Serialize)]
struct RenderRequest<'a> {
    url: &'a str,
}

#[derive(serde::Deserialize)]
struct RenderResponse {
    html: String,
}

impl RenderServiceProcessor {
    /// Points the processor at the render service base URL.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .context("failed to build render client")?;
        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl Processor<Document<String>> for RenderServiceProcessor {
    async fn process(&self, doc: Document<String>) -> Result<Vec<Document<String>>> {
        let response = self
            .client
            .post(format!("{}/render", self.endpoint))
            .json(&RenderRequest { url: &doc.id })
            .send()
            .await
            .with_context(|| format!("render service unreachable at {}", self.endpoint))?;

        if !response.status().is_success() {
            bail!("render service returned status {}", response.status().as_u16());
        }

        let rendered: RenderResponse = response
            .json()
            .await
            .context("failed to decode render response")?;
        let html = Html::parse_document(&rendered.html);

        let mut out = doc.clone();
        out.content = extract_text(&html);
        out.source = SOURCE_WEB.to_string();
        out.set_meta(
            "title",
            extract_title(&html).unwrap_or_else(|| doc.id.clone()),
        );
        out.set_meta("is_spa_render", true);
        out.set_meta("crawled_at", Utc::now().timestamp());

        Ok(vec![out])
    }
}

/// Routes between the standard crawler and the headless render backend.
///
/// Pre-routes on explicit hints (`force_render`, SPA-looking URLs); after a
/// standard fetch, falls back to rendering when the extracted text is sparse
/// or carries single-page-app root markers.
pub struct SmartCrawler {
    standard: CrawlerProcessor,
    spa: Arc<dyn Processor<Document<String>>>,
}

impl SmartCrawler {
    /// Combines a standard crawler with a render backend.
    pub fn new(standard: CrawlerProcessor, spa: Arc<dyn Processor<Document<String>>>) -> Self {
        Self { standard, spa }
    }

    fn wants_render(doc: &Document<String>) -> bool {
        if doc.meta_bool("force_render").unwrap_or(false) {
            return true;
        }
        if doc.id.contains("/app.") || doc.id.contains("dashboard") {
            return true;
        }
        doc.id.ends_with(".js") || doc.id.ends_with(".jsx") || doc.id.ends_with(".tsx")
    }

    fn looks_like_spa(content: &str) -> bool {
        content.len() < 200 || content.contains("id=\"root\"") || content.contains("id=\"app\"")
    }
}

#[async_trait]
impl Processor<Document<String>> for SmartCrawler {
    async fn process(&self, doc: Document<String>) -> Result<Vec<Document<String>>> {
        let mut doc = doc;
        if Self::wants_render(&doc) {
            info!(url = %doc.id, "routing to headless renderer");
            doc.set_meta("crawler_type", "spa");
            return self.spa.process(doc).await;
        }

        doc.set_meta("crawler_type", "standard");
        let results = self.standard.process(doc.clone()).await;

        if let Ok(results) = &results {
            if let Some(first) = results.first() {
                if Self::looks_like_spa(&first.content) {
                    info!(url = %doc.id, "sparse or SPA-marked content, falling back to renderer");
                    doc.set_meta("crawler_type", "spa");
                    return self.spa.process(doc).await;
                }
            }
        }

        results
    }
}
