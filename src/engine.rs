//! In-process crawl engine: the fallback topology used when the bus is
//! absent. A single coordinator task owns the domain scheduler; fetch workers
//! only ever touch the jobs/results channel pair.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use scraper::{Html, Selector};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use crate::cache::{PolitenessStore, RankingStore};
use crate::crawl::{extract_body_text, extract_title, MAX_TEXT_BYTES};
use crate::discovery::{is_likely_html, resolve_url};
use crate::embedding::Embedder;
use crate::netutil::{base_domain, read_capped, truncate_chars, ClientConfig, SafeHttpClient};
use crate::politeness::ROBOTS_TTL;
use crate::qdrant::{PointPayload, QdrantClient, COLLECTION_NAME};
use crate::robots::RobotsTxt;
use crate::scheduler::{Coordinator, CrawlOutcome, UrlJob};

const MISSING_ROBOTS_TTL: Duration = Duration::from_secs(60 * 60);
const MAX_TITLE_LEN: usize = 500;
const MAX_CONTENT_LEN: usize = 100_000;
const SNIPPET_LEN: usize = 200;

/// Durable destination for crawled pages.
#[async_trait]
pub trait DocumentStorage: Send + Sync {
    /// Persists one fetched page.
    async fn persist_document(
        &self,
        url: &str,
        title: &str,
        content: &str,
        namespace: &str,
    ) -> Result<()>;
}

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of fetch workers.
    pub concurrency: usize,
    /// Minimum interval between two requests to one domain.
    pub politeness: Duration,
    /// User agent for fetches and robots checks.
    pub user_agent: String,
    /// Namespace tag applied to persisted rows.
    pub namespace: String,
    /// Permit fetches against private address space (tests only).
    pub allow_internal: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 50,
            politeness: Duration::from_secs(2),
            user_agent: crate::crawl::USER_AGENT.to_string(),
            namespace: "default".to_string(),
            allow_internal: false,
        }
    }
}

/// Bus-less crawl engine over the fair domain scheduler.
pub struct Engine {
    storage: Arc<dyn DocumentStorage>,
    robots_cache: Arc<dyn PolitenessStore>,
    http: SafeHttpClient,
    config: EngineConfig,
}

struct FetchedPage {
    title: String,
    content: String,
    links: Vec<String>,
}

impl Engine {
    /// Builds an engine.
    pub fn new(
        storage: Arc<dyn DocumentStorage>,
        robots_cache: Arc<dyn PolitenessStore>,
        config: EngineConfig,
    ) -> Result<Self> {
        let http = SafeHttpClient::new(ClientConfig {
            timeout: Duration::from_secs(10),
            allow_internal: config.allow_internal,
            user_agent: config.user_agent.clone(),
        })?;
        Ok(Self {
            storage,
            robots_cache,
            http,
            config,
        })
    }

    /// Runs one crawl to completion or cancellation.
    ///
    /// `broad` mode clamps depth to 2 with no domain restriction; `targeted`
    /// clamps to 10 and restricts to the seed's base domain.
    pub async fn run(
        &self,
        shutdown: CancellationToken,
        seed_url: &str,
        max_depth: u32,
        crawl_mode: &str,
    ) -> Result<()> {
        info!(seed = %seed_url, mode = %crawl_mode, max_depth, "starting crawl");

        let (effective_max_depth, allowed_domain) = match crawl_mode {
            "broad" => (2, String::new()),
            "targeted" => {
                let domain = base_domain(seed_url)
                    .context("failed to get base domain for targeted crawl")?;
                (10, domain)
            }
            _ => (max_depth, String::new()),
        };

        let (jobs_tx, jobs_rx) = mpsc::channel::<UrlJob>(1);
        let jobs_rx = Arc::new(tokio::sync::Mutex::new(jobs_rx));
        let (results_tx, mut results_rx) = mpsc::channel::<CrawlOutcome>(self.config.concurrency.max(1));

        let mut workers = tokio::task::JoinSet::new();
        for _ in 0..self.config.concurrency.max(1) {
            let jobs_rx = Arc::clone(&jobs_rx);
            let results_tx = results_tx.clone();
            let shutdown = shutdown.clone();
            let engine = self.clone_parts();
            workers.spawn(async move {
                loop {
                    let job = tokio::select! {
                        _ = shutdown.cancelled() => return,
                        job = async { jobs_rx.lock().await.recv().await } => job,
                    };
                    let Some(job) = job else { return };
                    let outcome = engine.handle_job(job).await;
                    if results_tx.send(outcome).await.is_err() {
                        return;
                    }
                }
            });
        }
        drop(results_tx);

        let mut coordinator = Coordinator::new(self.config.politeness);
        coordinator.add_url(seed_url, 0, effective_max_depth, &allowed_domain);

        let mut pending: Option<UrlJob> = None;
        while coordinator.has_work() || pending.is_some() {
            if shutdown.is_cancelled() {
                break;
            }
            if pending.is_none() {
                pending = coordinator.next_job();
            }

            if let Some(job) = pending.take() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    permit = jobs_tx.reserve() => {
                        match permit {
                            Ok(permit) => {
                                permit.send(job);
                                coordinator.increment_active_workers();
                            }
                            Err(_) => break,
                        }
                    }
                    outcome = results_rx.recv() => {
                        pending = Some(job);
                        match outcome {
                            Some(outcome) => coordinator.process_outcome(outcome),
                            None => break,
                        }
                    }
                }
            } else if coordinator.active_workers() > 0 {
                match results_rx.recv().await {
                    Some(outcome) => coordinator.process_outcome(outcome),
                    None => break,
                }
            } else {
                let wait = coordinator.time_to_next_job().max(Duration::from_millis(10));
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }

        drop(jobs_tx);
        while workers.join_next().await.is_some() {}
        info!(seed = %seed_url, "crawl finished");
        Ok(())
    }

    fn clone_parts(&self) -> EngineWorker {
        EngineWorker {
            storage: Arc::clone(&self.storage),
            robots_cache: Arc::clone(&self.robots_cache),
            http: self.http.clone(),
            user_agent: self.config.user_agent.clone(),
            namespace: self.config.namespace.clone(),
        }
    }
}

struct EngineWorker {
    storage: Arc<dyn DocumentStorage>,
    robots_cache: Arc<dyn PolitenessStore>,
    http: SafeHttpClient,
    user_agent: String,
    namespace: String,
}

impl EngineWorker {
    async fn handle_job(&self, job: UrlJob) -> CrawlOutcome {
        let mut outcome = CrawlOutcome {
            url: job.url.clone(),
            depth: job.depth,
            max_depth: job.max_depth,
            allowed_domain: job.allowed_domain.clone(),
            ..CrawlOutcome::default()
        };

        if !self.is_allowed(&job.url).await {
            outcome.error = Some("robots not permitted".to_string());
            return outcome;
        }

        match self.fetch_and_parse(&job.url).await {
            Ok(page) => {
                if let Err(err) = self
                    .storage
                    .persist_document(&job.url, &page.title, &page.content, &self.namespace)
                    .await
                {
                    warn!(url = %job.url, error = %err, "persist failed");
                }
                outcome.title = page.title;
                outcome.content = page.content;
                outcome.links = page.links;
            }
            Err(err) => outcome.error = Some(err.to_string()),
        }
        outcome
    }

    // Fail-closed: server errors and unreachable hosts block the fetch.
    async fn is_allowed(&self, target_url: &str) -> bool {
        let Ok(url) = Url::parse(target_url) else {
            return false;
        };
        let Some(host) = url.host_str() else {
            return false;
        };
        let authority = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        let cached = self.robots_cache.robots_body(&authority).await.ok().flatten();
        let body = match cached {
            Some(body) => body,
            None => {
                let robots_url = format!("{}://{authority}/robots.txt", url.scheme());
                let response = match self.http.get(&robots_url).await {
                    Ok(response) => response,
                    Err(_) => return false,
                };
                let status = response.status();
                if status.is_server_error() {
                    return false;
                }
                if status == reqwest::StatusCode::NOT_FOUND {
                    let _ = self
                        .robots_cache
                        .store_robots(&authority, "", MISSING_ROBOTS_TTL)
                        .await;
                    return true;
                }
                let body = match read_capped(response, 64 * 1024).await {
                    Ok(body) => String::from_utf8_lossy(&body).into_owned(),
                    Err(_) => return false,
                };
                let _ = self
                    .robots_cache
                    .store_robots(&authority, &body, ROBOTS_TTL)
                    .await;
                body
            }
        };

        if body.is_empty() {
            return true;
        }
        RobotsTxt::parse(&body).is_allowed(&self.user_agent, url.path())
    }

    async fn fetch_and_parse(&self, url: &str) -> Result<FetchedPage> {
        let response = self.http.get(url).await?;
        let status = response.status();
        if !status.is_success() {
            bail!("bad status: {}", status.as_u16());
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if !content_type.contains("text/html") {
            bail!("non-html content");
        }

        let body = read_capped(response, MAX_TEXT_BYTES).await?;
        let body = String::from_utf8_lossy(&body);
        let html = Html::parse_document(&body);

        let title = extract_title(&html).unwrap_or_else(|| url.to_string());
        let content = extract_body_text(&html);

        let selector = Selector::parse("a[href]").expect("anchor selector");
        let mut links = Vec::new();
        for anchor in html.select(&selector) {
            let Some(href) = anchor.value().attr("href") else {
                continue;
            };
            if let Some(resolved) = resolve_url(url, href) {
                if is_likely_html(&resolved) {
                    links.push(resolved);
                }
            }
        }

        Ok(FetchedPage {
            title,
            content,
            links,
        })
    }
}

/// Production storage: relational row, vector upsert and autocomplete term.
pub struct IndexingStorage {
    db: Arc<tokio_postgres::Client>,
    vectors: Arc<QdrantClient>,
    embedder: Embedder,
    ranking: Arc<dyn RankingStore>,
}

impl IndexingStorage {
    /// Wires the storage fan-out together.
    pub fn new(
        db: Arc<tokio_postgres::Client>,
        vectors: Arc<QdrantClient>,
        embedder: Embedder,
        ranking: Arc<dyn RankingStore>,
    ) -> Self {
        Self {
            db,
            vectors,
            embedder,
            ranking,
        }
    }
}

#[async_trait]
impl DocumentStorage for IndexingStorage {
    async fn persist_document(
        &self,
        url: &str,
        title: &str,
        content: &str,
        namespace: &str,
    ) -> Result<()> {
        let title = truncate_chars(title, MAX_TITLE_LEN);
        let content = truncate_chars(content, MAX_CONTENT_LEN);
        let domain = crate::postgres::extract_domain(url);
        let hash = crate::postgres::content_hash(content);

        self.db
            .execute(
                "INSERT INTO documents (id, domain, source, title, content, namespace, content_hash, crawled_at, last_seen_at)
                 VALUES ($1, $2, 'web', $3, $4, $5, $6, NOW(), NOW())
                 ON CONFLICT (id) DO UPDATE SET
                    title = EXCLUDED.title,
                    content = EXCLUDED.content,
                    content_hash = EXCLUDED.content_hash,
                    last_seen_at = NOW()",
                &[&url, &domain, &title, &content, &namespace, &hash],
            )
            .await
            .context("document upsert failed")?;

        let snippet = if content.len() > SNIPPET_LEN {
            format!("{}...", truncate_chars(content, SNIPPET_LEN))
        } else {
            content.to_string()
        };

        match self
            .embedder
            .compute(&format!("{title} {snippet}"), false)
            .await
        {
            Ok(vector) => {
                let payload = PointPayload {
                    url: url.to_string(),
                    title: title.to_string(),
                    snippet,
                };
                if let Err(err) = self
                    .vectors
                    .upsert(COLLECTION_NAME, url, &payload, &vector)
                    .await
                {
                    warn!(url = %url, error = %err, "vector upsert failed");
                }
            }
            Err(err) => warn!(url = %url, error = %err, "embedding failed"),
        }

        if !title.is_empty() {
            if let Err(err) = self.ranking.register_term(&title.to_lowercase()).await {
                warn!(error = %err, "autocomplete term registration failed");
            }
        }

        Ok(())
    }
}
