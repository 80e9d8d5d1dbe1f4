//! The politeness gate: the single choke-point between "a URL exists" and
//! "a worker fetches it".

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;
use url::Url;

use crate::cache::PolitenessStore;
use crate::document::Document;
use crate::errors::CrawlError;
use crate::flow::Processor;
use crate::netutil::{base_domain, read_capped, ClientConfig, SafeHttpClient};
use crate::robots::RobotsTxt;

/// TTL for cached robots.txt bodies.
pub const ROBOTS_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// TTL for per-URL visited markers.
pub const VISITED_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);
const ROBOTS_BODY_CAP: usize = 64 * 1024;

/// Processor 0 of every crawl topology.
///
/// Enforces, in order: URL validity, the depth ceiling, visited dedup,
/// robots.txt, the per-domain page quota and the logarithmic politeness
/// penalty. A document rejected for the penalty leaves external state exactly
/// as it was found.
pub struct PolitenessGate {
    store: Arc<dyn PolitenessStore>,
    user_agent: String,
    http: SafeHttpClient,
    max_depth: u32,
    max_pages_per_domain: i64,
    robots_fail_closed: bool,
}

impl PolitenessGate {
    /// Builds a gate with the distributed default of fail-open robots fetches.
    pub fn new(
        store: Arc<dyn PolitenessStore>,
        user_agent: impl Into<String>,
        max_depth: u32,
        max_pages_per_domain: i64,
        allow_internal: bool,
    ) -> Result<Self> {
        let user_agent = user_agent.into();
        let http = SafeHttpClient::new(ClientConfig {
            timeout: Duration::from_secs(5),
            allow_internal,
            user_agent: user_agent.clone(),
        })?;
        Ok(Self {
            store,
            user_agent,
            http,
            max_depth,
            max_pages_per_domain,
            robots_fail_closed: false,
        })
    }

    /// Rejects URLs when the robots.txt fetch itself fails.
    pub fn robots_fail_closed(mut self, fail_closed: bool) -> Self {
        self.robots_fail_closed = fail_closed;
        self
    }

    async fn robots_data(&self, url: &Url) -> Result<String> {
        let authority = match url.port() {
            Some(port) => format!("{}:{port}", url.host_str().unwrap_or_default()),
            None => url.host_str().unwrap_or_default().to_string(),
        };

        if let Some(body) = self.store.robots_body(&authority).await? {
            return Ok(body);
        }

        let robots_url = format!("{}://{authority}/robots.txt", url.scheme());
        let response = self
            .http
            .get(&robots_url)
            .await
            .with_context(|| format!("robots fetch failed for {authority}"))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            self.store.store_robots(&authority, "", ROBOTS_TTL).await?;
            return Ok(String::new());
        }
        if status.is_server_error() {
            bail!("robots fetch for {authority} returned status {status}");
        }

        let body = read_capped(response, ROBOTS_BODY_CAP).await?;
        let body = String::from_utf8_lossy(&body).into_owned();
        self.store
            .store_robots(&authority, &body, ROBOTS_TTL)
            .await?;
        Ok(body)
    }
}

#[async_trait]
impl Processor<Document<String>> for PolitenessGate {
    async fn process(&self, doc: Document<String>) -> Result<Vec<Document<String>>> {
        let url = Url::parse(&doc.id).with_context(|| format!("invalid url: {}", doc.id))?;

        if doc.depth > self.max_depth {
            bail!("max depth {} exceeded", self.max_depth);
        }

        let domain = base_domain(&doc.id)?;

        if !self.store.visit_if_new(&doc.id, VISITED_TTL).await? {
            return Ok(Vec::new());
        }

        match self.robots_data(&url).await {
            Ok(body) if !body.is_empty() => {
                if !RobotsTxt::parse(&body).is_allowed(&self.user_agent, url.path()) {
                    return Err(CrawlError::RobotsDisallowed.into());
                }
            }
            Ok(_) => {}
            Err(err) if self.robots_fail_closed => return Err(err),
            Err(err) => {
                warn!(host = %url.host_str().unwrap_or_default(), error = %err, "robots.txt warning, proceeding ungated");
            }
        }

        let count = match self
            .store
            .admit_page(&domain, self.max_pages_per_domain)
            .await
        {
            Ok(count) => count,
            Err(err) => {
                self.store.forget_visit(&doc.id).await.ok();
                return Err(err);
            }
        };
        if count == -1 {
            return Err(CrawlError::QuotaExceeded.into());
        }

        if count > 1 {
            let penalty = (count as f64).log2();
            let elapsed = (Utc::now() - doc.created_at)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .as_secs_f64();
            if elapsed < penalty {
                self.store.release_page(&domain).await.ok();
                self.store.forget_visit(&doc.id).await.ok();
                return Err(CrawlError::DelayRequired {
                    wait: Duration::from_secs_f64(penalty - elapsed),
                }
                .into());
            }
        }

        Ok(vec![doc])
    }
}
