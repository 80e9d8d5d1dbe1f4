//! Control-plane and query HTTP API.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::bus;
use crate::document::{Document, SOURCE_API_TRIGGER};
use crate::netutil::base_domain;
use crate::postgres::JobStore;
use crate::search::SearchService;

/// Crawl-job persistence operations needed by the control plane.
#[async_trait]
pub trait JobControl: Send + Sync {
    /// Inserts a PENDING job row.
    async fn create(
        &self,
        job_id: &str,
        seed_url: &str,
        max_depth: i32,
        crawl_mode: &str,
        namespace: &str,
    ) -> Result<()>;
    /// Marks a job FAILED.
    async fn mark_failed(&self, job_id: &str) -> Result<()>;
    /// Marks a job CANCELLED.
    async fn cancel(&self, job_id: &str) -> Result<()>;
}

#[async_trait]
impl JobControl for JobStore {
    async fn create(
        &self,
        job_id: &str,
        seed_url: &str,
        max_depth: i32,
        crawl_mode: &str,
        namespace: &str,
    ) -> Result<()> {
        JobStore::create(self, job_id, seed_url, max_depth, crawl_mode, namespace).await
    }

    async fn mark_failed(&self, job_id: &str) -> Result<()> {
        JobStore::mark_failed(self, job_id).await
    }

    async fn cancel(&self, job_id: &str) -> Result<()> {
        JobStore::cancel(self, job_id).await
    }
}

/// Publishes seed documents onto the work queue.
#[async_trait]
pub trait SeedPublisher: Send + Sync {
    /// Enqueues one seed document.
    async fn publish(&self, doc: &Document<String>) -> Result<()>;
}

#[async_trait]
impl SeedPublisher for async_nats::jetstream::Context {
    async fn publish(&self, doc: &Document<String>) -> Result<()> {
        bus::publish_seed(self, doc).await
    }
}

/// Crawl trigger request.
#[derive(Debug, Deserialize)]
pub struct CrawlRequest {
    /// Seed URL to start from.
    #[serde(default)]
    pub seed_url: String,
    /// Requested depth ceiling; 0 picks the mode default.
    #[serde(default)]
    pub max_depth: i32,
    /// `broad` or `targeted`; empty defaults to `broad`.
    #[serde(default)]
    pub crawl_mode: String,
}

/// Crawl trigger response.
#[derive(Debug, Serialize)]
pub struct CrawlResponse {
    /// Identifier for polling job progress.
    pub job_id: String,
    /// Always `QUEUED` on success.
    pub status: String,
}

/// Job cancellation response.
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    /// Resulting status signal.
    pub status: String,
}

/// Control-plane service: validates, persists and enqueues crawl jobs.
pub struct CrawlService {
    jobs: Arc<dyn JobControl>,
    publisher: Arc<dyn SeedPublisher>,
    namespace: String,
}

impl CrawlService {
    /// Wires the service.
    pub fn new(
        jobs: Arc<dyn JobControl>,
        publisher: Arc<dyn SeedPublisher>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            jobs,
            publisher,
            namespace: namespace.into(),
        }
    }

    /// Handles a crawl trigger.
    pub async fn crawl(&self, request: &CrawlRequest) -> Result<CrawlResponse> {
        if request.seed_url.is_empty() {
            bail!("seed_url is required");
        }

        let mode = if request.crawl_mode.is_empty() {
            "broad"
        } else {
            &request.crawl_mode
        };
        let requested_depth = if request.max_depth == 0 {
            2
        } else {
            request.max_depth
        };

        // Mode clamps bound the blast radius of any single trigger.
        let (effective_depth, allowed_domain) = match mode {
            "targeted" => {
                let domain = base_domain(&request.seed_url)
                    .context("targeted crawl needs a resolvable base domain")?;
                (requested_depth.min(10), Some(domain))
            }
            _ => (requested_depth.min(2), None),
        };

        let job_id = Uuid::new_v4().to_string();
        self.jobs
            .create(
                &job_id,
                &request.seed_url,
                requested_depth,
                mode,
                &self.namespace,
            )
            .await?;

        let mut seed: Document<String> = Document::new(&request.seed_url, SOURCE_API_TRIGGER);
        seed.created_at = Utc::now();
        seed.set_meta("job_id", job_id.as_str());
        seed.set_meta("max_depth", i64::from(effective_depth));
        seed.set_meta("mode", mode);
        seed.set_meta("namespace", self.namespace.as_str());
        if let Some(domain) = allowed_domain {
            seed.set_meta("allowed_domain", domain);
        }

        if let Err(err) = self.publisher.publish(&seed).await {
            let _ = self.jobs.mark_failed(&job_id).await;
            return Err(err).context("failed to queue job");
        }

        info!(job_id = %job_id, seed = %request.seed_url, "job queued");
        Ok(CrawlResponse {
            job_id,
            status: "QUEUED".to_string(),
        })
    }

    /// Handles a cancellation.
    pub async fn cancel(&self, job_id: &str) -> Result<CancelResponse> {
        self.jobs
            .cancel(job_id)
            .await
            .context("failed to cancel job")?;
        Ok(CancelResponse {
            status: "CANCELLED_SIGNAL_SENT".to_string(),
        })
    }
}

/// Shared state behind the HTTP routes.
pub struct ApiState {
    /// Control-plane service.
    pub crawl: CrawlService,
    /// Query-path service.
    pub search: Arc<SearchService>,
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    #[serde(default)]
    query: String,
    #[serde(default)]
    limit: usize,
}

#[derive(Debug, Deserialize)]
struct AutocompleteParams {
    #[serde(default)]
    prefix: String,
    #[serde(default)]
    limit: usize,
}

/// Builds the HTTP router.
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/crawl", post(trigger_crawl))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/search", get(run_search))
        .route("/autocomplete", get(run_autocomplete))
        .with_state(state)
}

async fn trigger_crawl(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<CrawlRequest>,
) -> Result<Json<CrawlResponse>, (StatusCode, String)> {
    match state.crawl.crawl(&request).await {
        Ok(response) => Ok(Json(response)),
        Err(err) if err.to_string().contains("seed_url is required") => {
            Err((StatusCode::BAD_REQUEST, err.to_string()))
        }
        Err(err) => {
            error!(error = %err, "crawl trigger failed");
            Err((StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))
        }
    }
}

async fn cancel_job(
    State(state): State<Arc<ApiState>>,
    Path(job_id): Path<String>,
) -> Result<Json<CancelResponse>, (StatusCode, String)> {
    state
        .crawl
        .cancel(&job_id)
        .await
        .map(Json)
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))
}

async fn run_search(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<SearchParams>,
) -> Result<Json<crate::search::SearchResults>, (StatusCode, String)> {
    state
        .search
        .search(&params.query, params.limit)
        .await
        .map(Json)
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))
}

async fn run_autocomplete(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<AutocompleteParams>,
) -> Result<Json<crate::search::AutocompleteResult>, (StatusCode, String)> {
    state
        .search
        .autocomplete(&params.prefix, params.limit)
        .await
        .map(Json)
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingJobs {
        created: Mutex<Vec<(String, String, i32, String)>>,
        failed: Mutex<Vec<String>>,
        cancelled: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl JobControl for RecordingJobs {
        async fn create(
            &self,
            job_id: &str,
            seed_url: &str,
            max_depth: i32,
            crawl_mode: &str,
            _namespace: &str,
        ) -> Result<()> {
            self.created.lock().unwrap().push((
                job_id.to_string(),
                seed_url.to_string(),
                max_depth,
                crawl_mode.to_string(),
            ));
            Ok(())
        }

        async fn mark_failed(&self, job_id: &str) -> Result<()> {
            self.failed.lock().unwrap().push(job_id.to_string());
            Ok(())
        }

        async fn cancel(&self, job_id: &str) -> Result<()> {
            self.cancelled.lock().unwrap().push(job_id.to_string());
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<Document<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl SeedPublisher for RecordingPublisher {
        async fn publish(&self, doc: &Document<String>) -> Result<()> {
            if self.fail {
                anyhow::bail!("bus down");
            }
            self.published.lock().unwrap().push(doc.clone());
            Ok(())
        }
    }

    fn service(
        jobs: Arc<RecordingJobs>,
        publisher: Arc<RecordingPublisher>,
    ) -> CrawlService {
        CrawlService::new(jobs, publisher, "production-crawl")
    }

    #[tokio::test]
    async fn crawl_persists_job_and_publishes_seed() {
        let jobs = Arc::new(RecordingJobs::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let service = service(jobs.clone(), publisher.clone());

        let response = service
            .crawl(&CrawlRequest {
                seed_url: "https://example.com".to_string(),
                max_depth: 0,
                crawl_mode: String::new(),
            })
            .await
            .unwrap();

        assert_eq!(response.status, "QUEUED");
        let created = jobs.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].3, "broad");

        let published = publisher.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        let seed = &published[0];
        assert_eq!(seed.id, "https://example.com");
        assert_eq!(seed.source, SOURCE_API_TRIGGER);
        assert_eq!(seed.depth, 0);
        assert_eq!(seed.meta_str("job_id"), Some(response.job_id.as_str()));
        assert_eq!(seed.meta_i64("max_depth"), Some(2));
        assert_eq!(seed.meta_str("mode"), Some("broad"));
    }

    #[tokio::test]
    async fn targeted_mode_clamps_depth_and_restricts_domain() {
        let jobs = Arc::new(RecordingJobs::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let service = service(jobs.clone(), publisher.clone());

        service
            .crawl(&CrawlRequest {
                seed_url: "https://blog.example.co.uk/start".to_string(),
                max_depth: 50,
                crawl_mode: "targeted".to_string(),
            })
            .await
            .unwrap();

        let published = publisher.published.lock().unwrap();
        let seed = &published[0];
        assert_eq!(seed.meta_i64("max_depth"), Some(10));
        assert_eq!(seed.meta_str("allowed_domain"), Some("example.co.uk"));
    }

    #[tokio::test]
    async fn empty_seed_rejected() {
        let service = service(
            Arc::new(RecordingJobs::default()),
            Arc::new(RecordingPublisher::default()),
        );
        let err = service
            .crawl(&CrawlRequest {
                seed_url: String::new(),
                max_depth: 2,
                crawl_mode: String::new(),
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("seed_url is required"));
    }

    #[tokio::test]
    async fn publish_failure_marks_job_failed() {
        let jobs = Arc::new(RecordingJobs::default());
        let publisher = Arc::new(RecordingPublisher {
            fail: true,
            ..RecordingPublisher::default()
        });
        let service = service(jobs.clone(), publisher);

        let err = service
            .crawl(&CrawlRequest {
                seed_url: "https://example.com".to_string(),
                max_depth: 2,
                crawl_mode: String::new(),
            })
            .await
            .unwrap_err();

        assert!(err.to_string().contains("failed to queue job"));
        assert_eq!(jobs.failed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancel_flips_status() {
        let jobs = Arc::new(RecordingJobs::default());
        let service = service(jobs.clone(), Arc::new(RecordingPublisher::default()));

        let response = service.cancel("job-9").await.unwrap();
        assert_eq!(response.status, "CANCELLED_SIGNAL_SENT");
        assert_eq!(jobs.cancelled.lock().unwrap()[0], "job-9");
    }
}
