//! Relational persistence: connection setup, the batching document sink and
//! the crawl-job store.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::future::join_all;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use url::Url;

use crate::document::Document;
use crate::flow::Sink;

/// Default number of buffered documents before a flush.
pub const DEFAULT_BATCH_SIZE: usize = 20;
/// Default interval for the background flusher.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

const UPSERT_SQL: &str = "\
    INSERT INTO documents (
        id, parent_id, namespace, domain, source, content, cleaned_content,
        title, summary, content_hash, metadata, crawled_at, last_seen_at
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, NOW())
    ON CONFLICT (id) DO UPDATE SET
        content = EXCLUDED.content,
        cleaned_content = EXCLUDED.cleaned_content,
        title = EXCLUDED.title,
        summary = EXCLUDED.summary,
        content_hash = EXCLUDED.content_hash,
        metadata = EXCLUDED.metadata,
        last_seen_at = NOW()";

const JOB_PAGES_SQL: &str = "\
    UPDATE crawl_jobs
    SET pages_crawled = pages_crawled + $2, updated_at = NOW()
    WHERE id = $1";

/// Connects to Postgres and drives the connection on a background task.
pub async fn connect(database_url: &str) -> Result<Arc<Client>> {
    let (client, connection) = tokio_postgres::connect(database_url, NoTls)
        .await
        .context("postgres connection failed")?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            error!(error = %err, "postgres connection terminated");
        }
    });
    Ok(Arc::new(client))
}

/// Creates the `documents` and `crawl_jobs` tables when missing.
pub async fn ensure_schema(client: &Client) -> Result<()> {
    client
        .batch_execute(
            "CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                parent_id TEXT NOT NULL DEFAULT '',
                namespace TEXT NOT NULL DEFAULT 'default',
                domain TEXT NOT NULL DEFAULT '',
                source TEXT NOT NULL DEFAULT '',
                content TEXT NOT NULL DEFAULT '',
                cleaned_content TEXT NOT NULL DEFAULT '',
                title TEXT NOT NULL DEFAULT '',
                summary TEXT NOT NULL DEFAULT '',
                content_hash TEXT NOT NULL DEFAULT '',
                metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
                crawled_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                last_seen_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            CREATE INDEX IF NOT EXISTS documents_domain_idx ON documents (domain);
            CREATE TABLE IF NOT EXISTS crawl_jobs (
                id TEXT PRIMARY KEY,
                seed_url TEXT NOT NULL,
                max_depth INT NOT NULL DEFAULT 0,
                crawl_mode TEXT NOT NULL DEFAULT '',
                namespace TEXT NOT NULL DEFAULT 'default',
                status TEXT NOT NULL DEFAULT 'PENDING',
                pages_crawled BIGINT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
        )
        .await
        .context("schema setup failed")?;
    Ok(())
}

/// Hostname of a document id with any `www.` prefix removed.
pub fn extract_domain(raw_url: &str) -> String {
    match Url::parse(raw_url).ok().and_then(|u| {
        u.host_str()
            .map(|h| h.trim_start_matches("www.").to_string())
    }) {
        Some(host) => host,
        None => "unknown".to_string(),
    }
}

/// Lowercase hex SHA-256 of content; empty content hashes to the empty string.
pub fn content_hash(content: &str) -> String {
    if content.is_empty() {
        return String::new();
    }
    let digest = Sha256::digest(content.as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

// One increment per source page: the page document itself, or its first chunk.
fn counts_toward_job(doc: &Document<String>) -> bool {
    if doc.parent_id.is_empty() {
        return true;
    }
    doc.meta_i64("chunk_index") == Some(0)
}

fn job_increments<'a>(docs: impl IntoIterator<Item = &'a Document<String>>) -> Vec<(String, i64)> {
    let mut increments: Vec<(String, i64)> = Vec::new();
    for doc in docs {
        let Some(job_id) = doc.meta_str("job_id") else {
            continue;
        };
        if job_id.is_empty() || !counts_toward_job(doc) {
            continue;
        }
        match increments.iter_mut().find(|(id, _)| id == job_id) {
            Some((_, delta)) => *delta += 1,
            None => increments.push((job_id.to_string(), 1)),
        }
    }
    increments
}

/// Buffered upsert sink for the `documents` table.
///
/// Flushes when the buffer reaches the batch size, on the periodic timer and
/// on close. Per-row failures are logged and withheld from acknowledgement so
/// the bus redelivers them; successful rows are acked after the round-trip.
pub struct PostgresSink {
    client: Arc<Client>,
    batch_size: usize,
    buffer: Mutex<Vec<Document<String>>>,
    closed: CancellationToken,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl PostgresSink {
    /// Builds the sink and starts its background flusher.
    pub fn new(client: Arc<Client>, batch_size: usize, flush_interval: Duration) -> Arc<Self> {
        let batch_size = if batch_size == 0 {
            DEFAULT_BATCH_SIZE
        } else {
            batch_size
        };
        let flush_interval = if flush_interval.is_zero() {
            DEFAULT_FLUSH_INTERVAL
        } else {
            flush_interval
        };

        let sink = Arc::new(Self {
            client,
            batch_size,
            buffer: Mutex::new(Vec::with_capacity(batch_size)),
            closed: CancellationToken::new(),
            flusher: Mutex::new(None),
        });

        let flusher_sink = Arc::clone(&sink);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = flusher_sink.closed.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(err) = flusher_sink.flush().await {
                            warn!(error = %err, "scheduled flush failed");
                        }
                    }
                }
            }
        });
        *sink.flusher.lock().unwrap() = Some(handle);

        sink
    }

    /// Flushes all buffered documents now.
    pub async fn flush(&self) -> Result<()> {
        let pending: Vec<Document<String>> = {
            let mut buffer = self.buffer.lock().unwrap();
            if buffer.is_empty() {
                return Ok(());
            }
            std::mem::take(&mut *buffer)
        };
        self.execute_batch(pending).await
    }

    async fn execute_batch(&self, docs: Vec<Document<String>>) -> Result<()> {
        info!(rows = docs.len(), "executing document batch");

        let statement = self
            .client
            .prepare(UPSERT_SQL)
            .await
            .context("upsert prepare failed")?;

        let rows: Vec<_> = docs
            .iter()
            .map(|doc| {
                let namespace = doc
                    .meta_str("namespace")
                    .filter(|ns| !ns.is_empty())
                    .unwrap_or("default")
                    .to_string();
                (
                    doc,
                    namespace,
                    extract_domain(&doc.id),
                    doc.meta_str("title").unwrap_or_default().to_string(),
                    doc.meta_str("summary").unwrap_or_default().to_string(),
                    content_hash(&doc.content),
                    serde_json::to_value(&doc.metadata).unwrap_or_default(),
                )
            })
            .collect();

        // Statements pipeline over one connection when polled together.
        let writes = rows
            .iter()
            .map(|(doc, namespace, domain, title, summary, hash, metadata)| {
                let params: Vec<&(dyn ToSql + Sync)> = vec![
                    &doc.id,
                    &doc.parent_id,
                    namespace,
                    domain,
                    &doc.source,
                    &doc.content,
                    &doc.cleaned_content,
                    title,
                    summary,
                    hash,
                    metadata,
                    &doc.created_at,
                ];
                self.client.execute_raw(&statement, params)
            });
        let results = join_all(writes).await;

        for (doc, result) in docs.iter().zip(&results) {
            match result {
                Ok(_) => doc.do_ack(),
                Err(err) => warn!(id = %doc.id, error = %err, "batch write failed, withholding ack"),
            }
        }

        let job_updates = job_increments(
            docs.iter()
                .zip(&results)
                .filter(|(_, result)| result.is_ok())
                .map(|(doc, _)| doc),
        );
        for (job_id, delta) in &job_updates {
            let params: [&(dyn ToSql + Sync); 2] = [job_id, delta];
            if let Err(err) = self.client.execute(JOB_PAGES_SQL, &params).await {
                warn!(job_id = %job_id, error = %err, "job stats update failed");
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Sink<Document<String>> for Arc<PostgresSink> {
    async fn write(&self, doc: Document<String>) -> Result<()> {
        let should_flush = {
            let mut buffer = self.buffer.lock().unwrap();
            buffer.push(doc);
            buffer.len() >= self.batch_size
        };
        if should_flush {
            self.flush().await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        let handle = self.flusher.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.flush().await
    }
}

/// Looks up a persisted document's title, content and metadata.
pub async fn fetch_document(
    client: &Client,
    id: &str,
) -> Result<Option<(String, String, serde_json::Value)>> {
    let row = client
        .query_opt(
            "SELECT title, content, metadata FROM documents WHERE id = $1",
            &[&id],
        )
        .await
        .context("document lookup failed")?;
    Ok(row.map(|row| (row.get(0), row.get(1), row.get(2))))
}

/// Crawl-job lifecycle operations.
#[derive(Clone)]
pub struct JobStore {
    client: Arc<Client>,
}

impl JobStore {
    /// Wraps a client.
    pub fn new(client: Arc<Client>) -> Self {
        Self { client }
    }

    /// Inserts a PENDING job row.
    pub async fn create(
        &self,
        job_id: &str,
        seed_url: &str,
        max_depth: i32,
        crawl_mode: &str,
        namespace: &str,
    ) -> Result<()> {
        self.client
            .execute(
                "INSERT INTO crawl_jobs (id, seed_url, max_depth, crawl_mode, namespace, status, created_at)
                 VALUES ($1, $2, $3, $4, $5, 'PENDING', NOW())",
                &[&job_id, &seed_url, &max_depth, &crawl_mode, &namespace],
            )
            .await
            .context("failed to persist job")?;
        Ok(())
    }

    /// Transitions a job to FAILED after a publish error.
    pub async fn mark_failed(&self, job_id: &str) -> Result<()> {
        self.client
            .execute(
                "UPDATE crawl_jobs SET status = 'FAILED', updated_at = NOW() WHERE id = $1",
                &[&job_id],
            )
            .await
            .context("failed to mark job failed")?;
        Ok(())
    }

    /// Transitions a job to CANCELLED.
    pub async fn cancel(&self, job_id: &str) -> Result<()> {
        self.client
            .execute(
                "UPDATE crawl_jobs SET status = 'CANCELLED', updated_at = NOW() WHERE id = $1",
                &[&job_id],
            )
            .await
            .context("failed to cancel job")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Document, SOURCE_WEB};

    fn doc(id: &str, parent: &str, job: Option<&str>, chunk_index: Option<i64>) -> Document<String> {
        let mut doc: Document<String> = Document::new(id, SOURCE_WEB);
        doc.parent_id = parent.to_string();
        if let Some(job) = job {
            doc.set_meta("job_id", job);
        }
        if let Some(index) = chunk_index {
            doc.set_meta("is_chunk", true);
            doc.set_meta("chunk_index", index);
        }
        doc
    }

    #[test]
    fn hash_is_stable_sha256_hex() {
        assert_eq!(content_hash(""), "");
        assert_eq!(
            content_hash("hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn domain_strips_www() {
        assert_eq!(extract_domain("https://www.example.com/a"), "example.com");
        assert_eq!(extract_domain("https://blog.example.com/a"), "blog.example.com");
        assert_eq!(extract_domain("not a url"), "unknown");
    }

    #[test]
    fn one_job_increment_per_source_page() {
        let docs = vec![
            doc("https://a.com/page", "", Some("job-1"), None),
            doc("https://a.com/page#chunk0", "https://a.com/page", Some("job-1"), Some(0)),
            doc("https://a.com/page#chunk1", "https://a.com/page", Some("job-1"), Some(1)),
            doc("https://b.com/other", "", Some("job-2"), None),
            doc("https://c.com/untracked", "", None, None),
        ];

        let increments = job_increments(&docs);
        assert_eq!(increments.len(), 2);
        assert!(increments.contains(&("job-1".to_string(), 2)));
        assert!(increments.contains(&("job-2".to_string(), 1)));
    }

    #[test]
    fn chunked_pages_count_once_via_chunk_zero() {
        let docs = vec![
            doc("https://a.com/p#chunk0", "https://a.com/p", Some("job-1"), Some(0)),
            doc("https://a.com/p#chunk1", "https://a.com/p", Some("job-1"), Some(1)),
            doc("https://a.com/p#chunk2", "https://a.com/p", Some("job-1"), Some(2)),
        ];
        assert_eq!(job_increments(&docs), vec![("job-1".to_string(), 1)]);
    }
}
