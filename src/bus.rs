//! JetStream bus integration: durable work-queue stream, competing-consumer
//! source and publish sink.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_nats::jetstream::{self, consumer, stream, AckKind};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::document::{AckHandle, Document};
use crate::flow::{SharedStream, Sink, Source};

/// Durable stream holding all crawl work.
pub const STREAM_NAME: &str = "CRAWL_JOBS";
/// Subject carrying seeds and rediscovered links.
pub const SUBJECT_CRAWL_JOBS: &str = "crawl.jobs";
/// Subject handing documents off to the enrichment worker.
pub const SUBJECT_ENRICHMENT: &str = "crawl.enrichment";
/// Subject handing documents off to the vector-only worker.
pub const SUBJECT_VECTOR_JOBS: &str = "vector.jobs";

const MAX_ACK_PENDING: i64 = 100_000;
const POLL_TIMEOUT: Duration = Duration::from_secs(1);
const FETCH_BATCH: usize = 64;

/// Live connection plus JetStream context.
pub struct BusConnection {
    /// Raw client, kept for connection lifecycle management.
    pub client: async_nats::Client,
    /// JetStream context used by sources and sinks.
    pub jetstream: jetstream::Context,
}

/// Connects to the bus and returns a JetStream context.
pub async fn connect(nats_url: &str) -> Result<BusConnection> {
    let url = if nats_url.is_empty() {
        "nats://localhost:4222"
    } else {
        nats_url
    };
    let client = async_nats::connect(url)
        .await
        .with_context(|| format!("failed to connect to NATS at {url}"))?;
    let jetstream = jetstream::new(client.clone());
    Ok(BusConnection { client, jetstream })
}

impl BusConnection {
    /// Creates the work-queue stream if it does not exist yet.
    pub async fn ensure_stream(&self) -> Result<()> {
        self.jetstream
            .get_or_create_stream(stream::Config {
                name: STREAM_NAME.to_string(),
                subjects: vec!["crawl.>".to_string(), SUBJECT_VECTOR_JOBS.to_string()],
                retention: stream::RetentionPolicy::WorkQueue,
                max_messages: 1_000_000,
                max_bytes: 10 * 1024 * 1024 * 1024,
                discard: stream::DiscardPolicy::Old,
                ..Default::default()
            })
            .await
            .map_err(|err| anyhow::anyhow!("failed to create stream {STREAM_NAME}: {err}"))?;
        info!(stream = STREAM_NAME, "bus stream ready");
        Ok(())
    }
}

fn ack_handle(message: jetstream::Message, id: String) -> AckHandle {
    let message = Arc::new(message);
    let ack_msg = Arc::clone(&message);
    let ack_id = id.clone();
    AckHandle::with_nack(
        move || {
            let message = Arc::clone(&ack_msg);
            let id = ack_id.clone();
            tokio::spawn(async move {
                if let Err(err) = message.ack().await {
                    warn!(id = %id, error = %err, "failed to ack bus message");
                }
            });
        },
        move |delay| {
            let message = Arc::clone(&message);
            let id = id.clone();
            tokio::spawn(async move {
                if let Err(err) = message.ack_with(AckKind::Nak(Some(delay))).await {
                    warn!(id = %id, error = %err, "failed to nak bus message");
                }
            });
        },
    )
}

/// Competing-consumer source over a subject of the work-queue stream.
///
/// Polls in one-second slices so cancellation is observed promptly; malformed
/// payloads are terminated on the bus and skipped.
pub struct BusSource {
    jetstream: jetstream::Context,
    subject: String,
    group: String,
}

impl BusSource {
    /// Builds a source for `subject` under the named consumer group.
    pub fn new(jetstream: jetstream::Context, subject: &str, group: &str) -> Self {
        Self {
            jetstream,
            subject: subject.to_string(),
            group: group.to_string(),
        }
    }
}

#[async_trait]
impl Source<Document<String>> for BusSource {
    async fn stream(&self, shutdown: CancellationToken) -> Result<SharedStream<Document<String>>> {
        let stream = self
            .jetstream
            .get_stream(STREAM_NAME)
            .await
            .map_err(|err| anyhow::anyhow!("bus subscription failed: {err}"))?;

        let consumer = stream
            .get_or_create_consumer(
                &self.group,
                consumer::pull::Config {
                    durable_name: Some(self.group.clone()),
                    filter_subject: self.subject.clone(),
                    ack_policy: consumer::AckPolicy::Explicit,
                    max_ack_pending: MAX_ACK_PENDING,
                    ..Default::default()
                },
            )
            .await
            .map_err(|err| anyhow::anyhow!("bus consumer setup failed: {err}"))?;

        let (tx, shared) = SharedStream::channel(FETCH_BATCH);
        let subject = self.subject.clone();

        tokio::spawn(async move {
            loop {
                if shutdown.is_cancelled() {
                    return;
                }

                let batch = consumer
                    .fetch()
                    .max_messages(FETCH_BATCH)
                    .expires(POLL_TIMEOUT)
                    .messages()
                    .await;

                let mut messages = match batch {
                    Ok(messages) => messages,
                    Err(err) => {
                        warn!(subject = %subject, error = %err, "bus fetch error");
                        tokio::time::sleep(POLL_TIMEOUT).await;
                        continue;
                    }
                };

                while let Some(message) = messages.next().await {
                    let message = match message {
                        Ok(message) => message,
                        Err(err) => {
                            warn!(subject = %subject, error = %err, "bus message error");
                            break;
                        }
                    };

                    let mut doc: Document<String> =
                        match serde_json::from_slice(&message.payload) {
                            Ok(doc) => doc,
                            Err(err) => {
                                warn!(subject = %subject, error = %err, "malformed payload, terminating message");
                                if let Err(term_err) = message.ack_with(AckKind::Term).await {
                                    warn!(error = %term_err, "failed to terminate message");
                                }
                                continue;
                            }
                        };

                    doc.ack = Some(ack_handle(message, doc.id.clone()));

                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        sent = tx.send(doc) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(shared)
    }
}

/// Publishes documents as JSON onto a bus subject.
pub struct BusSink {
    jetstream: jetstream::Context,
    subject: String,
}

impl BusSink {
    /// Builds a sink for the given subject.
    pub fn new(jetstream: jetstream::Context, subject: &str) -> Self {
        Self {
            jetstream,
            subject: subject.to_string(),
        }
    }
}

#[async_trait]
impl Sink<Document<String>> for BusSink {
    async fn write(&self, doc: Document<String>) -> Result<()> {
        let payload = serde_json::to_vec(&doc).context("bus marshal failed")?;
        let ack = self
            .jetstream
            .publish(self.subject.clone(), payload.into())
            .await
            .map_err(|err| anyhow::anyhow!("bus publish failed: {err}"))?;
        ack.await
            .map_err(|err| anyhow::anyhow!("bus publish unacknowledged: {err}"))?;
        Ok(())
    }
}

/// Publishes a seed document for a new crawl job.
pub async fn publish_seed(jetstream: &jetstream::Context, doc: &Document<String>) -> Result<()> {
    let payload = serde_json::to_vec(doc).context("seed marshal failed")?;
    let ack = jetstream
        .publish(SUBJECT_CRAWL_JOBS.to_string(), payload.into())
        .await
        .map_err(|err| anyhow::anyhow!("failed to queue job: {err}"))?;
    ack.await
        .map_err(|err| anyhow::anyhow!("failed to queue job: {err}"))?;
    Ok(())
}
