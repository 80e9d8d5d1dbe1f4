//! Vector-only worker: hydrates documents from Postgres, embeds them and
//! upserts into the vector store.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use rarefactor::bus::{self, BusSource, SUBJECT_VECTOR_JOBS};
use rarefactor::config::{init_tracing, Settings};
use rarefactor::document::{Document, MetaValue};
use rarefactor::embedding::EmbeddingProcessor;
use rarefactor::postgres::{self, fetch_document};
use rarefactor::qdrant::{QdrantClient, QdrantSink, COLLECTION_NAME};
use rarefactor::{FnProcessor, PipelineConfig, PipelineRunner};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let settings = Settings::parse();

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
        });
    }

    let db = postgres::connect(&settings.database_url)
        .await
        .context("postgres init")?;
    let bus_conn = bus::connect(&settings.nats_url).await.context("nats init")?;
    bus_conn.ensure_stream().await.context("stream init")?;
    let qdrant = Arc::new(QdrantClient::new(&settings.qdrant_url).context("qdrant init")?);

    let source = BusSource::new(bus_conn.jetstream.clone(), SUBJECT_VECTOR_JOBS, "vector-group");
    let sink = QdrantSink::new(qdrant, COLLECTION_NAME);

    let lookup_db = Arc::clone(&db);
    let lookup = FnProcessor::new(move |mut doc: Document<String>| {
        let db = Arc::clone(&lookup_db);
        async move {
            let Some((title, content, metadata)) = fetch_document(&db, &doc.id).await? else {
                anyhow::bail!("document {} not found", doc.id);
            };

            doc.content = content;
            if let serde_json::Value::Object(map) = metadata {
                for (key, value) in map {
                    if let Ok(meta) = serde_json::from_value::<MetaValue>(value) {
                        doc.metadata.insert(key, meta);
                    }
                }
            }
            doc.set_meta("title", title);
            Ok(vec![doc])
        }
    });

    let mut runner = PipelineRunner::new(
        source,
        sink,
        PipelineConfig::new("vector-ingestion", 5),
    );
    runner.add_processor(lookup);
    runner.add_processor(EmbeddingProcessor::new(settings.embedding_url.clone())?);

    info!("vector worker active, processing embedding stream");
    if let Err(err) = runner.run(shutdown).await {
        tracing::error!(error = %err, "vector pipeline exited");
    }
    Ok(())
}
