//! Enrichment worker: consumes the enrichment hand-off subject and runs the
//! model-assisted tail of the topology.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio_postgres::Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use rarefactor::bus::{self, BusConnection, BusSource, SUBJECT_ENRICHMENT};
use rarefactor::config::{init_tracing, Settings};
use rarefactor::embedding::EmbeddingProcessor;
use rarefactor::flow::Sink;
use rarefactor::llm;
use rarefactor::metadata::MetadataProcessor;
use rarefactor::postgres::{self, PostgresSink};
use rarefactor::qdrant::{QdrantClient, QdrantSink, COLLECTION_NAME};
use rarefactor::GraphRunner;

const INFRA_DEADLINE: Duration = Duration::from_secs(120);

// This worker typically boots alongside the infrastructure containers, so it
// polls until everything answers instead of failing the first probe.
async fn wait_for_infrastructure(
    settings: &Settings,
) -> Result<(Arc<Client>, BusConnection, Arc<QdrantClient>)> {
    let deadline = Instant::now() + INFRA_DEADLINE;
    info!("waiting for infrastructure (NATS, Postgres, Qdrant)");

    loop {
        let attempt = async {
            let db = postgres::connect(&settings.database_url).await?;
            postgres::ensure_schema(&db).await?;
            let bus_conn = bus::connect(&settings.nats_url).await?;
            bus_conn.ensure_stream().await?;
            let qdrant = Arc::new(QdrantClient::new(&settings.qdrant_url)?);
            if let Err(err) = qdrant.ensure_collection(COLLECTION_NAME).await {
                warn!(error = %err, "qdrant collection setup");
            }
            anyhow::Ok((db, bus_conn, qdrant))
        };

        match attempt.await {
            Ok(deps) => return Ok(deps),
            Err(err) if Instant::now() < deadline => {
                warn!(error = %err, "infrastructure not ready");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
            Err(err) => {
                bail!("infrastructure initialization timed out after 120s: {err}")
            }
        }
    }
}

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

    let (db, bus_conn, qdrant) = wait_for_infrastructure(&settings).await?;
    let provider = llm::provider_from_env(&settings.gemini_api_key, &settings.ollama_url)?;

    let source = BusSource::new(
        bus_conn.jetstream.clone(),
        SUBJECT_ENRICHMENT,
        "enrichment-group",
    );
    let pg_sink = PostgresSink::new(Arc::clone(&db), 50, Duration::from_secs(5));
    let qdrant_sink = QdrantSink::new(qdrant, COLLECTION_NAME);

    let mut runner = GraphRunner::new("rarefactor-enrichment", source, settings.concurrency);
    runner.add_processor("start", MetadataProcessor::new(provider))?;
    runner.add_hybrid(
        "embedding",
        EmbeddingProcessor::new(settings.embedding_url.clone())?,
        qdrant_sink,
    )?;
    runner.add_sink("persist_pg", Arc::clone(&pg_sink))?;
    runner.connect("start", "embedding")?;
    runner.connect("embedding", "persist_pg")?;

    info!("enrichment topology constructed, starting");
    if let Err(err) = runner.run(shutdown).await {
        error!(error = %err, "worker stopped");
    }

    pg_sink.close().await.context("final flush failed")?;
    Ok(())
}
