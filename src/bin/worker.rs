//! Primary worker: HTTP control plane plus the full crawl graph topology.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use rarefactor::api::{ApiState, CrawlService};
use rarefactor::bus::{self, BusSink, BusSource, SUBJECT_CRAWL_JOBS, SUBJECT_VECTOR_JOBS};
use rarefactor::cache::RedisStore;
use rarefactor::chunker::ChunkerProcessor;
use rarefactor::config::{init_tracing, Settings};
use rarefactor::crawl::{CrawlerProcessor, RenderServiceProcessor, SmartCrawler, USER_AGENT};
use rarefactor::discovery::DiscoveryProcessor;
use rarefactor::document::Document;
use rarefactor::embedding::{Embedder, EmbeddingProcessor};
use rarefactor::enrich::EnrichmentProcessor;
use rarefactor::flow::{Processor, Sink, TeeProcessor};
use rarefactor::llm;
use rarefactor::metadata::MetadataProcessor;
use rarefactor::politeness::PolitenessGate;
use rarefactor::postgres::{self, JobStore, PostgresSink};
use rarefactor::qdrant::{QdrantClient, QdrantSink, COLLECTION_NAME};
use rarefactor::search::SearchService;
use rarefactor::security::SecurityProcessor;
use rarefactor::GraphRunner;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let settings = Settings::parse();

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    // Infrastructure init failures abort the process; per-document failures
    // never do.
    let db = postgres::connect(&settings.database_url)
        .await
        .context("postgres init")?;
    postgres::ensure_schema(&db).await.context("schema init")?;
    let store = Arc::new(
        RedisStore::connect(&settings.redis_url)
            .await
            .context("redis init")?,
    );
    let bus_conn = bus::connect(&settings.nats_url).await.context("nats init")?;
    bus_conn.ensure_stream().await.context("stream init")?;
    let qdrant = Arc::new(QdrantClient::new(&settings.qdrant_url).context("qdrant init")?);
    if let Err(err) = qdrant.ensure_collection(COLLECTION_NAME).await {
        warn!(error = %err, "qdrant collection setup");
    }

    let provider = llm::provider_from_env(&settings.gemini_api_key, &settings.ollama_url)?;

    // Control plane.
    let search_service = Arc::new(SearchService::new(
        store.clone(),
        Arc::clone(&qdrant),
        Embedder::new(settings.embedding_url.clone())?,
    ));
    let api_state = Arc::new(ApiState {
        crawl: CrawlService::new(
            Arc::new(JobStore::new(Arc::clone(&db))),
            Arc::new(bus_conn.jetstream.clone()),
            settings.namespace.clone(),
        ),
        search: search_service,
    });
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", settings.http_port))
        .await
        .context("api bind failed")?;
    info!(port = settings.http_port, "control plane listening");
    let api_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let serve = axum::serve(listener, rarefactor::api::router(api_state))
            .with_graceful_shutdown(async move { api_shutdown.cancelled().await });
        if let Err(err) = serve.await {
            error!(error = %err, "api server error");
        }
    });

    // Data plane.
    let source = BusSource::new(bus_conn.jetstream.clone(), SUBJECT_CRAWL_JOBS, "worker-group");
    let pg_sink = PostgresSink::new(Arc::clone(&db), 50, Duration::from_secs(5));
    let link_sink = BusSink::new(bus_conn.jetstream.clone(), SUBJECT_CRAWL_JOBS);
    let qdrant_sink = QdrantSink::new(Arc::clone(&qdrant), COLLECTION_NAME);

    let mut runner = GraphRunner::new("rarefactor-v2", source, settings.concurrency);

    let gate = PolitenessGate::new(
        store,
        USER_AGENT,
        settings.max_depth,
        settings.max_pages_per_domain,
        false,
    )?;
    runner.add_processor("start", gate)?;

    let spa: Arc<dyn Processor<Document<String>>> = if settings.render_url.is_empty() {
        // No render service configured: degrade to a second static fetch.
        Arc::new(CrawlerProcessor::new()?)
    } else {
        Arc::new(RenderServiceProcessor::new(
            &settings.render_url,
            Duration::from_secs(60),
        )?)
    };
    runner.add_processor("crawler", SmartCrawler::new(CrawlerProcessor::new()?, spa))?;
    runner.add_hybrid("discovery", DiscoveryProcessor::new(), link_sink)?;
    runner.add_processor("security", SecurityProcessor::new(false))?;
    runner.add_processor("chunker", ChunkerProcessor::new(4000, 400))?;
    runner.add_processor("enrichment", EnrichmentProcessor::new())?;
    runner.add_processor("metadata", MetadataProcessor::new(provider))?;
    runner.add_sink("persist_pg", Arc::clone(&pg_sink))?;
    if settings.defer_embeddings {
        runner.add_processor(
            "embedding",
            TeeProcessor::new(Arc::new(BusSink::new(
                bus_conn.jetstream.clone(),
                SUBJECT_VECTOR_JOBS,
            ))),
        )?;
    } else {
        runner.add_hybrid(
            "embedding",
            EmbeddingProcessor::new(settings.embedding_url.clone())?,
            qdrant_sink,
        )?;
    }

    runner.connect("start", "crawler")?;
    runner.connect("crawler", "discovery")?;
    runner.connect("crawler", "security")?;
    runner.connect("security", "chunker")?;
    runner.connect("chunker", "enrichment")?;
    runner.connect("enrichment", "metadata")?;
    runner.connect("metadata", "persist_pg")?;
    runner.connect("metadata", "embedding")?;

    info!("worker topology constructed, starting");
    if let Err(err) = runner.run(shutdown.clone()).await {
        error!(error = %err, "worker stopped");
    }

    pg_sink.close().await.context("final flush failed")?;
    Ok(())
}
