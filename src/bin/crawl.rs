//! Bus-less crawl CLI over the in-process engine and domain scheduler.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use rarefactor::cache::{MemoryStore, PolitenessStore, RankingStore, RedisStore};
use rarefactor::config::{init_tracing, Settings};
use rarefactor::embedding::Embedder;
use rarefactor::engine::{Engine, EngineConfig, IndexingStorage};
use rarefactor::postgres;
use rarefactor::qdrant::{QdrantClient, COLLECTION_NAME};

// Background crawls get a hard cap to bound runaway resource usage.
const CRAWL_DEADLINE: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Parser, Debug)]
#[command(name = "crawl", about = "Run one crawl without the message bus")]
struct Cli {
    /// Seed URL to crawl from.
    seed_url: String,

    /// Crawl mode: broad, targeted, or empty for the raw depth ceiling.
    #[arg(long, default_value = "broad")]
    mode: String,

    /// Per-domain politeness interval in milliseconds.
    #[arg(long, default_value_t = 2000)]
    politeness_ms: u64,

    #[command(flatten)]
    settings: Settings,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
        });
    }

    let db = postgres::connect(&cli.settings.database_url)
        .await
        .context("postgres init")?;
    postgres::ensure_schema(&db).await.context("schema init")?;

    let qdrant = Arc::new(QdrantClient::new(&cli.settings.qdrant_url).context("qdrant init")?);
    if let Err(err) = qdrant.ensure_collection(COLLECTION_NAME).await {
        warn!(error = %err, "qdrant collection setup");
    }

    // Redis is optional for single-shot runs; robots caching and autocomplete
    // fall back to process memory.
    let (robots_cache, ranking): (Arc<dyn PolitenessStore>, Arc<dyn RankingStore>) =
        match RedisStore::connect(&cli.settings.redis_url).await {
            Ok(store) => {
                let store = Arc::new(store);
                (store.clone(), store)
            }
            Err(err) => {
                warn!(error = %err, "redis unavailable, using in-memory stores");
                let store = Arc::new(MemoryStore::new());
                (store.clone(), store)
            }
        };

    let storage = Arc::new(IndexingStorage::new(
        db,
        Arc::clone(&qdrant),
        Embedder::new(cli.settings.embedding_url.clone())?,
        ranking,
    ));

    let engine = Engine::new(
        storage,
        robots_cache,
        EngineConfig {
            concurrency: cli.settings.concurrency.max(1),
            politeness: Duration::from_millis(cli.politeness_ms),
            namespace: cli.settings.namespace.clone(),
            ..EngineConfig::default()
        },
    )?;

    let deadline_shutdown = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(CRAWL_DEADLINE).await;
        warn!("crawl deadline reached, cancelling");
        deadline_shutdown.cancel();
    });

    engine
        .run(shutdown, &cli.seed_url, cli.settings.max_depth, &cli.mode)
        .await?;
    info!("crawl complete");
    Ok(())
}
