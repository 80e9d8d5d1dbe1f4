//! Shared-store traits for politeness state and query ranking, plus the
//! redis-backed implementation and an in-memory stand-in.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::AsyncCommands;

/// Key prefix for per-URL visited markers.
pub const VISITED_PREFIX: &str = "visited:";
/// Key prefix for cached robots.txt bodies.
pub const ROBOTS_PREFIX: &str = "robots:";
/// Hash holding one page counter per base domain.
pub const COUNT_KEY: &str = "crawl_counts";
/// Lexicographically-ordered set of autocomplete terms.
pub const AUTOCOMPLETE_KEY: &str = "rarefactor:autocomplete";
/// Scored set tracking global query popularity.
pub const SEARCH_SCORES_KEY: &str = "global_search_scores";

/// External state consulted by the politeness gate.
///
/// All operations are multi-writer safe; `admit_page` must be atomic so the
/// quota check and the increment cannot race.
#[async_trait]
pub trait PolitenessStore: Send + Sync {
    /// Marks a URL visited with a TTL; returns false when already present.
    async fn visit_if_new(&self, url: &str, ttl: Duration) -> Result<bool>;

    /// Removes a visited marker (politeness-delay rollback).
    async fn forget_visit(&self, url: &str) -> Result<()>;

    /// Cached robots.txt body for a host, which may be the empty string.
    async fn robots_body(&self, host: &str) -> Result<Option<String>>;

    /// Caches a robots.txt body.
    async fn store_robots(&self, host: &str, body: &str, ttl: Duration) -> Result<()>;

    /// Atomic check-and-increment of the domain page counter.
    ///
    /// Returns the new count, or -1 when the quota is already exhausted.
    async fn admit_page(&self, base_domain: &str, max_pages: i64) -> Result<i64>;

    /// Decrements the domain page counter (politeness-delay rollback).
    async fn release_page(&self, base_domain: &str) -> Result<()>;
}

/// Ordered-set operations backing autocomplete and search ranking.
#[async_trait]
pub trait RankingStore: Send + Sync {
    /// Registers an autocomplete term.
    async fn register_term(&self, term: &str) -> Result<()>;

    /// Increments a query's global popularity score.
    async fn bump_query_score(&self, query: &str) -> Result<()>;

    /// Lexicographic range scan over autocomplete terms.
    async fn terms_with_prefix(&self, prefix: &str, limit: usize) -> Result<Vec<String>>;

    /// Popularity scores for the given terms (0.0 when unscored).
    async fn term_scores(&self, terms: &[String]) -> Result<Vec<f64>>;
}

const ADMIT_SCRIPT: &str = r#"
local current = tonumber(redis.call("HGET", KEYS[1], ARGV[1]) or "0")
if current >= tonumber(ARGV[2]) then
    return -1
end
return redis.call("HINCRBY", KEYS[1], ARGV[1], 1)
"#;

/// Redis-backed implementation of both store traits.
#[derive(Clone)]
pub struct RedisStore {
    conn: redis::aio::ConnectionManager,
    admit: redis::Script,
}

impl RedisStore {
    /// Connects and pings the server.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .with_context(|| format!("failed to parse redis url {redis_url}"))?;
        let mut conn = client
            .get_connection_manager()
            .await
            .context("could not connect to redis")?;
        let _: () = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("redis ping failed")?;
        Ok(Self {
            conn,
            admit: redis::Script::new(ADMIT_SCRIPT),
        })
    }
}

#[async_trait]
impl PolitenessStore for RedisStore {
    async fn visit_if_new(&self, url: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(format!("{VISITED_PREFIX}{url}"))
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .context("redis visited check failed")?;
        Ok(set.is_some())
    }

    async fn forget_visit(&self, url: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(format!("{VISITED_PREFIX}{url}")).await?;
        Ok(())
    }

    async fn robots_body(&self, host: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let body: Option<String> = conn.get(format!("{ROBOTS_PREFIX}{host}")).await?;
        Ok(body)
    }

    async fn store_robots(&self, host: &str, body: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(format!("{ROBOTS_PREFIX}{host}"), body, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn admit_page(&self, base_domain: &str, max_pages: i64) -> Result<i64> {
        let mut conn = self.conn.clone();
        let count: i64 = self
            .admit
            .key(COUNT_KEY)
            .arg(base_domain)
            .arg(max_pages)
            .invoke_async(&mut conn)
            .await
            .context("quota script failed")?;
        Ok(count)
    }

    async fn release_page(&self, base_domain: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.hincr::<_, _, _, ()>(COUNT_KEY, base_domain, -1).await?;
        Ok(())
    }
}

#[async_trait]
impl RankingStore for RedisStore {
    async fn register_term(&self, term: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(AUTOCOMPLETE_KEY, term, 0f64).await?;
        Ok(())
    }

    async fn bump_query_score(&self, query: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.zincr::<_, _, _, ()>(SEARCH_SCORES_KEY, query, 1f64).await?;
        Ok(())
    }

    async fn terms_with_prefix(&self, prefix: &str, limit: usize) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let min = format!("[{prefix}");
        let mut max = format!("[{prefix}").into_bytes();
        max.push(0xff);
        let terms: Vec<String> = redis::cmd("ZRANGEBYLEX")
            .arg(AUTOCOMPLETE_KEY)
            .arg(min)
            .arg(max)
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await
            .context("redis lookup failed")?;
        Ok(terms)
    }

    async fn term_scores(&self, terms: &[String]) -> Result<Vec<f64>> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for term in terms {
            pipe.zscore(SEARCH_SCORES_KEY, term);
        }
        let scores: Vec<Option<f64>> = pipe
            .query_async(&mut conn)
            .await
            .context("ranking pipeline failed")?;
        Ok(scores.into_iter().map(|s| s.unwrap_or(0.0)).collect())
    }
}

#[derive(Default)]
struct MemoryInner {
    visited: HashSet<String>,
    robots: HashMap<String, String>,
    counts: HashMap<String, i64>,
    terms: BTreeSet<String>,
    scores: HashMap<String, f64>,
}

/// In-memory store used by tests and bus-less single-node runs.
///
/// TTLs are accepted but not expired.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    /// Builds an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current counter for a base domain (test observability).
    pub fn page_count(&self, base_domain: &str) -> i64 {
        *self
            .inner
            .lock()
            .unwrap()
            .counts
            .get(base_domain)
            .unwrap_or(&0)
    }
}

#[async_trait]
impl PolitenessStore for MemoryStore {
    async fn visit_if_new(&self, url: &str, _ttl: Duration) -> Result<bool> {
        Ok(self.inner.lock().unwrap().visited.insert(url.to_string()))
    }

    async fn forget_visit(&self, url: &str) -> Result<()> {
        self.inner.lock().unwrap().visited.remove(url);
        Ok(())
    }

    async fn robots_body(&self, host: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().unwrap().robots.get(host).cloned())
    }

    async fn store_robots(&self, host: &str, body: &str, _ttl: Duration) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .robots
            .insert(host.to_string(), body.to_string());
        Ok(())
    }

    async fn admit_page(&self, base_domain: &str, max_pages: i64) -> Result<i64> {
        let mut inner = self.inner.lock().unwrap();
        let count = inner.counts.entry(base_domain.to_string()).or_insert(0);
        if *count >= max_pages {
            return Ok(-1);
        }
        *count += 1;
        Ok(*count)
    }

    async fn release_page(&self, base_domain: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        *inner.counts.entry(base_domain.to_string()).or_insert(0) -= 1;
        Ok(())
    }
}

#[async_trait]
impl RankingStore for MemoryStore {
    async fn register_term(&self, term: &str) -> Result<()> {
        self.inner.lock().unwrap().terms.insert(term.to_string());
        Ok(())
    }

    async fn bump_query_score(&self, query: &str) -> Result<()> {
        *self
            .inner
            .lock()
            .unwrap()
            .scores
            .entry(query.to_string())
            .or_insert(0.0) += 1.0;
        Ok(())
    }

    async fn terms_with_prefix(&self, prefix: &str, limit: usize) -> Result<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .terms
            .range(prefix.to_string()..)
            .take_while(|t| t.starts_with(prefix))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn term_scores(&self, terms: &[String]) -> Result<Vec<f64>> {
        let inner = self.inner.lock().unwrap();
        Ok(terms
            .iter()
            .map(|t| *inner.scores.get(t).unwrap_or(&0.0))
            .collect())
    }
}
