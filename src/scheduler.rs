//! Min-heap domain scheduler for the in-process engine variant.
//!
//! Not internally synchronized: a single coordinator task owns this state and
//! exchanges jobs and results with workers over channels.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use url::Url;

use crate::netutil::base_domain;

/// One crawl assignment handed to a fetch worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlJob {
    /// Absolute URL to fetch.
    pub url: String,
    /// Depth of this URL in the crawl tree.
    pub depth: u32,
    /// Depth ceiling inherited from the seed.
    pub max_depth: u32,
    /// Base-domain restriction; empty means unrestricted.
    pub allowed_domain: String,
}

/// Outcome of one fetch, reported back to the coordinator.
#[derive(Debug, Clone, Default)]
pub struct CrawlOutcome {
    /// URL that was fetched.
    pub url: String,
    /// Depth of the fetched URL.
    pub depth: u32,
    /// Depth ceiling inherited from the seed.
    pub max_depth: u32,
    /// Base-domain restriction carried through.
    pub allowed_domain: String,
    /// Extracted page title.
    pub title: String,
    /// Extracted page text.
    pub content: String,
    /// Discovered absolute links.
    pub links: Vec<String>,
    /// Fetch or policy error, if any; errored results enqueue nothing.
    pub error: Option<String>,
}

struct DomainState {
    base_domain: String,
    queue: VecDeque<UrlJob>,
    last_crawl: Option<Instant>,
    page_count: u64,
    in_heap: bool,
}

/// Fair per-domain scheduler.
///
/// The heap orders domains by `last_crawl + log1p(pages) * 10s`, so a domain
/// that dominates the queue naturally yields to rarely-crawled ones.
pub struct Coordinator {
    domains: HashMap<String, DomainState>,
    heap: BinaryHeap<Reverse<(Duration, String)>>,
    base_domain_counts: HashMap<String, u64>,
    visited: HashSet<String>,
    politeness: Duration,
    active_workers: usize,
    max_pages_per_domain: u64,
    epoch: Instant,
}

impl Coordinator {
    /// Builds a coordinator with the given per-domain politeness interval.
    pub fn new(politeness: Duration) -> Self {
        Self {
            domains: HashMap::new(),
            heap: BinaryHeap::new(),
            base_domain_counts: HashMap::new(),
            visited: HashSet::new(),
            politeness,
            active_workers: 0,
            max_pages_per_domain: 1000,
            epoch: Instant::now(),
        }
    }

    /// Overrides the per-base-domain page quota.
    pub fn with_max_pages_per_domain(mut self, max: u64) -> Self {
        self.max_pages_per_domain = max;
        self
    }

    fn weight(&self, state: &DomainState) -> Duration {
        let base = state
            .last_crawl
            .map(|t| t.duration_since(self.epoch))
            .unwrap_or(Duration::ZERO);
        let penalty = ((state.page_count as f64).ln_1p() * 10.0).max(0.0);
        base + Duration::from_secs_f64(penalty)
    }

    fn push_heap(&mut self, host: &str) {
        let weight = match self.domains.get(host) {
            Some(state) if !state.in_heap => self.weight(state),
            _ => return,
        };
        self.heap.push(Reverse((weight, host.to_string())));
        if let Some(state) = self.domains.get_mut(host) {
            state.in_heap = true;
        }
    }

    /// Validates and enqueues a URL under its host's queue.
    ///
    /// Silently drops: over-depth URLs, already-visited URLs, unparseable
    /// URLs, URLs without a host, out-of-restriction domains and domains at
    /// quota.
    pub fn add_url(&mut self, raw_url: &str, depth: u32, max_depth: u32, allowed_domain: &str) {
        if depth > max_depth {
            return;
        }
        if self.visited.contains(raw_url) {
            return;
        }

        let Ok(base) = base_domain(raw_url) else {
            return;
        };
        if !allowed_domain.is_empty() && base != allowed_domain {
            return;
        }
        if self
            .base_domain_counts
            .get(&base)
            .copied()
            .unwrap_or_default()
            >= self.max_pages_per_domain
        {
            return;
        }

        let Ok(url) = Url::parse(raw_url) else {
            return;
        };
        let Some(host) = url.host_str() else {
            return;
        };
        let host = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        self.visited.insert(raw_url.to_string());

        self.domains
            .entry(host.clone())
            .or_insert_with(|| DomainState {
                base_domain: base,
                queue: VecDeque::new(),
                last_crawl: None,
                page_count: 0,
                in_heap: false,
            })
            .queue
            .push_back(UrlJob {
                url: raw_url.to_string(),
                depth,
                max_depth,
                allowed_domain: allowed_domain.to_string(),
            });

        self.push_heap(&host);
    }

    /// Pops the next job respecting politeness and quotas.
    ///
    /// Returns `None` when the heap is empty or the top domain is still
    /// inside its politeness window.
    pub fn next_job(&mut self) -> Option<UrlJob> {
        loop {
            let Reverse((_, host)) = self.heap.peek()?.clone();
            let (last_crawl, base) = match self.domains.get(&host) {
                Some(state) => (state.last_crawl, state.base_domain.clone()),
                None => {
                    self.heap.pop();
                    continue;
                }
            };

            if let Some(last) = last_crawl {
                if last.elapsed() < self.politeness {
                    return None;
                }
            }

            self.heap.pop();

            if self
                .base_domain_counts
                .get(&base)
                .copied()
                .unwrap_or_default()
                >= self.max_pages_per_domain
            {
                self.domains.remove(&host);
                continue;
            }

            let (job, requeue) = {
                let state = self.domains.get_mut(&host)?;
                let Some(job) = state.queue.pop_front() else {
                    state.in_heap = false;
                    continue;
                };
                state.last_crawl = Some(Instant::now());
                state.page_count += 1;
                state.in_heap = false;
                (job, !state.queue.is_empty())
            };

            *self.base_domain_counts.entry(base).or_default() += 1;
            if requeue {
                self.push_heap(&host);
            }
            return Some(job);
        }
    }

    /// Remaining politeness wait for the top domain, or zero.
    pub fn time_to_next_job(&self) -> Duration {
        let Some(Reverse((_, host))) = self.heap.peek() else {
            return Duration::ZERO;
        };
        let Some(state) = self.domains.get(host) else {
            return Duration::ZERO;
        };
        match state.last_crawl {
            Some(last) => self.politeness.saturating_sub(last.elapsed()),
            None => Duration::ZERO,
        }
    }

    /// Folds a worker result back in: frees the worker slot and enqueues
    /// discovered links one level deeper. Errored results enqueue nothing.
    pub fn process_outcome(&mut self, outcome: CrawlOutcome) {
        self.active_workers = self.active_workers.saturating_sub(1);
        if outcome.error.is_some() {
            return;
        }
        for link in &outcome.links {
            self.add_url(
                link,
                outcome.depth + 1,
                outcome.max_depth,
                &outcome.allowed_domain,
            );
        }
    }

    /// Records a job handed to a worker.
    pub fn increment_active_workers(&mut self) {
        self.active_workers += 1;
    }

    /// Number of jobs currently held by workers.
    pub fn active_workers(&self) -> usize {
        self.active_workers
    }

    /// True while workers are busy or any domain queue is non-empty.
    pub fn has_work(&self) -> bool {
        if self.active_workers > 0 {
            return true;
        }
        self.domains.values().any(|state| !state.queue.is_empty())
    }
}
