use super::resolver::Resolver;
use super::types::{LinkCandidate, ResolvedLink};
use crate::util::canonical_address;
use futures::stream::{self, StreamExt};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Raw addresses remembered within one run
const CACHE_CAPACITY: usize = 1024;

/// What the cache remembers per raw address: `None` for a failed resolution.
type CachedResolution = Option<(String, Option<String>)>;

/// Counters for one pool pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub resolved: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub cache_hits: usize,
}

enum Outcome {
    Resolved { link: ResolvedLink, cached: bool },
    Failed { cached: bool },
    Cancelled,
}

/// Resolves candidates with at most `workers` fetches in flight.
///
/// [`ResolverPool::run`] returns only after every candidate has been
/// resolved, failed or skipped, which is the barrier before aggregation.
pub struct ResolverPool {
    resolver: Arc<dyn Resolver>,
    workers: usize,
    cache: Mutex<LruCache<String, CachedResolution>>,
}

impl ResolverPool {
    pub fn new(resolver: Arc<dyn Resolver>, workers: usize) -> Self {
        let capacity = NonZeroUsize::new(CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            resolver,
            workers: workers.max(1),
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Drains `candidates` and returns the resolved links in completion order.
    pub async fn run(
        &self,
        candidates: mpsc::Receiver<LinkCandidate>,
        cancel: &CancellationToken,
    ) -> (Vec<ResolvedLink>, PoolStats) {
        let incoming = stream::unfold(candidates, |mut rx| async move {
            rx.recv().await.map(|candidate| (candidate, rx))
        });

        let outcomes: Vec<Outcome> = incoming
            .map(|candidate| self.resolve_one(candidate, cancel))
            .buffer_unordered(self.workers)
            .collect()
            .await;

        let mut stats = PoolStats::default();
        let mut links = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            match outcome {
                Outcome::Resolved { link, cached } => {
                    stats.resolved += 1;
                    stats.cache_hits += usize::from(cached);
                    links.push(link);
                }
                Outcome::Failed { cached } => {
                    stats.failed += 1;
                    stats.cache_hits += usize::from(cached);
                }
                Outcome::Cancelled => stats.cancelled += 1,
            }
        }

        (links, stats)
    }

    async fn resolve_one(&self, candidate: LinkCandidate, cancel: &CancellationToken) -> Outcome {
        if cancel.is_cancelled() {
            return Outcome::Cancelled;
        }

        if let Some(cached) = self.cached(&candidate.raw_address) {
            return match cached {
                Some((canonical_address, title)) => Outcome::Resolved {
                    link: ResolvedLink {
                        candidate,
                        canonical_address,
                        title,
                    },
                    cached: true,
                },
                None => Outcome::Failed { cached: true },
            };
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => return Outcome::Cancelled,
            result = self.resolver.resolve(&candidate.raw_address) => result,
        };

        match result {
            Ok(resolution) => {
                let canonical = canonical_address(&resolution.final_url);
                tracing::debug!(
                    raw = %candidate.raw_address,
                    address = %canonical,
                    has_title = resolution.title.is_some(),
                    "Link resolved"
                );
                self.remember(
                    &candidate.raw_address,
                    Some((canonical.clone(), resolution.title.clone())),
                );
                Outcome::Resolved {
                    link: ResolvedLink {
                        candidate,
                        canonical_address: canonical,
                        title: resolution.title,
                    },
                    cached: false,
                }
            }
            Err(e) => {
                tracing::debug!(
                    raw = %candidate.raw_address,
                    post_id = candidate.source_post_id,
                    error = %e,
                    "Link resolution failed, dropping candidate"
                );
                self.remember(&candidate.raw_address, None);
                Outcome::Failed { cached: false }
            }
        }
    }

    fn cached(&self, raw_address: &str) -> Option<CachedResolution> {
        // A poisoned lock only loses cache entries
        let mut cache = self.cache.lock().ok()?;
        cache.get(raw_address).cloned()
    }

    fn remember(&self, raw_address: &str, value: CachedResolution) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(raw_address.to_owned(), value);
        }
    }
}
