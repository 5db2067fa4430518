//! One incremental harvest run for a query.
//!
//! ```text
//! Retriever ──posts──▶ Extractor ──candidates──▶ ResolverPool ─┐
//!                                                              │ barrier
//!                                   store ◀── Aggregator ◀─────┘
//! ```
//!
//! The three producing stages run concurrently on one task, joined by bounded
//! channels. Aggregation starts only after every resolution has finished.

mod aggregator;
mod extractor;
mod pool;
mod resolver;
mod retriever;
mod types;

pub use aggregator::{accumulate, Aggregator, CommitReport};
pub use extractor::{link_addresses, ExtractStats, Extractor, HasUrlFilter, LinkPolicy, PostFilter};
pub use pool::{PoolStats, ResolverPool};
pub use resolver::{HttpResolver, Resolution, ResolveError, Resolver, ResolverSettings};
pub use retriever::{RetrieveStats, Retriever};
pub use types::{LinkCandidate, ResolvedLink};

use crate::config::Config;
use crate::search::{FetchError, SearchClient};
use crate::storage::{DatabaseError, ScoreTally, TallyStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Capacity of the channels between stages
const STAGE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Invalid harvest request: {0}")]
    Config(String),

    #[error("Failed to read watermark: {0}")]
    Watermark(#[source] DatabaseError),

    #[error("Fetching posts failed: {0}")]
    FetchFailed(#[source] FetchError),

    #[error("Harvest cancelled")]
    Cancelled,
}

/// Where a run is. `Failed` is only reachable from `Fetching`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    /// Retrieval, extraction and resolution running concurrently, up to the
    /// barrier. Cancellation anywhere in this phase fails the run.
    Fetching,
    /// Barrier passed: every resolution has finished and the results are
    /// being tallied for commit.
    Resolving,
    Aggregating,
    Done,
    Failed,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Fetching => "fetching",
            RunState::Resolving => "resolving",
            RunState::Aggregating => "aggregating",
            RunState::Done => "done",
            RunState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Per-run tuning.
#[derive(Debug, Clone)]
pub struct HarvestSettings {
    /// Reach of the first run when no tallies exist yet
    pub lookback: chrono::Duration,
    pub max_pages: usize,
    pub resolver_workers: usize,
    pub commit_concurrency: usize,
    pub link_policy: LinkPolicy,
}

impl Default for HarvestSettings {
    fn default() -> Self {
        Self {
            lookback: chrono::Duration::hours(24),
            max_pages: 10,
            resolver_workers: 8,
            commit_concurrency: 4,
            link_policy: LinkPolicy::EveryLink,
        }
    }
}

impl HarvestSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            lookback: i64::try_from(config.lookback_hours)
                .ok()
                .and_then(chrono::Duration::try_hours)
                .unwrap_or_else(|| chrono::Duration::hours(24)),
            max_pages: config.max_pages,
            resolver_workers: config.resolver_workers,
            commit_concurrency: config.commit_concurrency,
            link_policy: config.link_policy,
        }
    }
}

/// The collaborators a run talks to. Cloning shares them.
#[derive(Clone)]
pub struct HarvestContext {
    pub search: Arc<dyn SearchClient>,
    pub resolver: Arc<dyn Resolver>,
    pub store: Arc<dyn TallyStore>,
    pub cancel: CancellationToken,
}

/// Summary of a completed run.
#[derive(Debug)]
pub struct HarvestReport {
    pub query: String,
    /// Posts at or before this instant were not fetched
    pub cutoff: DateTime<Utc>,
    pub pages: usize,
    pub posts: usize,
    pub candidates: usize,
    pub resolved: usize,
    pub resolve_failures: usize,
    pub committed: Vec<ScoreTally>,
    pub persist_failures: usize,
    pub state: RunState,
}

/// Runs harvests for one set of collaborators.
pub struct Harvester {
    ctx: HarvestContext,
    settings: HarvestSettings,
    state: RunState,
}

impl Harvester {
    pub fn new(ctx: HarvestContext, settings: HarvestSettings) -> Self {
        Self {
            ctx,
            settings,
            state: RunState::Idle,
        }
    }

    /// State reached by the most recent run.
    pub fn state(&self) -> RunState {
        self.state
    }

    fn transition(&mut self, query: &str, next: RunState) {
        tracing::info!(query = %query, from = %self.state, to = %next, "Harvest state change");
        self.state = next;
    }

    /// Harvests everything newer than the query's watermark.
    ///
    /// Dropped candidates and addresses that fail to persist do not fail the
    /// run. A fetch error or cancellation before the barrier fails it without
    /// committing anything, so the watermark cannot skip unfetched posts.
    pub async fn run(&mut self, query: &str) -> Result<HarvestReport, HarvestError> {
        self.state = RunState::Idle;
        let query = query.trim();
        if query.is_empty() {
            return Err(HarvestError::Config("query must not be empty".to_string()));
        }

        let cutoff = match self.ctx.store.watermark(query).await {
            Ok(Some(mark)) => mark,
            Ok(None) => Utc::now() - self.settings.lookback,
            Err(e) => return Err(HarvestError::Watermark(e)),
        };

        self.transition(query, RunState::Fetching);
        tracing::info!(query = %query, cutoff = %cutoff, "Fetching posts newer than watermark");

        // Child token so a fetch failure can stop resolution without
        // cancelling the caller's token
        let run_cancel = self.ctx.cancel.child_token();
        let retriever = Retriever::new(Arc::clone(&self.ctx.search), self.settings.max_pages);
        let mut extractor = Extractor::new(query, self.settings.link_policy);
        let pool = ResolverPool::new(Arc::clone(&self.ctx.resolver), self.settings.resolver_workers);

        let (post_tx, post_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);
        let (candidate_tx, candidate_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);

        let fetch = async {
            let result = retriever.fetch(query, cutoff, post_tx, &run_cancel).await;
            if result.is_err() {
                run_cancel.cancel();
            }
            result
        };

        let (fetched, extracted, (links, pool_stats)) = tokio::join!(
            fetch,
            extractor.run(post_rx, candidate_tx),
            pool.run(candidate_rx, &run_cancel),
        );

        let fetch_stats = match fetched {
            Ok(stats) => stats,
            Err(FetchError::Cancelled) => {
                self.transition(query, RunState::Failed);
                return Err(HarvestError::Cancelled);
            }
            Err(e) => {
                tracing::error!(query = %query, error = %e, "Fetch failed, nothing committed");
                self.transition(query, RunState::Failed);
                return Err(HarvestError::FetchFailed(e));
            }
        };

        if fetch_stats.posts == 0 {
            tracing::info!(query = %query, "No new posts since watermark");
            self.transition(query, RunState::Done);
            return Ok(HarvestReport {
                query: query.to_owned(),
                cutoff,
                pages: fetch_stats.pages,
                posts: 0,
                candidates: 0,
                resolved: 0,
                resolve_failures: 0,
                committed: Vec::new(),
                persist_failures: 0,
                state: self.state,
            });
        }

        if self.ctx.cancel.is_cancelled() {
            tracing::warn!(
                query = %query,
                skipped = pool_stats.cancelled,
                "Cancelled before aggregation, nothing committed"
            );
            self.transition(query, RunState::Failed);
            return Err(HarvestError::Cancelled);
        }

        // Resolution itself ran under Fetching; this marks the barrier
        self.transition(query, RunState::Resolving);
        tracing::info!(
            query = %query,
            posts = fetch_stats.posts,
            candidates = extracted.candidates,
            resolved = pool_stats.resolved,
            failed = pool_stats.failed,
            cache_hits = pool_stats.cache_hits,
            "All resolutions finished"
        );

        self.transition(query, RunState::Aggregating);
        let aggregator = Aggregator::new(Arc::clone(&self.ctx.store), self.settings.commit_concurrency);
        let commit = aggregator.aggregate(links).await;

        self.transition(query, RunState::Done);
        tracing::info!(
            query = %query,
            committed = commit.committed.len(),
            persist_failures = commit.persist_failures,
            "Harvest complete"
        );

        Ok(HarvestReport {
            query: query.to_owned(),
            cutoff,
            pages: fetch_stats.pages,
            posts: fetch_stats.posts,
            candidates: extracted.candidates,
            resolved: pool_stats.resolved,
            resolve_failures: pool_stats.failed,
            committed: commit.committed,
            persist_failures: commit.persist_failures,
            state: self.state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::{Post, SearchPage};
    use crate::storage::TallyUpdate;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use url::Url;

    struct OnePage(Vec<Post>);

    #[async_trait]
    impl SearchClient for OnePage {
        async fn search(&self, _query: &str, _page: Option<&str>) -> Result<SearchPage, FetchError> {
            Ok(SearchPage {
                posts: self.0.clone(),
                next_page: None,
            })
        }
    }

    struct Broken;

    #[async_trait]
    impl SearchClient for Broken {
        async fn search(&self, _query: &str, _page: Option<&str>) -> Result<SearchPage, FetchError> {
            Err(FetchError::HttpStatus(500))
        }
    }

    struct Echo;

    #[async_trait]
    impl Resolver for Echo {
        async fn resolve(&self, raw: &str) -> Result<Resolution, ResolveError> {
            Ok(Resolution {
                final_url: Url::parse(raw).map_err(crate::util::UrlValidationError::from)?,
                title: None,
            })
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        upserts: Mutex<Vec<TallyUpdate>>,
    }

    #[async_trait]
    impl TallyStore for MemoryStore {
        async fn watermark(&self, _query: &str) -> Result<Option<DateTime<Utc>>, DatabaseError> {
            Ok(None)
        }

        async fn upsert_tally(&self, update: &TallyUpdate) -> Result<ScoreTally, DatabaseError> {
            self.upserts.lock().unwrap().push(update.clone());
            Ok(ScoreTally::from_update(update))
        }
    }

    fn post(id: i64, url: &str) -> Post {
        Post {
            id,
            text: "text".to_string(),
            created_at: Utc::now(),
            favorite_count: 1,
            retweet_count: 0,
            author: "erin".to_string(),
            urls: vec![url.to_string()],
        }
    }

    fn harvester(search: Arc<dyn SearchClient>, store: Arc<MemoryStore>) -> Harvester {
        Harvester::new(
            HarvestContext {
                search,
                resolver: Arc::new(Echo),
                store,
                cancel: CancellationToken::new(),
            },
            HarvestSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_empty_query_is_config_error() {
        let store = Arc::new(MemoryStore::default());
        let mut h = harvester(Arc::new(OnePage(vec![])), store);
        assert!(matches!(h.run("   ").await, Err(HarvestError::Config(_))));
        assert_eq!(h.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn test_no_posts_goes_straight_to_done() {
        let store = Arc::new(MemoryStore::default());
        let mut h = harvester(Arc::new(OnePage(vec![])), store.clone());

        let report = h.run("rust").await.unwrap();

        assert_eq!(report.state, RunState::Done);
        assert_eq!(report.posts, 0);
        assert!(store.upserts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_failure_commits_nothing() {
        let store = Arc::new(MemoryStore::default());
        let mut h = harvester(Arc::new(Broken), store.clone());

        assert!(matches!(h.run("rust").await, Err(HarvestError::FetchFailed(_))));
        assert_eq!(h.state(), RunState::Failed);
        assert!(store.upserts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_commits_each_address() {
        let store = Arc::new(MemoryStore::default());
        let search = Arc::new(OnePage(vec![
            post(3, "https://a.example/"),
            post(2, "https://b.example/"),
            post(1, "https://a.example/"),
        ]));
        let mut h = harvester(search, store.clone());

        let report = h.run("rust").await.unwrap();

        assert_eq!(report.state, RunState::Done);
        assert_eq!(report.posts, 3);
        assert_eq!(report.candidates, 3);
        assert_eq!(report.committed.len(), 2);
        let a = report
            .committed
            .iter()
            .find(|t| t.address == "https://a.example/")
            .unwrap();
        assert_eq!(a.score, 4);
        assert_eq!(a.contributing_post_ids, vec![3, 1]);
    }

    #[tokio::test]
    async fn test_cancelled_run_commits_nothing() {
        let store = Arc::new(MemoryStore::default());
        let mut h = harvester(Arc::new(OnePage(vec![post(1, "https://a.example/")])), store.clone());
        h.ctx.cancel.cancel();

        assert!(matches!(h.run("rust").await, Err(HarvestError::Cancelled)));
        assert_eq!(h.state(), RunState::Failed);
        assert!(store.upserts.lock().unwrap().is_empty());
    }

    struct CancelOnResolve(CancellationToken);

    #[async_trait]
    impl Resolver for CancelOnResolve {
        async fn resolve(&self, raw: &str) -> Result<Resolution, ResolveError> {
            self.0.cancel();
            Echo.resolve(raw).await
        }
    }

    #[tokio::test]
    async fn test_cancel_during_resolution_fails_from_fetching() {
        let store = Arc::new(MemoryStore::default());
        let cancel = CancellationToken::new();
        let mut h = Harvester::new(
            HarvestContext {
                search: Arc::new(OnePage(vec![post(1, "https://a.example/")])),
                resolver: Arc::new(CancelOnResolve(cancel.clone())),
                store: store.clone(),
                cancel,
            },
            HarvestSettings::default(),
        );

        assert!(matches!(h.run("rust").await, Err(HarvestError::Cancelled)));
        assert_eq!(h.state(), RunState::Failed);
        assert!(store.upserts.lock().unwrap().is_empty());
    }
}
