use super::types::ResolvedLink;
use crate::storage::{ScoreTally, TallyPost, TallyStore, TallyUpdate};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;

/// Merges one run's resolved links into per-address updates.
///
/// Links are folded in `ordinal` order whatever order they resolved in, so
/// the first non-empty title and the post order are reproducible. A post
/// that appears more than once for the same address contributes its weight
/// once. Updates come back in order of each address's first appearance.
pub fn accumulate(mut links: Vec<ResolvedLink>) -> Vec<TallyUpdate> {
    links.sort_by_key(|link| link.candidate.ordinal);

    let mut index: HashMap<String, usize> = HashMap::new();
    let mut updates: Vec<TallyUpdate> = Vec::new();

    for link in links {
        let ResolvedLink {
            candidate,
            canonical_address,
            title,
        } = link;

        let slot = match index.get(&canonical_address) {
            Some(&slot) => slot,
            None => {
                index.insert(canonical_address.clone(), updates.len());
                updates.push(TallyUpdate {
                    query: candidate.query.clone(),
                    address: canonical_address,
                    last_active: candidate.created_at,
                    title: String::new(),
                    posts: Vec::new(),
                });
                updates.len() - 1
            }
        };
        let update = &mut updates[slot];

        if update.title.is_empty() {
            if let Some(title) = title.filter(|t| !t.is_empty()) {
                update.title = title;
            }
        }

        if update.posts.iter().any(|p| p.post_id == candidate.source_post_id) {
            continue;
        }
        update.last_active = update.last_active.max(candidate.created_at);
        update.posts.push(TallyPost {
            post_id: candidate.source_post_id,
            weight: candidate.weight(),
            author: candidate.author,
            text: candidate.text,
        });
    }

    updates
}

/// Result of committing one run's updates.
#[derive(Debug, Default)]
pub struct CommitReport {
    pub committed: Vec<ScoreTally>,
    /// Addresses whose transaction failed and were dropped for this run
    pub persist_failures: usize,
}

/// Commits accumulated updates, one transaction per address.
pub struct Aggregator {
    store: Arc<dyn TallyStore>,
    concurrency: usize,
}

impl Aggregator {
    pub fn new(store: Arc<dyn TallyStore>, concurrency: usize) -> Self {
        Self {
            store,
            concurrency: concurrency.max(1),
        }
    }

    /// Upserts every update; a failing address is logged and skipped.
    pub async fn commit(&self, updates: Vec<TallyUpdate>) -> CommitReport {
        let results: Vec<_> = stream::iter(updates)
            .map(|update| {
                let store = Arc::clone(&self.store);
                async move {
                    let result = store.upsert_tally(&update).await;
                    (update, result)
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = CommitReport::default();
        for (update, result) in results {
            match result {
                Ok(tally) => {
                    tracing::debug!(
                        query = %tally.query,
                        address = %tally.address,
                        score = tally.score,
                        "Tally committed"
                    );
                    report.committed.push(tally);
                }
                Err(e) => {
                    tracing::warn!(
                        query = %update.query,
                        address = %update.address,
                        error = %e,
                        "PersistFailed: dropping address for this run"
                    );
                    report.persist_failures += 1;
                }
            }
        }

        report
    }

    /// [`accumulate`] followed by [`Aggregator::commit`].
    pub async fn aggregate(&self, links: Vec<ResolvedLink>) -> CommitReport {
        self.commit(accumulate(links)).await
    }
}
