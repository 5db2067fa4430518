use chrono::{DateTime, Utc};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds the database lock
    #[error("Another linkharvest process appears to be using the database. Please wait and try again.")]
    InstanceLocked,

    /// Schema creation failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// A stored row could not be converted back into a domain value
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5), SQLITE_LOCKED (6), SQLITE_CANTOPEN (14)
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return DatabaseError::InstanceLocked;
        }

        DatabaseError::Other(err)
    }
}

// ============================================================================
// Helper Types
// ============================================================================

/// Row type for tally queries
pub(crate) type TallyRow = (String, String, i64, i64, String);

/// Row type for contributing post queries
pub(crate) type TallyPostRow = (String, i64, String, String, i64);

pub(crate) fn timestamp_to_utc(secs: i64) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| DatabaseError::Corrupt(format!("timestamp out of range: {}", secs)))
}

// ============================================================================
// Data Structures
// ============================================================================

/// A post that contributed to a tally, kept so feeds can show what was said
/// about the address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TallyPost {
    pub post_id: i64,
    pub author: String,
    pub text: String,
    /// Score contribution of this post (`favorites + 1`)
    pub weight: i64,
}

/// The per-address accumulator produced by one harvest run.
///
/// `posts` is in arrival order and free of duplicate post IDs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TallyUpdate {
    pub query: String,
    pub address: String,
    pub last_active: DateTime<Utc>,
    /// First non-empty title seen for this address in the run (may be empty)
    pub title: String,
    pub posts: Vec<TallyPost>,
}

impl TallyUpdate {
    /// Sum of the post weights carried by this update.
    pub fn score(&self) -> i64 {
        self.posts.iter().map(|p| p.weight).sum()
    }
}

/// Persisted aggregate for one canonical address under one query.
///
/// `score` never decreases, `last_active` is the newest post time ever folded
/// in, and `contributing_post_ids` never repeats an ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoreTally {
    pub query: String,
    pub address: String,
    pub score: i64,
    pub last_active: DateTime<Utc>,
    pub title: String,
    pub contributing_post_ids: Vec<i64>,
}

impl ScoreTally {
    /// An empty tally with no contributing posts.
    pub fn new(query: &str, address: &str, last_active: DateTime<Utc>) -> Self {
        Self {
            query: query.to_owned(),
            address: address.to_owned(),
            score: 0,
            last_active,
            title: String::new(),
            contributing_post_ids: Vec::new(),
        }
    }

    /// Builds a fresh tally from an update, as if nothing had been stored before.
    pub fn from_update(update: &TallyUpdate) -> Self {
        let mut tally = Self::new(&update.query, &update.address, update.last_active);
        tally.absorb(update);
        tally
    }

    /// Folds an update into this tally and returns the posts that were new.
    ///
    /// Posts whose IDs are already present add nothing, so absorbing the same
    /// update twice leaves the tally unchanged. The stored title is only
    /// replaced when it is empty.
    pub fn absorb<'a>(&mut self, update: &'a TallyUpdate) -> Vec<&'a TallyPost> {
        let mut added = Vec::new();
        for post in &update.posts {
            if self.contributing_post_ids.contains(&post.post_id) {
                continue;
            }
            self.contributing_post_ids.push(post.post_id);
            self.score = self.score.saturating_add(post.weight);
            added.push(post);
        }

        if update.last_active > self.last_active {
            self.last_active = update.last_active;
        }

        if self.title.is_empty() && !update.title.is_empty() {
            self.title = update.title.clone();
        }

        added
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn post(id: i64, weight: i64) -> TallyPost {
        TallyPost {
            post_id: id,
            author: "someone".into(),
            text: format!("post {}", id),
            weight,
        }
    }

    fn update(posts: Vec<TallyPost>, at: i64, title: &str) -> TallyUpdate {
        TallyUpdate {
            query: "rust".into(),
            address: "https://example.com/a".into(),
            last_active: DateTime::from_timestamp(at, 0).unwrap(),
            title: title.into(),
            posts,
        }
    }

    #[test]
    fn test_from_update_sums_weights() {
        let tally = ScoreTally::from_update(&update(vec![post(1, 3), post(2, 1)], 100, "T"));
        assert_eq!(tally.score, 4);
        assert_eq!(tally.contributing_post_ids, vec![1, 2]);
        assert_eq!(tally.title, "T");
    }

    #[test]
    fn test_absorb_same_update_twice_is_noop() {
        let u = update(vec![post(1, 3)], 100, "");
        let mut tally = ScoreTally::from_update(&u);
        let added = tally.absorb(&u);
        assert!(added.is_empty());
        assert_eq!(tally.score, 3);
        assert_eq!(tally.contributing_post_ids, vec![1]);
    }

    #[test]
    fn test_absorb_adds_new_posts_only() {
        let mut tally = ScoreTally::from_update(&update(vec![post(1, 2)], 100, ""));
        let next = update(vec![post(1, 2), post(2, 5)], 200, "");
        let added = tally.absorb(&next);
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].post_id, 2);
        assert_eq!(tally.score, 7);
        assert_eq!(tally.contributing_post_ids, vec![1, 2]);
        assert_eq!(tally.last_active.timestamp(), 200);
    }

    #[test]
    fn test_absorb_keeps_newest_last_active() {
        let mut tally = ScoreTally::from_update(&update(vec![post(1, 1)], 500, ""));
        tally.absorb(&update(vec![post(2, 1)], 100, ""));
        assert_eq!(tally.last_active.timestamp(), 500);
    }

    #[test]
    fn test_absorb_title_only_fills_empty() {
        let mut tally = ScoreTally::from_update(&update(vec![post(1, 1)], 100, ""));
        tally.absorb(&update(vec![post(2, 1)], 100, "First"));
        assert_eq!(tally.title, "First");
        tally.absorb(&update(vec![post(3, 1)], 100, "Second"));
        assert_eq!(tally.title, "First");
    }
}
