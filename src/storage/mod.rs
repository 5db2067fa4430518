mod schema;
mod tallies;
mod types;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use schema::Database;
pub use types::{DatabaseError, ScoreTally, TallyPost, TallyUpdate};

/// The slice of the durable store the harvest pipeline writes through.
///
/// [`Database`] is the production implementation; tests substitute fakes to
/// inject per-address failures.
#[async_trait]
pub trait TallyStore: Send + Sync {
    /// Newest `last_active` across all tallies for `query`.
    async fn watermark(&self, query: &str) -> Result<Option<DateTime<Utc>>, DatabaseError>;

    /// Atomically merge one address's update into its stored tally.
    async fn upsert_tally(&self, update: &TallyUpdate) -> Result<ScoreTally, DatabaseError>;
}

#[async_trait]
impl TallyStore for Database {
    async fn watermark(&self, query: &str) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        Database::watermark(self, query).await
    }

    async fn upsert_tally(&self, update: &TallyUpdate) -> Result<ScoreTally, DatabaseError> {
        Database::upsert_tally(self, update).await
    }
}
