use chrono::{DateTime, Utc};

/// A link found in a post, not yet resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkCandidate {
    /// Arrival position within the run; orders downstream merges
    pub ordinal: u64,
    pub source_post_id: i64,
    pub raw_address: String,
    pub created_at: DateTime<Utc>,
    pub favorite_count: i64,
    pub query: String,
    pub author: String,
    pub text: String,
}

impl LinkCandidate {
    /// Score contributed by the source post: one for the post plus its favorites.
    pub fn weight(&self) -> i64 {
        self.favorite_count.max(0).saturating_add(1)
    }
}

/// A candidate after redirect following and title scraping.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedLink {
    pub candidate: LinkCandidate,
    /// Final URL after redirects, fragment removed
    pub canonical_address: String,
    /// Page title, `None` when the document had none
    pub title: Option<String>,
}
