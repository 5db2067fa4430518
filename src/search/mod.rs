//! Upstream post search.
//!
//! The harvest pipeline only sees the [`SearchClient`] trait: one call returns
//! one newest-first page plus an opaque token for the next (older) page.
//! [`HttpSearchClient`] speaks the v1.1 JSON search API.

mod twitter;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use twitter::HttpSearchClient;

/// A single post returned by the search API. Immutable once fetched.
#[derive(Debug, Clone, PartialEq)]
pub struct Post {
    pub id: i64,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub favorite_count: i64,
    pub retweet_count: i64,
    /// Screen name of the posting account
    pub author: String,
    /// Structured URL entities, expanded form preferred
    pub urls: Vec<String>,
}

/// One page of search results, newest first.
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub posts: Vec<Post>,
    /// Token for the next older page, `None` when the result set is exhausted
    pub next_page: Option<String>,
}

/// Errors that can occur while fetching search results.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the configured timeout
    #[error("Request timed out")]
    Timeout,
    /// Response body was not the expected JSON shape
    #[error("Parse error: {0}")]
    Parse(String),
    /// Server returned 429 Too Many Requests after max retries
    #[error("Rate limited after {0} retries")]
    RateLimited(u32),
    /// Response body exceeded the size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    /// The run was cancelled between pages
    #[error("Fetch cancelled")]
    Cancelled,
}

/// Paginated, reverse-chronological search over the upstream post source.
#[async_trait]
pub trait SearchClient: Send + Sync {
    /// Fetch one page for `query`. `page` is `None` for the newest page and
    /// otherwise a token previously returned in [`SearchPage::next_page`].
    async fn search(&self, query: &str, page: Option<&str>) -> Result<SearchPage, FetchError>;
}
