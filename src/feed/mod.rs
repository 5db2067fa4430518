//! Republishes a query's most popular links as an RSS feed.
//!
//! - [`assemble`] reads recently active tallies and ranks them
//! - [`render_rss`] serializes the result as RSS 2.0
//! - [`write_to_file`] replaces an output file atomically

mod rss;

pub use rss::{render_rss, write_to_file};

use crate::config::Config;
use crate::storage::{Database, DatabaseError, ScoreTally, TallyPost};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Failed to read tallies: {0}")]
    Database(#[from] DatabaseError),

    #[error("Failed to write RSS: {0}")]
    Xml(String),
}

/// Window, size and channel link for a rendered feed.
#[derive(Debug, Clone)]
pub struct FeedSettings {
    pub window: chrono::Duration,
    pub max_items: usize,
    pub link: Option<String>,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            window: chrono::Duration::days(7),
            max_items: 50,
            link: None,
        }
    }
}

impl FeedSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            window: i64::try_from(config.feed_window_days)
                .ok()
                .and_then(chrono::Duration::try_days)
                .unwrap_or_else(|| chrono::Duration::days(7)),
            max_items: config.feed_max_items,
            link: config.feed_link.clone(),
        }
    }
}

/// One `<item>`: a tally plus the posts that mentioned it.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedItem {
    pub guid: String,
    pub address: String,
    pub title: String,
    pub score: i64,
    pub last_active: DateTime<Utc>,
    pub posts: Vec<TallyPost>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Feed {
    pub query: String,
    pub title: String,
    pub link: String,
    pub description: String,
    pub generated_at: DateTime<Utc>,
    pub items: Vec<FeedItem>,
}

/// Stable item identifier: hex SHA-256 of `query|address`.
pub fn item_guid(query: &str, address: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.as_bytes());
    hasher.update(b"|");
    hasher.update(address.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Orders tallies by score, then recency, then address for stable output.
fn ranking(a: &ScoreTally, b: &ScoreTally) -> std::cmp::Ordering {
    b.score
        .cmp(&a.score)
        .then_with(|| b.last_active.cmp(&a.last_active))
        .then_with(|| a.address.cmp(&b.address))
}

fn default_link(query: &str) -> String {
    url::Url::parse_with_params("https://twitter.com/search", &[("q", query)])
        .map(|u| u.to_string())
        .unwrap_or_else(|_| "https://twitter.com/search".to_string())
}

/// Builds the feed for `query` from tallies active within the window before `now`.
pub async fn assemble(
    db: &Database,
    query: &str,
    settings: &FeedSettings,
    now: DateTime<Utc>,
) -> Result<Feed, FeedError> {
    let since = now - settings.window;
    let mut active = db.list_active_with_posts(query, since, None).await?;
    active.sort_by(|(a, _), (b, _)| ranking(a, b));
    active.truncate(settings.max_items);

    let items: Vec<FeedItem> = active
        .into_iter()
        .map(|(tally, posts)| FeedItem {
            guid: item_guid(query, &tally.address),
            title: if tally.title.is_empty() {
                tally.address.clone()
            } else {
                tally.title
            },
            posts,
            address: tally.address,
            score: tally.score,
            last_active: tally.last_active,
        })
        .collect();

    tracing::info!(query = %query, items = items.len(), since = %since, "Assembled feed");

    Ok(Feed {
        query: query.to_owned(),
        title: format!("Link harvest: {}", query),
        link: settings.link.clone().unwrap_or_else(|| default_link(query)),
        description: format!("Most shared links about: {}", query),
        generated_at: now,
        items,
    })
}
