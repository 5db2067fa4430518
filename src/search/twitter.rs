use super::{FetchError, Post, SearchClient, SearchPage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;
use url::Url;

const MAX_RETRIES: u32 = 3;
const MAX_RESPONSE_SIZE: usize = 5 * 1024 * 1024; // 5MB
const DEFAULT_PAGE_SIZE: u32 = 100;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RETRY_BASE: Duration = Duration::from_secs(2);

/// `created_at` format used by the v1.1 API, e.g. `Wed Oct 10 20:19:24 +0000 2018`
const CREATED_AT_FORMAT: &str = "%a %b %d %H:%M:%S %z %Y";

/// HTTP client for a v1.1-style search endpoint (`/1.1/search/tweets.json`).
///
/// The first page is requested with `q`, `count`, `result_type=recent` and
/// `include_entities=true`; subsequent pages reuse the `next_results` query
/// string the server hands back in `search_metadata`.
pub struct HttpSearchClient {
    client: reqwest::Client,
    endpoint: Url,
    bearer_token: Option<SecretString>,
    page_size: u32,
    timeout: Duration,
    retry_base: Duration,
}

impl HttpSearchClient {
    pub fn new(client: reqwest::Client, endpoint: Url) -> Self {
        Self {
            client,
            endpoint,
            bearer_token: None,
            page_size: DEFAULT_PAGE_SIZE,
            timeout: DEFAULT_TIMEOUT,
            retry_base: DEFAULT_RETRY_BASE,
        }
    }

    /// Sends `Authorization: Bearer <token>` with every request.
    pub fn with_bearer_token(mut self, token: Option<SecretString>) -> Self {
        self.bearer_token = token;
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// First backoff delay; doubles on each retry.
    pub fn with_retry_base(mut self, retry_base: Duration) -> Self {
        self.retry_base = retry_base;
        self
    }

    fn page_url(&self, query: &str, page: Option<&str>) -> Url {
        let mut url = self.endpoint.clone();
        match page {
            Some(token) => url.set_query(Some(token.trim_start_matches('?'))),
            None => {
                url.query_pairs_mut()
                    .clear()
                    .append_pair("q", query)
                    .append_pair("count", &self.page_size.to_string())
                    .append_pair("result_type", "recent")
                    .append_pair("include_entities", "true");
            }
        }
        url
    }

    async fn get_with_retry(&self, url: &Url) -> Result<Vec<u8>, FetchError> {
        let mut retry_count = 0;

        loop {
            let mut request = self.client.get(url.clone());
            if let Some(token) = &self.bearer_token {
                request = request.header("Authorization", format!("Bearer {}", token.expose_secret()));
            }

            let response = tokio::time::timeout(self.timeout, request.send())
                .await
                .map_err(|_| FetchError::Timeout)?
                .map_err(FetchError::Network)?;

            let status = response.status();

            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                if retry_count >= MAX_RETRIES {
                    return Err(FetchError::RateLimited(MAX_RETRIES));
                }
                let delay = self.retry_base * 2u32.pow(retry_count);
                tracing::warn!(
                    retry = retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Search API rate limited, backing off"
                );
                tokio::time::sleep(delay).await;
                retry_count += 1;
                continue;
            }

            if status.is_server_error() {
                if retry_count >= MAX_RETRIES {
                    return Err(FetchError::HttpStatus(status.as_u16()));
                }
                let delay = self.retry_base * 2u32.pow(retry_count);
                tracing::warn!(
                    status = %status,
                    retry = retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Search API server error, retrying after delay"
                );
                tokio::time::sleep(delay).await;
                retry_count += 1;
                continue;
            }

            // 4xx other than 429 fail immediately
            if !status.is_success() {
                return Err(FetchError::HttpStatus(status.as_u16()));
            }

            let body = tokio::time::timeout(
                self.timeout,
                read_limited_bytes(response, MAX_RESPONSE_SIZE),
            )
            .await
            .map_err(|_| FetchError::Timeout)?;

            match body {
                Ok(bytes) => return Ok(bytes),
                Err(FetchError::IncompleteResponse { expected, received }) => {
                    if retry_count >= MAX_RETRIES {
                        return Err(FetchError::IncompleteResponse { expected, received });
                    }
                    tracing::debug!(
                        expected = expected,
                        received = received,
                        attempt = retry_count + 1,
                        "Retrying incomplete search response"
                    );
                    tokio::time::sleep(self.retry_base * 2u32.pow(retry_count)).await;
                    retry_count += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl SearchClient for HttpSearchClient {
    async fn search(&self, query: &str, page: Option<&str>) -> Result<SearchPage, FetchError> {
        let url = self.page_url(query, page);
        tracing::debug!(query = %query, paged = page.is_some(), "Requesting search page");

        let bytes = self.get_with_retry(&url).await?;
        parse_search_page(&bytes)
    }
}

// ============================================================================
// Wire format
// ============================================================================

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    statuses: Vec<Status>,
    #[serde(default)]
    search_metadata: Option<SearchMetadata>,
}

#[derive(Deserialize)]
struct SearchMetadata {
    #[serde(default)]
    next_results: Option<String>,
}

#[derive(Deserialize)]
struct Status {
    id: i64,
    #[serde(default, alias = "full_text")]
    text: String,
    created_at: String,
    #[serde(default)]
    favorite_count: i64,
    #[serde(default)]
    retweet_count: i64,
    #[serde(default)]
    user: Option<User>,
    #[serde(default)]
    entities: Option<Entities>,
}

#[derive(Deserialize)]
struct User {
    screen_name: String,
}

#[derive(Deserialize)]
struct Entities {
    #[serde(default)]
    urls: Vec<UrlEntity>,
}

#[derive(Deserialize)]
struct UrlEntity {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    expanded_url: Option<String>,
}

impl UrlEntity {
    fn address(self) -> Option<String> {
        self.expanded_url
            .filter(|u| !u.trim().is_empty())
            .or(self.url)
            .filter(|u| !u.trim().is_empty())
    }
}

fn parse_created_at(raw: &str) -> Result<DateTime<Utc>, FetchError> {
    DateTime::parse_from_str(raw, CREATED_AT_FORMAT)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| FetchError::Parse(format!("created_at {:?}: {}", raw, e)))
}

fn parse_search_page(bytes: &[u8]) -> Result<SearchPage, FetchError> {
    let response: SearchResponse =
        serde_json::from_slice(bytes).map_err(|e| FetchError::Parse(e.to_string()))?;

    let posts = response
        .statuses
        .into_iter()
        .map(|status| {
            Ok(Post {
                id: status.id,
                created_at: parse_created_at(&status.created_at)?,
                text: status.text,
                favorite_count: status.favorite_count,
                retweet_count: status.retweet_count,
                author: status.user.map(|u| u.screen_name).unwrap_or_default(),
                urls: status
                    .entities
                    .map(|e| e.urls.into_iter().filter_map(UrlEntity::address).collect())
                    .unwrap_or_default(),
            })
        })
        .collect::<Result<Vec<_>, FetchError>>()?;

    let next_page = response
        .search_metadata
        .and_then(|m| m.next_results)
        .filter(|token| !token.trim_start_matches('?').is_empty());

    Ok(SearchPage { posts, next_page })
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}
