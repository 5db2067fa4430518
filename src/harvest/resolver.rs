use crate::util::{check_public, clean_title, validate_url, UrlValidationError};
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Documents announcing more than this are refused outright
const MAX_DOCUMENT_SIZE: u64 = 10 * 1024 * 1024; // 10MB
/// Title scanning gives up after this many bytes
const MAX_TITLE_SCAN: usize = 512 * 1024;

const USER_AGENT: &str = concat!("linkharvest/", env!("CARGO_PKG_VERSION"));

/// Outcome of following one link.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Address after all redirects
    pub final_url: Url,
    pub title: Option<String>,
}

/// Why a link could not be resolved. Each one drops only its candidate.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Invalid or disallowed address: {0}")]
    InvalidUrl(#[from] UrlValidationError),
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    #[error("Request timed out")]
    Timeout,
    #[error("Not an HTML document: {0:?}")]
    NonHtml(String),
    #[error("Document too large")]
    TooLarge,
}

/// Follows a raw link to its final address and reads the page title.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, raw_address: &str) -> Result<Resolution, ResolveError>;
}

/// Knobs for [`HttpResolver`].
#[derive(Debug, Clone, Copy)]
pub struct ResolverSettings {
    pub timeout: Duration,
    pub max_redirects: usize,
    /// Skip the SSRF address checks (local testing only)
    pub allow_private_addresses: bool,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            max_redirects: 10,
            allow_private_addresses: false,
        }
    }
}

/// [`Resolver`] backed by a dedicated reqwest client.
///
/// Every redirect hop is checked against the public-address rules unless
/// `allow_private_addresses` is set, so a public short link cannot bounce the
/// fetch into the local network.
pub struct HttpResolver {
    client: reqwest::Client,
    settings: ResolverSettings,
}

impl HttpResolver {
    pub fn new(settings: ResolverSettings) -> Result<Self, reqwest::Error> {
        let max_redirects = settings.max_redirects;
        let allow_private = settings.allow_private_addresses;

        let policy = reqwest::redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() > max_redirects {
                return attempt.error(format!("more than {} redirects", max_redirects));
            }
            if !allow_private {
                if let Err(e) = check_public(attempt.url()) {
                    return attempt.error(e);
                }
            }
            attempt.follow()
        });

        let client = reqwest::Client::builder()
            .redirect(policy)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self { client, settings })
    }

    fn parse_start(&self, raw_address: &str) -> Result<Url, ResolveError> {
        if self.settings.allow_private_addresses {
            Ok(Url::parse(raw_address).map_err(UrlValidationError::from)?)
        } else {
            Ok(validate_url(raw_address)?)
        }
    }
}

#[async_trait]
impl Resolver for HttpResolver {
    async fn resolve(&self, raw_address: &str) -> Result<Resolution, ResolveError> {
        let url = self.parse_start(raw_address)?;
        let timeout = self.settings.timeout;

        let response = tokio::time::timeout(timeout, self.client.get(url).send())
            .await
            .map_err(|_| ResolveError::Timeout)?
            .map_err(ResolveError::Network)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ResolveError::HttpStatus(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned();
        if !is_html(&content_type) {
            return Err(ResolveError::NonHtml(content_type));
        }

        if response.content_length().is_some_and(|len| len > MAX_DOCUMENT_SIZE) {
            return Err(ResolveError::TooLarge);
        }

        let final_url = response.url().clone();
        let title = tokio::time::timeout(timeout, scrape_title(response))
            .await
            .map_err(|_| ResolveError::Timeout)??;

        Ok(Resolution { final_url, title })
    }
}

fn is_html(content_type: &str) -> bool {
    let lower = content_type.to_ascii_lowercase();
    lower.contains("text/html") || lower.contains("application/xhtml+xml")
}

// ============================================================================
// Title scanning
// ============================================================================

/// Streams the body only as far as needed to find the first `<title>`.
async fn scrape_title(response: reqwest::Response) -> Result<Option<String>, ResolveError> {
    let mut doc = Vec::new();
    let mut lower = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(ResolveError::Network)?;
        // Back up so a tag split across chunks is still seen
        let search_from = lower.len().saturating_sub(8);
        doc.extend_from_slice(&chunk);
        lower.extend(chunk.iter().map(u8::to_ascii_lowercase));

        if find_bytes(&lower, b"</title", search_from).is_some()
            || find_bytes(&lower, b"</head", search_from).is_some()
            || doc.len() >= MAX_TITLE_SCAN
        {
            break;
        }
    }

    Ok(extract_title(&doc, &lower))
}

/// Text of the first `<title>` element, cleaned. `None` if absent or blank.
fn extract_title(doc: &[u8], lower: &[u8]) -> Option<String> {
    let open = find_bytes(lower, b"<title", 0)?;
    let start = find_bytes(lower, b">", open)? + 1;
    let end = find_bytes(lower, b"</title", start)?;

    let title = clean_title(&String::from_utf8_lossy(&doc[start..end]));
    (!title.is_empty()).then_some(title)
}

fn find_bytes(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|pos| pos + from)
}
