//! Configuration file parser for ~/.config/linkharvest/config.toml.
//!
//! The config file is optional; a missing file yields `Config::default()`.
//! Unknown keys are accepted by serde but logged as warnings since they are
//! usually typos.
use crate::harvest::LinkPolicy;
use secrecy::SecretString;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Environment variable that overrides `search_bearer_token`
pub const BEARER_TOKEN_ENV: &str = "LINKHARVEST_BEARER_TOKEN";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    /// A value parsed but is out of range.
    #[error("Invalid config value: {0}")]
    Invalid(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
/// The custom Debug impl masks `search_bearer_token`.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Search endpoint, e.g. `https://api.twitter.com/1.1/search/tweets.json`.
    pub search_base_url: String,

    /// Bearer token for the search API. The env var takes precedence.
    pub search_bearer_token: Option<String>,

    /// Concurrent link resolutions per run.
    pub resolver_workers: usize,

    /// Concurrent per-address commits per run.
    pub commit_concurrency: usize,

    /// Timeout for each outbound request, in seconds.
    pub request_timeout_secs: u64,

    /// Redirect hops followed before a link is given up on.
    pub max_redirects: usize,

    /// How far back the first run for a query reaches.
    pub lookback_hours: u64,

    /// Upper bound on search pages fetched per run.
    pub max_pages: usize,

    /// Posts requested per search page.
    pub page_size: u32,

    /// `"every_link"` or `"first_only"`.
    pub link_policy: LinkPolicy,

    /// Feed items must have been active within this many days.
    pub feed_window_days: u64,

    /// Maximum items in a rendered feed.
    pub feed_max_items: usize,

    /// Channel `<link>` for rendered feeds. Defaults to a search URL for the query.
    pub feed_link: Option<String>,

    /// SQLite file path. Defaults to `linkharvest.db` in the config directory.
    pub database_path: Option<String>,

    /// Let the resolver fetch loopback and private-network addresses.
    pub allow_private_addresses: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            search_base_url: "https://api.twitter.com/1.1/search/tweets.json".to_string(),
            search_bearer_token: None,
            resolver_workers: 8,
            commit_concurrency: 4,
            request_timeout_secs: 15,
            max_redirects: 10,
            lookback_hours: 24,
            max_pages: 10,
            page_size: 100,
            link_policy: LinkPolicy::EveryLink,
            feed_window_days: 7,
            feed_max_items: 50,
            feed_link: None,
            database_path: None,
            allow_private_addresses: false,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("search_base_url", &self.search_base_url)
            .field(
                "search_bearer_token",
                &self.search_bearer_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("resolver_workers", &self.resolver_workers)
            .field("commit_concurrency", &self.commit_concurrency)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("max_redirects", &self.max_redirects)
            .field("lookback_hours", &self.lookback_hours)
            .field("max_pages", &self.max_pages)
            .field("page_size", &self.page_size)
            .field("link_policy", &self.link_policy)
            .field("feed_window_days", &self.feed_window_days)
            .field("feed_max_items", &self.feed_max_items)
            .field("feed_link", &self.feed_link)
            .field("database_path", &self.database_path)
            .field("allow_private_addresses", &self.allow_private_addresses)
            .finish()
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Ten years
    const MAX_LOOKBACK_HOURS: u64 = 24 * 365 * 10;

    const KNOWN_KEYS: [&'static str; 15] = [
        "search_base_url",
        "search_bearer_token",
        "resolver_workers",
        "commit_concurrency",
        "request_timeout_secs",
        "max_redirects",
        "lookback_hours",
        "max_pages",
        "page_size",
        "link_policy",
        "feed_window_days",
        "feed_max_items",
        "feed_link",
        "database_path",
        "allow_private_addresses",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Out-of-range values → `Err(ConfigError::Invalid)`
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Check file size before reading to bound memory use
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        tracing::info!(
            path = %path.display(),
            endpoint = %config.search_base_url,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Rejects values that would stall or disable a run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("resolver_workers", self.resolver_workers as u64),
            ("commit_concurrency", self.commit_concurrency as u64),
            ("request_timeout_secs", self.request_timeout_secs),
            ("max_pages", self.max_pages as u64),
            ("page_size", u64::from(self.page_size)),
            ("feed_max_items", self.feed_max_items as u64),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be greater than 0", key)));
            }
        }

        if self.lookback_hours > Self::MAX_LOOKBACK_HOURS {
            return Err(ConfigError::Invalid(format!(
                "lookback_hours must be at most {}",
                Self::MAX_LOOKBACK_HOURS
            )));
        }

        url::Url::parse(&self.search_base_url).map_err(|e| {
            ConfigError::Invalid(format!("search_base_url {:?}: {}", self.search_base_url, e))
        })?;

        Ok(())
    }

    /// The bearer token to send, `LINKHARVEST_BEARER_TOKEN` first, then the file.
    pub fn bearer_token(&self) -> Option<SecretString> {
        Self::pick_token(
            std::env::var(BEARER_TOKEN_ENV).ok(),
            self.search_bearer_token.as_deref(),
        )
    }

    fn pick_token(env_value: Option<String>, file_value: Option<&str>) -> Option<SecretString> {
        env_value
            .filter(|t| !t.trim().is_empty())
            .or_else(|| file_value.filter(|t| !t.trim().is_empty()).map(str::to_owned))
            .map(SecretString::from)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn write_config(name: &str, content: &str) -> (std::path::PathBuf, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("linkharvest_config_test_{}", name));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.resolver_workers, 8);
        assert_eq!(config.lookback_hours, 24);
        assert_eq!(config.feed_window_days, 7);
        assert_eq!(config.feed_max_items, 50);
        assert_eq!(config.link_policy, LinkPolicy::EveryLink);
        assert!(!config.allow_private_addresses);
        assert!(config.search_bearer_token.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_returns_default() {
        let path = Path::new("/tmp/linkharvest_test_nonexistent_config.toml");
        let config = Config::load(path).unwrap();
        assert_eq!(config.max_pages, 10);
    }

    #[test]
    fn test_whitespace_only_file_returns_default() {
        let (dir, path) = write_config("whitespace", "   \n  \n  ");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.page_size, 100);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let (dir, path) = write_config("partial", "resolver_workers = 2\n");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.resolver_workers, 2);
        assert_eq!(config.commit_concurrency, 4);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_full_config() {
        let content = r#"
search_base_url = "http://127.0.0.1:9999/search"
search_bearer_token = "file-token"
resolver_workers = 16
commit_concurrency = 2
request_timeout_secs = 5
max_redirects = 3
lookback_hours = 48
max_pages = 4
page_size = 50
link_policy = "first_only"
feed_window_days = 3
feed_max_items = 20
feed_link = "https://links.example/"
database_path = "/var/lib/linkharvest/db.sqlite"
allow_private_addresses = true
"#;
        let (dir, path) = write_config("full", content);

        let config = Config::load(&path).unwrap();
        assert_eq!(config.search_base_url, "http://127.0.0.1:9999/search");
        assert_eq!(config.search_bearer_token.as_deref(), Some("file-token"));
        assert_eq!(config.resolver_workers, 16);
        assert_eq!(config.max_redirects, 3);
        assert_eq!(config.lookback_hours, 48);
        assert_eq!(config.link_policy, LinkPolicy::FirstOnly);
        assert_eq!(config.feed_link.as_deref(), Some("https://links.example/"));
        assert_eq!(
            config.database_path.as_deref(),
            Some("/var/lib/linkharvest/db.sqlite")
        );
        assert!(config.allow_private_addresses);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let (dir, path) = write_config("invalid", "this is not [valid toml");
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("Invalid TOML"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_unknown_link_policy_rejected() {
        let (dir, path) = write_config("policy", "link_policy = \"some_links\"\n");
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse(_))));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_unknown_keys_accepted() {
        let (dir, path) = write_config("unknown", "max_pages = 3\ntotally_fake_key = 1\n");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.max_pages, 3);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_zero_workers_rejected() {
        let (dir, path) = write_config("zero", "resolver_workers = 0\n");
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.to_string().contains("resolver_workers"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_bad_endpoint_rejected() {
        let config = Config {
            search_base_url: "not a url".to_string(),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_too_large_file_rejected() {
        let (dir, path) = write_config("too_large", &"a".repeat(1_048_577));
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::TooLarge(_)));
        assert!(err.to_string().contains("too large"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_env_token_takes_precedence() {
        let token = Config::pick_token(Some("from-env".into()), Some("from-file")).unwrap();
        assert_eq!(token.expose_secret(), "from-env");

        let token = Config::pick_token(None, Some("from-file")).unwrap();
        assert_eq!(token.expose_secret(), "from-file");

        let token = Config::pick_token(Some("  ".into()), Some("from-file")).unwrap();
        assert_eq!(token.expose_secret(), "from-file");

        assert!(Config::pick_token(None, None).is_none());
    }

    #[test]
    fn test_debug_masks_bearer_token() {
        let config = Config {
            search_bearer_token: Some("super-secret-token-12345".to_string()),
            ..Config::default()
        };
        let debug_output = format!("{:?}", config);
        assert!(!debug_output.contains("super-secret-token-12345"));
        assert!(debug_output.contains("[REDACTED]"));
    }

    #[test]
    fn test_debug_shows_none_when_no_token() {
        let debug_output = format!("{:?}", Config::default());
        assert!(!debug_output.contains("[REDACTED]"));
    }
}
