use super::types::LinkCandidate;
use crate::search::Post;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::LazyLock;
use tokio::sync::mpsc;
use url::Url;

/// Loose URL matcher for post text when the API gave no structured entities.
static URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(?:https?://|www\.)[^\s<>"'`]+"#).expect("URL pattern is valid")
});

/// Characters that end a sentence rather than a URL when scanning free text
const TRAILING_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?', '\'', '"', '…'];

/// Closing brackets paired with their openers
const BRACKETS: &[(char, char)] = &[(')', '('), (']', '['), ('}', '{')];

/// Strips sentence punctuation and closing brackets that do not close
/// anything inside the match, so `(see https://x.example/a_(b))` keeps `a_(b)`.
fn trim_trailing(mut candidate: &str) -> &str {
    loop {
        let trimmed = candidate.trim_end_matches(TRAILING_PUNCTUATION);
        let Some(last) = trimmed.chars().next_back() else {
            return trimmed;
        };
        let Some(&(close, open)) = BRACKETS.iter().find(|(close, _)| *close == last) else {
            return trimmed;
        };
        let opens = trimmed.matches(open).count();
        let closes = trimmed.matches(close).count();
        if closes <= opens {
            return trimmed;
        }
        candidate = &trimmed[..trimmed.len() - close.len_utf8()];
    }
}

/// How many candidates a single post may produce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkPolicy {
    /// One candidate per distinct address in the post
    #[default]
    EveryLink,
    /// Only the first address in the post
    FirstOnly,
}

/// A yes/no capability applied to each post before link extraction.
pub trait PostFilter: Send + Sync {
    fn accept(&self, post: &Post) -> bool;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

/// Accepts posts that carry at least one link, structured or in the text.
#[derive(Debug, Default, Clone, Copy)]
pub struct HasUrlFilter;

impl PostFilter for HasUrlFilter {
    fn accept(&self, post: &Post) -> bool {
        !post.urls.is_empty() || URL_PATTERN.is_match(&post.text)
    }

    fn name(&self) -> &'static str {
        "has_url"
    }
}

/// Counters for one extraction pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExtractStats {
    pub posts: usize,
    pub rejected: usize,
    pub candidates: usize,
}

/// Turns posts into link candidates, numbering them in arrival order.
pub struct Extractor {
    query: String,
    filters: Vec<Box<dyn PostFilter>>,
    policy: LinkPolicy,
    next_ordinal: u64,
}

impl Extractor {
    /// An extractor with the default [`HasUrlFilter`] installed.
    pub fn new(query: &str, policy: LinkPolicy) -> Self {
        Self {
            query: query.to_owned(),
            filters: vec![Box::new(HasUrlFilter)],
            policy,
            next_ordinal: 0,
        }
    }

    /// Adds a filter; every installed filter must accept a post.
    pub fn with_filter(mut self, filter: Box<dyn PostFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    /// Candidates for one post. Empty when a filter rejects it or no usable
    /// http(s) address is found.
    pub fn extract(&mut self, post: &Post) -> Vec<LinkCandidate> {
        if let Some(filter) = self.filters.iter().find(|f| !f.accept(post)) {
            tracing::trace!(post_id = post.id, filter = filter.name(), "Post rejected");
            return Vec::new();
        }

        let mut addresses = link_addresses(post);
        if self.policy == LinkPolicy::FirstOnly {
            addresses.truncate(1);
        }

        addresses
            .into_iter()
            .map(|raw_address| {
                let ordinal = self.next_ordinal;
                self.next_ordinal += 1;
                LinkCandidate {
                    ordinal,
                    source_post_id: post.id,
                    raw_address,
                    created_at: post.created_at,
                    favorite_count: post.favorite_count,
                    query: self.query.clone(),
                    author: post.author.clone(),
                    text: post.text.clone(),
                }
            })
            .collect()
    }

    /// Drains `posts`, forwarding candidates to `out` until the input closes.
    ///
    /// Stops early if the downstream receiver is gone.
    pub async fn run(
        &mut self,
        mut posts: mpsc::Receiver<Post>,
        out: mpsc::Sender<LinkCandidate>,
    ) -> ExtractStats {
        let mut stats = ExtractStats::default();

        while let Some(post) = posts.recv().await {
            stats.posts += 1;
            let candidates = self.extract(&post);
            if candidates.is_empty() {
                stats.rejected += 1;
                continue;
            }
            for candidate in candidates {
                if out.send(candidate).await.is_err() {
                    tracing::debug!("Resolver stage closed, stopping extraction");
                    return stats;
                }
                stats.candidates += 1;
            }
        }

        stats
    }
}

/// Distinct http(s) addresses in a post, structured entities first.
///
/// The text is only scanned when the post has no structured URL entities.
pub fn link_addresses(post: &Post) -> Vec<String> {
    let raw: Vec<&str> = if post.urls.is_empty() {
        URL_PATTERN
            .find_iter(&post.text)
            .map(|m| trim_trailing(m.as_str()))
            .collect()
    } else {
        post.urls.iter().map(|u| u.trim()).collect()
    };

    let mut seen = HashSet::new();
    raw.into_iter()
        .filter_map(normalize_address)
        .filter(|addr| seen.insert(addr.clone()))
        .collect()
}

/// Adds `http://` to bare `www.` hosts and drops anything that is not http(s).
fn normalize_address(raw: &str) -> Option<String> {
    if raw.is_empty() {
        return None;
    }
    let with_scheme = if raw.get(..4).is_some_and(|p| p.eq_ignore_ascii_case("www.")) {
        format!("http://{}", raw)
    } else {
        raw.to_owned()
    };

    let url = Url::parse(&with_scheme).ok()?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Some(url.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn post(id: i64, text: &str, urls: &[&str]) -> Post {
        Post {
            id,
            text: text.to_string(),
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            favorite_count: 2,
            retweet_count: 0,
            author: "carol".to_string(),
            urls: urls.iter().map(|u| u.to_string()).collect(),
        }
    }

    #[test]
    fn test_no_link_yields_nothing() {
        let mut extractor = Extractor::new("rust", LinkPolicy::EveryLink);
        assert!(extractor.extract(&post(1, "just words here", &[])).is_empty());
    }

    #[test]
    fn test_structured_entities_preferred_over_text() {
        let p = post(1, "see http://text.example/a", &["https://entity.example/b"]);
        assert_eq!(link_addresses(&p), vec!["https://entity.example/b".to_string()]);
    }

    #[test]
    fn test_text_scan_fallback_trims_punctuation() {
        let p = post(1, "Great read (https://blog.example/post). Also www.other.example!", &[]);
        assert_eq!(
            link_addresses(&p),
            vec![
                "https://blog.example/post".to_string(),
                "http://www.other.example/".to_string(),
            ]
        );
    }

    #[test]
    fn test_text_scan_keeps_balanced_brackets() {
        let p = post(
            1,
            "see https://en.wikipedia.org/wiki/Rust_(programming_language) now \
             (or https://en.wikipedia.org/wiki/Ferris_(crab)).",
            &[],
        );
        assert_eq!(
            link_addresses(&p),
            vec![
                "https://en.wikipedia.org/wiki/Rust_(programming_language)".to_string(),
                "https://en.wikipedia.org/wiki/Ferris_(crab)".to_string(),
            ]
        );
    }

    #[test]
    fn test_non_http_schemes_dropped() {
        let p = post(1, "", &["ftp://files.example/x", "mailto:a@b.c", "https://ok.example/"]);
        assert_eq!(link_addresses(&p), vec!["https://ok.example/".to_string()]);
    }

    #[test]
    fn test_duplicate_addresses_collapse() {
        let p = post(1, "", &["https://a.example/x", "https://a.example/x"]);
        assert_eq!(link_addresses(&p).len(), 1);
    }

    #[test]
    fn test_every_link_policy_numbers_candidates() {
        let mut extractor = Extractor::new("rust", LinkPolicy::EveryLink);
        let first = extractor.extract(&post(10, "", &["https://a.example/", "https://b.example/"]));
        let second = extractor.extract(&post(11, "", &["https://c.example/"]));

        let ordinals: Vec<u64> = first.iter().chain(second.iter()).map(|c| c.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2]);
        assert_eq!(first[0].source_post_id, 10);
        assert_eq!(first[0].query, "rust");
        assert_eq!(first[0].author, "carol");
        assert_eq!(first[0].weight(), 3);
    }

    #[test]
    fn test_first_only_policy() {
        let mut extractor = Extractor::new("rust", LinkPolicy::FirstOnly);
        let candidates =
            extractor.extract(&post(10, "", &["https://a.example/", "https://b.example/"]));
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].raw_address, "https://a.example/");
    }

    struct MinFavorites(i64);

    impl PostFilter for MinFavorites {
        fn accept(&self, post: &Post) -> bool {
            post.favorite_count >= self.0
        }

        fn name(&self) -> &'static str {
            "min_favorites"
        }
    }

    #[test]
    fn test_all_filters_must_accept() {
        let mut extractor =
            Extractor::new("rust", LinkPolicy::EveryLink).with_filter(Box::new(MinFavorites(5)));
        assert!(extractor.extract(&post(1, "", &["https://a.example/"])).is_empty());
    }

    #[tokio::test]
    async fn test_run_forwards_candidates_and_counts() {
        let (post_tx, post_rx) = mpsc::channel(4);
        let (cand_tx, mut cand_rx) = mpsc::channel(4);

        post_tx.send(post(1, "nothing", &[])).await.unwrap();
        post_tx.send(post(2, "", &["https://a.example/"])).await.unwrap();
        drop(post_tx);

        let mut extractor = Extractor::new("rust", LinkPolicy::EveryLink);
        let stats = extractor.run(post_rx, cand_tx).await;

        assert_eq!(
            stats,
            ExtractStats {
                posts: 2,
                rejected: 1,
                candidates: 1
            }
        );
        let candidate = cand_rx.recv().await.unwrap();
        assert_eq!(candidate.source_post_id, 2);
        assert!(cand_rx.recv().await.is_none());
    }
}
