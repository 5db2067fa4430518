use crate::search::{FetchError, Post, SearchClient};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Counters for one retrieval pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetrieveStats {
    pub pages: usize,
    pub posts: usize,
}

/// Walks search results newest-first down to a cutoff.
pub struct Retriever {
    search: Arc<dyn SearchClient>,
    max_pages: usize,
}

impl Retriever {
    pub fn new(search: Arc<dyn SearchClient>, max_pages: usize) -> Self {
        Self {
            search,
            max_pages: max_pages.max(1),
        }
    }

    /// Sends every post strictly newer than `cutoff` to `out`, newest first.
    ///
    /// Stops at the first post at or before the cutoff (which is not sent),
    /// when the results run out, or after `max_pages` pages. The next page is
    /// only requested once `out` has accepted the current one. Posts already
    /// sent stay sent if a later page fails.
    ///
    /// Hitting `max_pages` leaves a gap for good: the posts it delivered move
    /// the watermark past the older ones that were never fetched.
    pub async fn fetch(
        &self,
        query: &str,
        cutoff: DateTime<Utc>,
        out: mpsc::Sender<Post>,
        cancel: &CancellationToken,
    ) -> Result<RetrieveStats, FetchError> {
        let mut stats = RetrieveStats::default();
        let mut next_page: Option<String> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            let page = tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                page = self.search.search(query, next_page.as_deref()) => page?,
            };
            stats.pages += 1;

            for post in page.posts {
                if post.created_at <= cutoff {
                    tracing::debug!(
                        query = %query,
                        post_id = post.id,
                        pages = stats.pages,
                        "Reached watermark"
                    );
                    return Ok(stats);
                }
                if out.send(post).await.is_err() {
                    tracing::debug!(query = %query, "Post consumer closed, stopping retrieval");
                    return Ok(stats);
                }
                stats.posts += 1;
            }

            next_page = match page.next_page {
                Some(token) => Some(token),
                None => return Ok(stats),
            };

            if stats.pages >= self.max_pages {
                tracing::warn!(
                    query = %query,
                    max_pages = self.max_pages,
                    cutoff = %cutoff,
                    "Page limit reached before watermark; older posts will not be harvested by later runs"
                );
                return Ok(stats);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::SearchPage;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves fixed pages; page tokens are the page index as a string.
    struct PagedSearch {
        pages: Vec<Vec<Post>>,
        fail_on_page: Option<usize>,
        requests: AtomicUsize,
    }

    impl PagedSearch {
        fn new(pages: Vec<Vec<Post>>) -> Self {
            Self {
                pages,
                fail_on_page: None,
                requests: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SearchClient for PagedSearch {
        async fn search(&self, _query: &str, page: Option<&str>) -> Result<SearchPage, FetchError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            let index: usize = page.map(|p| p.parse().unwrap()).unwrap_or(0);
            if self.fail_on_page == Some(index) {
                return Err(FetchError::HttpStatus(503));
            }
            let next_page = (index + 1 < self.pages.len()).then(|| (index + 1).to_string());
            Ok(SearchPage {
                posts: self.pages[index].clone(),
                next_page,
            })
        }
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
    }

    fn post_at(id: i64, hour: u32) -> Post {
        Post {
            id,
            text: format!("post {}", id),
            created_at: at(hour),
            favorite_count: 0,
            retweet_count: 0,
            author: "dana".to_string(),
            urls: vec![],
        }
    }

    async fn collect(
        retriever: &Retriever,
        cutoff: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> (Result<RetrieveStats, FetchError>, Vec<i64>) {
        let (tx, mut rx) = mpsc::channel::<Post>(2);
        let consumer = async {
            let mut ids = Vec::new();
            while let Some(post) = rx.recv().await {
                ids.push(post.id);
            }
            ids
        };
        let (result, ids) = tokio::join!(retriever.fetch("q", cutoff, tx, cancel), consumer);
        (result, ids)
    }

    #[tokio::test]
    async fn test_stops_at_cutoff_exclusive() {
        // t5 > t4 > t3 > t2 > t1 across two pages
        let search = Arc::new(PagedSearch::new(vec![
            vec![post_at(5, 5), post_at(4, 4)],
            vec![post_at(3, 3), post_at(2, 2)],
            vec![post_at(1, 1)],
        ]));
        let retriever = Retriever::new(search.clone(), 10);

        let (result, ids) = collect(&retriever, at(3), &CancellationToken::new()).await;

        assert_eq!(ids, vec![5, 4]);
        assert_eq!(result.unwrap(), RetrieveStats { pages: 2, posts: 2 });
        // The third page is never requested
        assert_eq!(search.requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_exhausts_source() {
        let search = Arc::new(PagedSearch::new(vec![
            vec![post_at(3, 3)],
            vec![post_at(2, 2), post_at(1, 1)],
        ]));
        let retriever = Retriever::new(search, 10);

        let (result, ids) = collect(&retriever, at(0), &CancellationToken::new()).await;

        assert_eq!(ids, vec![3, 2, 1]);
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_error_after_partial_delivery() {
        let mut search = PagedSearch::new(vec![vec![post_at(5, 5)], vec![post_at(4, 4)]]);
        search.fail_on_page = Some(1);
        let retriever = Retriever::new(Arc::new(search), 10);

        let (result, ids) = collect(&retriever, at(0), &CancellationToken::new()).await;

        assert_eq!(ids, vec![5]);
        assert!(matches!(result, Err(FetchError::HttpStatus(503))));
    }

    #[tokio::test]
    async fn test_max_pages_bound() {
        let search = Arc::new(PagedSearch::new(vec![
            vec![post_at(5, 5)],
            vec![post_at(4, 4)],
            vec![post_at(3, 3)],
        ]));
        let retriever = Retriever::new(search.clone(), 2);

        let (_, ids) = collect(&retriever, at(0), &CancellationToken::new()).await;

        assert_eq!(ids, vec![5, 4]);
        assert_eq!(search.requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_page() {
        let search = Arc::new(PagedSearch::new(vec![vec![post_at(5, 5)]]));
        let retriever = Retriever::new(search.clone(), 10);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (result, ids) = collect(&retriever, at(0), &cancel).await;

        assert!(matches!(result, Err(FetchError::Cancelled)));
        assert!(ids.is_empty());
        assert_eq!(search.requests.load(Ordering::SeqCst), 0);
    }
}
