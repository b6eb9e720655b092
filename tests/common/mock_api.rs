//! In-memory [`ApiClient`] with scripted content, failures and latency

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use treehole_dl::client::{CommentPage, FollowedPage, PageCursor, PostBody, RawComment};
use treehole_dl::{ApiClient, FetchError, PostId};

/// How a scripted post request fails
#[derive(Clone, Debug)]
pub enum Failure {
    /// Always `NotFound`
    Missing,
    /// Always `Transient`
    Unavailable,
    /// Always `Auth`
    Rejected,
    /// `Transient` for the first `n` requests, then normal
    Flaky(usize),
}

/// Scripted forum
#[derive(Default)]
pub struct MockApi {
    posts: HashMap<PostId, PostBody>,
    threads: HashMap<PostId, Vec<Vec<RawComment>>>,
    followed: Vec<Vec<PostId>>,
    failures: HashMap<PostId, Failure>,
    images: HashMap<String, Vec<u8>>,
    latency: HashMap<PostId, Duration>,
    default_latency: Duration,

    attempts: Mutex<HashMap<PostId, usize>>,
    in_flight: AtomicUsize,
    /// Highest number of concurrently executing requests
    pub peak_in_flight: AtomicUsize,
    /// Post requests served, failures included
    pub post_requests: AtomicUsize,
    /// Comment page requests served
    pub comment_requests: AtomicUsize,
    /// Image downloads served
    pub downloads: AtomicUsize,
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_post(mut self, body: PostBody) -> Self {
        self.posts.insert(body.id, body);
        self
    }

    /// Comment thread of `id`, one inner vector per page
    pub fn with_thread(mut self, id: i64, pages: Vec<Vec<RawComment>>) -> Self {
        self.threads.insert(PostId(id), pages);
        self
    }

    pub fn with_followed(mut self, pages: Vec<Vec<i64>>) -> Self {
        self.followed = pages
            .into_iter()
            .map(|page| page.into_iter().map(PostId).collect())
            .collect();
        self
    }

    pub fn with_failure(mut self, id: i64, failure: Failure) -> Self {
        self.failures.insert(PostId(id), failure);
        self
    }

    pub fn with_image(mut self, url: &str, bytes: &[u8]) -> Self {
        self.images.insert(url.to_string(), bytes.to_vec());
        self
    }

    /// Latency of every request concerning `id`
    pub fn with_latency(mut self, id: i64, latency: Duration) -> Self {
        self.latency.insert(PostId(id), latency);
        self
    }

    pub fn with_default_latency(mut self, latency: Duration) -> Self {
        self.default_latency = latency;
        self
    }

    pub fn peak(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    async fn enter(&self, id: Option<PostId>) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        let latency = id
            .and_then(|id| self.latency.get(&id).copied())
            .unwrap_or(self.default_latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        InFlight(&self.in_flight)
    }

    fn scripted_failure(&self, id: PostId) -> Option<FetchError> {
        match self.failures.get(&id)? {
            Failure::Missing => Some(FetchError::NotFound(id)),
            Failure::Unavailable => Some(FetchError::Transient("HTTP 503".into())),
            Failure::Rejected => Some(FetchError::Auth("token expired".into())),
            Failure::Flaky(n) => {
                let mut attempts = self.attempts.lock().unwrap();
                let seen = attempts.entry(id).or_insert(0);
                *seen += 1;
                (*seen <= *n).then(|| FetchError::Transient("HTTP 502".into()))
            }
        }
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl ApiClient for MockApi {
    async fn fetch_post(&self, id: PostId) -> Result<PostBody, FetchError> {
        let _guard = self.enter(Some(id)).await;
        self.post_requests.fetch_add(1, Ordering::SeqCst);

        if let Some(e) = self.scripted_failure(id) {
            return Err(e);
        }
        self.posts.get(&id).cloned().ok_or(FetchError::NotFound(id))
    }

    async fn fetch_comments(
        &self,
        id: PostId,
        cursor: Option<PageCursor>,
    ) -> Result<CommentPage, FetchError> {
        let _guard = self.enter(Some(id)).await;
        self.comment_requests.fetch_add(1, Ordering::SeqCst);

        let Some(pages) = self.threads.get(&id) else {
            return Ok(CommentPage::default());
        };
        let index = cursor.map_or(0, |page| page as usize - 1);
        Ok(CommentPage {
            comments: pages.get(index).cloned().unwrap_or_default(),
            next_cursor: (index + 1 < pages.len()).then_some(index as PageCursor + 2),
        })
    }

    async fn fetch_followed_list(
        &self,
        cursor: Option<PageCursor>,
    ) -> Result<FollowedPage, FetchError> {
        let _guard = self.enter(None).await;
        let index = cursor.map_or(0, |page| page as usize - 1);
        Ok(FollowedPage {
            ids: self.followed.get(index).cloned().unwrap_or_default(),
            next_cursor: (index + 1 < self.followed.len()).then_some(index as PageCursor + 2),
        })
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let _guard = self.enter(None).await;
        self.downloads.fetch_add(1, Ordering::SeqCst);
        self.images
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::Permanent(format!("HTTP 404 for {url}")))
    }
}
