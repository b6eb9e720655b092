//! Order-independent accumulation of fetched posts

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};

use crate::types::{Post, PostId};

/// Thread-safe collector of finished posts
///
/// Insertion is keyed by post id, so re-inserting a post overwrites it and
/// the final content does not depend on completion order. Shared between
/// fetch tasks behind an `Arc` while collecting; [`freeze`](Self::freeze)
/// consumes it once the join barrier has been passed.
#[derive(Debug, Default)]
pub struct Aggregator {
    posts: Mutex<BTreeMap<PostId, Post>>,
}

impl Aggregator {
    /// Empty aggregator
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a post
    pub fn insert(&self, post: Post) {
        let mut posts = self.posts.lock().unwrap_or_else(PoisonError::into_inner);
        if posts.insert(post.id, post).is_some() {
            tracing::debug!("Replaced previously aggregated post");
        }
    }

    /// Whether a post with this id has been inserted
    pub fn contains(&self, id: PostId) -> bool {
        self.posts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    /// Number of aggregated posts
    pub fn len(&self) -> usize {
        self.posts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether nothing has been aggregated yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop collecting and hand out the read-only snapshot
    pub fn freeze(self, created_at: DateTime<Utc>) -> Snapshot {
        let posts = self
            .posts
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        Snapshot { created_at, posts }
    }
}

/// Frozen result of one collection run
///
/// Only obtainable from [`Aggregator::freeze`] or by loading a persisted
/// snapshot, so anything holding a `Snapshot` sees the complete view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    created_at: DateTime<Utc>,
    posts: BTreeMap<PostId, Post>,
}

impl Snapshot {
    /// Rebuild a snapshot from persisted posts; later duplicates win
    pub fn from_posts(created_at: DateTime<Utc>, posts: impl IntoIterator<Item = Post>) -> Self {
        Self {
            created_at,
            posts: posts.into_iter().map(|p| (p.id, p)).collect(),
        }
    }

    /// When the run started
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Look up a post
    pub fn get(&self, id: PostId) -> Option<&Post> {
        self.posts.get(&id)
    }

    /// Posts in ascending id order
    pub fn posts(&self) -> impl Iterator<Item = &Post> {
        self.posts.values()
    }

    /// Number of posts
    pub fn len(&self) -> usize {
        self.posts.len()
    }

    /// Whether the snapshot holds no posts
    pub fn is_empty(&self) -> bool {
        self.posts.is_empty()
    }

    /// Posts carrying no error marker
    pub fn succeeded(&self) -> usize {
        self.posts.values().filter(|p| p.error.is_none()).count()
    }

    /// Posts carrying an error marker
    pub fn failed(&self) -> usize {
        self.len() - self.succeeded()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Comment, CommentId, FailureKind, FetchFailure, FetchStage, PostKind};
    use std::sync::Arc;

    fn post(id: i64, text: &str) -> Post {
        Post {
            id: PostId(id),
            text: text.to_string(),
            timestamp: Some(1_700_000_000 + id),
            kind: PostKind::Text,
            images: vec![],
            comments: vec![Comment {
                id: CommentId(1),
                post_id: PostId(id),
                text: format!("re {id}"),
                timestamp: None,
                author: None,
                quote_marker: None,
                images: vec![],
            }],
            error: None,
        }
    }

    #[test]
    fn test_reinsert_overwrites() {
        let aggregator = Aggregator::new();
        aggregator.insert(post(1, "first"));
        aggregator.insert(post(1, "second"));
        assert_eq!(aggregator.len(), 1);

        let snapshot = aggregator.freeze(Utc::now());
        assert_eq!(snapshot.get(PostId(1)).unwrap().text, "second");
    }

    #[tokio::test]
    async fn test_completion_order_is_irrelevant() {
        let created_at = Utc::now();
        let inputs: Vec<Post> = (1..=8).map(|i| post(i * 100, "body")).collect();

        let forward = Aggregator::new();
        for p in inputs.iter().cloned() {
            forward.insert(p);
        }

        let concurrent = Arc::new(Aggregator::new());
        let mut handles = Vec::new();
        for p in inputs.iter().rev().cloned() {
            let aggregator = concurrent.clone();
            handles.push(tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(
                    (p.id.get() as u64 * 7) % 23,
                ))
                .await;
                aggregator.insert(p);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let concurrent = Arc::try_unwrap(concurrent).unwrap();

        assert_eq!(forward.freeze(created_at), concurrent.freeze(created_at));
    }

    #[test]
    fn test_snapshot_counts_failures() {
        let aggregator = Aggregator::new();
        aggregator.insert(post(1, "ok"));
        aggregator.insert(Post::failed(
            PostId(2),
            FetchFailure {
                kind: FailureKind::NotFound,
                stage: FetchStage::Post,
                message: "gone".into(),
            },
        ));
        assert!(aggregator.contains(PostId(2)));

        let snapshot = aggregator.freeze(Utc::now());
        assert_eq!(snapshot.succeeded(), 1);
        assert_eq!(snapshot.failed(), 1);
        let ids: Vec<_> = snapshot.posts().map(|p| p.id).collect();
        assert_eq!(ids, vec![PostId(1), PostId(2)]);
    }
}
