//! Quote markers and their resolution
//!
//! A marker names its target directly: `>>{post}` quotes a post,
//! `>>{post}#{comment}` quotes one comment of it. Resolution is therefore a
//! plain lookup in a frozen [`Snapshot`]; a target outside the snapshot is
//! reported as [`Resolution::Unresolved`], never as an error.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::collector::Snapshot;
use crate::types::{CommentId, PostId, QuoteRef};

#[allow(clippy::expect_used)]
static MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^>>(\d+)(?:#(\d+))?$").expect("marker pattern is valid"));

#[allow(clippy::expect_used)]
static LEADING_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(>>\d+(?:#\d+)?)(?:\s|$)").expect("leading marker pattern is valid")
});

/// Parse a complete marker string
pub fn parse_marker(marker: &str) -> Option<QuoteRef> {
    let caps = MARKER.captures(marker.trim())?;
    let post_id = caps.get(1)?.as_str().parse().ok()?;
    let comment_id = match caps.get(2) {
        Some(m) => Some(CommentId(m.as_str().parse().ok()?)),
        None => None,
    };
    Some(QuoteRef {
        post_id: PostId(post_id),
        comment_id,
    })
}

/// Marker written at the very start of a comment body, if any
pub fn leading_marker(text: &str) -> Option<String> {
    let marker = LEADING_MARKER.captures(text)?.get(1)?.as_str();
    // Reject ids that overflow
    parse_marker(marker).map(|q| q.to_marker())
}

/// Outcome of resolving one quote marker
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// Target found in the snapshot
    Resolved {
        /// What was quoted
        target: QuoteRef,
        /// Author of the quoted comment; `None` for posts and anonymous comments
        author: Option<String>,
        /// Exact text of the quoted post or comment
        excerpt: String,
    },
    /// Target was not fetched in this run
    Unresolved {
        /// What was quoted
        target: QuoteRef,
    },
}

impl Resolution {
    /// The quoted target
    pub fn target(&self) -> QuoteRef {
        match self {
            Resolution::Resolved { target, .. } | Resolution::Unresolved { target } => *target,
        }
    }

    /// Whether the target was found
    pub fn is_resolved(&self) -> bool {
        matches!(self, Resolution::Resolved { .. })
    }
}

/// Resolutions of every quoting comment in a snapshot
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QuoteIndex {
    by_comment: HashMap<(PostId, CommentId), Resolution>,
}

impl QuoteIndex {
    /// Resolution for the quote carried by comment `comment` of post `post`
    pub fn get(&self, post: PostId, comment: CommentId) -> Option<&Resolution> {
        self.by_comment.get(&(post, comment))
    }

    /// Number of quoting comments
    pub fn len(&self) -> usize {
        self.by_comment.len()
    }

    /// Whether no comment carries a quote
    pub fn is_empty(&self) -> bool {
        self.by_comment.is_empty()
    }

    /// Number of quotes whose target is missing
    pub fn dangling(&self) -> usize {
        self.by_comment.values().filter(|r| !r.is_resolved()).count()
    }
}

/// Resolve a single reference against the snapshot
pub fn resolve_ref(snapshot: &Snapshot, target: QuoteRef) -> Resolution {
    let found = snapshot
        .get(target.post_id)
        .filter(|post| !post.is_failed())
        .and_then(|post| match target.comment_id {
            None => Some((None, post.text.clone())),
            Some(cid) => post
                .comment(cid)
                .map(|c| (c.author.clone(), c.text.clone())),
        });

    match found {
        Some((author, excerpt)) => Resolution::Resolved {
            target,
            author,
            excerpt,
        },
        None => Resolution::Unresolved { target },
    }
}

/// Resolve every quote marker in a frozen snapshot
///
/// Comments whose marker cannot be parsed are skipped.
pub fn resolve(snapshot: &Snapshot) -> QuoteIndex {
    let mut by_comment = HashMap::new();
    for post in snapshot.posts() {
        for comment in &post.comments {
            let Some(target) = comment.quote_marker.as_deref().and_then(parse_marker) else {
                continue;
            };
            by_comment.insert((post.id, comment.id), resolve_ref(snapshot, target));
        }
    }

    let index = QuoteIndex { by_comment };
    tracing::debug!(
        quotes = index.len(),
        dangling = index.dangling(),
        "Resolved quote markers"
    );
    index
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Comment, FailureKind, FetchFailure, FetchStage, Post, PostKind};
    use chrono::Utc;

    fn comment(post: i64, id: i64, text: &str, marker: Option<&str>) -> Comment {
        Comment {
            id: CommentId(id),
            post_id: PostId(post),
            text: text.to_string(),
            timestamp: None,
            author: Some(format!("User{id}")),
            quote_marker: marker.map(str::to_string),
            images: vec![],
        }
    }

    fn post(id: i64, comments: Vec<Comment>) -> Post {
        Post {
            id: PostId(id),
            text: format!("post {id}"),
            timestamp: None,
            kind: PostKind::Text,
            images: vec![],
            comments,
            error: None,
        }
    }

    #[test]
    fn test_parse_marker() {
        assert_eq!(
            parse_marker(">>200#5"),
            Some(QuoteRef {
                post_id: PostId(200),
                comment_id: Some(CommentId(5)),
            })
        );
        assert_eq!(
            parse_marker(">>200"),
            Some(QuoteRef {
                post_id: PostId(200),
                comment_id: None,
            })
        );
        assert_eq!(parse_marker(">>abc"), None);
        assert_eq!(parse_marker(">200#5"), None);
        assert_eq!(parse_marker(">>99999999999999999999"), None);
    }

    #[test]
    fn test_leading_marker() {
        assert_eq!(leading_marker(">>200#5 agreed").as_deref(), Some(">>200#5"));
        assert_eq!(leading_marker("  >>17").as_deref(), Some(">>17"));
        assert_eq!(leading_marker("see >>200"), None);
        assert_eq!(leading_marker(">>200abc"), None);
    }

    #[test]
    fn test_resolves_to_exact_comment_text() {
        let snapshot = Snapshot::from_posts(
            Utc::now(),
            vec![
                post(200, vec![comment(200, 5, "the quoted words", None)]),
                post(100, vec![comment(100, 1, "replying", Some(">>200#5"))]),
            ],
        );

        let index = resolve(&snapshot);
        assert_eq!(
            index.get(PostId(100), CommentId(1)),
            Some(&Resolution::Resolved {
                target: parse_marker(">>200#5").unwrap(),
                author: Some("User5".into()),
                excerpt: "the quoted words".into(),
            })
        );
        assert_eq!(index.dangling(), 0);
    }

    #[test]
    fn test_absent_target_is_unresolved() {
        let snapshot = Snapshot::from_posts(
            Utc::now(),
            vec![post(
                100,
                vec![
                    comment(100, 1, "a", Some(">>200#5")),
                    comment(100, 2, "b", Some(">>100#9")),
                    comment(100, 3, "c", Some(">>100")),
                ],
            )],
        );

        let index = resolve(&snapshot);
        assert!(!index.get(PostId(100), CommentId(1)).unwrap().is_resolved());
        assert!(!index.get(PostId(100), CommentId(2)).unwrap().is_resolved());
        assert!(index.get(PostId(100), CommentId(3)).unwrap().is_resolved());
        assert_eq!(index.dangling(), 2);
    }

    #[test]
    fn test_failed_target_is_unresolved() {
        let snapshot = Snapshot::from_posts(
            Utc::now(),
            vec![
                Post::failed(
                    PostId(200),
                    FetchFailure {
                        kind: FailureKind::NotFound,
                        stage: FetchStage::Post,
                        message: "gone".into(),
                    },
                ),
                post(100, vec![comment(100, 1, "a", Some(">>200"))]),
            ],
        );
        let index = resolve(&snapshot);
        assert!(!index.get(PostId(100), CommentId(1)).unwrap().is_resolved());
    }

    #[test]
    fn test_unparseable_marker_is_skipped() {
        let snapshot = Snapshot::from_posts(
            Utc::now(),
            vec![post(1, vec![comment(1, 1, "a", Some("garbage"))])],
        );
        assert!(resolve(&snapshot).is_empty());
    }
}
