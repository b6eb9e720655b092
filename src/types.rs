//! Core types for treehole-dl

use serde::{Deserialize, Serialize};

/// Identifier of a treehole post (`pid`)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PostId(pub i64);

impl PostId {
    /// Create a new PostId
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }

    /// Id zero-padded to 7 digits, as used in artifact file names
    pub fn padded(&self) -> String {
        format!("{:07}", self.0)
    }
}

impl From<i64> for PostId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for PostId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for PostId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.trim().parse()?))
    }
}

/// Identifier of a comment, unique within its post
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommentId(pub i64);

impl std::fmt::Display for CommentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a local image asset, derived from the owning post or comment
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(pub String);

impl AssetId {
    /// Asset owned by a post: the zero-padded post id
    pub fn for_post(post: PostId) -> Self {
        Self(post.padded())
    }

    /// Asset owned by a comment: `{post:07}-{comment}`
    pub fn for_comment(post: PostId, comment: CommentId) -> Self {
        Self(format!("{}-{}", post.padded(), comment.0))
    }

    /// The `index`-th (0-based) asset of the same owner: the owner id itself,
    /// then `{owner}_2`, `{owner}_3`, ...
    pub fn nth(&self, index: usize) -> Self {
        match index {
            0 => self.clone(),
            n => Self(format!("{}_{}", self.0, n + 1)),
        }
    }

    /// Borrow the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AssetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Post type as reported by the API
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostKind {
    /// Plain text post
    #[default]
    Text,
    /// Post with an attached image
    Image,
    /// Any type this crate does not know about
    #[serde(other)]
    Other,
}

impl std::fmt::Display for PostKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PostKind::Text => "text",
            PostKind::Image => "image",
            PostKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// Reference from a post or comment to a remote image
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    /// Original remote URL (kept in the JSON snapshot)
    pub url: String,
    /// Local asset identity
    pub asset: AssetId,
    /// File extension taken from the source URL
    pub extension: String,
}

/// A fetched post with its full comment thread
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    /// Post id
    #[serde(rename = "pid")]
    pub id: PostId,
    /// Body text; image URLs are rewritten to `image:<asset id>`
    pub text: String,
    /// Unix timestamp (seconds), if the API reported one
    #[serde(default)]
    pub timestamp: Option<i64>,
    /// Post type
    #[serde(rename = "type", default)]
    pub kind: PostKind,
    /// Attached and inline images, in asset order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageRef>,
    /// Comments in original server order
    #[serde(default)]
    pub comments: Vec<Comment>,
    /// Error marker for items that could not be (fully) fetched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FetchFailure>,
}

impl Post {
    /// Placeholder post carrying only an error marker
    pub fn failed(id: PostId, failure: FetchFailure) -> Self {
        Self {
            id,
            text: String::new(),
            timestamp: None,
            kind: PostKind::Text,
            images: Vec::new(),
            comments: Vec::new(),
            error: Some(failure),
        }
    }

    /// Whether the post body itself is unavailable
    ///
    /// A post whose comment pagination failed part way still has a usable body.
    pub fn is_failed(&self) -> bool {
        self.error
            .as_ref()
            .is_some_and(|e| e.stage == FetchStage::Post)
    }

    /// Look up a comment by its local id
    pub fn comment(&self, id: CommentId) -> Option<&Comment> {
        self.comments.iter().find(|c| c.id == id)
    }
}

/// A single comment on a post
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    /// Comment id, unique within the post
    #[serde(rename = "cid")]
    pub id: CommentId,
    /// Owning post
    #[serde(rename = "pid")]
    pub post_id: PostId,
    /// Body text; image URLs are rewritten to `image:<asset id>`
    pub text: String,
    /// Unix timestamp (seconds)
    #[serde(default)]
    pub timestamp: Option<i64>,
    /// Display name of the commenter
    #[serde(default, rename = "name", skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Quote marker, `>>pid` or `>>pid#cid`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote_marker: Option<String>,
    /// Inline images, in asset order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageRef>,
}

/// Target of a quote marker
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuoteRef {
    /// Quoted post
    pub post_id: PostId,
    /// Quoted comment; `None` quotes the post itself
    pub comment_id: Option<CommentId>,
}

impl QuoteRef {
    /// Render back into marker syntax
    pub fn to_marker(&self) -> String {
        match self.comment_id {
            Some(cid) => format!(">>{}#{}", self.post_id, cid),
            None => format!(">>{}", self.post_id),
        }
    }
}

/// Classification of a recorded per-item failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transient error that survived every retry
    Transient,
    /// Permanent fetch error
    Permanent,
    /// Post does not exist
    NotFound,
    /// Unparseable response
    Malformed,
    /// Credentials rejected
    Auth,
    /// Run cancelled before the item finished
    Cancelled,
    /// Task ended without reporting (panicked)
    Aborted,
}

/// Which part of a fetch task failed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStage {
    /// Fetching the post body
    Post,
    /// Paginating the comment thread
    Comments,
}

/// Error marker attached to a post in the snapshot
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchFailure {
    /// Failure classification
    pub kind: FailureKind,
    /// Stage that failed
    pub stage: FetchStage,
    /// Human-readable message
    pub message: String,
}

/// Kind of a metrics timeline event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionKind {
    /// A rate-limit token was acquired and a request submitted
    Submitted,
    /// A fetch task finished
    Completed,
}

/// Append-only telemetry record
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionEvent {
    /// Milliseconds since the recorder was created
    pub offset_ms: u64,
    /// Event kind
    pub kind: SubmissionKind,
    /// Fetch tasks in flight when the event was recorded
    pub in_flight: usize,
}

/// Where the list of posts to collect comes from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PostSource {
    /// A single post
    Single(PostId),
    /// An explicit list of posts
    List(Vec<PostId>),
    /// Every post on the account's followed list
    Followed,
}

/// Progress events emitted by the collector
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Collection started
    CollectionStarted {
        /// Number of unique posts to fetch
        total: usize,
    },
    /// A fetch task took a pool slot
    PostDispatched {
        /// Post id
        id: PostId,
    },
    /// A fetch task returned
    PostCompleted {
        /// Post id
        id: PostId,
        /// Whether the post and all comments were fetched
        ok: bool,
    },
    /// The join barrier was passed
    CollectionFinished {
        /// Fully fetched posts
        succeeded: usize,
        /// Posts carrying an error marker
        failed: usize,
    },
}
