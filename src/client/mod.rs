//! API client abstraction
//!
//! The collection pipeline only talks to the forum through [`ApiClient`].
//! Session establishment, raw HTTP transport and endpoint schemas live behind
//! this trait; [`HttpApiClient`] is the production implementation for the
//! treehole JSON API, tests substitute in-memory clients.

mod http;

pub use http::HttpApiClient;

use crate::error::FetchError;
use crate::types::{CommentId, PostId, PostKind, QuoteRef};

/// Opaque pagination cursor (1-based page number for the treehole API)
pub type PageCursor = u32;

/// Image attached to a post by the API
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteImage {
    /// Download URL
    pub url: String,
    /// Original file name, when the download URL does not carry one
    pub file_name: Option<String>,
}

/// A post as returned by the API, before comments and image materialization
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PostBody {
    /// Post id
    pub id: PostId,
    /// Body text with remote URLs intact
    pub text: String,
    /// Unix timestamp (seconds)
    pub timestamp: Option<i64>,
    /// Post type
    pub kind: PostKind,
    /// Attached image
    pub image: Option<RemoteImage>,
}

/// A comment as returned by the API
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawComment {
    /// Comment id, unique within the post
    pub id: CommentId,
    /// Body text with remote URLs intact
    pub text: String,
    /// Unix timestamp (seconds)
    pub timestamp: Option<i64>,
    /// Display name of the commenter
    pub author: Option<String>,
    /// Structured quote target, when the API provides one
    pub quote: Option<QuoteRef>,
}

/// One page of a comment thread
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommentPage {
    /// Comments in server order
    pub comments: Vec<RawComment>,
    /// Cursor of the next page, `None` once the thread is exhausted
    pub next_cursor: Option<PageCursor>,
}

/// One page of the followed-posts list
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FollowedPage {
    /// Followed post ids
    pub ids: Vec<PostId>,
    /// Cursor of the next page, `None` once the list is exhausted
    pub next_cursor: Option<PageCursor>,
}

/// Forum API consumed by the collection pipeline
///
/// Authentication is internal to implementations; rejected credentials are
/// reported as [`FetchError::Auth`].
#[async_trait::async_trait]
pub trait ApiClient: Send + Sync {
    /// Fetch a post body
    async fn fetch_post(&self, id: PostId) -> Result<PostBody, FetchError>;

    /// Fetch one page of a post's comments; `None` requests the first page
    async fn fetch_comments(
        &self,
        id: PostId,
        cursor: Option<PageCursor>,
    ) -> Result<CommentPage, FetchError>;

    /// Fetch one page of the account's followed posts; `None` requests the first page
    async fn fetch_followed_list(
        &self,
        cursor: Option<PageCursor>,
    ) -> Result<FollowedPage, FetchError>;

    /// Download raw bytes of an image
    async fn download(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}
