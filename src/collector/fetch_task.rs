//! Fetch task: one post and its full comment thread.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::client::{ApiClient, PageCursor, PostBody, RawComment};
use crate::config::RetryConfig;
use crate::error::FetchError;
use crate::images::{ImageStore, image_ref};
use crate::quote::leading_marker;
use crate::rate_limiter::Throttle;
use crate::retry::fetch_with_retry;
use crate::types::{AssetId, Comment, FetchFailure, FetchStage, ImageRef, Post, PostId};

#[allow(clippy::expect_used)]
static IMAGE_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)https?://[^\s<>()\[\]"']+?\.(?:png|jpe?g|gif|webp|bmp)(?:\?[^\s<>()\[\]"']*)?"#)
        .expect("image URL pattern is valid")
});

/// Prefix of the local reference that replaces a remote image URL in body text
pub const IMAGE_SCHEME: &str = "image:";

/// Everything a fetch task needs, shared by all tasks of a run
#[derive(Clone)]
pub struct FetchContext {
    /// API collaborator
    pub client: Arc<dyn ApiClient>,
    /// Shared submission gate
    pub throttle: Throttle,
    /// Retry policy for transient failures
    pub retry: RetryConfig,
    /// Image materializer
    pub images: Arc<ImageStore>,
    /// Run-wide cancellation
    pub cancel: CancellationToken,
}

/// What a fetch task hands back to the collector
#[derive(Debug)]
pub struct TaskOutcome {
    /// The populated post, possibly carrying an error marker
    pub post: Post,
    /// Set when the task hit an error that must abort the run
    pub fatal: Option<FetchError>,
}

/// Fetch one post, page through its comments and materialize its images
///
/// `prepaid` means the dispatcher already took a rate-limit token for the
/// first post request. Every other request (retries, comment pages, image
/// downloads) takes its own token from the shared bucket.
///
/// Never fails: per-item errors end up as an error marker on the post.
pub async fn fetch_post(ctx: &FetchContext, id: PostId, prepaid: bool) -> TaskOutcome {
    let body = match fetch_body(ctx, id, prepaid).await {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!(post_id = %id, error = %e, "Post fetch failed");
            return TaskOutcome {
                post: Post::failed(id, failure(&e, FetchStage::Post)),
                fatal: e.is_fatal().then_some(e),
            };
        }
    };

    let mut post = build_post(body);
    let (comments, comment_error) = fetch_thread(ctx, id).await;
    post.comments = comments;

    let mut fatal = None;
    if let Some(e) = comment_error {
        tracing::warn!(
            post_id = %id,
            fetched = post.comments.len(),
            error = %e,
            "Comment pagination failed, keeping fetched pages"
        );
        post.error = Some(failure(&e, FetchStage::Comments));
        fatal = e.is_fatal().then_some(e);
    }

    // Download failures only degrade the rendered output
    let images: Vec<ImageRef> = post
        .images
        .iter()
        .chain(post.comments.iter().flat_map(|c| c.images.iter()))
        .cloned()
        .collect();
    for image in &images {
        ctx.images.ensure_local(image).await;
    }

    tracing::debug!(
        post_id = %id,
        comments = post.comments.len(),
        images = images.len(),
        "Post fetched"
    );
    TaskOutcome { post, fatal }
}

async fn fetch_body(ctx: &FetchContext, id: PostId, prepaid: bool) -> Result<PostBody, FetchError> {
    let mut paid = prepaid;
    let throttle = &ctx.throttle;
    let client = &ctx.client;
    let cancel = &ctx.cancel;

    fetch_with_retry(&ctx.retry, cancel, || {
        let already_paid = std::mem::take(&mut paid);
        async move {
            if !already_paid {
                throttle.submit(cancel).await?;
            }
            client.fetch_post(id).await
        }
    })
    .await
}

/// Page through a thread until exhaustion; on error keep what was fetched
async fn fetch_thread(ctx: &FetchContext, id: PostId) -> (Vec<Comment>, Option<FetchError>) {
    let mut comments = Vec::new();
    let mut seen = HashSet::new();
    let mut cursor: Option<PageCursor> = None;
    let throttle = &ctx.throttle;
    let client = &ctx.client;
    let cancel = &ctx.cancel;

    loop {
        let page = fetch_with_retry(&ctx.retry, cancel, || async move {
            throttle.submit(cancel).await?;
            client.fetch_comments(id, cursor).await
        })
        .await;

        let page = match page {
            Ok(page) => page,
            Err(e) => return (comments, Some(e)),
        };

        for raw in page.comments {
            // Overlapping pages must not duplicate comment ids
            if seen.insert(raw.id) {
                comments.push(build_comment(id, raw));
            }
        }

        match page.next_cursor {
            None => return (comments, None),
            Some(next) if Some(next) == cursor => {
                return (
                    comments,
                    Some(FetchError::Malformed(format!(
                        "comment cursor of post {id} did not advance past page {next}"
                    ))),
                );
            }
            Some(next) => cursor = Some(next),
        }
    }
}

fn build_post(body: PostBody) -> Post {
    let mut text = body.text;
    let owner = AssetId::for_post(body.id);

    // The API attachment takes the owner's first asset id, inline URLs follow
    let mut images: Vec<ImageRef> = body
        .image
        .map(|remote| image_ref(&remote.url, remote.file_name.as_deref(), owner.nth(0)))
        .into_iter()
        .collect();
    let inline = extract_images(&mut text, &owner, images.len());
    images.extend(inline);

    Post {
        id: body.id,
        text,
        timestamp: body.timestamp,
        kind: body.kind,
        images,
        comments: Vec::new(),
        error: None,
    }
}

fn build_comment(post_id: PostId, raw: RawComment) -> Comment {
    let mut text = raw.text;
    let quote_marker = raw
        .quote
        .map(|q| q.to_marker())
        .or_else(|| leading_marker(&text));
    let images = extract_images(&mut text, &AssetId::for_comment(post_id, raw.id), 0);

    Comment {
        id: raw.id,
        post_id,
        text,
        timestamp: raw.timestamp,
        author: raw.author,
        quote_marker,
        images,
    }
}

/// Replace every image URL in `text` with `image:<asset>`
///
/// Assets are numbered per owner starting at `first_index`; a URL repeated in
/// the same body maps to the same asset.
pub fn extract_images(text: &mut String, owner: &AssetId, first_index: usize) -> Vec<ImageRef> {
    let mut images: Vec<ImageRef> = Vec::new();
    let rewritten = IMAGE_URL.replace_all(text, |caps: &regex::Captures<'_>| {
        let url = &caps[0];
        let asset = match images.iter().find(|image| image.url == url) {
            Some(seen) => seen.asset.clone(),
            None => {
                let image = image_ref(url, None, owner.nth(first_index + images.len()));
                let asset = image.asset.clone();
                images.push(image);
                asset
            }
        };
        format!("{IMAGE_SCHEME}{asset}")
    });
    if !images.is_empty() {
        *text = rewritten.into_owned();
    }
    images
}

fn failure(e: &FetchError, stage: FetchStage) -> FetchFailure {
    FetchFailure {
        kind: e.kind(),
        stage,
        message: e.to_string(),
    }
}
