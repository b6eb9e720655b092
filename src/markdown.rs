//! Markdown rendering of resolved posts
//!
//! [`render_post`] is a pure function of its inputs: no network or disk
//! access, and the same post, quotes and image links always give the same
//! bytes.

use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::DateTime;
use regex::{Captures, Regex};

use crate::collector::IMAGE_SCHEME;
use crate::quote::{QuoteIndex, Resolution};
use crate::types::{AssetId, Comment, FailureKind, FetchStage, ImageRef, Post, PostId};

/// Rendered for quotes whose target is not in the snapshot
pub const QUOTE_UNAVAILABLE: &str = "quoted content unavailable";

/// Rendered in place of an image that could not be materialized
pub const IMAGE_UNAVAILABLE: &str = "*[image unavailable]*";

/// Body of a post the API reported as missing
pub const POST_NOT_FOUND: &str = "The post you are viewing does not exist";

const ANONYMOUS: &str = "Anonymous";
const NO_COMMENTS: &str = "No comments.";
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[allow(clippy::expect_used)]
static IMAGE_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"{IMAGE_SCHEME}(\d{{7,}}(?:-\d+)?(?:_\d+)?)"))
        .expect("image token pattern is valid")
});

/// Local link targets of available images, keyed by asset id
pub type ImageLinks = HashMap<AssetId, String>;

/// Render one post with its comment thread
pub fn render_post(post: &Post, quotes: &QuoteIndex, images: &ImageLinks) -> String {
    let mut out = format!(
        "# Post {}\n\n[{}] ({})\n\n",
        post.id,
        format_time(post.timestamp),
        post.kind
    );

    if post.is_failed() {
        if let Some(error) = &post.error {
            if error.kind == FailureKind::NotFound {
                out.push_str(&format!("{POST_NOT_FOUND}\n\n"));
            }
            out.push_str(&format!("*Fetch failed ({:?}): {}*\n\n", error.kind, error.message));
        }
    } else {
        let body = render_text(&post.text, &post.images, images);
        if !body.is_empty() {
            out.push_str(&format!("{body}\n\n"));
        }
    }

    out.push_str("## Comments\n\n");
    if post.comments.is_empty() {
        out.push_str(NO_COMMENTS);
        out.push('\n');
    }
    for comment in &post.comments {
        render_comment(&mut out, post.id, comment, quotes, images);
    }

    if let Some(error) = post.error.as_ref().filter(|e| e.stage == FetchStage::Comments) {
        out.push_str(&format!(
            "\n*Comments incomplete ({:?}): {}*\n",
            error.kind, error.message
        ));
    }
    out
}

fn render_comment(
    out: &mut String,
    post_id: PostId,
    comment: &Comment,
    quotes: &QuoteIndex,
    images: &ImageLinks,
) {
    match quotes.get(post_id, comment.id) {
        Some(Resolution::Resolved {
            target,
            author,
            excerpt,
        }) => {
            let label = match (author, target.comment_id) {
                (Some(name), _) => name.clone(),
                (None, Some(_)) => ANONYMOUS.to_string(),
                (None, None) => format!("Post {}", target.post_id),
            };
            let excerpt = render_text(excerpt, &[], images);
            let mut lines = excerpt.lines();
            let first = lines.next().unwrap_or_default();
            out.push_str(&format!("> {label}: {first}\n"));
            for line in lines {
                out.push_str(&format!("> {line}\n"));
            }
            out.push('\n');
        }
        Some(Resolution::Unresolved { target }) => {
            out.push_str(&format!("> {QUOTE_UNAVAILABLE} ({})\n\n", target.to_marker()));
        }
        None => {}
    }

    let name = comment.author.as_deref().unwrap_or(ANONYMOUS);
    let text = render_text(&comment.text, &comment.images, images);
    out.push_str(&format!(
        "{name} [{}]: {text}\n\n---\n\n",
        format_time(comment.timestamp)
    ));
}

fn embed(asset: &AssetId, images: &ImageLinks) -> String {
    match images.get(asset) {
        Some(link) => format!("![]({link})"),
        None => IMAGE_UNAVAILABLE.to_string(),
    }
}

/// Replace every `image:<asset>` reference in `text` with an embed, then
/// append embeds for `owned` images the text does not reference inline
fn render_text(text: &str, owned: &[ImageRef], images: &ImageLinks) -> String {
    let mut inline = Vec::new();
    let mut out = IMAGE_TOKEN
        .replace_all(text, |caps: &Captures<'_>| {
            let asset = AssetId(caps[1].to_string());
            let rendered = embed(&asset, images);
            inline.push(asset);
            rendered
        })
        .into_owned();

    for image in owned.iter().filter(|image| !inline.contains(&image.asset)) {
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str(&embed(&image.asset, images));
    }
    out
}

/// UTC `YYYY-MM-DD HH:MM:SS`, or `unknown`
pub fn format_time(timestamp: Option<i64>) -> String {
    timestamp
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
        .map(|dt| dt.format(TIME_FORMAT).to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
