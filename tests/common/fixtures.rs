//! Configuration and content builders shared by integration tests

use std::path::Path;
use std::time::Duration;

use treehole_dl::client::{PostBody, RawComment};
use treehole_dl::config::RetryConfig;
use treehole_dl::types::{CommentId, PostKind};
use treehole_dl::{Config, PostId, QuoteRef};

/// Config writing into `data_dir` with fast retries
pub fn test_config(data_dir: &Path, rate: f64, burst: u32, parallel: usize) -> Config {
    let mut config = Config::default();
    config.output.data_dir = data_dir.to_path_buf();
    config.rate.max_submitted_requests_per_second = rate;
    config.rate.burst = burst;
    config.max_parallel_requests = parallel;
    config.retry = fast_retry(2);
    config
}

/// Retry policy with millisecond delays and no jitter
pub fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        backoff_multiplier: 2.0,
        jitter: false,
    }
}

/// Config that never makes the rate limiter the bottleneck
pub fn unthrottled_config(data_dir: &Path, parallel: usize) -> Config {
    test_config(data_dir, 10_000.0, 1_000, parallel)
}

/// Text post body
pub fn text_post(id: i64, text: &str) -> PostBody {
    PostBody {
        id: PostId(id),
        text: text.to_string(),
        timestamp: Some(1_700_000_000 + id),
        kind: PostKind::Text,
        image: None,
    }
}

/// Plain comment
pub fn comment(id: i64, author: &str, text: &str) -> RawComment {
    RawComment {
        id: CommentId(id),
        text: text.to_string(),
        timestamp: Some(1_700_000_100 + id),
        author: Some(author.to_string()),
        quote: None,
    }
}

/// Comment carrying a structured quote of `post#comment`
pub fn quoting_comment(id: i64, author: &str, text: &str, post: i64, target: Option<i64>) -> RawComment {
    RawComment {
        quote: Some(QuoteRef {
            post_id: PostId(post),
            comment_id: target.map(CommentId),
        }),
        ..comment(id, author, text)
    }
}

/// Every file under `dir` with its contents, sorted by name
pub fn read_tree(dir: &Path) -> Vec<(String, Vec<u8>)> {
    let mut files: Vec<(String, Vec<u8>)> = std::fs::read_dir(dir)
        .unwrap_or_else(|e| panic!("reading {}: {e}", dir.display()))
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_file())
        .map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            let bytes = std::fs::read(entry.path()).unwrap_or_default();
            (name, bytes)
        })
        .collect();
    files.sort_by(|a, b| a.0.cmp(&b.0));
    files
}
