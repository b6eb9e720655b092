//! # treehole-dl
//!
//! Rate-limited archiver for PKU Treehole posts, their comment threads and images.
//!
//! ## Pipeline
//!
//! - A shared token bucket caps request submissions per second
//! - A worker pool caps concurrently executing fetch tasks
//! - Each fetch task retrieves one post plus every comment page, retrying
//!   transient failures, and materializes referenced images exactly once per id
//! - Results are aggregated into a snapshot that is frozen at the join barrier
//! - Quote markers are resolved against the frozen snapshot, then every post
//!   is rendered to Markdown next to a JSON snapshot and metrics series
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use treehole_dl::{Collector, Config, HttpApiClient, PostId, PostSource};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::default();
//!     config.api.token = std::env::var("TREEHOLE_TOKEN").ok();
//!
//!     let client = Arc::new(HttpApiClient::new(&config.api)?);
//!     let collector = Collector::new(config, client)?;
//!
//!     let mut events = collector.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let report = collector
//!         .run(PostSource::List(vec![PostId(100), PostId(200)]))
//!         .await?;
//!     println!("{} posts archived", report.manifest.succeeded);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Treehole API client
pub mod client;
/// Collection pipeline
pub mod collector;
/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Image materialization
pub mod images;
/// Markdown rendering
pub mod markdown;
/// Submission telemetry
pub mod metrics;
/// Quote markers and resolution
pub mod quote;
/// Request rate limiting with a token bucket
pub mod rate_limiter;
/// Retry logic with exponential backoff
pub mod retry;
/// Data directory layout and persisted artifacts
pub mod storage;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use client::{ApiClient, HttpApiClient};
pub use collector::{Collection, Collector, Manifest, RenderSummary, RunReport, Snapshot};
pub use config::Config;
pub use error::{Error, FetchError, ImageError, Result};
pub use types::{Comment, CommentId, Event, FetchFailure, Post, PostId, PostSource, QuoteRef};

/// Cancel `token` once a termination signal arrives.
///
/// Spawns a background task; dispatching stops and in-flight requests are
/// allowed to finish, so a run still ends with a snapshot and manifest.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
pub fn cancel_on_signal(token: tokio_util::sync::CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            () = wait_for_signal() => {
                tracing::warn!("Cancelling run, waiting for in-flight requests");
                token.cancel();
            }
            () = token.cancelled() => {}
        }
    })
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration can fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) | (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register signal handlers, using ctrl_c fallback");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
