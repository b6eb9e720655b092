//! Collection pipeline
//!
//! [`Collector`] owns one run's configuration and wires the pieces together:
//!
//! 1. Resolve the [`PostSource`] into a de-duplicated id list
//! 2. For every id: take a rate-limit token, wait for a pool slot, spawn a fetch task
//! 3. Fetch tasks insert their posts into the [`Aggregator`]
//! 4. Join barrier; the aggregator is frozen into a [`Snapshot`]
//! 5. Quote resolution, Markdown rendering and persistence run on the frozen snapshot
//!
//! Per-item failures are recorded on the posts. Only systemic errors
//! (rejected credentials, invalid configuration, output I/O) make
//! [`Collector::collect`] or [`Collector::run`] return an error.

mod aggregator;
mod fetch_task;
mod pool;

pub use aggregator::{Aggregator, Snapshot};
pub use fetch_task::{FetchContext, IMAGE_SCHEME, TaskOutcome, extract_images, fetch_post};
pub use pool::WorkerPool;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::client::{ApiClient, PageCursor};
use crate::config::Config;
use crate::error::{Error, FetchError, Result};
use crate::images::{ImageOutcome, ImageStore, file_name};
use crate::markdown::{ImageLinks, render_post};
use crate::metrics::{ConcurrencyAnalysis, MetricsRecorder, RateAnalysis};
use crate::quote::{self, QuoteIndex};
use crate::rate_limiter::{Throttle, TokenBucket};
use crate::retry::fetch_with_retry;
use crate::storage::{self, Layout};
use crate::types::{
    Event, FailureKind, FetchFailure, FetchStage, ImageRef, Post, PostId, PostSource,
    SubmissionEvent,
};

/// Broadcast buffer; slow subscribers lag instead of blocking collection
const EVENT_BUFFER: usize = 1000;

/// Consecutive failed followed-list pages after which listing stops
const MAX_FOLLOWED_PAGE_FAILURES: u32 = 3;

/// Result of the collection phase
#[derive(Debug)]
pub struct Collection {
    /// Run stamp (`YYYY-MM-DD-HH-MM-SS`)
    pub stamp: String,
    /// Frozen snapshot
    pub snapshot: Snapshot,
    /// Raw submission timeline
    pub timeline: Vec<SubmissionEvent>,
    /// Ids requested, after de-duplication
    pub requested: Vec<PostId>,
    images: Arc<ImageStore>,
}

/// What rendering produced
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderSummary {
    /// Directory holding the Markdown documents
    pub markdown_dir: PathBuf,
    /// Documents written
    pub documents: usize,
    /// Images on disk
    pub images_available: usize,
    /// Images rendered as placeholders
    pub images_unavailable: usize,
    /// Quoting comments
    pub quotes: usize,
    /// Quotes whose target was not fetched
    pub dangling_quotes: usize,
}

/// Per-post line of the manifest
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Post id
    pub id: PostId,
    /// Post and every comment page fetched
    pub ok: bool,
    /// Comments fetched
    pub comments: usize,
    /// Failure marker, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FetchFailure>,
}

/// Success/failure manifest of a run
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Run stamp
    pub stamp: String,
    /// Run start
    pub created_at: DateTime<Utc>,
    /// Posts requested
    pub requested: usize,
    /// Posts fetched without error
    pub succeeded: usize,
    /// Posts carrying an error marker
    pub failed: usize,
    /// Snapshot file
    pub snapshot_path: PathBuf,
    /// Rendering outcome
    pub render: RenderSummary,
    /// One entry per post, ascending id
    pub posts: Vec<ManifestEntry>,
}

impl Manifest {
    fn new(stamp: &str, snapshot: &Snapshot, snapshot_path: PathBuf, render: RenderSummary) -> Self {
        Self {
            stamp: stamp.to_string(),
            created_at: snapshot.created_at(),
            requested: snapshot.len(),
            succeeded: snapshot.succeeded(),
            failed: snapshot.failed(),
            snapshot_path,
            render,
            posts: snapshot
                .posts()
                .map(|p| ManifestEntry {
                    id: p.id,
                    ok: p.error.is_none(),
                    comments: p.comments.len(),
                    error: p.error.clone(),
                })
                .collect(),
        }
    }
}

/// Everything a full run produced
#[derive(Debug)]
pub struct RunReport {
    /// Run stamp
    pub stamp: String,
    /// Frozen snapshot
    pub snapshot: Snapshot,
    /// Quote resolutions
    pub quotes: QuoteIndex,
    /// Manifest as written to disk
    pub manifest: Manifest,
}

/// Rate-limited, bounded-parallelism collector for one configuration
pub struct Collector {
    config: Arc<Config>,
    client: Arc<dyn ApiClient>,
    layout: Layout,
    cancel: CancellationToken,
    event_tx: broadcast::Sender<Event>,
}

impl Collector {
    /// Create a collector
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid.
    pub fn new(config: Config, client: Arc<dyn ApiClient>) -> Result<Self> {
        config.validate()?;
        let (event_tx, _rx) = broadcast::channel(EVENT_BUFFER);
        Ok(Self {
            layout: Layout::new(config.output.data_dir.clone()),
            config: Arc::new(config),
            client,
            cancel: CancellationToken::new(),
            event_tx,
        })
    }

    /// Subscribe to progress events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Shutdown token of this collector
    ///
    /// Cancelling stops dispatching and makes fetch tasks stop re-submitting
    /// at their next checkpoint; requests already in flight complete. Every
    /// run derives its own child token from it, so a run aborted by rejected
    /// credentials does not affect later runs, while cancelling this token
    /// shuts down the current run and every later one.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Output layout
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Configuration of this collector
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn emit(&self, event: Event) {
        self.event_tx.send(event).ok();
    }

    fn image_store(&self, throttle: Throttle, cancel: CancellationToken) -> Arc<ImageStore> {
        Arc::new(ImageStore::new(
            self.layout.image_dir(),
            self.client.clone(),
            throttle,
            self.config.retry.clone(),
            cancel,
        ))
    }

    /// Collect every post of `source` into a frozen snapshot
    ///
    /// # Errors
    ///
    /// - [`Error::Auth`] if any request was rejected for authentication
    /// - [`Error::Cancelled`] if the run was cancelled while listing followed posts
    /// - any error listing the first followed page
    pub async fn collect(&self, source: PostSource) -> Result<Collection> {
        let started = Local::now();
        let stamp = storage::run_stamp(started);
        // Run-scoped: an auth abort cancels this run only
        let cancel = self.cancel.child_token();
        let metrics = Arc::new(MetricsRecorder::new());
        let throttle = Throttle::new(TokenBucket::from_config(&self.config.rate)?, metrics.clone());
        let images = self.image_store(throttle.clone(), cancel.clone());

        let ids = self.resolve_source(source, &throttle, &cancel).await?;
        tracing::info!(stamp = %stamp, posts = ids.len(), "Starting collection");
        self.emit(Event::CollectionStarted { total: ids.len() });

        let ctx = FetchContext {
            client: self.client.clone(),
            throttle: throttle.clone(),
            retry: self.config.retry.clone(),
            images: images.clone(),
            cancel: cancel.clone(),
        };
        let aggregator = Arc::new(Aggregator::new());
        let mut pool = WorkerPool::new(self.config.max_parallel_requests)?;
        let mut dispatched = HashSet::new();

        for &id in &ids {
            // The token pays for the task's first post request
            if throttle.submit(&cancel).await.is_err() {
                tracing::info!(remaining = ids.len() - dispatched.len(), "Run cancelled, stopping dispatch");
                break;
            }

            let ctx = ctx.clone();
            let aggregator = aggregator.clone();
            let metrics = metrics.clone();
            let event_tx = self.event_tx.clone();
            pool.spawn(async move {
                metrics.task_started();
                event_tx.send(Event::PostDispatched { id }).ok();

                let outcome = fetch_post(&ctx, id, true).await;
                if outcome.fatal.is_some() {
                    ctx.cancel.cancel();
                }
                let ok = outcome.post.error.is_none();
                aggregator.insert(outcome.post);

                metrics.record_completed();
                event_tx.send(Event::PostCompleted { id, ok }).ok();
                outcome.fatal
            })
            .await?;
            dispatched.insert(id);
        }

        // Join barrier
        let mut fatal: Option<FetchError> = None;
        for result in pool.join().await {
            match result {
                Ok(Some(e)) => {
                    fatal.get_or_insert(e);
                }
                Ok(None) => {}
                Err(e) => tracing::error!(error = %e, "Fetch task panicked"),
            }
        }

        if let Some(e) = fatal {
            tracing::error!(error = %e, "Authentication rejected, aborting run");
            return Err(Error::Auth(e.to_string()));
        }

        for &id in &ids {
            if aggregator.contains(id) {
                continue;
            }
            let (kind, message) = if dispatched.contains(&id) {
                (FailureKind::Aborted, "fetch task ended without a result")
            } else {
                (FailureKind::Cancelled, "run cancelled before dispatch")
            };
            aggregator.insert(Post::failed(
                id,
                FetchFailure {
                    kind,
                    stage: FetchStage::Post,
                    message: message.to_string(),
                },
            ));
        }

        let aggregator = Arc::try_unwrap(aggregator)
            .map_err(|_| Error::Other("aggregator still shared after join".into()))?;
        let snapshot = aggregator.freeze(started.with_timezone(&Utc));

        tracing::info!(
            succeeded = snapshot.succeeded(),
            failed = snapshot.failed(),
            "Collection finished"
        );
        self.emit(Event::CollectionFinished {
            succeeded: snapshot.succeeded(),
            failed: snapshot.failed(),
        });

        Ok(Collection {
            stamp,
            snapshot,
            timeline: metrics.timeline(),
            requested: ids,
            images,
        })
    }

    /// Full pipeline: collect, resolve quotes, render and persist every artifact
    pub async fn run(&self, source: PostSource) -> Result<RunReport> {
        let collection = self.collect(source).await?;
        let Collection {
            stamp,
            snapshot,
            timeline,
            images,
            ..
        } = collection;

        let snapshot_path = self.layout.snapshot_path(&stamp);
        storage::save_snapshot(&snapshot_path, &snapshot).await?;

        let quotes = quote::resolve(&snapshot);
        let render = self.render(&stamp, &snapshot, &quotes, &images).await?;

        self.write_metrics(&stamp, &timeline).await?;

        let manifest = Manifest::new(&stamp, &snapshot, snapshot_path, render);
        storage::write_json(&self.layout.manifest_path(&stamp), &manifest).await?;

        tracing::info!(
            stamp = %stamp,
            succeeded = manifest.succeeded,
            failed = manifest.failed,
            documents = manifest.render.documents,
            "Run complete"
        );
        Ok(RunReport {
            stamp,
            snapshot,
            quotes,
            manifest,
        })
    }

    /// Regenerate Markdown (and missing images) from a persisted snapshot
    ///
    /// The run directory is named after the snapshot's file stem. Nothing is
    /// fetched except images absent from the image directory.
    pub async fn render_snapshot_file(&self, path: &Path) -> Result<RenderSummary> {
        let stamp = storage::stamp_of(path)?;
        let snapshot = storage::load_snapshot(path).await?;
        let throttle = Throttle::new(
            TokenBucket::from_config(&self.config.rate)?,
            Arc::new(MetricsRecorder::new()),
        );
        let images = self.image_store(throttle, self.cancel.child_token());

        let quotes = quote::resolve(&snapshot);
        let summary = self.render(&stamp, &snapshot, &quotes, &images).await?;
        tracing::info!(
            stamp = %stamp,
            documents = summary.documents,
            "Rendered snapshot"
        );
        Ok(summary)
    }

    async fn render(
        &self,
        stamp: &str,
        snapshot: &Snapshot,
        quotes: &QuoteIndex,
        images: &ImageStore,
    ) -> Result<RenderSummary> {
        let refs: Vec<&ImageRef> = snapshot
            .posts()
            .flat_map(|p| {
                p.images
                    .iter()
                    .chain(p.comments.iter().flat_map(|c| c.images.iter()))
            })
            .collect();

        let outcomes: Vec<(&ImageRef, ImageOutcome)> = futures::stream::iter(refs)
            .map(|image| async move { (image, images.ensure_local(image).await) })
            .buffer_unordered(self.config.max_parallel_requests)
            .collect()
            .await;

        let mut links = ImageLinks::new();
        let mut unavailable = 0;
        for (image, outcome) in outcomes {
            match outcome {
                ImageOutcome::Available(_) => {
                    links.insert(image.asset.clone(), self.layout.image_link(&file_name(image)));
                }
                ImageOutcome::Unavailable => unavailable += 1,
            }
        }

        let markdown_dir = self.layout.markdown_dir(stamp);
        tokio::fs::create_dir_all(&markdown_dir).await?;
        let mut documents = 0;
        for post in snapshot.posts() {
            let text = render_post(post, quotes, &links);
            storage::write_atomically(&self.layout.markdown_path(stamp, post.id), text.as_bytes())
                .await?;
            documents += 1;
        }

        Ok(RenderSummary {
            markdown_dir,
            documents,
            images_available: links.len(),
            images_unavailable: unavailable,
            quotes: quotes.len(),
            dangling_quotes: quotes.dangling(),
        })
    }

    async fn write_metrics(&self, stamp: &str, timeline: &[SubmissionEvent]) -> Result<()> {
        storage::write_json(
            &self.layout.rate_analysis_path(stamp),
            &RateAnalysis::from_events(timeline),
        )
        .await?;
        storage::write_json(
            &self.layout.concurrency_analysis_path(stamp),
            &ConcurrencyAnalysis::from_events(timeline),
        )
        .await?;
        storage::write_json(&self.layout.timeline_path(stamp), timeline).await
    }

    /// Turn a source into a de-duplicated id list, first occurrence wins
    async fn resolve_source(
        &self,
        source: PostSource,
        throttle: &Throttle,
        cancel: &CancellationToken,
    ) -> Result<Vec<PostId>> {
        let ids = match source {
            PostSource::Single(id) => vec![id],
            PostSource::List(ids) => ids,
            PostSource::Followed => self.list_followed(throttle, cancel).await?,
        };

        let mut seen = HashSet::new();
        let unique: Vec<PostId> = ids.into_iter().filter(|id| seen.insert(*id)).collect();
        Ok(unique)
    }

    /// Page through the followed list
    ///
    /// The first page must succeed. Later failed pages are skipped; listing
    /// stops after several consecutive failures.
    async fn list_followed(
        &self,
        throttle: &Throttle,
        cancel: &CancellationToken,
    ) -> Result<Vec<PostId>> {
        let client = &self.client;
        let mut ids = Vec::new();
        let mut cursor: Option<PageCursor> = None;
        let mut failures = 0u32;
        let mut visited: HashSet<Option<PageCursor>> = HashSet::new();

        loop {
            if !visited.insert(cursor) {
                tracing::warn!(?cursor, "Followed list cursor repeated, stopping");
                break;
            }

            let page = fetch_with_retry(&self.config.retry, cancel, || async move {
                throttle.submit(cancel).await?;
                client.fetch_followed_list(cursor).await
            })
            .await;

            match page {
                Ok(page) => {
                    failures = 0;
                    ids.extend(page.ids);
                    match page.next_cursor {
                        Some(next) => cursor = Some(next),
                        None => break,
                    }
                }
                Err(FetchError::Auth(message)) => return Err(Error::Auth(message)),
                Err(FetchError::Cancelled) => return Err(Error::Cancelled),
                Err(e) if cursor.is_none() => {
                    return Err(Error::Other(format!("failed to list followed posts: {e}")));
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(?cursor, error = %e, "Skipping followed list page");
                    if failures >= MAX_FOLLOWED_PAGE_FAILURES {
                        tracing::warn!(failures, "Too many failed followed pages, stopping");
                        break;
                    }
                    cursor = cursor.map(|page| page + 1);
                }
            }
        }

        tracing::info!(posts = ids.len(), "Listed followed posts");
        Ok(ids)
    }
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("layout", &self.layout)
            .field("max_parallel_requests", &self.config.max_parallel_requests)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}
