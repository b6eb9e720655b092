//! treehole-dl CLI: collect posts into a data directory, or re-render a snapshot.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use treehole_dl::{Collector, Config, Event, HttpApiClient, PostId, PostSource};

/// Archive PKU Treehole posts, comment threads and images.
#[derive(Parser)]
#[command(name = "treehole-dl")]
#[command(about = "Rate-limited PKU Treehole archiver")]
#[command(version)]
struct Cli {
    /// JSON configuration file; missing fields use defaults
    #[arg(short, long, global = true, env = "TREEHOLE_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory (overrides the configuration file)
    #[arg(long, global = true, env = "TREEHOLE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Bearer token of an established session
    #[arg(long, global = true, env = "TREEHOLE_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch posts, then write the snapshot, Markdown, images and metrics
    Collect {
        #[command(flatten)]
        source: SourceArgs,

        /// Request submissions per second
        #[arg(long)]
        rate: Option<f64>,

        /// Requests that may be submitted back to back
        #[arg(long)]
        burst: Option<u32>,

        /// Concurrently executing fetch tasks
        #[arg(long)]
        parallel: Option<usize>,

        /// Retries per request on transient failures
        #[arg(long)]
        retries: Option<u32>,
    },

    /// Regenerate Markdown (and missing images) from a JSON snapshot without re-fetching
    Render {
        /// Snapshot file (default: most recent in the data directory)
        #[arg(long)]
        json: Option<PathBuf>,
    },
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct SourceArgs {
    /// A single post id
    #[arg(long)]
    post: Option<PostId>,

    /// Comma-separated post ids
    #[arg(long, value_delimiter = ',')]
    posts: Option<Vec<PostId>>,

    /// Every post on the account's followed list
    #[arg(long)]
    followed: bool,
}

impl SourceArgs {
    fn into_source(self) -> PostSource {
        match (self.post, self.posts) {
            (Some(id), _) => PostSource::Single(id),
            (None, Some(ids)) => PostSource::List(ids),
            (None, None) => PostSource::Followed,
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info,treehole_dl=debug")
        }
    });

    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().with_target(false)).init();
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_json_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(dir) = &cli.data_dir {
        config.output.data_dir = dir.clone();
    }
    if cli.token.is_some() {
        config.api.token = cli.token.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = load_config(&cli)?;

    match cli.command {
        Commands::Collect {
            source,
            rate,
            burst,
            parallel,
            retries,
        } => {
            if let Some(rate) = rate {
                config.rate.max_submitted_requests_per_second = rate;
            }
            if let Some(burst) = burst {
                config.rate.burst = burst;
            }
            if let Some(parallel) = parallel {
                config.max_parallel_requests = parallel;
            }
            if let Some(retries) = retries {
                config.retry.max_attempts = retries;
            }
            if config.api.token.is_none() {
                tracing::warn!("No token configured; the API will likely reject requests");
            }

            let client = Arc::new(HttpApiClient::new(&config.api)?);
            let collector = Collector::new(config, client)?;
            treehole_dl::cancel_on_signal(collector.cancel_token());

            let mut events = collector.subscribe();
            tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    if let Event::PostCompleted { id, ok: false } = event {
                        tracing::warn!(post_id = %id, "Post recorded with an error marker");
                    }
                }
            });

            let report = collector
                .run(source.into_source())
                .await
                .context("collection aborted")?;

            let manifest = &report.manifest;
            tracing::info!(
                stamp = %report.stamp,
                succeeded = manifest.succeeded,
                failed = manifest.failed,
                dangling_quotes = manifest.render.dangling_quotes,
                markdown = %manifest.render.markdown_dir.display(),
                "Done"
            );
        }
        Commands::Render { json } => {
            let client = Arc::new(HttpApiClient::new(&config.api)?);
            let collector = Collector::new(config, client)?;

            let path = match json {
                Some(path) => path,
                None => match collector.layout().latest_snapshot().await? {
                    Some(path) => path,
                    None => bail!(
                        "no snapshot found in {}",
                        collector.layout().json_dir().display()
                    ),
                },
            };

            let summary = collector
                .render_snapshot_file(&path)
                .await
                .with_context(|| format!("rendering {}", path.display()))?;
            tracing::info!(
                documents = summary.documents,
                images_unavailable = summary.images_unavailable,
                markdown = %summary.markdown_dir.display(),
                "Rendered"
            );
        }
    }

    Ok(())
}
