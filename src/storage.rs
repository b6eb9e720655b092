//! On-disk layout of a data directory and the artifacts persisted per run
//!
//! ```text
//! <data>/post_json/<stamp>.json              snapshot
//! <data>/post_json/<stamp>-manifest.json     success/failure manifest
//! <data>/post_markdown/<stamp>/<pid:07>.md   one document per post
//! <data>/images/<asset>.<ext>                shared across runs
//! <data>/metrics/<stamp>-rate_analysis.json
//! <data>/metrics/<stamp>-concurrency_analysis.json
//! <data>/metrics/<stamp>-timeline.json
//! ```

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

use crate::collector::Snapshot;
use crate::error::{Error, Result};
use crate::types::{Post, PostId};

/// Run stamp format, also the snapshot file stem
pub const STAMP_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

const MANIFEST_SUFFIX: &str = "-manifest";

/// Paths inside a data directory
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    /// Layout rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Data directory root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding snapshots and manifests
    pub fn json_dir(&self) -> PathBuf {
        self.root.join("post_json")
    }

    /// Snapshot file of a run
    pub fn snapshot_path(&self, stamp: &str) -> PathBuf {
        self.json_dir().join(format!("{stamp}.json"))
    }

    /// Manifest file of a run
    pub fn manifest_path(&self, stamp: &str) -> PathBuf {
        self.json_dir().join(format!("{stamp}{MANIFEST_SUFFIX}.json"))
    }

    /// Markdown directory of a run
    pub fn markdown_dir(&self, stamp: &str) -> PathBuf {
        self.root.join("post_markdown").join(stamp)
    }

    /// Markdown document of one post
    pub fn markdown_path(&self, stamp: &str, id: PostId) -> PathBuf {
        self.markdown_dir(stamp).join(format!("{}.md", id.padded()))
    }

    /// Shared image directory
    pub fn image_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    /// Link from a markdown document to an image file
    pub fn image_link(&self, file_name: &str) -> String {
        format!("../../images/{file_name}")
    }

    /// Directory holding metrics series
    pub fn metrics_dir(&self) -> PathBuf {
        self.root.join("metrics")
    }

    /// Rate-over-time series of a run
    pub fn rate_analysis_path(&self, stamp: &str) -> PathBuf {
        self.metrics_dir().join(format!("{stamp}-rate_analysis.json"))
    }

    /// Concurrency-over-time series of a run
    pub fn concurrency_analysis_path(&self, stamp: &str) -> PathBuf {
        self.metrics_dir()
            .join(format!("{stamp}-concurrency_analysis.json"))
    }

    /// Raw submission timeline of a run
    pub fn timeline_path(&self, stamp: &str) -> PathBuf {
        self.metrics_dir().join(format!("{stamp}-timeline.json"))
    }

    /// Most recently modified snapshot in the JSON directory
    pub async fn latest_snapshot(&self) -> Result<Option<PathBuf>> {
        let dir = self.json_dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut latest: Option<(std::time::SystemTime, PathBuf)> = None;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_snapshot = path.extension().is_some_and(|ext| ext == "json")
                && path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .is_some_and(|s| !s.ends_with(MANIFEST_SUFFIX));
            if !is_snapshot {
                continue;
            }
            let modified = entry.metadata().await?.modified()?;
            if latest.as_ref().is_none_or(|(t, _)| modified > *t) {
                latest = Some((modified, path));
            }
        }
        Ok(latest.map(|(_, path)| path))
    }
}

/// Stamp for a run started at `at`
pub fn run_stamp(at: DateTime<Local>) -> String {
    at.format(STAMP_FORMAT).to_string()
}

/// Stamp of an existing snapshot file: its file stem
pub fn stamp_of(path: &Path) -> Result<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .ok_or_else(|| Error::Other(format!("not a snapshot file: {}", path.display())))
}

#[derive(Serialize)]
struct SnapshotOut<'a> {
    created_at: DateTime<Utc>,
    posts: Vec<&'a Post>,
}

#[derive(Deserialize)]
struct SnapshotIn {
    created_at: DateTime<Utc>,
    #[serde(default)]
    posts: Vec<Post>,
}

/// Persist a snapshot as `{created_at, posts}` with posts sorted by id
pub async fn save_snapshot(path: &Path, snapshot: &Snapshot) -> Result<()> {
    let out = SnapshotOut {
        created_at: snapshot.created_at(),
        posts: snapshot.posts().collect(),
    };
    write_json(path, &out).await
}

/// Load a persisted snapshot
pub async fn load_snapshot(path: &Path) -> Result<Snapshot> {
    let content = tokio::fs::read(path).await?;
    let parsed: SnapshotIn = serde_json::from_slice(&content)?;
    Ok(Snapshot::from_posts(parsed.created_at, parsed.posts))
}

/// Serialize `value` as pretty JSON and write it atomically
pub async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    write_atomically(path, &bytes).await?;
    Ok(())
}

/// Write to a sibling `.part` file, then rename into place
pub async fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".part");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}
