//! Image materialization
//!
//! [`ImageStore::ensure_local`] turns an [`ImageRef`] into a file under the
//! image directory. Identity comes from the owning post or comment, not from
//! content: the first caller for an asset id downloads it, concurrent callers
//! for the same id wait on that claim and reuse its outcome, and an existing
//! file on disk is never fetched again.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::client::ApiClient;
use crate::config::RetryConfig;
use crate::error::ImageError;
use crate::rate_limiter::Throttle;
use crate::retry::fetch_with_retry;
use crate::storage::write_atomically;
use crate::types::{AssetId, ImageRef};

/// Extension used when the source carries none
const FALLBACK_EXTENSION: &str = "bin";

/// A materialized image on disk
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageAsset {
    /// Asset identity
    pub id: AssetId,
    /// File extension, without the dot
    pub extension: String,
    /// Absolute or data-dir relative location of the file
    pub local_path: PathBuf,
}

/// Result of [`ImageStore::ensure_local`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImageOutcome {
    /// The image is on disk
    Available(ImageAsset),
    /// The download failed; rendered as a placeholder
    Unavailable,
}

impl ImageOutcome {
    /// Local path, if the image is available
    pub fn local_path(&self) -> Option<&Path> {
        match self {
            ImageOutcome::Available(asset) => Some(&asset.local_path),
            ImageOutcome::Unavailable => None,
        }
    }
}

type Claim = Arc<OnceCell<ImageOutcome>>;

/// Per-run image materializer with per-id de-duplication
pub struct ImageStore {
    dir: PathBuf,
    client: Arc<dyn ApiClient>,
    throttle: Throttle,
    retry: RetryConfig,
    cancel: CancellationToken,
    claims: Mutex<HashMap<AssetId, Claim>>,
}

impl ImageStore {
    /// Create a store writing into `dir`
    pub fn new(
        dir: impl Into<PathBuf>,
        client: Arc<dyn ApiClient>,
        throttle: Throttle,
        retry: RetryConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            dir: dir.into(),
            client,
            throttle,
            retry,
            cancel,
            claims: Mutex::new(HashMap::new()),
        }
    }

    /// Directory holding the assets
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where the asset for `image` lives (whether or not it exists yet)
    pub fn path_for(&self, image: &ImageRef) -> PathBuf {
        self.dir.join(file_name(image))
    }

    /// Make sure the image exists locally
    ///
    /// Never fails: download or write errors are logged and reported as
    /// [`ImageOutcome::Unavailable`].
    pub async fn ensure_local(&self, image: &ImageRef) -> ImageOutcome {
        let claim = {
            let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
            claims.entry(image.asset.clone()).or_default().clone()
        };

        claim
            .get_or_init(|| async {
                match self.materialize(image).await {
                    Ok(asset) => ImageOutcome::Available(asset),
                    Err(e) => {
                        tracing::warn!(asset = %image.asset, error = %e, "Image unavailable");
                        ImageOutcome::Unavailable
                    }
                }
            })
            .await
            .clone()
    }

    async fn materialize(&self, image: &ImageRef) -> Result<ImageAsset, ImageError> {
        let path = self.path_for(image);
        let asset = ImageAsset {
            id: image.asset.clone(),
            extension: image.extension.clone(),
            local_path: path.clone(),
        };

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tracing::debug!(asset = %image.asset, "Image already on disk");
            return Ok(asset);
        }

        let url = image.url.as_str();
        let bytes = fetch_with_retry(&self.retry, &self.cancel, || async move {
            self.throttle.submit(&self.cancel).await?;
            self.client.download(url).await
        })
        .await
        .map_err(|source| ImageError::Download {
            url: image.url.clone(),
            source,
        })?;

        write_atomically(&path, &bytes)
            .await
            .map_err(|source| ImageError::Write {
                path: path.clone(),
                source,
            })?;

        tracing::debug!(asset = %image.asset, bytes = bytes.len(), "Image stored");
        Ok(asset)
    }
}

impl std::fmt::Debug for ImageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageStore")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

/// `<asset id>.<extension>`
pub fn file_name(image: &ImageRef) -> String {
    format!("{}.{}", image.asset, image.extension)
}

/// Build an image reference, taking the extension from `file_name` when the
/// download URL does not carry one
pub fn image_ref(url: &str, file_name: Option<&str>, asset: AssetId) -> ImageRef {
    let extension = file_name
        .and_then(extension_of)
        .or_else(|| extension_of(url))
        .unwrap_or_else(|| FALLBACK_EXTENSION.to_string());
    ImageRef {
        url: url.to_string(),
        asset,
        extension,
    }
}

/// Lower-cased extension of the last path segment, ignoring query and fragment
pub fn extension_of(source: &str) -> Option<String> {
    let path = source.split(['?', '#']).next().unwrap_or(source);
    let segment = path.rsplit('/').next().unwrap_or(path);
    let (stem, ext) = segment.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || ext.len() > 5 {
        return None;
    }
    if !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{CommentPage, FollowedPage, PageCursor, PostBody};
    use crate::error::FetchError;
    use crate::metrics::MetricsRecorder;
    use crate::rate_limiter::TokenBucket;
    use crate::types::{CommentId, PostId};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Serves image bytes slowly and counts downloads
    struct SlowImages {
        downloads: AtomicUsize,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl ApiClient for SlowImages {
        async fn fetch_post(&self, id: PostId) -> Result<PostBody, FetchError> {
            Err(FetchError::NotFound(id))
        }

        async fn fetch_comments(
            &self,
            _id: PostId,
            _cursor: Option<PageCursor>,
        ) -> Result<CommentPage, FetchError> {
            Ok(CommentPage::default())
        }

        async fn fetch_followed_list(
            &self,
            _cursor: Option<PageCursor>,
        ) -> Result<FollowedPage, FetchError> {
            Ok(FollowedPage::default())
        }

        async fn download(&self, _url: &str) -> Result<Vec<u8>, FetchError> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.fail {
                Err(FetchError::Permanent("404".into()))
            } else {
                Ok(b"\x89PNG".to_vec())
            }
        }
    }

    fn store(dir: &Path, client: Arc<SlowImages>) -> ImageStore {
        let throttle = Throttle::new(
            TokenBucket::new(1000.0, 100).unwrap(),
            Arc::new(MetricsRecorder::new()),
        );
        ImageStore::new(
            dir,
            client,
            throttle,
            RetryConfig::default(),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of("https://x/y/abc.JPEG").as_deref(), Some("jpeg"));
        assert_eq!(extension_of("abc.png?x=1#f").as_deref(), Some("png"));
        assert_eq!(extension_of("https://x/api/pku_image/100"), None);
        assert_eq!(extension_of(".hidden"), None);
        assert_eq!(extension_of("a.b/c"), None);
    }

    #[test]
    fn test_image_ref_prefers_file_name() {
        let r = image_ref(
            "https://x/api/pku_image/100",
            Some("f.gif"),
            AssetId::for_post(PostId(100)),
        );
        assert_eq!(r.extension, "gif");
        assert_eq!(file_name(&r), "0000100.gif");

        let r = image_ref("https://x/raw", None, AssetId::for_post(PostId(1)));
        assert_eq!(r.extension, "bin");
    }

    #[tokio::test]
    async fn test_concurrent_calls_download_once() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(SlowImages {
            downloads: AtomicUsize::new(0),
            fail: false,
        });
        let store = Arc::new(store(dir.path(), client.clone()));
        let image = image_ref("https://x/a.png", None, AssetId::for_post(PostId(7)));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            let image = image.clone();
            handles.push(tokio::spawn(async move { store.ensure_local(&image).await }));
        }
        for handle in handles {
            let outcome = handle.await.unwrap();
            assert_eq!(
                outcome.local_path().unwrap(),
                dir.path().join("0000007.png")
            );
        }

        assert_eq!(client.downloads.load(Ordering::SeqCst), 1);
        assert_eq!(
            std::fs::read(dir.path().join("0000007.png")).unwrap(),
            b"\x89PNG"
        );
    }

    #[tokio::test]
    async fn test_existing_file_is_not_downloaded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("0000009-3.jpg"), b"old").unwrap();
        let client = Arc::new(SlowImages {
            downloads: AtomicUsize::new(0),
            fail: false,
        });
        let store = store(dir.path(), client.clone());
        let image = image_ref(
            "https://x/b.jpg",
            None,
            AssetId::for_comment(PostId(9), CommentId(3)),
        );

        assert!(matches!(
            store.ensure_local(&image).await,
            ImageOutcome::Available(_)
        ));
        assert_eq!(client.downloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_download_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(SlowImages {
            downloads: AtomicUsize::new(0),
            fail: true,
        });
        let store = store(dir.path(), client.clone());
        let image = image_ref("https://x/c.png", None, AssetId::for_post(PostId(3)));

        assert_eq!(store.ensure_local(&image).await, ImageOutcome::Unavailable);
        assert_eq!(store.ensure_local(&image).await, ImageOutcome::Unavailable);
        assert_eq!(client.downloads.load(Ordering::SeqCst), 1, "outcome is reused");
        assert!(!dir.path().join("0000003.png").exists());
    }
}
