//! Configuration types for treehole-dl
//!
//! One [`Config`] is built per run and handed to the [`Collector`](crate::Collector)
//! constructor; nothing here is process-global.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Request submission rate limiting (token bucket)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Average request submissions per second (default: 20)
    #[serde(default = "default_requests_per_second")]
    pub max_submitted_requests_per_second: f64,

    /// Bucket capacity; requests that may be submitted back to back (default: 1)
    #[serde(default = "default_burst")]
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_submitted_requests_per_second: default_requests_per_second(),
            burst: default_burst(),
        }
    }
}

/// Retry behavior configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first try (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 500ms)
    #[serde(default = "default_initial_delay", with = "duration_ms_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 10 seconds)
    #[serde(default = "default_max_delay", with = "duration_ms_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Treehole API access
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiConfig {
    /// API root (default: "https://treehole.pku.edu.cn/")
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Bearer token of an already established session
    #[serde(default, skip_serializing)]
    pub token: Option<String>,

    /// Comments requested per page (default: 15)
    #[serde(default = "default_comment_page_size")]
    pub comment_page_size: u32,

    /// Followed posts requested per page (default: 25)
    #[serde(default = "default_followed_page_size")]
    pub followed_page_size: u32,

    /// Per-request timeout (default: 30 seconds)
    #[serde(default = "default_timeout", with = "duration_serde")]
    pub timeout: Duration,

    /// User agent sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            token: None,
            comment_page_size: default_comment_page_size(),
            followed_page_size: default_followed_page_size(),
            timeout: default_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

/// Output tree location
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Root of the data directory (default: "./data")
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Main configuration for a collection run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Submission rate limiting
    #[serde(default)]
    pub rate: RateLimitConfig,

    /// Maximum concurrently executing fetch tasks (default: 10)
    #[serde(default = "default_max_parallel")]
    pub max_parallel_requests: usize,

    /// Retry policy for transient failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// API access
    #[serde(default)]
    pub api: ApiConfig,

    /// Output tree
    #[serde(default)]
    pub output: OutputConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rate: RateLimitConfig::default(),
            max_parallel_requests: default_max_parallel(),
            retry: RetryConfig::default(),
            api: ApiConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(
                "config_file",
                format!("failed to read '{}': {}", path.display(), e),
            )
        })?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Check that the configuration describes a runnable pipeline
    pub fn validate(&self) -> Result<()> {
        let rate = self.rate.max_submitted_requests_per_second;
        if !rate.is_finite() || rate <= 0.0 {
            return Err(Error::config(
                "rate.max_submitted_requests_per_second",
                format!("rate must be a positive number, got {rate}"),
            ));
        }
        if self.rate.burst == 0 {
            return Err(Error::config("rate.burst", "burst must be at least 1"));
        }
        if self.max_parallel_requests == 0 {
            return Err(Error::config(
                "max_parallel_requests",
                "at least one parallel request is required",
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(Error::config(
                "retry.backoff_multiplier",
                "backoff multiplier must be >= 1.0",
            ));
        }
        if self.api.comment_page_size == 0 || self.api.followed_page_size == 0 {
            return Err(Error::config("api", "page sizes must be at least 1"));
        }
        url::Url::parse(&self.api.base_url)
            .map_err(|e| Error::config("api.base_url", format!("invalid base URL: {e}")))?;
        Ok(())
    }
}

fn default_requests_per_second() -> f64 {
    20.0
}

fn default_burst() -> u32 {
    1
}

fn default_max_parallel() -> usize {
    10
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_base_url() -> String {
    "https://treehole.pku.edu.cn/".to_string()
}

fn default_comment_page_size() -> u32 {
    15
}

fn default_followed_page_size() -> u32 {
    25
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_user_agent() -> String {
    concat!("treehole-dl/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Backoff delays are sub-second, so they travel as milliseconds
mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
