//! Request rate limiting using a token bucket
//!
//! The [`TokenBucket`] throttles request *submission* across every fetch task of a
//! run. It is independent of the worker pool's parallelism cap; whichever
//! constraint is tighter at a given instant dominates throughput.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::config::RateLimitConfig;
use crate::error::{Error, FetchError, Result};
use crate::metrics::MetricsRecorder;

/// Tokens are tracked in thousandths so fractional refill rates accumulate
const MILLI: u64 = 1_000;

/// Shortest and longest sleep while waiting for a refill
const MIN_WAIT: Duration = Duration::from_millis(10);
const MAX_WAIT: Duration = Duration::from_millis(100);

/// Request token bucket shared by all fetch tasks of one run
///
/// # Algorithm
///
/// - The bucket holds at most `burst` tokens and starts full
/// - Tokens refill continuously at `rate` tokens per second, computed from the
///   wall-clock time elapsed since the last refill
/// - Every request submission consumes exactly one token
/// - If no token is available the caller sleeps until the next refill
///
/// # Implementation
///
/// Lock-free: token count (in milli-tokens) and last refill timestamp are
/// atomics updated with compare-and-swap. There is no fairness guarantee, the
/// first caller to observe a token wins it, but every waiter re-polls at least
/// every 100ms so no caller starves while the rate is positive.
#[derive(Clone)]
pub struct TokenBucket {
    inner: Arc<BucketState>,
}

struct BucketState {
    /// Refill rate in milli-tokens per second
    rate_millis: f64,
    /// Capacity in milli-tokens
    capacity: u64,
    /// Available milli-tokens
    tokens: AtomicU64,
    /// Last refill, nanoseconds since `epoch`
    last_refill: AtomicU64,
    /// Clock origin for this bucket
    epoch: Instant,
}

impl TokenBucket {
    /// Create a bucket refilling at `rate` tokens/second holding at most `burst` tokens
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the rate is not a positive finite number or
    /// the burst is zero; a misconfigured limiter is a systemic error.
    pub fn new(rate: f64, burst: u32) -> Result<Self> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(Error::config(
                "rate.max_submitted_requests_per_second",
                format!("token bucket rate must be positive, got {rate}"),
            ));
        }
        if burst == 0 {
            return Err(Error::config("rate.burst", "token bucket burst must be >= 1"));
        }

        let capacity = u64::from(burst) * MILLI;
        Ok(Self {
            inner: Arc::new(BucketState {
                rate_millis: rate * MILLI as f64,
                capacity,
                tokens: AtomicU64::new(capacity),
                last_refill: AtomicU64::new(0),
                epoch: Instant::now(),
            }),
        })
    }

    /// Build a bucket from the run configuration
    pub fn from_config(config: &RateLimitConfig) -> Result<Self> {
        Self::new(config.max_submitted_requests_per_second, config.burst)
    }

    /// Refill rate in tokens per second
    pub fn rate(&self) -> f64 {
        self.inner.rate_millis / MILLI as f64
    }

    /// Bucket capacity in whole tokens
    pub fn burst(&self) -> u32 {
        (self.inner.capacity / MILLI) as u32
    }

    /// Tokens currently available (after refilling), possibly fractional
    pub fn available(&self) -> f64 {
        self.refill();
        self.inner.tokens.load(Ordering::SeqCst) as f64 / MILLI as f64
    }

    /// Wait until one token is available and consume it
    ///
    /// Not cancellation-aware by itself; callers that must observe a run-wide
    /// cancellation race this future against the token in `tokio::select!`.
    pub async fn acquire(&self) {
        loop {
            if self.try_acquire() {
                return;
            }

            // Sleep roughly until one whole token has accumulated
            let current = self.inner.tokens.load(Ordering::SeqCst);
            let missing = MILLI.saturating_sub(current);
            let wait = Duration::from_secs_f64(missing as f64 / self.inner.rate_millis);
            tokio::time::sleep(wait.clamp(MIN_WAIT, MAX_WAIT)).await;
        }
    }

    /// Consume one token if one is available right now
    pub fn try_acquire(&self) -> bool {
        self.refill();
        let tokens = &self.inner.tokens;
        loop {
            let current = tokens.load(Ordering::SeqCst);
            if current < MILLI {
                return false;
            }
            if tokens
                .compare_exchange(current, current - MILLI, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
            // CAS lost to another caller; re-read and retry
        }
    }

    /// Refill tokens based on elapsed time since last refill
    fn refill(&self) {
        let state = &self.inner;
        let now = state.epoch.elapsed().as_nanos() as u64;
        let last = state.last_refill.load(Ordering::SeqCst);

        let elapsed_secs = now.saturating_sub(last) as f64 / 1_000_000_000.0;
        let to_add = (state.rate_millis * elapsed_secs) as u64;
        if to_add == 0 {
            return;
        }

        if state.tokens.load(Ordering::SeqCst) >= state.capacity {
            // Time spent with a full bucket earns nothing
            let _ = state
                .last_refill
                .compare_exchange(last, now, Ordering::SeqCst, Ordering::SeqCst);
            return;
        }

        // Advance the clock only by the time the added tokens account for,
        // so fractional progress carries over to the next refill
        let spent = ((to_add as f64 / state.rate_millis) * 1_000_000_000.0).ceil() as u64;
        let new_last = last.saturating_add(spent).min(now);
        if state
            .last_refill
            .compare_exchange(last, new_last, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let capacity = state.capacity;
            let _ = state
                .tokens
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| {
                    Some(t.saturating_add(to_add).min(capacity))
                });
        }
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("rate", &self.rate())
            .field("burst", &self.burst())
            .field(
                "tokens",
                &(self.inner.tokens.load(Ordering::Relaxed) as f64 / MILLI as f64),
            )
            .finish()
    }
}

/// Submission gate: the shared bucket plus the telemetry it feeds
///
/// Every outgoing request of a run (post bodies, comment pages, followed-list
/// pages, image downloads) passes through [`Throttle::submit`].
#[derive(Clone, Debug)]
pub struct Throttle {
    bucket: TokenBucket,
    metrics: Arc<MetricsRecorder>,
}

impl Throttle {
    /// Combine a bucket with the run's recorder
    pub fn new(bucket: TokenBucket, metrics: Arc<MetricsRecorder>) -> Self {
        Self { bucket, metrics }
    }

    /// The run's recorder
    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    /// Wait for a token and record the submission
    ///
    /// Returns [`FetchError::Cancelled`] without consuming a token if the run
    /// is cancelled while waiting.
    pub async fn submit(&self, cancel: &CancellationToken) -> std::result::Result<(), FetchError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(FetchError::Cancelled),
            () = self.bucket.acquire() => {
                self.metrics.record_submitted();
                Ok(())
            }
        }
    }
}
