//! Submission telemetry
//!
//! [`MetricsRecorder`] appends one [`SubmissionEvent`] for every acquired
//! rate-limit token and every finished fetch task. Nothing is aggregated on the
//! hot path; [`RateAnalysis`] and [`ConcurrencyAnalysis`] summarise the timeline
//! after the run.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::types::{SubmissionEvent, SubmissionKind};

/// Append-only recorder shared by every fetch task of a run
#[derive(Debug)]
pub struct MetricsRecorder {
    epoch: Instant,
    in_flight: AtomicUsize,
    events: Mutex<Vec<SubmissionEvent>>,
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRecorder {
    /// Create a recorder whose offsets are measured from now
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            in_flight: AtomicUsize::new(0),
            events: Mutex::new(Vec::new()),
        }
    }

    /// A fetch task took a pool slot
    pub fn task_started(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    /// A rate-limit token was acquired and a request is about to be submitted
    pub fn record_submitted(&self) {
        let in_flight = self.in_flight.load(Ordering::SeqCst);
        self.push(SubmissionKind::Submitted, in_flight);
    }

    /// A fetch task finished, successfully or not
    pub fn record_completed(&self) {
        let previous = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_sub(1))
            })
            .unwrap_or_else(|n| n);
        self.push(SubmissionKind::Completed, previous.saturating_sub(1));
    }

    /// Fetch tasks currently in flight
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Copy of the timeline in recording order
    pub fn timeline(&self) -> Vec<SubmissionEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn push(&self, kind: SubmissionKind, in_flight: usize) {
        let event = SubmissionEvent {
            offset_ms: self.epoch.elapsed().as_millis() as u64,
            kind,
            in_flight,
        };
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// Requests per one-second window
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateBucket {
    /// Window start, whole seconds since the run began
    pub second: u64,
    /// Requests submitted in the window
    pub submitted: usize,
    /// Fetch tasks completed in the window
    pub completed: usize,
}

/// Rate-over-time series
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RateAnalysis {
    /// Total submitted requests
    pub total_submitted: usize,
    /// Total completed fetch tasks
    pub total_completed: usize,
    /// Offset of the last event in milliseconds
    pub duration_ms: u64,
    /// Mean submissions per second over the run
    pub average_per_second: f64,
    /// Busiest one-second window
    pub peak_per_second: usize,
    /// Per-second windows, gap-free from zero
    pub buckets: Vec<RateBucket>,
}

impl RateAnalysis {
    /// Summarise a timeline into per-second windows
    #[allow(clippy::cast_precision_loss)]
    pub fn from_events(events: &[SubmissionEvent]) -> Self {
        let Some(last) = events.iter().map(|e| e.offset_ms).max() else {
            return Self::default();
        };

        let mut buckets: Vec<RateBucket> = (0..=last / 1000)
            .map(|second| RateBucket {
                second,
                ..Default::default()
            })
            .collect();
        for event in events {
            let bucket = &mut buckets[(event.offset_ms / 1000) as usize];
            match event.kind {
                SubmissionKind::Submitted => bucket.submitted += 1,
                SubmissionKind::Completed => bucket.completed += 1,
            }
        }

        let total_submitted = buckets.iter().map(|b| b.submitted).sum();
        let total_completed = buckets.iter().map(|b| b.completed).sum();
        let seconds = (last as f64 / 1000.0).max(1.0);

        Self {
            total_submitted,
            total_completed,
            duration_ms: last,
            average_per_second: total_submitted as f64 / seconds,
            peak_per_second: buckets.iter().map(|b| b.submitted).max().unwrap_or(0),
            buckets,
        }
    }
}

/// One sample of the in-flight task count
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencySample {
    /// Milliseconds since the run began
    pub offset_ms: u64,
    /// Fetch tasks in flight
    pub in_flight: usize,
}

/// Concurrency-over-time series
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencyAnalysis {
    /// Highest observed in-flight count
    pub max_in_flight: usize,
    /// Mean in-flight count across samples
    pub mean_in_flight: f64,
    /// One sample per recorded event
    pub series: Vec<ConcurrencySample>,
}

impl ConcurrencyAnalysis {
    /// Summarise a timeline into an in-flight series
    #[allow(clippy::cast_precision_loss)]
    pub fn from_events(events: &[SubmissionEvent]) -> Self {
        if events.is_empty() {
            return Self::default();
        }

        let mut series: Vec<ConcurrencySample> = events
            .iter()
            .map(|e| ConcurrencySample {
                offset_ms: e.offset_ms,
                in_flight: e.in_flight,
            })
            .collect();
        series.sort_by_key(|s| s.offset_ms);

        let total: usize = series.iter().map(|s| s.in_flight).sum();
        Self {
            max_in_flight: series.iter().map(|s| s.in_flight).max().unwrap_or(0),
            mean_in_flight: total as f64 / series.len() as f64,
            series,
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn event(offset_ms: u64, kind: SubmissionKind, in_flight: usize) -> SubmissionEvent {
        SubmissionEvent {
            offset_ms,
            kind,
            in_flight,
        }
    }

    #[test]
    fn test_recorder_tracks_in_flight() {
        let recorder = MetricsRecorder::new();
        recorder.task_started();
        recorder.task_started();
        recorder.record_submitted();
        recorder.record_completed();
        recorder.record_submitted();
        recorder.record_completed();

        let timeline = recorder.timeline();
        let in_flight: Vec<_> = timeline.iter().map(|e| e.in_flight).collect();
        assert_eq!(in_flight, vec![2, 1, 1, 0]);
        assert_eq!(recorder.in_flight(), 0);
    }

    #[test]
    fn test_completion_never_underflows() {
        let recorder = MetricsRecorder::new();
        recorder.record_completed();
        assert_eq!(recorder.in_flight(), 0);
        assert_eq!(recorder.timeline()[0].in_flight, 0);
    }

    #[test]
    fn test_rate_analysis_buckets() {
        let events = vec![
            event(0, SubmissionKind::Submitted, 1),
            event(400, SubmissionKind::Submitted, 2),
            event(900, SubmissionKind::Completed, 1),
            event(2100, SubmissionKind::Submitted, 1),
        ];
        let analysis = RateAnalysis::from_events(&events);
        assert_eq!(analysis.buckets.len(), 3);
        assert_eq!(analysis.buckets[0].submitted, 2);
        assert_eq!(analysis.buckets[0].completed, 1);
        assert_eq!(analysis.buckets[1].submitted, 0, "gaps are filled");
        assert_eq!(analysis.buckets[2].submitted, 1);
        assert_eq!(analysis.total_submitted, 3);
        assert_eq!(analysis.peak_per_second, 2);
        assert_eq!(analysis.duration_ms, 2100);
    }

    #[test]
    fn test_concurrency_analysis() {
        let events = vec![
            event(10, SubmissionKind::Submitted, 1),
            event(5, SubmissionKind::Submitted, 3),
            event(20, SubmissionKind::Completed, 2),
        ];
        let analysis = ConcurrencyAnalysis::from_events(&events);
        assert_eq!(analysis.max_in_flight, 3);
        assert_eq!(analysis.series[0].offset_ms, 5);
        assert!((analysis.mean_in_flight - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_timeline() {
        assert_eq!(RateAnalysis::from_events(&[]), RateAnalysis::default());
        assert_eq!(
            ConcurrencyAnalysis::from_events(&[]).max_in_flight,
            0
        );
    }
}
