//! Running metrics, bucketed by outcome.
//!
//! Averages are updated incrementally (`avg' = (avg·n + x) / (n + 1)`), so
//! no samples are retained. Rates are outcome counts per second of engine
//! age and are recomputed whenever a snapshot is taken.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::Mode;
use crate::envelope::ResultEnvelope;

/// Incremental average, min, and max of one latency, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencyStats {
    pub samples: u64,
    pub avg_ms: f64,
    /// `+inf` until the first sample.
    pub min_ms: f64,
    pub max_ms: f64,
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self {
            samples: 0,
            avg_ms: 0.0,
            min_ms: f64::INFINITY,
            max_ms: 0.0,
        }
    }
}

impl LatencyStats {
    pub fn record(&mut self, sample: Duration) {
        let x = sample.as_secs_f64() * 1000.0;
        let n = self.samples as f64;
        self.avg_ms = (self.avg_ms * n + x) / (n + 1.0);
        self.min_ms = self.min_ms.min(x);
        self.max_ms = self.max_ms.max(x);
        self.samples += 1;
    }
}

/// Metrics for one outcome (success or error).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BucketMetrics {
    pub count: u64,
    /// Outcomes per second of engine age.
    pub rate: f64,
    pub time_resolving: LatencyStats,
    pub time_in_queue: LatencyStats,
}

impl BucketMetrics {
    fn update_rate(&mut self, age: Duration) {
        let secs = age.as_secs_f64();
        self.rate = if secs > 0.0 { self.count as f64 / secs } else { 0.0 };
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Metrics {
    pub success: BucketMetrics,
    pub error: BucketMetrics,
}

impl Metrics {
    pub(crate) fn record<T>(&mut self, envelope: &ResultEnvelope<T>, age: Duration) {
        let bucket = if envelope.is_ok() {
            &mut self.success
        } else {
            &mut self.error
        };
        bucket.count += 1;
        bucket.time_resolving.record(envelope.time_resolving());
        bucket.time_in_queue.record(envelope.time_in_queue());
        self.update_rates(age);
    }

    pub(crate) fn update_rates(&mut self, age: Duration) {
        self.success.update_rate(age);
        self.error.update_rate(age);
    }

    pub fn resolved(&self) -> u64 {
        self.success.count + self.error.count
    }
}

/// Point-in-time view of an engine.
#[derive(Debug, Clone, Serialize)]
pub struct Metadata {
    pub name: String,
    pub mode: Mode,
    pub concurrency: usize,
    /// Whole-engine pause, from [`Engine::pause`](super::Engine::pause).
    pub paused: bool,
    /// Effective pause of each phase, including the whole-engine pause.
    pub pull_paused: bool,
    pub resolve_paused: bool,
    /// Whether a pull source is installed.
    pub pulling: bool,
    pub completed: bool,
    /// Items waiting in the admission queue.
    pub queued: usize,
    pub in_flight: usize,
    /// Items ever admitted.
    pub total_queued: u64,
    /// Results buffered for the next resolutions to consume.
    pub buffered_results: usize,
    pub pending_demand: usize,
    pub created_at: DateTime<Utc>,
    pub age_ms: u64,
    pub metrics: Metrics,
}
