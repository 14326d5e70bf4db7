//! Metric instrument factories for resolveq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created from the `"resolveq"` meter; without a
//! provider they are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for resolveq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("resolveq")
}

/// Counter: items admitted to an engine.
/// Labels: `engine`, `kind`.
pub fn admissions() -> Counter<u64> {
    meter()
        .u64_counter("resolveq.admissions")
        .with_description("Number of work items admitted")
        .build()
}

/// Counter: completed resolutions.
/// Labels: `engine`, `outcome` ("success" | "error").
pub fn resolutions() -> Counter<u64> {
    meter()
        .u64_counter("resolveq.resolutions")
        .with_description("Number of completed resolutions")
        .build()
}

/// Histogram: time from start of resolution to completion, in milliseconds.
/// Labels: `engine`, `outcome`.
pub fn resolution_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("resolveq.resolution.duration_ms")
        .with_description("Resolution duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Histogram: time from admission to completion, in milliseconds.
/// Labels: `engine`, `outcome`.
pub fn queue_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("resolveq.queue.duration_ms")
        .with_description("Time in queue until completion, in milliseconds")
        .with_unit("ms")
        .build()
}
