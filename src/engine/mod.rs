//! Engine: admission queue, gates, refresh loop, and metrics.

pub mod control;
pub mod gate;
pub mod metrics;
mod queue;

pub use control::Engine;
pub use gate::{Action, ConditionalId, Phase};
pub use metrics::{BucketMetrics, LatencyStats, Metadata, Metrics};
