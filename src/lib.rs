//! # resolveq
//!
//! In-process admission-and-resolution engine.
//!
//! Work items are admitted to an [`Engine`], held in a FIFO queue, and
//! resolved under a concurrency ceiling. Outcomes come back as immutable
//! [`ResultEnvelope`]s through a hybrid callback/future [`emitter`], and
//! the engine keeps running success/error metrics. Engines can be chained
//! so one engine's results become another's work.

pub mod config;
pub mod emitter;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod event;
pub mod model;
pub mod pipe;
pub mod resolvee;
pub mod telemetry;

pub use config::{EngineConfig, Mode};
pub use engine::{Action, Engine, Metadata, Phase};
pub use envelope::{ResultEnvelope, WorkError};
pub use error::{Error, Result};
pub use event::{Event, Notice};
pub use resolvee::{Resolvee, Ticket, WorkItem};

/// Crate version, fixed at build time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
