//! Error types for resolveq.
//!
//! Classification and protocol errors are returned from the call that
//! triggered them. Failures produced by the wrapped work never show up
//! here as a returned error: they travel inside a
//! [`ResultEnvelope`](crate::envelope::ResultEnvelope) as a
//! [`WorkError`](crate::envelope::WorkError).

use thiserror::Error;

use crate::envelope::WorkError;
use crate::model::ResolveeKind;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not a valid resolvee type: {0}")]
    InvalidResolveeType(String),

    #[error("cannot resolve a non-multi-use resolvee ({kind}) more than once")]
    NotMultiUse { kind: ResolveeKind },

    #[error("work item failed: {0}")]
    WorkItem(#[from] WorkError),

    #[error("incompatible subscription source: {0}")]
    IncompatibleSubscriptionSource(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("no tokio runtime available: {0}")]
    Runtime(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
