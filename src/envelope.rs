//! Result envelopes: the immutable outcome of one resolution.
//!
//! An envelope holds exactly one of a value or a [`WorkError`], plus the
//! timing recorded by the resolvee that produced it. Envelopes are shared,
//! never copied: cloning one hands out another reference to the same
//! outcome, and [`ResultEnvelope::ptr_eq`] tells two references apart from
//! two equal outcomes.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// A failure produced by wrapped work.
///
/// Carried as data inside an envelope. Cheap to clone so the same failure
/// can be delivered to every subscriber.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct WorkError(Arc<anyhow::Error>);

impl WorkError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }

    /// Build a work error from a plain message.
    pub fn msg(message: impl std::fmt::Display + std::fmt::Debug + Send + Sync + 'static) -> Self {
        Self(Arc::new(anyhow::Error::msg(message)))
    }

    /// The underlying error.
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

/// Timing stamped on an envelope when it is built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Timing {
    /// From the start of resolution to its completion.
    pub time_resolving: Duration,
    /// From admission (or the previous resolution, for multi-use items) to
    /// completion.
    pub time_in_queue: Duration,
}

/// What a resolution settled with, before it is wrapped.
#[derive(Debug)]
pub enum Settlement<T> {
    Value(T),
    Error(WorkError),
    /// Already wrapped. Passed through unchanged.
    Envelope(ResultEnvelope<T>),
}

impl<T> From<anyhow::Result<T>> for Settlement<T> {
    fn from(result: anyhow::Result<T>) -> Self {
        match result {
            Ok(value) => Settlement::Value(value),
            Err(err) => Settlement::Error(WorkError::new(err)),
        }
    }
}

struct EnvelopeInner<T> {
    outcome: Result<T, WorkError>,
    timing: Timing,
}

/// Immutable success/error result with timing metadata.
pub struct ResultEnvelope<T> {
    inner: Arc<EnvelopeInner<T>>,
}

impl<T> ResultEnvelope<T> {
    /// Wrap a settlement.
    ///
    /// An input that is already an envelope is returned as-is, so results
    /// flowing through chained engines are never wrapped twice.
    pub fn settle(settlement: Settlement<T>, timing: Timing) -> Self {
        let outcome = match settlement {
            Settlement::Envelope(envelope) => return envelope,
            Settlement::Value(value) => Ok(value),
            Settlement::Error(err) => Err(err),
        };
        Self {
            inner: Arc::new(EnvelopeInner { outcome, timing }),
        }
    }

    pub fn success(value: T, timing: Timing) -> Self {
        Self::settle(Settlement::Value(value), timing)
    }

    pub fn failure(error: WorkError, timing: Timing) -> Self {
        Self::settle(Settlement::Error(error), timing)
    }

    pub fn value(&self) -> Option<&T> {
        self.inner.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&WorkError> {
        self.inner.outcome.as_ref().err()
    }

    pub fn outcome(&self) -> Result<&T, &WorkError> {
        self.inner.outcome.as_ref()
    }

    pub fn is_ok(&self) -> bool {
        self.inner.outcome.is_ok()
    }

    pub fn is_err(&self) -> bool {
        self.inner.outcome.is_err()
    }

    pub fn timing(&self) -> Timing {
        self.inner.timing
    }

    pub fn time_resolving(&self) -> Duration {
        self.inner.timing.time_resolving
    }

    pub fn time_in_queue(&self) -> Duration {
        self.inner.timing.time_in_queue
    }

    /// Whether both references point at the same envelope instance.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Split into the error-first shape used for delivery: `Ok` for a
    /// success, `Err` for a failure. Both sides carry the envelope.
    pub fn into_delivery(self) -> Result<Self, Self> {
        if self.is_ok() { Ok(self) } else { Err(self) }
    }
}

impl<T: Clone> ResultEnvelope<T> {
    /// The outcome as a crate result, with a failure as [`Error::WorkItem`].
    ///
    /// [`Error::WorkItem`]: crate::error::Error::WorkItem
    pub fn into_result(self) -> crate::error::Result<T> {
        match &self.inner.outcome {
            Ok(value) => Ok(value.clone()),
            Err(err) => Err(err.clone().into()),
        }
    }
}

impl<T> Clone for ResultEnvelope<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for ResultEnvelope<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultEnvelope")
            .field("outcome", &self.inner.outcome)
            .field("time_resolving", &self.inner.timing.time_resolving)
            .field("time_in_queue", &self.inner.timing.time_in_queue)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing(ms: u64) -> Timing {
        Timing {
            time_resolving: Duration::from_millis(ms),
            time_in_queue: Duration::from_millis(ms * 2),
        }
    }

    #[test]
    fn success_holds_only_a_value() {
        let env = ResultEnvelope::success(7, timing(3));
        assert_eq!(env.value(), Some(&7));
        assert!(env.error().is_none());
        assert_eq!(env.time_in_queue(), Duration::from_millis(6));
    }

    #[test]
    fn failure_holds_only_an_error() {
        let env: ResultEnvelope<i32> = ResultEnvelope::failure(WorkError::msg("boom"), timing(1));
        assert!(env.value().is_none());
        assert_eq!(env.error().map(ToString::to_string).as_deref(), Some("boom"));
    }

    #[test]
    fn settling_an_envelope_returns_the_same_instance() {
        let original = ResultEnvelope::success("x", timing(5));
        let wrapped = ResultEnvelope::settle(Settlement::Envelope(original.clone()), timing(99));
        assert!(ResultEnvelope::ptr_eq(&original, &wrapped));
        assert_eq!(wrapped.time_resolving(), Duration::from_millis(5));
    }

    #[test]
    fn delivery_splits_on_outcome() {
        let ok = ResultEnvelope::success(1, Timing::default());
        let err: ResultEnvelope<i32> = ResultEnvelope::failure(WorkError::msg("no"), Timing::default());
        assert!(ok.into_delivery().is_ok());
        assert!(err.into_delivery().is_err());
    }

    #[test]
    fn into_result_surfaces_the_work_error() {
        let ok = ResultEnvelope::success(4, Timing::default());
        assert_eq!(ok.into_result().unwrap(), 4);

        let err: ResultEnvelope<i32> = ResultEnvelope::failure(WorkError::msg("gone"), Timing::default());
        let failure = err.into_result().unwrap_err();
        assert!(matches!(failure, crate::error::Error::WorkItem(_)));
        assert_eq!(failure.to_string(), "work item failed: gone");
    }
}
