//! Resolution span helpers.
//!
//! Provides span creation and stage-transition recording for resolvees
//! flowing through an engine.

use tracing::Span;

use crate::model::{ResolveeId, ResolveeKind, Stage};

/// Start a span for one resolution.
///
/// The `resolvee.outcome` field is declared empty and can be filled via
/// [`record_outcome`].
pub fn start_resolution_span(engine: &str, id: ResolveeId, kind: ResolveeKind) -> Span {
    tracing::info_span!(
        "resolvee.resolve",
        "resolvee.engine" = engine,
        "resolvee.id" = %id,
        "resolvee.kind" = %kind,
        "resolvee.outcome" = tracing::field::Empty,
    )
}

/// Record a stage transition on the given span.
///
/// Emits a tracing `debug` event scoped to the span.
pub fn record_stage_transition(span: &Span, from: Stage, to: Stage) {
    span.in_scope(|| {
        tracing::debug!(from = %from, to = %to, "stage_transition");
    });
}

/// Record the outcome of a resolution on its span.
pub fn record_outcome(span: &Span, ok: bool) {
    span.record("resolvee.outcome", if ok { "success" } else { "error" });
}
