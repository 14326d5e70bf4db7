//! Events published by engines and resolvees.
//!
//! Consumers subscribe by [`Event`] key and receive a [`Notice`]. Failures
//! are only ever published under [`Event::Resolved`], where the error side
//! carries the failed envelope.

use serde::{Deserialize, Serialize};

use crate::emitter::Emitter;
use crate::envelope::ResultEnvelope;
use crate::model::ResolveeId;

/// Event keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    /// An item was admitted to an engine's queue.
    Queued,
    /// A resolvee started resolving.
    Resolving,
    /// A resolution completed, successfully or not.
    Resolved,
    /// An engine finished a refresh pass.
    Refresh,
    /// An engine was marked complete.
    Completed,
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Event::Queued => "queued",
            Event::Resolving => "resolving",
            Event::Resolved => "resolved",
            Event::Refresh => "refresh",
            Event::Completed => "completed",
        };
        write!(f, "{s}")
    }
}

/// Payload delivered with an event.
#[derive(Debug)]
pub enum Notice<T> {
    Queued(ResolveeId),
    Resolving(ResolveeId),
    Resolved(ResultEnvelope<T>),
    Refresh,
    Completed,
}

impl<T> Notice<T> {
    /// The envelope carried by a `Resolved` notice.
    pub fn envelope(&self) -> Option<&ResultEnvelope<T>> {
        match self {
            Notice::Resolved(envelope) => Some(envelope),
            _ => None,
        }
    }

    pub fn into_envelope(self) -> Option<ResultEnvelope<T>> {
        match self {
            Notice::Resolved(envelope) => Some(envelope),
            _ => None,
        }
    }
}

impl<T> Clone for Notice<T> {
    fn clone(&self) -> Self {
        match self {
            Notice::Queued(id) => Notice::Queued(*id),
            Notice::Resolving(id) => Notice::Resolving(*id),
            Notice::Resolved(envelope) => Notice::Resolved(envelope.clone()),
            Notice::Refresh => Notice::Refresh,
            Notice::Completed => Notice::Completed,
        }
    }
}

/// The emitter shape shared by engines and resolvees.
pub type NoticeEmitter<T> = Emitter<Event, Notice<T>, ResultEnvelope<T>>;
