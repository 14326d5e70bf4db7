//! Core data model.
//!
//! A resolvee is an admitted unit of work. It has identity, a kind fixed at
//! classification time, and a lifecycle stage.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Resolvee identity
// ---------------------------------------------------------------------------

/// Newtype for resolvee IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolveeId(pub Uuid);

impl ResolveeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ResolveeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for ResolveeId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Kind
// ---------------------------------------------------------------------------

/// How a work item is resolved. Fixed when the item is classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveeKind {
    /// An invocable, called once with the previous result.
    Function,
    /// An already-produced envelope, resolved to itself.
    Result,
    /// Any other value, resolved immediately as a success.
    Wild,
}

impl ResolveeKind {
    /// Whether a resolvee of this kind may be resolved more than once.
    ///
    /// Re-resolving a plain value or an existing envelope has no side
    /// effects, so only invocables are single-use.
    pub fn is_multi_use(self) -> bool {
        !matches!(self, ResolveeKind::Function)
    }
}

impl std::fmt::Display for ResolveeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResolveeKind::Function => "function",
            ResolveeKind::Result => "queue-result",
            ResolveeKind::Wild => "*",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// Lifecycle stage of a resolvee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Admitted, waiting in the queue.
    Created,
    /// Work has started and is awaiting completion.
    Resolving,
    /// Completed with a success or error envelope.
    Resolved,
}

impl Stage {
    /// Can a resolvee move from self to `to`? Only multi-use resolvees may
    /// start again once they have started.
    pub fn can_transition_to(self, to: Stage, multi_use: bool) -> bool {
        use Stage::*;
        match (self, to) {
            (Created, Resolving) | (Resolving, Resolved) => true,
            (Resolved, Resolving) | (Resolving, Resolving) => multi_use,
            _ => false,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Created => "created",
            Stage::Resolving => "resolving",
            Stage::Resolved => "resolved",
        };
        write!(f, "{s}")
    }
}
