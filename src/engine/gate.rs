//! Conditionals gating refresh passes and resolutions.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::control::Engine;

/// The step a conditional gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Admitting work from the pull source.
    Pull,
    Refresh,
    Resolve,
}

/// A stage of the refresh pass that can be paused on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Pull,
    Resolve,
}

/// Handle for removing a conditional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConditionalId(u64);

pub(crate) type Predicate<T> = Arc<dyn Fn(&Engine<T>) -> bool + Send + Sync>;

/// User-registered predicates, per action, in registration order.
pub(crate) struct Conditionals<T> {
    pull: Vec<(ConditionalId, Predicate<T>)>,
    refresh: Vec<(ConditionalId, Predicate<T>)>,
    resolve: Vec<(ConditionalId, Predicate<T>)>,
    next_id: u64,
}

impl<T> Conditionals<T> {
    pub(crate) fn new() -> Self {
        Self {
            pull: Vec::new(),
            refresh: Vec::new(),
            resolve: Vec::new(),
            next_id: 0,
        }
    }

    fn list_mut(&mut self, action: Action) -> &mut Vec<(ConditionalId, Predicate<T>)> {
        match action {
            Action::Pull => &mut self.pull,
            Action::Refresh => &mut self.refresh,
            Action::Resolve => &mut self.resolve,
        }
    }

    pub(crate) fn add(&mut self, action: Action, predicate: Predicate<T>) -> ConditionalId {
        let id = ConditionalId(self.next_id);
        self.next_id += 1;
        self.list_mut(action).push((id, predicate));
        id
    }

    pub(crate) fn remove(&mut self, action: Action, id: ConditionalId) -> bool {
        let list = self.list_mut(action);
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        list.len() != before
    }

    /// Clones of the predicates for `action`, so they can be evaluated
    /// without holding the lock.
    pub(crate) fn snapshot(&self, action: Action) -> Vec<Predicate<T>> {
        let list = match action {
            Action::Pull => &self.pull,
            Action::Refresh => &self.refresh,
            Action::Resolve => &self.resolve,
        };
        list.iter().map(|(_, predicate)| Arc::clone(predicate)).collect()
    }
}

/// Why the built-in resolve gate is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Blocked {
    Empty,
    Paused,
    Saturated,
}
