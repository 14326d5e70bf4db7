//! Admission queue: FIFO, unique, with O(1) head and arbitrary removal.
//!
//! Removal only drops the entry from the live index. Stale slots are
//! skipped and discarded when they reach the head.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::model::ResolveeId;
use crate::resolvee::Resolvee;

pub(crate) struct AdmissionQueue<T> {
    order: VecDeque<(u64, Arc<Resolvee<T>>)>,
    live: HashMap<ResolveeId, u64>,
    next_seq: u64,
}

impl<T> AdmissionQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            order: VecDeque::new(),
            live: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Append to the tail. Returns false if already queued.
    pub(crate) fn push(&mut self, resolvee: Arc<Resolvee<T>>) -> bool {
        let id = resolvee.id();
        if self.live.contains_key(&id) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.live.insert(id, seq);
        self.order.push_back((seq, resolvee));
        true
    }

    /// The oldest live entry, without removing it.
    pub(crate) fn head(&mut self) -> Option<Arc<Resolvee<T>>> {
        while let Some((seq, resolvee)) = self.order.front() {
            if self.live.get(&resolvee.id()) == Some(seq) {
                return Some(Arc::clone(resolvee));
            }
            self.order.pop_front();
        }
        None
    }

    pub(crate) fn remove(&mut self, id: ResolveeId) -> bool {
        let removed = self.live.remove(&id).is_some();
        if self.live.is_empty() {
            self.order.clear();
        }
        removed
    }

    pub(crate) fn contains(&self, id: ResolveeId) -> bool {
        self.live.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.live.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}
