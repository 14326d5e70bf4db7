//! Hybrid event bus: persistent callbacks, one-shot futures, and FIFO demand.
//!
//! Three subscription shapes per event key:
//!
//! - [`Emitter::on`]: a persistent callback, fired on every publish.
//! - [`Emitter::once`]: a future settled by the next publish, then removed.
//! - [`Emitter::next`]: a future matched to publishes in the order the
//!   `next` calls were made. Each publish settles only the oldest one.
//!
//! [`Emitter::publish`] delivers to all callbacks, then all once-futures,
//! then the single oldest live demand future. Callbacks run outside the
//! emitter's lock, so a callback may subscribe, unsubscribe, or publish
//! again on the same emitter.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::sync::oneshot;

/// Identifies one subscription of any shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Why a future subscription did not settle with a value.
#[derive(Debug, Clone, Error)]
pub enum Rejected<E> {
    /// The event was published with an error.
    #[error("event was published with an error")]
    Published(E),
    /// The subscription was removed, or the emitter dropped, before a publish.
    #[error("subscription closed before the event was published")]
    Closed,
}

impl<E> Rejected<E> {
    /// The published error, if there was one.
    pub fn published(self) -> Option<E> {
        match self {
            Rejected::Published(err) => Some(err),
            Rejected::Closed => None,
        }
    }
}

/// What a future subscription settles with.
pub type Settled<P, E> = Result<P, Rejected<E>>;

type Listener<P, E> = Arc<dyn Fn(Result<&P, &E>) + Send + Sync>;
type Settler<P, E> = oneshot::Sender<Result<P, E>>;

struct OnceEntry<P, E> {
    id: SubscriptionId,
    settler: Settler<P, E>,
    companion: Option<Listener<P, E>>,
}

struct Channel<P, E> {
    listeners: Vec<(SubscriptionId, Listener<P, E>)>,
    once: Vec<OnceEntry<P, E>>,
    demand: VecDeque<(SubscriptionId, Settler<P, E>)>,
}

impl<P, E> Default for Channel<P, E> {
    fn default() -> Self {
        Self {
            listeners: Vec::new(),
            once: Vec::new(),
            demand: VecDeque::new(),
        }
    }
}

/// A future for one publish of one event.
///
/// Returned by [`Emitter::once`] and [`Emitter::next`]. Dropping it
/// abandons the subscription; a dropped demand future never consumes a
/// publish.
pub struct Pending<P, E> {
    id: SubscriptionId,
    rx: oneshot::Receiver<Result<P, E>>,
}

impl<P, E> Pending<P, E> {
    /// The subscription handle, usable with [`Emitter::unsubscribe`].
    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

impl<P, E> Future for Pending<P, E> {
    type Output = Settled<P, E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| match received {
            Ok(Ok(content)) => Ok(content),
            Ok(Err(err)) => Err(Rejected::Published(err)),
            Err(_) => Err(Rejected::Closed),
        })
    }
}

/// Event bus keyed by `K`, delivering `P` on success and `E` on failure.
pub struct Emitter<K, P, E> {
    channels: Mutex<HashMap<K, Channel<P, E>>>,
    next_id: AtomicU64,
}

impl<K, P, E> Default for Emitter<K, P, E>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, P, E> Emitter<K, P, E>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn allocate_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<K, Channel<P, E>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a persistent, error-first callback.
    pub fn on<F>(&self, event: K, callback: F) -> SubscriptionId
    where
        F: Fn(Result<&P, &E>) + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        self.channels()
            .entry(event)
            .or_default()
            .listeners
            .push((id, Arc::new(callback)));
        id
    }

    /// Subscribe to the next publish of `event`.
    pub fn once(&self, event: K) -> Pending<P, E> {
        self.once_entry(event, None)
    }

    /// Like [`Emitter::once`], with a companion callback fired and removed
    /// together with the future.
    pub fn once_with<F>(&self, event: K, callback: F) -> Pending<P, E>
    where
        F: Fn(Result<&P, &E>) + Send + Sync + 'static,
    {
        self.once_entry(event, Some(Arc::new(callback)))
    }

    fn once_entry(&self, event: K, companion: Option<Listener<P, E>>) -> Pending<P, E> {
        let id = self.allocate_id();
        let (settler, rx) = oneshot::channel();
        self.channels()
            .entry(event)
            .or_default()
            .once
            .push(OnceEntry {
                id,
                settler,
                companion,
            });
        Pending { id, rx }
    }

    /// Queue a demand for a future publish of `event`.
    ///
    /// Demands are served strictly in the order they were made, one per
    /// publish, independently of `once` subscribers.
    pub fn next(&self, event: K) -> Pending<P, E> {
        let id = self.allocate_id();
        let (settler, rx) = oneshot::channel();
        self.channels()
            .entry(event)
            .or_default()
            .demand
            .push_back((id, settler));
        Pending { id, rx }
    }

    /// Remove subscriptions.
    ///
    /// With a handle, removes the one subscription it names, whatever its
    /// shape. Without one, clears every callback and once-future for the
    /// event; outstanding demand is left alone, since each demand belongs to
    /// whoever holds its future. Removed futures settle as
    /// [`Rejected::Closed`]. Returns whether anything was removed.
    pub fn unsubscribe(&self, event: &K, handle: Option<SubscriptionId>) -> bool {
        let mut channels = self.channels();
        let Some(channel) = channels.get_mut(event) else {
            return false;
        };

        match handle {
            Some(id) => {
                if let Some(pos) = channel.listeners.iter().position(|(l, _)| *l == id) {
                    channel.listeners.remove(pos);
                    return true;
                }
                if let Some(pos) = channel.once.iter().position(|entry| entry.id == id) {
                    channel.once.remove(pos);
                    return true;
                }
                if let Some(pos) = channel.demand.iter().position(|(d, _)| *d == id) {
                    channel.demand.remove(pos);
                    return true;
                }
                false
            }
            None => {
                let removed = !channel.listeners.is_empty() || !channel.once.is_empty();
                channel.listeners.clear();
                channel.once.clear();
                removed
            }
        }
    }

    /// Publish `event`. `Ok` delivers content, `Err` delivers an error.
    pub fn publish(&self, event: &K, delivery: Result<P, E>)
    where
        P: Clone,
        E: Clone,
    {
        let (listeners, once, demand) = {
            let mut channels = self.channels();
            let Some(channel) = channels.get_mut(event) else {
                return;
            };
            let listeners: Vec<Listener<P, E>> = channel
                .listeners
                .iter()
                .map(|(_, listener)| Arc::clone(listener))
                .collect();
            let once = std::mem::take(&mut channel.once);
            let demand = loop {
                match channel.demand.pop_front() {
                    Some((_, settler)) if settler.is_closed() => continue,
                    other => break other,
                }
            };
            (listeners, once, demand)
        };

        for listener in &listeners {
            listener(delivery.as_ref());
        }
        for entry in once {
            if let Some(companion) = &entry.companion {
                companion(delivery.as_ref());
            }
            let _ = entry.settler.send(delivery.clone());
        }
        if let Some((_, settler)) = demand {
            let _ = settler.send(delivery);
        }
    }

    /// Whether any live `next` future is waiting on `event`.
    pub fn has_pending_demand(&self, event: &K) -> bool {
        self.pending_demand(event) > 0
    }

    /// Number of live `next` futures waiting on `event`.
    pub fn pending_demand(&self, event: &K) -> usize {
        let mut channels = self.channels();
        let Some(channel) = channels.get_mut(event) else {
            return 0;
        };
        channel.demand.retain(|(_, settler)| !settler.is_closed());
        channel.demand.len()
    }

    /// Number of callbacks plus once-futures registered for `event`.
    pub fn subscriber_count(&self, event: &K) -> usize {
        self.channels()
            .get(event)
            .map(|channel| channel.listeners.len() + channel.once.len())
            .unwrap_or(0)
    }
}
