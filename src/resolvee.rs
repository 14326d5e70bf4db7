//! Resolvees: work items normalized into resolvable units.
//!
//! A [`WorkItem`] is classified once, when its [`Resolvee`] is built. The
//! variant fixes the resolution strategy:
//!
//! - `Function` is called with the previous envelope and awaited. Errors and
//!   panics become the envelope's error. Single-use.
//! - `Result` resolves to the wrapped envelope itself.
//! - `Wild` resolves immediately as a success.
//!
//! A resolvee owns an emitter and publishes `Resolving` when it starts and
//! `Resolved` when it completes, so an engine can react without polling.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::emitter::{Pending, Rejected, Settled, SubscriptionId};
use crate::envelope::{ResultEnvelope, Settlement, Timing, WorkError};
use crate::error::{Error, Result};
use crate::event::{Event, Notice, NoticeEmitter};
use crate::model::{ResolveeId, ResolveeKind, Stage};

type WorkFuture<T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send>>;
type WorkFn<T> = Box<dyn FnOnce(Option<ResultEnvelope<T>>) -> WorkFuture<T> + Send>;

/// Opaque input to an engine.
pub enum WorkItem<T> {
    /// An invocable producing the outcome asynchronously.
    Function(WorkFn<T>),
    /// An already-produced envelope.
    Result(ResultEnvelope<T>),
    /// Any other value.
    Wild(T),
}

impl<T> WorkItem<T> {
    /// Wrap an async invocable. It receives the previous result buffered by
    /// the engine, if any.
    pub fn function<F, Fut>(work: F) -> Self
    where
        F: FnOnce(Option<ResultEnvelope<T>>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        WorkItem::Function(Box::new(move |previous| Box::pin(work(previous))))
    }

    pub fn value(value: T) -> Self {
        WorkItem::Wild(value)
    }

    pub fn envelope(envelope: ResultEnvelope<T>) -> Self {
        WorkItem::Result(envelope)
    }

    pub fn kind(&self) -> ResolveeKind {
        match self {
            WorkItem::Function(_) => ResolveeKind::Function,
            WorkItem::Result(_) => ResolveeKind::Result,
            WorkItem::Wild(_) => ResolveeKind::Wild,
        }
    }
}

impl<T> From<ResultEnvelope<T>> for WorkItem<T> {
    fn from(envelope: ResultEnvelope<T>) -> Self {
        WorkItem::Result(envelope)
    }
}

impl<T> std::fmt::Debug for WorkItem<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WorkItem({})", self.kind())
    }
}

enum Strategy<T> {
    Function(Option<WorkFn<T>>),
    Result(ResultEnvelope<T>),
    Wild(T),
}

enum Run<T> {
    Call(WorkFn<T>),
    Envelope(ResultEnvelope<T>),
    Value(T),
}

struct Lifecycle<T> {
    stage: Stage,
    started_at: Option<DateTime<Utc>>,
    resolved_at: Option<DateTime<Utc>>,
    last_resolved: Option<Instant>,
    resolutions: u32,
    last: Option<ResultEnvelope<T>>,
}

fn lock<G>(mutex: &Mutex<G>) -> MutexGuard<'_, G> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An admitted unit of work and its resolution lifecycle.
pub struct Resolvee<T> {
    id: ResolveeId,
    kind: ResolveeKind,
    created_at: DateTime<Utc>,
    created: Instant,
    strategy: Mutex<Strategy<T>>,
    lifecycle: Mutex<Lifecycle<T>>,
    emitter: NoticeEmitter<T>,
}

impl<T> Resolvee<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Classify a work item. An absent item has no resolvee type.
    pub fn new(item: Option<WorkItem<T>>) -> Result<Self> {
        let item = item.ok_or_else(|| Error::InvalidResolveeType("none".to_string()))?;
        let kind = item.kind();
        let strategy = match item {
            WorkItem::Function(work) => Strategy::Function(Some(work)),
            WorkItem::Result(envelope) => Strategy::Result(envelope),
            WorkItem::Wild(value) => Strategy::Wild(value),
        };

        Ok(Self {
            id: ResolveeId::new(),
            kind,
            created_at: Utc::now(),
            created: Instant::now(),
            strategy: Mutex::new(strategy),
            lifecycle: Mutex::new(Lifecycle {
                stage: Stage::Created,
                started_at: None,
                resolved_at: None,
                last_resolved: None,
                resolutions: 0,
                last: None,
            }),
            emitter: NoticeEmitter::new(),
        })
    }

    /// Start resolving.
    ///
    /// The synchronous part records the start, publishes `Resolving`, and
    /// picks the strategy; the returned future performs the work, builds
    /// the envelope, and publishes `Resolved`. A second call on a
    /// single-use resolvee fails with [`Error::NotMultiUse`] and never
    /// touches the wrapped work.
    pub fn resolve(
        self: &Arc<Self>,
        previous: Option<ResultEnvelope<T>>,
    ) -> Result<impl Future<Output = ResultEnvelope<T>> + Send + use<T>> {
        let (run, started, queue_origin) = {
            let mut lifecycle = lock(&self.lifecycle);
            if !lifecycle
                .stage
                .can_transition_to(Stage::Resolving, self.kind.is_multi_use())
            {
                return Err(Error::NotMultiUse { kind: self.kind });
            }

            let run = match &mut *lock(&self.strategy) {
                Strategy::Function(work) => {
                    Run::Call(work.take().ok_or(Error::NotMultiUse { kind: self.kind })?)
                }
                Strategy::Result(envelope) => Run::Envelope(envelope.clone()),
                Strategy::Wild(value) => Run::Value(value.clone()),
            };

            let queue_origin = if self.kind.is_multi_use() {
                lifecycle.last_resolved.unwrap_or(self.created)
            } else {
                self.created
            };
            lifecycle.stage = Stage::Resolving;
            // First start only; each resolution is timed from `started`.
            lifecycle.started_at.get_or_insert_with(Utc::now);
            (run, Instant::now(), queue_origin)
        };

        debug!(resolvee = %self.id, kind = %self.kind, "resolving");
        self.emitter
            .publish(&Event::Resolving, Ok(Notice::Resolving(self.id)));

        let this = Arc::clone(self);
        Ok(async move {
            let settlement = match run {
                Run::Call(work) => match tokio::spawn(async move { work(previous).await }).await {
                    Ok(result) => Settlement::from(result),
                    Err(join) => Settlement::Error(WorkError::msg(format!(
                        "work item panicked: {join}"
                    ))),
                },
                Run::Envelope(envelope) => Settlement::Envelope(envelope),
                Run::Value(value) => Settlement::Value(value),
            };

            let completed = Instant::now();
            let envelope = ResultEnvelope::settle(
                settlement,
                Timing {
                    time_resolving: completed.duration_since(started),
                    time_in_queue: completed.duration_since(queue_origin),
                },
            );

            {
                let mut lifecycle = lock(&this.lifecycle);
                // An overlapping resolution may already have settled the stage.
                if lifecycle
                    .stage
                    .can_transition_to(Stage::Resolved, this.kind.is_multi_use())
                {
                    lifecycle.stage = Stage::Resolved;
                }
                lifecycle.resolved_at = Some(Utc::now());
                lifecycle.last_resolved = Some(completed);
                lifecycle.resolutions += 1;
                lifecycle.last = Some(envelope.clone());
            }

            debug!(
                resolvee = %this.id,
                ok = envelope.is_ok(),
                duration_ms = envelope.time_resolving().as_millis() as u64,
                "resolved"
            );
            this.emitter.publish(
                &Event::Resolved,
                envelope.clone().into_delivery().map(Notice::Resolved),
            );
            envelope
        })
    }

    /// The latest result: settled immediately if already resolved,
    /// otherwise on the next `Resolved`.
    pub fn result(&self) -> Ticket<T> {
        // Held while registering so a completion cannot slip in between.
        let lifecycle = lock(&self.lifecycle);
        if let Some(last) = lifecycle.last.clone() {
            return Ticket::ready(last.into_delivery().map_err(Rejected::Published));
        }
        Ticket::waiting(self.emitter.once(Event::Resolved))
    }
}

impl<T> Resolvee<T> {
    pub fn id(&self) -> ResolveeId {
        self.id
    }

    pub fn kind(&self) -> ResolveeKind {
        self.kind
    }

    pub fn is_multi_use(&self) -> bool {
        self.kind.is_multi_use()
    }

    pub fn stage(&self) -> Stage {
        lock(&self.lifecycle).stage
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.lifecycle).started_at
    }

    pub fn resolved_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.lifecycle).resolved_at
    }

    /// How many times this resolvee has completed.
    pub fn resolutions(&self) -> u32 {
        lock(&self.lifecycle).resolutions
    }

    pub fn on<F>(&self, event: Event, callback: F) -> SubscriptionId
    where
        F: Fn(std::result::Result<&Notice<T>, &ResultEnvelope<T>>) + Send + Sync + 'static,
    {
        self.emitter.on(event, callback)
    }

    pub fn once(&self, event: Event) -> Pending<Notice<T>, ResultEnvelope<T>> {
        self.emitter.once(event)
    }

    pub fn unsubscribe(&self, event: Event, handle: Option<SubscriptionId>) -> bool {
        self.emitter.unsubscribe(&event, handle)
    }
}

impl<T> std::fmt::Debug for Resolvee<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolvee")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stage", &self.stage())
            .finish()
    }
}

enum TicketState<T> {
    Waiting(Pending<Notice<T>, ResultEnvelope<T>>),
    Ready(Option<Settled<ResultEnvelope<T>, ResultEnvelope<T>>>),
}

/// A future for one eventual envelope.
///
/// Settles with `Ok(envelope)` on success and
/// `Err(Rejected::Published(envelope))` when the work failed.
pub struct Ticket<T> {
    state: TicketState<T>,
}

impl<T> Ticket<T> {
    pub(crate) fn waiting(pending: Pending<Notice<T>, ResultEnvelope<T>>) -> Self {
        Self {
            state: TicketState::Waiting(pending),
        }
    }

    pub(crate) fn ready(settled: Settled<ResultEnvelope<T>, ResultEnvelope<T>>) -> Self {
        Self {
            state: TicketState::Ready(Some(settled)),
        }
    }

    /// The subscription handle while still waiting.
    pub fn id(&self) -> Option<SubscriptionId> {
        match &self.state {
            TicketState::Waiting(pending) => Some(pending.id()),
            TicketState::Ready(_) => None,
        }
    }
}

impl<T> Future for Ticket<T> {
    type Output = Settled<ResultEnvelope<T>, ResultEnvelope<T>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            TicketState::Ready(settled) => Poll::Ready(settled.take().unwrap_or(Err(Rejected::Closed))),
            TicketState::Waiting(pending) => Pin::new(pending).poll(cx).map(|settled| {
                settled.and_then(|notice| notice.into_envelope().ok_or(Rejected::Closed))
            }),
        }
    }
}
