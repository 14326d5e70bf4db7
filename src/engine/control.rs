//! The engine: admission, gating, resolution, and result delivery.
//!
//! Everything is driven by refresh passes. A pass checks the refresh gate,
//! pulls at most one item from the pull source, makes at most one
//! resolution-advance attempt, publishes `Refresh`, and re-arms the
//! inactivity timer. Requests for a pass made before it runs
//! collapse into one. Starting a resolution and completing one both
//! schedule another pass, so the engine keeps advancing until the queue is
//! empty or a gate closes.
//!
//! State lives behind short synchronous critical sections. No lock is held
//! across an `.await`, and user callbacks and conditionals always run with
//! the state unlocked.

use std::any::Any;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, warn};

use crate::config::{EngineConfig, Mode};
use crate::emitter::{Pending, SubscriptionId};
use crate::envelope::ResultEnvelope;
use crate::error::{Error, Result};
use crate::event::{Event, Notice, NoticeEmitter};
use crate::model::{ResolveeId, Stage};
use crate::resolvee::{Resolvee, Ticket, WorkItem};
use crate::telemetry;

use super::gate::{Action, Blocked, ConditionalId, Conditionals, Phase};
use super::metrics::{Metadata, Metrics};
use super::queue::AdmissionQueue;

/// Producer polled for new work on each refresh pass while the pull gate
/// is open. `None` means nothing to admit right now.
type PullSource<T> = Arc<dyn Fn() -> Option<WorkItem<T>> + Send + Sync>;

fn lock<G>(mutex: &Mutex<G>) -> MutexGuard<'_, G> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct State<T> {
    queue: AdmissionQueue<T>,
    previous: VecDeque<ResultEnvelope<T>>,
    in_flight: HashSet<ResolveeId>,
    /// The resolvee a refresh pass is starting right now.
    starting: Option<ResolveeId>,
    metrics: Metrics,
    total_queued: u64,
    paused: bool,
    pull_paused: bool,
    resolve_paused: bool,
    completed: bool,
    queued_waiter: bool,
}

struct Instruments {
    admissions: Counter<u64>,
    resolutions: Counter<u64>,
    resolution_ms: Histogram<f64>,
    queue_ms: Histogram<f64>,
}

struct Inner<T> {
    config: EngineConfig,
    runtime: Handle,
    created_at: DateTime<Utc>,
    started: Instant,
    state: Mutex<State<T>>,
    conditionals: Mutex<Conditionals<T>>,
    pull_source: Mutex<Option<PullSource<T>>>,
    emitter: NoticeEmitter<T>,
    refresh_scheduled: AtomicBool,
    /// Serializes refresh passes.
    pass: Mutex<()>,
    timer: Mutex<Option<JoinHandle<()>>>,
    instruments: Instruments,
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        if let Some(timer) = lock(&self.timer).take() {
            timer.abort();
        }
    }
}

/// Admission-and-resolution engine. Cheap to clone; clones share state.
pub struct Engine<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Engine<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Engine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("name", &self.inner.config.name)
            .field("mode", &self.inner.config.mode)
            .field("concurrency", &self.inner.config.concurrency)
            .finish()
    }
}

impl<T> Engine<T> {
    /// Remove a `Resolved` listener registered through this engine.
    pub(crate) fn detach(&self, handle: SubscriptionId) -> bool {
        self.inner.emitter.unsubscribe(&Event::Resolved, Some(handle))
    }
}

impl<T> Engine<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create an engine on the current tokio runtime.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| Error::Runtime(e.to_string()))?;

        info!(
            engine = %config.name,
            concurrency = config.concurrency,
            mode = %config.mode,
            "engine created"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                runtime,
                created_at: Utc::now(),
                started: Instant::now(),
                state: Mutex::new(State {
                    queue: AdmissionQueue::new(),
                    previous: VecDeque::new(),
                    in_flight: HashSet::new(),
                    starting: None,
                    metrics: Metrics::default(),
                    total_queued: 0,
                    paused: false,
                    pull_paused: false,
                    resolve_paused: false,
                    completed: false,
                    queued_waiter: false,
                }),
                conditionals: Mutex::new(Conditionals::new()),
                pull_source: Mutex::new(None),
                emitter: NoticeEmitter::new(),
                refresh_scheduled: AtomicBool::new(false),
                pass: Mutex::new(()),
                timer: Mutex::new(None),
                instruments: Instruments {
                    admissions: telemetry::metrics::admissions(),
                    resolutions: telemetry::metrics::resolutions(),
                    resolution_ms: telemetry::metrics::resolution_duration_ms(),
                    queue_ms: telemetry::metrics::queue_duration_ms(),
                },
            }),
        })
    }

    fn from_inner(inner: Arc<Inner<T>>) -> Self {
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn mode(&self) -> Mode {
        self.inner.config.mode
    }

    pub fn concurrency(&self) -> usize {
        self.inner.config.concurrency
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    /// Admit a work item and return a future for its envelope.
    ///
    /// `None` is not a valid work item and fails with
    /// [`Error::InvalidResolveeType`].
    pub fn resolve(&self, item: impl Into<Option<WorkItem<T>>>) -> Result<Ticket<T>> {
        let resolvee = Arc::new(Resolvee::new(item.into())?);
        let ticket = resolvee.result();
        self.enqueue(resolvee);
        Ok(ticket)
    }

    /// Admit a work item and return its resolvee handle instead of a future.
    pub fn admit(&self, item: impl Into<Option<WorkItem<T>>>) -> Result<Arc<Resolvee<T>>> {
        let resolvee = Arc::new(Resolvee::new(item.into())?);
        self.enqueue(Arc::clone(&resolvee));
        Ok(resolvee)
    }

    fn enqueue(&self, resolvee: Arc<Resolvee<T>>) {
        let id = resolvee.id();
        let kind = resolvee.kind();

        let weak = Arc::downgrade(&self.inner);
        resolvee.on(Event::Resolving, move |_| {
            if let Some(inner) = weak.upgrade() {
                Engine::from_inner(inner).on_resolving(id);
            }
        });
        let weak = Arc::downgrade(&self.inner);
        resolvee.on(Event::Resolved, move |delivery| {
            let envelope = match delivery {
                Ok(notice) => notice.envelope().cloned(),
                Err(envelope) => Some(envelope.clone()),
            };
            if let (Some(inner), Some(envelope)) = (weak.upgrade(), envelope) {
                Engine::from_inner(inner).on_resolved(id, envelope);
            }
        });

        {
            let mut state = lock(&self.inner.state);
            state.queue.push(resolvee);
            state.total_queued += 1;
        }

        debug!(engine = %self.name(), resolvee = %id, kind = %kind, "queued");
        self.inner.instruments.admissions.add(
            1,
            &[
                KeyValue::new("engine", self.inner.config.name.clone()),
                KeyValue::new("kind", kind.to_string()),
            ],
        );
        self.inner
            .emitter
            .publish(&Event::Queued, Ok(Notice::Queued(id)));
        self.refresh();
    }

    /// Install a producer the engine pulls work from. Each refresh pass
    /// whose pull gate is open (source set, pull phase not paused, every
    /// `Action::Pull` conditional holds) calls it once and admits what it
    /// returns. A source that always has work should be bounded with a pull
    /// conditional.
    pub fn set_pull_source<F>(&self, source: F)
    where
        F: Fn() -> Option<WorkItem<T>> + Send + Sync + 'static,
    {
        *lock(&self.inner.pull_source) = Some(Arc::new(source));
        info!(engine = %self.name(), "pull source set");
        self.refresh();
    }

    /// Remove the pull source. Returns whether one was installed.
    pub fn clear_pull_source(&self) -> bool {
        lock(&self.inner.pull_source).take().is_some()
    }

    /// Remove an item that has not started resolving. Returns whether it
    /// was still queued.
    pub fn withdraw(&self, id: ResolveeId) -> bool {
        let removed = lock(&self.inner.state).queue.remove(id);
        if removed {
            debug!(engine = %self.name(), resolvee = %id, "withdrawn");
        }
        removed
    }

    /// Whether `id` is admitted and has not started resolving.
    pub fn is_queued(&self, id: ResolveeId) -> bool {
        lock(&self.inner.state).queue.contains(id)
    }

    // -----------------------------------------------------------------------
    // Chaining
    // -----------------------------------------------------------------------

    /// Feed every `Resolved` emission of `source`, success or error, into
    /// this engine. Returns the listener handle registered on `source`.
    pub fn subscribe(&self, source: &Engine<T>) -> Result<SubscriptionId> {
        if Arc::ptr_eq(&self.inner, &source.inner) {
            return Err(Error::IncompatibleSubscriptionSource(format!(
                "engine {} cannot subscribe to itself",
                self.name()
            )));
        }

        let weak = Arc::downgrade(&self.inner);
        let target = self.name().to_string();
        let handle = source.on(Event::Resolved, move |delivery| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let envelope = match delivery {
                Ok(notice) => notice.envelope().cloned(),
                Err(envelope) => Some(envelope.clone()),
            };
            if let Some(envelope) = envelope {
                if let Err(e) = Engine::from_inner(inner).resolve(WorkItem::Result(envelope)) {
                    warn!(engine = %target, error = %e, "failed to forward chained result");
                }
            }
        });

        info!(engine = %self.name(), source = %source.name(), "subscribed");
        Ok(handle)
    }

    /// Like [`Engine::subscribe`], for a source whose type is only known at
    /// runtime. Anything other than an `Engine<T>` is rejected.
    pub fn subscribe_dyn(&self, source: &dyn Any) -> Result<SubscriptionId> {
        let source = source.downcast_ref::<Engine<T>>().ok_or_else(|| {
            Error::IncompatibleSubscriptionSource(format!(
                "expected an Engine<{}>",
                std::any::type_name::<T>()
            ))
        })?;
        self.subscribe(source)
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// A future for the next occurrence of `event`, served in call order.
    /// Also schedules a refresh so pending work can satisfy the demand.
    pub fn next(&self, event: Event) -> Pending<Notice<T>, ResultEnvelope<T>> {
        let pending = self.inner.emitter.next(event);
        self.refresh();
        pending
    }

    /// [`Engine::next`] for `Resolved`, settling with the envelope.
    pub fn next_resolved(&self) -> Ticket<T> {
        Ticket::waiting(self.next(Event::Resolved))
    }

    pub fn on<F>(&self, event: Event, callback: F) -> SubscriptionId
    where
        F: Fn(std::result::Result<&Notice<T>, &ResultEnvelope<T>>) + Send + Sync + 'static,
    {
        self.inner.emitter.on(event, callback)
    }

    pub fn once(&self, event: Event) -> Pending<Notice<T>, ResultEnvelope<T>> {
        self.inner.emitter.once(event)
    }

    /// [`Engine::once`] with a callback fired alongside the future.
    pub fn once_with<F>(&self, event: Event, callback: F) -> Pending<Notice<T>, ResultEnvelope<T>>
    where
        F: Fn(std::result::Result<&Notice<T>, &ResultEnvelope<T>>) + Send + Sync + 'static,
    {
        self.inner.emitter.once_with(event, callback)
    }

    pub fn unsubscribe(&self, event: Event, handle: Option<SubscriptionId>) -> bool {
        self.inner.emitter.unsubscribe(&event, handle)
    }

    // -----------------------------------------------------------------------
    // Control
    // -----------------------------------------------------------------------

    /// Add a predicate to the refresh or resolve gate. All predicates of an
    /// action must hold for it to proceed.
    pub fn add_conditional<F>(&self, action: Action, predicate: F) -> ConditionalId
    where
        F: Fn(&Engine<T>) -> bool + Send + Sync + 'static,
    {
        let id = lock(&self.inner.conditionals).add(action, Arc::new(predicate));
        self.refresh();
        id
    }

    pub fn remove_conditional(&self, action: Action, id: ConditionalId) -> bool {
        let removed = lock(&self.inner.conditionals).remove(action, id);
        if removed {
            self.refresh();
        }
        removed
    }

    /// Stop starting new resolutions. In-flight work still completes.
    pub fn pause(&self) {
        lock(&self.inner.state).paused = true;
        info!(engine = %self.name(), "paused");
    }

    /// Clears the whole-engine pause. Phases paused on their own stay paused.
    pub fn resume(&self) {
        lock(&self.inner.state).paused = false;
        info!(engine = %self.name(), "resumed");
        self.refresh();
    }

    pub fn pause_phase(&self, phase: Phase) {
        self.set_phase_paused(phase, true);
        info!(engine = %self.name(), ?phase, "phase paused");
    }

    pub fn resume_phase(&self, phase: Phase) {
        self.set_phase_paused(phase, false);
        info!(engine = %self.name(), ?phase, "phase resumed");
        self.refresh();
    }

    fn set_phase_paused(&self, phase: Phase, paused: bool) {
        let mut state = lock(&self.inner.state);
        match phase {
            Phase::Pull => state.pull_paused = paused,
            Phase::Resolve => state.resolve_paused = paused,
        }
    }

    /// Whether `phase` is held, by its own pause or the whole-engine one.
    pub fn is_paused(&self, phase: Phase) -> bool {
        let state = lock(&self.inner.state);
        state.paused
            || match phase {
                Phase::Pull => state.pull_paused,
                Phase::Resolve => state.resolve_paused,
            }
    }

    /// Publish `Completed`. The queue keeps working.
    pub fn set_complete(&self) {
        lock(&self.inner.state).completed = true;
        info!(engine = %self.name(), "completed");
        self.inner
            .emitter
            .publish(&Event::Completed, Ok(Notice::Completed));
    }

    pub fn is_complete(&self) -> bool {
        lock(&self.inner.state).completed
    }

    pub fn get_metadata(&self) -> Metadata {
        let pending_demand = self.inner.emitter.pending_demand(&Event::Resolved);
        let pulling = lock(&self.inner.pull_source).is_some();
        let age = self.inner.started.elapsed();
        let mut state = lock(&self.inner.state);
        state.metrics.update_rates(age);
        Metadata {
            name: self.inner.config.name.clone(),
            mode: self.inner.config.mode,
            concurrency: self.inner.config.concurrency,
            paused: state.paused,
            pull_paused: state.paused || state.pull_paused,
            resolve_paused: state.paused || state.resolve_paused,
            pulling,
            completed: state.completed,
            queued: state.queue.len(),
            in_flight: state.in_flight.len(),
            total_queued: state.total_queued,
            buffered_results: state.previous.len(),
            pending_demand,
            created_at: self.inner.created_at,
            age_ms: age.as_millis() as u64,
            metrics: state.metrics,
        }
    }

    // -----------------------------------------------------------------------
    // Refresh loop
    // -----------------------------------------------------------------------

    /// Schedule a refresh pass. Calls made before the pass runs collapse
    /// into it.
    pub fn refresh(&self) {
        if self.inner.refresh_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        self.inner.runtime.spawn(async move {
            if let Some(inner) = weak.upgrade() {
                Engine::from_inner(inner).refresh_pass();
            }
        });
    }

    fn refresh_pass(&self) {
        let _pass = lock(&self.inner.pass);
        self.inner.refresh_scheduled.store(false, Ordering::Release);

        if self.refresh_permitted() {
            self.pull_next();
            self.resolve_next();
            self.inner
                .emitter
                .publish(&Event::Refresh, Ok(Notice::Refresh));
        }
        self.arm_inactivity_timer();
    }

    fn refresh_permitted(&self) -> bool {
        let pulled = match self.inner.config.mode {
            Mode::Passive => true,
            // Each outstanding demand may pull one resolution.
            Mode::Active => {
                let demand = self.inner.emitter.pending_demand(&Event::Resolved);
                demand > lock(&self.inner.state).in_flight.len()
            }
        };
        pulled && self.conditionals_hold(Action::Refresh)
    }

    fn conditionals_hold(&self, action: Action) -> bool {
        let predicates = lock(&self.inner.conditionals).snapshot(action);
        predicates.iter().all(|predicate| predicate(self))
    }

    fn blocked(&self) -> Option<Blocked> {
        let state = lock(&self.inner.state);
        if state.queue.is_empty() {
            Some(Blocked::Empty)
        } else if state.paused || state.resolve_paused {
            Some(Blocked::Paused)
        } else if state.in_flight.len() >= self.inner.config.concurrency {
            Some(Blocked::Saturated)
        } else {
            None
        }
    }

    fn pull_next(&self) {
        let Some(source) = lock(&self.inner.pull_source).clone() else {
            return;
        };
        {
            let state = lock(&self.inner.state);
            if state.paused || state.pull_paused {
                return;
            }
        }
        if !self.conditionals_hold(Action::Pull) {
            return;
        }

        let Some(item) = source() else {
            return;
        };
        match Resolvee::new(Some(item)) {
            Ok(resolvee) => {
                debug!(engine = %self.name(), resolvee = %resolvee.id(), "pulled");
                self.enqueue(Arc::new(resolvee));
            }
            Err(e) => warn!(engine = %self.name(), error = %e, "pulled item rejected"),
        }
    }

    fn resolve_next(&self) {
        match self.blocked() {
            Some(Blocked::Empty) => {
                self.wait_for_queued();
                return;
            }
            Some(_) => return,
            None => {}
        }
        if !self.conditionals_hold(Action::Resolve) {
            return;
        }

        let (resolvee, previous) = {
            let mut state = lock(&self.inner.state);
            let Some(resolvee) = state.queue.head() else {
                return;
            };
            state.starting = Some(resolvee.id());
            (resolvee, state.previous.pop_front())
        };

        let span = telemetry::resolution::start_resolution_span(
            self.name(),
            resolvee.id(),
            resolvee.kind(),
        );
        let started = resolvee.resolve(previous.clone());
        lock(&self.inner.state).starting = None;

        match started {
            Ok(resolution) => {
                telemetry::resolution::record_stage_transition(
                    &span,
                    Stage::Created,
                    Stage::Resolving,
                );
                let recorder = span.clone();
                self.inner.runtime.spawn(
                    async move {
                        let envelope = resolution.await;
                        telemetry::resolution::record_outcome(&recorder, envelope.is_ok());
                        telemetry::resolution::record_stage_transition(
                            &recorder,
                            Stage::Resolving,
                            Stage::Resolved,
                        );
                    }
                    .instrument(span),
                );
            }
            Err(e) => {
                warn!(engine = %self.name(), resolvee = %resolvee.id(), error = %e, "resolvee rejected");
                let mut state = lock(&self.inner.state);
                state.queue.remove(resolvee.id());
                if let Some(previous) = previous {
                    state.previous.push_front(previous);
                }
            }
        }

        self.refresh();
    }

    /// Retry once the next item is admitted. At most one waiter at a time.
    fn wait_for_queued(&self) {
        {
            let mut state = lock(&self.inner.state);
            if state.queued_waiter {
                return;
            }
            state.queued_waiter = true;
        }
        let weak = Arc::downgrade(&self.inner);
        drop(self.inner.emitter.once_with(Event::Queued, move |_| {
            if let Some(inner) = weak.upgrade() {
                let engine = Engine::from_inner(inner);
                lock(&engine.inner.state).queued_waiter = false;
                engine.refresh();
            }
        }));
    }

    fn arm_inactivity_timer(&self) {
        let Some(period) = self.inner.config.inactivity_refresh_period else {
            return;
        };
        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        let timer = self.inner.runtime.spawn(async move {
            tokio::time::sleep(period).await;
            if let Some(inner) = weak.upgrade() {
                Engine::from_inner(inner).refresh();
            }
        });
        if let Some(previous) = lock(&self.inner.timer).replace(timer) {
            previous.abort();
        }
    }

    // -----------------------------------------------------------------------
    // Resolvee reactions
    // -----------------------------------------------------------------------

    fn on_resolving(&self, id: ResolveeId) {
        let mut state = lock(&self.inner.state);
        state.queue.remove(id);
        // Only resolutions started by a refresh pass count against the ceiling.
        if state.starting == Some(id) {
            state.in_flight.insert(id);
        }
    }

    fn on_resolved(&self, id: ResolveeId, envelope: ResultEnvelope<T>) {
        {
            let mut state = lock(&self.inner.state);
            if !state.in_flight.contains(&id) {
                return;
            }
            state.previous.push_back(envelope.clone());
        }

        self.inner.emitter.publish(
            &Event::Resolved,
            envelope.clone().into_delivery().map(Notice::Resolved),
        );

        let age = self.inner.started.elapsed();
        {
            let mut state = lock(&self.inner.state);
            state.in_flight.remove(&id);
            state.metrics.record(&envelope, age);
        }

        let outcome = if envelope.is_ok() { "success" } else { "error" };
        let attributes = [
            KeyValue::new("engine", self.inner.config.name.clone()),
            KeyValue::new("outcome", outcome),
        ];
        let instruments = &self.inner.instruments;
        instruments.resolutions.add(1, &attributes);
        instruments.resolution_ms.record(
            envelope.time_resolving().as_secs_f64() * 1000.0,
            &attributes,
        );
        instruments
            .queue_ms
            .record(envelope.time_in_queue().as_secs_f64() * 1000.0, &attributes);

        match envelope.error() {
            None => debug!(engine = %self.name(), resolvee = %id, "resolution succeeded"),
            Some(err) => debug!(engine = %self.name(), resolvee = %id, error = %err, "resolution failed"),
        }

        self.refresh();
    }
}
