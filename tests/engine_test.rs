//! Integration tests for admission, gating, and resolution.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use resolveq::emitter::Rejected;
use resolveq::envelope::Timing;
use resolveq::{
    Action, Engine, EngineConfig, Error, Event, Mode, Notice, Phase, ResultEnvelope, WorkItem,
};

fn engine(concurrency: usize) -> Engine<i32> {
    Engine::new(EngineConfig::new("test").concurrency(concurrency)).unwrap()
}

async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

// Tests that wait on the engine run with a paused clock, so this sleep
// advances virtual time once every ready task has run.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

fn counter(engine: &Engine<i32>, event: Event) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&count);
    engine.on(event, move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    count
}

async fn fail(message: &'static str) -> anyhow::Result<i32> {
    Err(anyhow::anyhow!(message))
}

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

#[tokio::test]
async fn absent_item_is_rejected_at_admission() {
    let engine = engine(1);
    let result = engine.resolve(None::<WorkItem<i32>>);
    assert!(matches!(result, Err(Error::InvalidResolveeType(_))));
    assert_eq!(engine.get_metadata().total_queued, 0);
}

#[tokio::test]
async fn engine_requires_a_runtime() {
    let result = Engine::<i32>::new(EngineConfig::default());
    assert!(result.is_ok());

    let outside = std::thread::spawn(|| Engine::<i32>::new(EngineConfig::default()).is_err())
        .join()
        .unwrap();
    assert!(outside);
}

#[tokio::test]
async fn wild_value_resolves_to_itself() {
    let engine = engine(2);
    let envelope = within(engine.resolve(WorkItem::value(7)).unwrap()).await.unwrap();
    assert_eq!(envelope.value(), Some(&7));
    assert!(envelope.error().is_none());
}

#[tokio::test]
async fn admitted_envelope_comes_back_as_the_same_instance() {
    let engine = engine(2);
    let original = ResultEnvelope::success(11, Timing::default());
    let envelope = within(engine.resolve(WorkItem::envelope(original.clone())).unwrap())
        .await
        .unwrap();
    assert!(ResultEnvelope::ptr_eq(&original, &envelope));
}

#[tokio::test]
async fn failed_work_settles_with_its_envelope() {
    let engine = engine(2);
    let settled = within(engine.resolve(WorkItem::function(|_| fail("boom"))).unwrap()).await;
    let envelope = match settled {
        Err(Rejected::Published(envelope)) => envelope,
        other => panic!("expected a published error, got {other:?}"),
    };
    assert!(envelope.value().is_none());
    assert_eq!(envelope.error().unwrap().to_string(), "boom");
}

#[tokio::test]
async fn admit_returns_the_resolvee_handle() {
    let engine = engine(1);
    let resolvee = engine.admit(WorkItem::value(5)).unwrap();
    let envelope = within(resolvee.result()).await.unwrap();
    assert_eq!(envelope.value(), Some(&5));
    assert_eq!(resolvee.resolutions(), 1);
}

// ---------------------------------------------------------------------------
// Concurrency and ordering
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn in_flight_never_exceeds_concurrency() {
    let engine = engine(2);
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let tickets: Vec<_> = (0..6)
        .map(|n| {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            engine
                .resolve(WorkItem::function(move |_| async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(n)
                }))
                .unwrap()
        })
        .collect();

    for ticket in tickets {
        within(ticket).await.unwrap();
    }
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(engine.get_metadata().in_flight <= 2);
}

#[tokio::test]
async fn single_lane_resolves_in_admission_order() {
    let engine = engine(1);
    let order = Arc::new(Mutex::new(Vec::new()));

    let tickets: Vec<_> = (0..5)
        .map(|n| {
            let order = Arc::clone(&order);
            engine
                .resolve(WorkItem::function(move |_| async move {
                    order.lock().unwrap().push(n);
                    Ok(n)
                }))
                .unwrap()
        })
        .collect();

    for ticket in tickets {
        within(ticket).await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn functions_receive_the_previous_result() {
    let engine = engine(1);
    let first = engine.resolve(WorkItem::function(|_| async { Ok(1) })).unwrap();
    let tickets: Vec<_> = (0..2)
        .map(|_| {
            engine
                .resolve(WorkItem::function(|previous: Option<ResultEnvelope<i32>>| async move {
                    let previous = previous.and_then(|p| p.value().copied()).unwrap_or(0);
                    Ok(previous + 1)
                }))
                .unwrap()
        })
        .collect();

    assert_eq!(within(first).await.unwrap().value(), Some(&1));
    let mut values = Vec::new();
    for ticket in tickets {
        values.push(*within(ticket).await.unwrap().value().unwrap());
    }
    assert_eq!(values, vec![2, 3]);
}

#[tokio::test]
async fn mixed_outcomes_are_counted_per_bucket() {
    let engine = engine(2);
    let tickets: Vec<_> = (0..10)
        .map(|n| {
            let item = if n % 2 == 0 {
                WorkItem::function(|_| fail("even"))
            } else {
                WorkItem::function(move |_| async move { Ok(n) })
            };
            engine.resolve(item).unwrap()
        })
        .collect();

    let mut errors = 0;
    for ticket in tickets {
        if within(ticket).await.is_err() {
            errors += 1;
        }
    }
    assert_eq!(errors, 5);

    let metadata = engine.get_metadata();
    assert_eq!(metadata.total_queued, 10);
    assert_eq!(metadata.queued, 0);
    assert_eq!(metadata.in_flight, 0);
    assert_eq!(metadata.metrics.success.count, 5);
    assert_eq!(metadata.metrics.error.count, 5);
    assert_eq!(metadata.metrics.success.time_resolving.samples, 5);
    assert!(metadata.metrics.error.time_in_queue.min_ms.is_finite());
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn next_is_served_in_call_order() {
    let engine = engine(1);
    let first = engine.next_resolved();
    let second = engine.next_resolved();

    engine.resolve(WorkItem::value(1)).unwrap();
    engine.resolve(WorkItem::value(2)).unwrap();

    assert_eq!(within(first).await.unwrap().value(), Some(&1));
    assert_eq!(within(second).await.unwrap().value(), Some(&2));
}

#[tokio::test]
async fn queued_and_resolved_listeners_fire() {
    let engine = engine(2);
    let queued = Arc::new(AtomicUsize::new(0));
    let resolved = Arc::new(AtomicUsize::new(0));
    {
        let queued = Arc::clone(&queued);
        engine.on(Event::Queued, move |_| {
            queued.fetch_add(1, Ordering::SeqCst);
        });
        let resolved = Arc::clone(&resolved);
        engine.on(Event::Resolved, move |_| {
            resolved.fetch_add(1, Ordering::SeqCst);
        });
    }

    let ok = engine.resolve(WorkItem::value(1)).unwrap();
    let err = engine.resolve(WorkItem::function(|_| fail("x"))).unwrap();
    within(ok).await.unwrap();
    assert!(within(err).await.is_err());

    assert_eq!(queued.load(Ordering::SeqCst), 2);
    assert_eq!(resolved.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn set_complete_publishes_completed() {
    let engine = engine(1);
    let completed = engine.once(Event::Completed);
    assert!(!engine.is_complete());

    engine.set_complete();
    assert!(matches!(within(completed).await, Ok(Notice::Completed)));
    assert!(engine.is_complete());

    // The queue keeps working after completion.
    let envelope = within(engine.resolve(WorkItem::value(3)).unwrap()).await.unwrap();
    assert_eq!(envelope.value(), Some(&3));
}

#[tokio::test(start_paused = true)]
async fn inactivity_timer_keeps_refreshing() {
    let engine = engine(1);
    let refreshes = counter(&engine, Event::Refresh);
    engine.refresh();
    tokio::time::sleep(Duration::from_millis(350)).await;
    // One requested pass plus one per elapsed 100 ms period.
    assert_eq!(refreshes.load(Ordering::SeqCst), 4);
}

#[tokio::test(start_paused = true)]
async fn refresh_requests_coalesce() {
    let engine: Engine<i32> =
        Engine::new(EngineConfig::new("quiet").inactivity_refresh(None)).unwrap();
    let refreshes = counter(&engine, Event::Refresh);

    for _ in 0..50 {
        engine.refresh();
    }
    settle().await;
    assert_eq!(refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn disabled_inactivity_timer_stays_quiet() {
    let engine: Engine<i32> =
        Engine::new(EngineConfig::new("quiet").inactivity_refresh(None)).unwrap();
    let refreshes = counter(&engine, Event::Refresh);

    engine.refresh();
    settle().await;
    assert_eq!(refreshes.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_millis(450)).await;
    settle().await;
    assert_eq!(refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn once_with_fires_its_callback_once() {
    let engine = engine(1);
    let calls = Arc::new(AtomicUsize::new(0));
    let completed = {
        let calls = Arc::clone(&calls);
        engine.once_with(Event::Completed, move |delivery| {
            assert!(matches!(delivery, Ok(Notice::Completed)));
            calls.fetch_add(1, Ordering::SeqCst);
        })
    };

    engine.set_complete();
    engine.set_complete();
    assert!(matches!(within(completed).await, Ok(Notice::Completed)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// Gating
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn active_mode_resolves_only_on_demand() {
    let engine: Engine<i32> =
        Engine::new(EngineConfig::new("pull").concurrency(4).mode(Mode::Active)).unwrap();
    for n in 1..=3 {
        engine.resolve(WorkItem::value(n)).unwrap();
    }

    settle().await;
    let metadata = engine.get_metadata();
    assert_eq!(metadata.queued, 3);
    assert_eq!(metadata.metrics.resolved(), 0);

    let envelope = within(engine.next_resolved()).await.unwrap();
    assert_eq!(envelope.value(), Some(&1));

    settle().await;
    let metadata = engine.get_metadata();
    assert_eq!(metadata.queued, 2);
    assert_eq!(metadata.metrics.resolved(), 1);
}

#[tokio::test(start_paused = true)]
async fn pause_holds_the_queue_until_resume() {
    let engine = engine(2);
    engine.pause();
    let first = engine.resolve(WorkItem::value(1)).unwrap();
    let second = engine.resolve(WorkItem::value(2)).unwrap();

    settle().await;
    let metadata = engine.get_metadata();
    assert!(metadata.paused);
    assert_eq!(metadata.queued, 2);
    assert_eq!(metadata.metrics.resolved(), 0);

    engine.resume();
    assert_eq!(within(first).await.unwrap().value(), Some(&1));
    assert_eq!(within(second).await.unwrap().value(), Some(&2));
}

#[tokio::test(start_paused = true)]
async fn resolve_conditional_gates_resolution() {
    let engine = engine(2);
    let open = Arc::new(AtomicBool::new(false));
    let gate = {
        let open = Arc::clone(&open);
        engine.add_conditional(Action::Resolve, move |_| open.load(Ordering::SeqCst))
    };

    let ticket = engine.resolve(WorkItem::value(9)).unwrap();
    settle().await;
    assert_eq!(engine.get_metadata().queued, 1);

    open.store(true, Ordering::SeqCst);
    engine.refresh();
    assert_eq!(within(ticket).await.unwrap().value(), Some(&9));

    assert!(engine.remove_conditional(Action::Resolve, gate));
    assert!(!engine.remove_conditional(Action::Resolve, gate));
}

#[tokio::test(start_paused = true)]
async fn refresh_conditional_suppresses_refresh_events() {
    let engine = engine(2);
    let gate = engine.add_conditional(Action::Refresh, |_| false);
    let refreshes = Arc::new(AtomicUsize::new(0));
    {
        let refreshes = Arc::clone(&refreshes);
        engine.on(Event::Refresh, move |_| {
            refreshes.fetch_add(1, Ordering::SeqCst);
        });
    }

    engine.resolve(WorkItem::value(1)).unwrap();
    settle().await;
    assert_eq!(refreshes.load(Ordering::SeqCst), 0);
    assert_eq!(engine.get_metadata().queued, 1);

    let next = engine.next_resolved();
    assert!(engine.remove_conditional(Action::Refresh, gate));
    within(next).await.unwrap();
    assert!(refreshes.load(Ordering::SeqCst) > 0);
}

#[tokio::test]
async fn conditionals_can_inspect_the_engine() {
    let engine = engine(4);
    // Only one resolution at a time, regardless of the ceiling.
    engine.add_conditional(Action::Resolve, |engine| engine.get_metadata().in_flight == 0);
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let tickets: Vec<_> = (0..4)
        .map(|n| {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            engine
                .resolve(WorkItem::function(move |_| async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(n)
                }))
                .unwrap()
        })
        .collect();

    for ticket in tickets {
        within(ticket).await.unwrap();
    }
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn withdrawn_items_never_resolve() {
    let engine = engine(1);
    engine.pause();
    let resolvee = engine.admit(WorkItem::value(1)).unwrap();
    let kept = engine.resolve(WorkItem::value(2)).unwrap();

    assert!(engine.is_queued(resolvee.id()));
    assert!(engine.withdraw(resolvee.id()));
    assert!(!engine.withdraw(resolvee.id()));
    assert!(!engine.is_queued(resolvee.id()));
    assert_eq!(engine.get_metadata().queued, 1);

    engine.resume();
    assert_eq!(within(kept).await.unwrap().value(), Some(&2));
    settle().await;
    assert_eq!(resolvee.resolutions(), 0);
    assert_eq!(engine.get_metadata().metrics.resolved(), 1);
}

#[tokio::test]
async fn metadata_serializes_to_json() {
    let engine = engine(3);
    within(engine.resolve(WorkItem::value(1)).unwrap()).await.unwrap();

    let json = serde_json::to_value(engine.get_metadata()).unwrap();
    assert_eq!(json["name"], "test");
    assert_eq!(json["concurrency"], 3);
    assert_eq!(json["mode"], "passive");
    assert_eq!(json["metrics"]["success"]["count"], 1);
}

// ---------------------------------------------------------------------------
// Pull source
// ---------------------------------------------------------------------------

fn finite_source(values: &[i32]) -> (Arc<Mutex<VecDeque<i32>>>, Arc<AtomicUsize>) {
    (
        Arc::new(Mutex::new(values.iter().copied().collect())),
        Arc::new(AtomicUsize::new(0)),
    )
}

#[tokio::test(start_paused = true)]
async fn pull_source_feeds_the_queue() {
    let engine = engine(1);
    let (items, _) = finite_source(&[1, 2, 3]);
    let nexts: Vec<_> = (0..3).map(|_| engine.next_resolved()).collect();

    engine.set_pull_source(move || items.lock().unwrap().pop_front().map(WorkItem::value));

    let mut values = Vec::new();
    for next in nexts {
        values.push(*within(next).await.unwrap().value().unwrap());
    }
    assert_eq!(values, vec![1, 2, 3]);
    assert_eq!(engine.get_metadata().total_queued, 3);
    assert!(engine.get_metadata().pulling);
    assert!(engine.clear_pull_source());
    assert!(!engine.clear_pull_source());
}

#[tokio::test(start_paused = true)]
async fn pull_conditional_bounds_the_queue() {
    let engine = engine(1);
    engine.pause_phase(Phase::Resolve);
    engine.add_conditional(Action::Pull, |engine| engine.get_metadata().queued < 2);

    let pulls = Arc::new(AtomicUsize::new(0));
    {
        let pulls = Arc::clone(&pulls);
        engine.set_pull_source(move || {
            let n = pulls.fetch_add(1, Ordering::SeqCst) as i32;
            Some(WorkItem::value(n))
        });
    }

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(pulls.load(Ordering::SeqCst), 2);
    let metadata = engine.get_metadata();
    assert_eq!(metadata.queued, 2);
    assert!(metadata.resolve_paused);
    assert!(!metadata.pull_paused);
    assert_eq!(metadata.metrics.resolved(), 0);
}

#[tokio::test(start_paused = true)]
async fn paused_pull_phase_stops_pulling_only() {
    let engine = engine(2);
    engine.pause_phase(Phase::Pull);
    assert!(engine.is_paused(Phase::Pull));
    assert!(!engine.is_paused(Phase::Resolve));

    let (items, calls) = finite_source(&[10]);
    {
        let calls = Arc::clone(&calls);
        engine.set_pull_source(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            items.lock().unwrap().pop_front().map(WorkItem::value)
        });
    }

    // Direct admission still resolves.
    let direct = engine.resolve(WorkItem::value(1)).unwrap();
    assert_eq!(within(direct).await.unwrap().value(), Some(&1));
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let next = engine.next_resolved();
    engine.resume_phase(Phase::Pull);
    assert_eq!(within(next).await.unwrap().value(), Some(&10));
}

#[tokio::test(start_paused = true)]
async fn whole_engine_pause_covers_every_phase() {
    let engine = engine(1);
    engine.pause_phase(Phase::Resolve);
    engine.pause();
    assert!(engine.is_paused(Phase::Pull));
    assert!(engine.is_paused(Phase::Resolve));

    engine.resume();
    assert!(!engine.is_paused(Phase::Pull));
    // The phase pause outlives the whole-engine resume.
    assert!(engine.is_paused(Phase::Resolve));

    let ticket = engine.resolve(WorkItem::value(4)).unwrap();
    settle().await;
    assert_eq!(engine.get_metadata().queued, 1);

    engine.resume_phase(Phase::Resolve);
    assert_eq!(within(ticket).await.unwrap().value(), Some(&4));
}
