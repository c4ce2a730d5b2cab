use super::*;
use crate::keys::PlaintextKeys;
use crate::repository::{InMemoryRegistrations, RepositoryError};
use crate::test_utils::{make_event, make_registration, RecordingSenders, SLOW_SEND};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};

struct Harness {
    repo: Arc<InMemoryRegistrations>,
    senders: RecordingSenders,
    dispatcher: Dispatcher,
}

fn harness(registrations: Vec<Registration>) -> Harness {
    let repo = Arc::new(InMemoryRegistrations::with_registrations(registrations));
    let senders = RecordingSenders::new();
    let ctx = WorkerContext::new(Arc::new(PlaintextKeys), Arc::new(senders.clone()));
    let dispatcher = Dispatcher::new(repo.clone(), ctx, Duration::from_millis(10));
    Harness {
        repo,
        senders,
        dispatcher,
    }
}

async fn wait_for(mut done: impl FnMut() -> bool) {
    for _ in 0..200 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Fails the first `failures` list calls.
struct FlakyRepository {
    failures: usize,
    calls: AtomicUsize,
    inner: InMemoryRegistrations,
}

#[async_trait]
impl RegistrationRepository for FlakyRepository {
    async fn list(&self) -> crate::repository::Result<Vec<Registration>> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(RepositoryError::Unavailable("starting".to_string()));
        }
        self.inner.list().await
    }

    async fn by_name(&self, name: &str) -> crate::repository::Result<Registration> {
        self.inner.by_name(name).await
    }
}

#[tokio::test]
async fn test_startup_skips_rejected_registrations() {
    let mut h = harness(vec![
        make_registration("good", "sink-a", &[]),
        make_registration("bad", "reject", &[]),
    ]);

    h.dispatcher.startup().await;

    assert_eq!(h.dispatcher.live_workers(), vec!["good"]);
}

#[tokio::test]
async fn test_startup_retries_until_store_ready() {
    let repo = Arc::new(FlakyRepository {
        failures: 3,
        calls: AtomicUsize::new(0),
        inner: InMemoryRegistrations::with_registrations([make_registration("r1", "sink", &[])]),
    });
    let ctx = WorkerContext::new(Arc::new(PlaintextKeys), Arc::new(RecordingSenders::new()));
    let mut dispatcher = Dispatcher::new(repo.clone(), ctx, Duration::from_millis(5));

    dispatcher.startup().await;

    assert_eq!(repo.calls.load(Ordering::SeqCst), 4);
    assert_eq!(dispatcher.live_workers(), vec!["r1"]);
}

#[tokio::test]
async fn test_add_update_delete_lifecycle() {
    let mut h = harness(vec![]);
    h.dispatcher.startup().await;

    h.repo
        .upsert(make_registration("R1", "old-sink", &["therm-1"]))
        .await;
    h.dispatcher.handle_notification(NotifyUpdate::add("R1")).await;
    assert_eq!(h.dispatcher.live_workers(), vec!["R1"]);

    h.dispatcher
        .dispatch_event(Arc::new(make_event("e1", "therm-1", "temp", "1")))
        .await;
    wait_for(|| h.senders.log.total() == 1).await;

    h.repo
        .upsert(make_registration("R1", "new-sink", &["therm-1"]))
        .await;
    h.dispatcher
        .handle_notification(NotifyUpdate::update("R1"))
        .await;
    h.dispatcher
        .dispatch_event(Arc::new(make_event("e2", "therm-1", "temp", "2")))
        .await;
    wait_for(|| h.senders.log.total() == 2).await;

    h.dispatcher
        .handle_notification(NotifyUpdate::delete("R1"))
        .await;
    assert!(h.dispatcher.live_workers().is_empty());
    h.dispatcher
        .dispatch_event(Arc::new(make_event("e3", "therm-1", "temp", "3")))
        .await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    let delivered = h.senders.log.for_registration("R1");
    let sinks: Vec<(&str, &str)> = delivered
        .iter()
        .map(|d| (d.event_id.as_str(), d.sink.as_str()))
        .collect();
    assert_eq!(sinks, vec![("e1", "old-sink"), ("e2", "new-sink")]);
}

#[tokio::test]
async fn test_lookup_misses_are_not_fatal() {
    let mut h = harness(vec![]);
    h.dispatcher.startup().await;

    h.dispatcher.handle_notification(NotifyUpdate::add("ghost")).await;
    h.dispatcher
        .handle_notification(NotifyUpdate::update("ghost"))
        .await;
    h.dispatcher
        .handle_notification(NotifyUpdate::delete("ghost"))
        .await;

    assert!(h.dispatcher.live_workers().is_empty());
}

#[tokio::test]
async fn test_failed_rebuild_worker_is_reaped_on_next_event() {
    let mut h = harness(vec![
        make_registration("r1", "sink-a", &[]),
        make_registration("r2", "sink-b", &[]),
    ]);
    h.dispatcher.startup().await;

    h.repo.upsert(make_registration("r1", "reject", &[])).await;
    h.dispatcher
        .handle_notification(NotifyUpdate::update("r1"))
        .await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    h.dispatcher
        .dispatch_event(Arc::new(make_event("e1", "d", "t", "1")))
        .await;

    assert_eq!(h.dispatcher.live_workers(), vec!["r2"]);
    wait_for(|| h.senders.log.total() == 1).await;
    assert_eq!(h.senders.log.for_registration("r2").len(), 1);
}

#[tokio::test]
async fn test_duplicate_add_replaces_worker() {
    let mut h = harness(vec![make_registration("r1", "sink-a", &[])]);
    h.dispatcher.startup().await;

    h.repo.upsert(make_registration("r1", "sink-b", &[])).await;
    h.dispatcher.handle_notification(NotifyUpdate::add("r1")).await;
    assert_eq!(h.dispatcher.live_workers(), vec!["r1"]);

    h.dispatcher
        .dispatch_event(Arc::new(make_event("e1", "d", "t", "1")))
        .await;
    wait_for(|| h.senders.log.total() == 1).await;
    assert_eq!(h.senders.log.for_registration("r1")[0].sink, "sink-b");
}

#[tokio::test]
async fn test_run_returns_error_on_fatal() {
    let h = harness(vec![make_registration("r1", "sink-a", &[])]);
    let (_events_tx, events_rx) = mpsc::channel(1);
    let (_notify_tx, notify_rx) = mpsc::channel(2);
    let (fatal_tx, fatal_rx) = mpsc::channel(1);

    let run = tokio::spawn(h.dispatcher.run(events_rx, notify_rx, fatal_rx));
    fatal_tx
        .send("notification listener died".into())
        .await
        .unwrap();

    let result = run.await.unwrap();
    assert!(matches!(result, Err(DispatchError::Fatal(_))));
}

#[tokio::test]
async fn test_run_stops_cleanly_when_events_close() {
    let h = harness(vec![make_registration("r1", "sink-a", &[])]);
    let senders = h.senders.clone();
    let (events_tx, events_rx) = mpsc::channel(1);
    let (_notify_tx, notify_rx) = mpsc::channel(2);
    let (_fatal_tx, fatal_rx) = mpsc::channel::<FatalError>(1);

    let run = tokio::spawn(h.dispatcher.run(events_rx, notify_rx, fatal_rx));
    events_tx
        .send(Arc::new(make_event("e1", "d", "t", "1")))
        .await
        .unwrap();
    wait_for(|| senders.log.total() == 1).await;
    drop(events_tx);

    assert!(run.await.unwrap().is_ok());
    assert_eq!(senders.log.total(), 1);
}

#[tokio::test]
async fn test_fatal_error_terminates_workers_before_queued_events() {
    let h = harness(vec![make_registration("r1", "slow", &[])]);
    let senders = h.senders.clone();
    let (events_tx, events_rx) = mpsc::channel(1);
    let (_notify_tx, notify_rx) = mpsc::channel(2);
    let (fatal_tx, fatal_rx) = mpsc::channel(1);

    let run = tokio::spawn(h.dispatcher.run(events_rx, notify_rx, fatal_rx));
    events_tx
        .send(Arc::new(make_event("e1", "d", "t", "1")))
        .await
        .unwrap();
    // e1 is now held inside the slow send; e2 waits in the worker's queue.
    wait_for(|| senders.log.total() == 1).await;
    events_tx
        .send(Arc::new(make_event("e2", "d", "t", "2")))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    fatal_tx
        .send("notification listener died".into())
        .await
        .unwrap();
    let result = tokio::time::timeout(SLOW_SEND, run)
        .await
        .expect("dispatch loop does not wait for busy workers")
        .unwrap();
    assert!(matches!(result, Err(DispatchError::Fatal(_))));

    // The worker exits once its in-flight send returns, dropping its sender.
    wait_for(|| senders.log.released("r1") == 1).await;
    assert_eq!(senders.log.released("r1"), 1);
    let ids: Vec<String> = senders
        .log
        .for_registration("r1")
        .into_iter()
        .map(|d| d.event_id)
        .collect();
    assert_eq!(ids, vec!["e1"]);
}

#[tokio::test]
async fn test_shutdown_does_not_wait_for_busy_workers() {
    let mut h = harness(vec![make_registration("r1", "slow", &[])]);
    h.dispatcher.startup().await;
    h.dispatcher
        .dispatch_event(Arc::new(make_event("e1", "d", "t", "1")))
        .await;
    wait_for(|| h.senders.log.total() == 1).await;
    h.dispatcher
        .dispatch_event(Arc::new(make_event("e2", "d", "t", "2")))
        .await;

    let started = tokio::time::Instant::now();
    h.dispatcher.shutdown();
    assert!(started.elapsed() < SLOW_SEND / 2);
    assert!(h.dispatcher.live_workers().is_empty());

    wait_for(|| h.senders.log.released("r1") == 1).await;
    assert_eq!(h.senders.log.released("r1"), 1);
    assert_eq!(h.senders.log.total(), 1);
}

#[tokio::test]
async fn test_disabled_registration_receives_nothing_through_run() {
    let mut disabled = make_registration("off", "sink-a", &[]);
    disabled.enable = false;
    let h = harness(vec![disabled, make_registration("on", "sink-b", &[])]);
    let senders = h.senders.clone();
    let (events_tx, events_rx) = mpsc::channel(1);
    let (_notify_tx, notify_rx) = mpsc::channel(2);
    let (_fatal_tx, fatal_rx) = mpsc::channel::<FatalError>(1);

    let run = tokio::spawn(h.dispatcher.run(events_rx, notify_rx, fatal_rx));
    for id in ["e1", "e2"] {
        events_tx
            .send(Arc::new(make_event(id, "d", "t", "1")))
            .await
            .unwrap();
    }
    wait_for(|| senders.log.total() == 2).await;
    drop(events_tx);
    assert!(run.await.unwrap().is_ok());

    assert_eq!(senders.log.for_registration("on").len(), 2);
    assert!(senders.log.for_registration("off").is_empty());
}
