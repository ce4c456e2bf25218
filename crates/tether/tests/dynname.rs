//! Queueing, draining, failing, and cancelling against a reactive name.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::watch;

use tether::dynname::{DynNameFactory, FailureTracer, NewService};
use tether::error::{Error, ErrorKind};
use tether::factory::{ClientConnection, Service, ServiceFactory, Svc};
use tether::name::{BoundName, NameFault, NameId, NameState, Path};

struct NoopService;

impl Service<()> for NoopService {
    type Response = ();

    fn call(&mut self, _req: ()) -> BoxFuture<'static, Result<(), Error>> {
        Box::pin(std::future::ready(Ok(())))
    }
}

fn bound(id: &str) -> BoundName {
    BoundName::fixed(NameId::Str(Arc::from(id)), BTreeSet::new())
}

fn conn(tag: u16) -> ClientConnection {
    ClientConnection::to(format!("127.0.0.1:{tag}").parse().unwrap())
}

struct Harness {
    factory: DynNameFactory<(), ()>,
    name: watch::Sender<NameState>,
    /// `(name, connection tag)` per `new_service` invocation, in order.
    started: Arc<Mutex<Vec<(String, u16)>>>,
    traced: Arc<AtomicUsize>,
}

fn harness(initial: NameState) -> Harness {
    let (name, name_rx) = watch::channel(initial);
    let started: Arc<Mutex<Vec<(String, u16)>>> = Arc::default();
    let traced = Arc::new(AtomicUsize::new(0));

    let started2 = Arc::clone(&started);
    let new_service: NewService<(), ()> = Arc::new(move |name, conn| {
        let tag = conn.remote_addr.map(|a| a.port()).unwrap_or(0);
        started2.lock().push((name.render(), tag));
        Box::pin(std::future::ready(Ok(Box::new(NoopService) as Svc<(), ()>)))
    });

    let traced2 = Arc::clone(&traced);
    let on_failure: FailureTracer = Arc::new(move |_fault| {
        traced2.fetch_add(1, Ordering::SeqCst);
    });

    Harness {
        factory: DynNameFactory::new(name_rx, new_service, on_failure),
        name,
        started,
        traced,
    }
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn queued_acquisitions_drain_in_enqueue_order() {
    let h = harness(NameState::Pending);
    let first = h.factory.acquire(conn(1));
    let second = h.factory.acquire(conn(2));

    h.name.send(NameState::Bound(bound("n"))).unwrap();
    let (first, second) = tokio::join!(first, second);
    first.unwrap();
    second.unwrap();

    assert_eq!(
        *h.started.lock(),
        vec![("n".to_string(), 1), ("n".to_string(), 2)]
    );
    assert_eq!(h.traced.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn queued_acquisitions_fail_through_with_the_fault() {
    let h = harness(NameState::Pending);
    let first = h.factory.acquire(conn(1));
    let second = h.factory.acquire(conn(2));

    h.name
        .send(NameState::Failed(NameFault::msg("boom")))
        .unwrap();
    let (first, second) = tokio::join!(first, second);

    for result in [first, second] {
        match result {
            Err(Error::Naming(fault)) => assert_eq!(fault, NameFault::msg("boom")),
            other => panic!("expected the naming fault, got {other:?}"),
        }
    }
    assert!(h.started.lock().is_empty());
    assert_eq!(h.traced.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn queued_no_brokers_fault_surfaces_unwrapped() {
    let h = harness(NameState::Pending);
    let pending = h.factory.acquire(conn(1));
    let path = Path::read("/s/users").unwrap();
    h.name
        .send(NameState::Failed(NameFault::NoBrokers { path: path.clone() }))
        .unwrap();
    match pending.await {
        Err(Error::NoBrokersAvailable { path: p, .. }) => assert_eq!(p, path),
        other => panic!("expected NoBrokersAvailable, got {other:?}"),
    }
    assert_eq!(h.traced.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancelling_a_queued_acquisition_removes_only_that_entry() {
    let h = harness(NameState::Pending);
    let kept = h.factory.acquire(conn(1));
    let cancelled = h.factory.acquire(conn(2));
    drop(cancelled);

    h.name.send(NameState::Bound(bound("n"))).unwrap();
    kept.await.unwrap();
    settle().await;

    assert_eq!(*h.started.lock(), vec![("n".to_string(), 1)]);
    assert_eq!(
        h.traced.load(Ordering::SeqCst),
        0,
        "cancellation is not a naming failure"
    );
}

#[tokio::test]
async fn bound_name_serves_directly() {
    let h = harness(NameState::Bound(bound("ready")));
    h.factory.acquire(conn(7)).await.unwrap();
    assert_eq!(*h.started.lock(), vec![("ready".to_string(), 7)]);
    assert!(h.factory.is_available());
}

#[tokio::test]
async fn failed_name_fails_and_traces_each_acquisition() {
    let h = harness(NameState::Failed(NameFault::msg("down")));
    for _ in 0..2 {
        let err = h.factory.acquire(conn(1)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Naming);
    }
    assert_eq!(h.traced.load(Ordering::SeqCst), 2);
    assert!(!h.factory.is_available());
}

#[tokio::test]
async fn later_updates_rebind_the_name() {
    let h = harness(NameState::Bound(bound("old")));
    h.name.send(NameState::Bound(bound("new"))).unwrap();
    settle().await;
    h.factory.acquire(conn(1)).await.unwrap();
    assert_eq!(*h.started.lock(), vec![("new".to_string(), 1)]);
}

#[tokio::test]
async fn a_failure_can_recover_to_bound() {
    let h = harness(NameState::Failed(NameFault::msg("flap")));
    assert!(h.factory.acquire(conn(1)).await.is_err());

    h.name.send(NameState::Bound(bound("back"))).unwrap();
    settle().await;
    h.factory.acquire(conn(2)).await.unwrap();
    assert_eq!(*h.started.lock(), vec![("back".to_string(), 2)]);
}

#[tokio::test]
async fn close_fails_queued_and_future_acquisitions() {
    let h = harness(NameState::Pending);
    let queued = h.factory.acquire(conn(1));

    h.factory.close(Instant::now()).await;
    assert_eq!(queued.await.unwrap_err().kind(), ErrorKind::ServiceClosed);
    assert_eq!(
        h.factory
            .acquire(conn(2))
            .await
            .unwrap_err()
            .kind(),
        ErrorKind::ServiceClosed
    );
    assert!(!h.factory.is_available());

    // Updates after close are ignored.
    let _ = h.name.send(NameState::Bound(bound("late")));
    settle().await;
    assert!(h.started.lock().is_empty());
    assert_eq!(h.traced.load(Ordering::SeqCst), 0);
}
