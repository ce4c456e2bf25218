//! Fail-fast state machine scenarios under paused time.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tether::backoff::Backoff;
use tether::error::{Error, ErrorKind};
use tether::factory::{ClientConnection, Service, ServiceFactory, SharedFactory, Svc, SvcFuture};
use tether::failfast::{FailFastConfig, FailFastFactory};

struct NoopService;

impl Service<()> for NoopService {
    type Response = ();

    fn call(&mut self, _req: ()) -> BoxFuture<'static, Result<(), Error>> {
        Box::pin(std::future::ready(Ok(())))
    }
}

/// An endpoint that can be flipped between connecting and refusing.
#[derive(Default)]
struct FlakyEndpoint {
    failing: AtomicBool,
    acquires: AtomicUsize,
    closes: AtomicUsize,
}

impl FlakyEndpoint {
    fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn acquires(&self) -> usize {
        self.acquires.load(Ordering::SeqCst)
    }

    fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl ServiceFactory<()> for FlakyEndpoint {
    type Response = ();

    fn acquire(&self, _conn: ClientConnection) -> SvcFuture<(), ()> {
        self.acquires.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            Box::pin(std::future::ready(Err(Error::downstream(
                std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
            ))))
        } else {
            Box::pin(std::future::ready(Ok(Box::new(NoopService) as Svc<(), ()>)))
        }
    }

    fn close(&self, _deadline: Instant) -> BoxFuture<'static, ()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Box::pin(std::future::ready(()))
    }
}

fn fail_fast(
    endpoint: &Arc<FlakyEndpoint>,
    backoffs: Backoff,
) -> FailFastFactory<(), ()> {
    let shared: SharedFactory<(), ()> = Arc::clone(endpoint) as SharedFactory<(), ()>;
    FailFastFactory::with_config(
        shared,
        FailFastConfig::builder()
            .backoffs(backoffs)
            .label("test-endpoint")
            .build(),
    )
}

/// Lets the observation worker and any probe tasks run without advancing
/// the paused clock.
async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn fail_fast_opens_and_recovers_via_probe() {
    let endpoint = Arc::new(FlakyEndpoint::default());
    let ff = fail_fast(&endpoint, Backoff::constant(Duration::from_secs(1)));

    // Call 1 reaches the endpoint and fails, marking it dead.
    endpoint.fail(true);
    let err = ff.acquire(ClientConnection::none()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Downstream);
    settle().await;
    assert!(ff.status().retrying);
    assert_eq!(ff.marked_dead(), 1);
    assert!(!ff.is_available());
    let touched = endpoint.acquires();

    // Within the backoff window acquisitions are rejected without
    // touching the endpoint.
    for _ in 0..3 {
        let err = ff.acquire(ClientConnection::none()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EndpointMarkedDown);
    }
    assert_eq!(endpoint.acquires(), touched);

    // After the first timer tick the probe succeeds and revives the
    // endpoint.
    endpoint.fail(false);
    tokio::time::sleep(Duration::from_millis(1100)).await;
    settle().await;
    assert!(!ff.status().retrying);
    assert_eq!(ff.marked_available(), 1);
    assert_eq!(endpoint.acquires(), touched + 1);

    // The next caller-initiated acquisition reaches the endpoint.
    let svc = ff.acquire(ClientConnection::none()).await.unwrap();
    svc.close().await;
    assert_eq!(endpoint.acquires(), touched + 2);
    assert!(ff.is_available());
}

#[tokio::test(start_paused = true)]
async fn exhausted_schedule_optimistically_revives() {
    let endpoint = Arc::new(FlakyEndpoint::default());
    let ff = fail_fast(
        &endpoint,
        Backoff::from_durations([Duration::from_millis(100)]),
    );

    endpoint.fail(true);
    let _ = ff.acquire(ClientConnection::none()).await;
    settle().await;
    assert!(ff.status().retrying);

    // The single probe fails; with the schedule exhausted the endpoint
    // becomes available again so live traffic takes over probing.
    tokio::time::sleep(Duration::from_millis(150)).await;
    settle().await;
    let status = ff.status();
    assert!(!status.retrying);
    assert_eq!(status.tries, 0);
    assert_eq!(status.unhealthy_for, None);
    assert_eq!(ff.marked_available(), 0, "optimistic revival is not counted");
    assert_eq!(endpoint.acquires(), 2); // initial failure + one probe

    // Traffic reaches the endpoint again (and fails, restarting the
    // cycle).
    let err = ff.acquire(ClientConnection::none()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Downstream);
    assert_eq!(endpoint.acquires(), 3);
    settle().await;
    assert_eq!(ff.marked_dead(), 2);
}

#[tokio::test(start_paused = true)]
async fn retry_window_is_monotonic_until_exhaustion() {
    let endpoint = Arc::new(FlakyEndpoint::default());
    let wait = Duration::from_millis(100);
    let ff = fail_fast(&endpoint, Backoff::from_durations([wait; 4]));

    endpoint.fail(true);
    let _ = ff.acquire(ClientConnection::none()).await;
    settle().await;
    assert!(ff.status().retrying);

    // Each failed probe consumes one scheduled wait; tries climbs
    // monotonically and the unhealthy window only grows.
    let mut last_unhealthy = Duration::ZERO;
    for expected_tries in 1..=3u32 {
        tokio::time::sleep(wait).await;
        settle().await;
        let status = ff.status();
        assert!(status.retrying);
        assert_eq!(status.tries, expected_tries);
        let unhealthy = status.unhealthy_for.expect("still unhealthy");
        assert!(unhealthy >= last_unhealthy);
        last_unhealthy = unhealthy;
    }

    // The fourth probe failure exhausts the schedule.
    tokio::time::sleep(wait).await;
    settle().await;
    assert!(!ff.status().retrying);
    assert_eq!(ff.marked_dead(), 1);
    assert_eq!(ff.marked_available(), 0);
    // One failed caller acquisition plus exactly four probes.
    assert_eq!(endpoint.acquires(), 5);
}

#[tokio::test(start_paused = true)]
async fn success_during_retry_window_requires_a_probe() {
    let endpoint = Arc::new(FlakyEndpoint::default());
    let ff = fail_fast(&endpoint, Backoff::constant(Duration::from_secs(1)));

    endpoint.fail(true);
    let _ = ff.acquire(ClientConnection::none()).await;
    settle().await;
    assert!(ff.status().retrying);

    // Recovering the endpoint alone changes nothing until the probe runs;
    // callers keep being rejected.
    endpoint.fail(false);
    let err = ff.acquire(ClientConnection::none()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EndpointMarkedDown);
    assert_eq!(endpoint.acquires(), 1);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    settle().await;
    assert!(ff.acquire(ClientConnection::none()).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn close_stops_the_state_machine_and_closes_the_endpoint() {
    let endpoint = Arc::new(FlakyEndpoint::default());
    let ff = fail_fast(&endpoint, Backoff::constant(Duration::from_secs(1)));

    endpoint.fail(true);
    let _ = ff.acquire(ClientConnection::none()).await;
    settle().await;
    assert!(ff.status().retrying);

    ff.close(Instant::now()).await;
    settle().await;
    assert_eq!(endpoint.closes(), 1);
    assert!(!ff.status().retrying);

    // With the worker stopped, no probe ever fires again.
    let probes_before = endpoint.acquires();
    tokio::time::sleep(Duration::from_secs(10)).await;
    settle().await;
    assert_eq!(endpoint.acquires(), probes_before);
}
