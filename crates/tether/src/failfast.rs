//! Per-endpoint fail-fast: mark an endpoint dead on connection failure,
//! probe it in the background, and short-circuit acquisitions meanwhile.
//!
//! A [`FailFastFactory`] wraps one endpoint factory. On a failed
//! acquisition the endpoint is marked dead: new acquisitions fail
//! immediately with [`Error::EndpointMarkedDown`] instead of piling onto a
//! struggling endpoint, and a background loop probes the endpoint on a
//! jittered backoff schedule until a probe succeeds. Once the schedule is
//! exhausted (finite schedules only) the endpoint optimistically becomes
//! available again, since at that point live traffic is a better signal
//! than more probing.
//!
//! Layers above recognise the rejection by its kind and route around the
//! endpoint rather than counting a request failure.
//!
//! # Operational notes
//!
//! An endpoint stuck in the retrying state shows up as:
//!
//! - `failfast_marked_dead` / `failfast_marked_available` counters,
//! - `failfast_unhealthy_for_ms` / `failfast_unhealthy_num_tries` gauges,
//!
//! all labelled with the endpoint, and as a non-zero
//! [`FailFastFactory::status`]. Persistent flapping usually means the
//! endpoint accepts connections and then fails them, which this layer
//! cannot distinguish from load; look at the endpoint itself first.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backoff::Backoff;
use crate::error::Error;
use crate::events::{EventListener, EventListeners};
use crate::factory::{ClientConnection, ServiceFactory, SharedFactory, SvcFuture};

/// Lifecycle events emitted by a [`FailFastFactory`].
#[derive(Debug, Clone)]
pub enum FailFastEvent {
    MarkedDead { label: String },
    ProbeFailed { label: String, ntries: u32 },
    Revived { label: String, optimistic: bool },
    Closed { label: String },
}

/// Configuration for a [`FailFastFactory`].
pub struct FailFastConfig {
    backoffs: Backoff,
    label: String,
    listeners: EventListeners<FailFastEvent>,
}

impl Default for FailFastConfig {
    fn default() -> Self {
        FailFastConfig::builder().build()
    }
}

impl FailFastConfig {
    pub fn builder() -> FailFastConfigBuilder {
        FailFastConfigBuilder {
            backoffs: Backoff::default_connect(),
            label: "endpoint".to_string(),
            listeners: EventListeners::new(),
        }
    }
}

/// Builder for [`FailFastConfig`].
pub struct FailFastConfigBuilder {
    backoffs: Backoff,
    label: String,
    listeners: EventListeners<FailFastEvent>,
}

impl FailFastConfigBuilder {
    /// The probe schedule consumed while the endpoint is dead.
    pub fn backoffs(mut self, backoffs: Backoff) -> Self {
        self.backoffs = backoffs;
        self
    }

    /// The endpoint label used in metrics and events.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn on_event<L>(mut self, listener: L) -> Self
    where
        L: EventListener<FailFastEvent> + 'static,
    {
        self.listeners.add(listener);
        self
    }

    pub fn build(self) -> FailFastConfig {
        FailFastConfig {
            backoffs: self.backoffs,
            label: self.label,
            listeners: self.listeners,
        }
    }
}

/// A point-in-time view of the endpoint's health state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailFastStatus {
    pub retrying: bool,
    /// Time spent in the retrying state; `None` when healthy.
    pub unhealthy_for: Option<Duration>,
    /// Completed backoff rounds in the current retrying window.
    pub tries: u32,
}

/// Observations fed to the state machine. All transitions are applied by
/// a single worker draining these in arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Observation {
    Fail,
    Success,
    Timeout,
    TimeoutFail,
    Close,
}

/// The state published to readers. The worker is the only writer; a
/// stale read is acceptable because every transition is followed by
/// further observations that converge behaviour.
struct Mirror {
    epoch: Instant,
    retrying: AtomicBool,
    tries: AtomicU32,
    since_ms: AtomicU64,
    marked_dead: AtomicU64,
    marked_available: AtomicU64,
}

impl Mirror {
    fn new() -> Mirror {
        Mirror {
            epoch: Instant::now(),
            retrying: AtomicBool::new(false),
            tries: AtomicU32::new(0),
            since_ms: AtomicU64::new(0),
            marked_dead: AtomicU64::new(0),
            marked_available: AtomicU64::new(0),
        }
    }

    fn is_retrying(&self) -> bool {
        self.retrying.load(Ordering::Acquire)
    }

    fn set_retrying(&self, since: Instant, tries: u32) {
        self.since_ms.store(
            since.saturating_duration_since(self.epoch).as_millis() as u64,
            Ordering::Relaxed,
        );
        self.tries.store(tries, Ordering::Relaxed);
        self.retrying.store(true, Ordering::Release);
    }

    fn set_tries(&self, tries: u32) {
        self.tries.store(tries, Ordering::Relaxed);
    }

    fn set_ok(&self) {
        self.retrying.store(false, Ordering::Release);
        self.tries.store(0, Ordering::Relaxed);
        self.since_ms.store(0, Ordering::Relaxed);
    }

    fn status(&self) -> FailFastStatus {
        if !self.is_retrying() {
            return FailFastStatus {
                retrying: false,
                unhealthy_for: None,
                tries: 0,
            };
        }
        let since = Duration::from_millis(self.since_ms.load(Ordering::Relaxed));
        FailFastStatus {
            retrying: true,
            unhealthy_for: Some(self.epoch.elapsed().saturating_sub(since)),
            tries: self.tries.load(Ordering::Relaxed),
        }
    }
}

/// Wraps an endpoint factory with the fail-fast state machine.
///
/// Closing the factory is terminal and idempotent: it stops the state
/// machine, cancels any pending probe, and closes the wrapped factory.
pub struct FailFastFactory<Req, Rsp> {
    underlying: SharedFactory<Req, Rsp>,
    tx: mpsc::UnboundedSender<Observation>,
    mirror: Arc<Mirror>,
    _worker: JoinHandle<()>,
}

impl<Req, Rsp> FailFastFactory<Req, Rsp>
where
    Req: Send + 'static,
    Rsp: Send + 'static,
{
    /// Wraps `underlying` with the default connect schedule.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(underlying: SharedFactory<Req, Rsp>) -> Self {
        Self::with_config(underlying, FailFastConfig::default())
    }

    pub fn with_config(underlying: SharedFactory<Req, Rsp>, config: FailFastConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let mirror = Arc::new(Mirror::new());
        let worker = Worker {
            underlying: underlying.clone(),
            tx: tx.clone(),
            mirror: Arc::clone(&mirror),
            schedule: config.backoffs,
            label: config.label,
            listeners: config.listeners,
            state: WorkerState::Ok,
        };
        let handle = tokio::spawn(worker.run(rx));
        FailFastFactory {
            underlying,
            tx,
            mirror,
            _worker: handle,
        }
    }

    pub fn status(&self) -> FailFastStatus {
        self.mirror.status()
    }

    /// Total transitions into the retrying state.
    pub fn marked_dead(&self) -> u64 {
        self.mirror.marked_dead.load(Ordering::Relaxed)
    }

    /// Total probe-driven revivals (optimistic revivals excluded).
    pub fn marked_available(&self) -> u64 {
        self.mirror.marked_available.load(Ordering::Relaxed)
    }
}

impl<Req, Rsp> Drop for FailFastFactory<Req, Rsp> {
    fn drop(&mut self) {
        let _ = self.tx.send(Observation::Close);
    }
}

impl<Req, Rsp> ServiceFactory<Req> for FailFastFactory<Req, Rsp>
where
    Req: Send + 'static,
    Rsp: Send + 'static,
{
    type Response = Rsp;

    fn acquire(&self, conn: ClientConnection) -> SvcFuture<Req, Rsp> {
        if self.mirror.is_retrying() {
            return Box::pin(std::future::ready(Err(Error::EndpointMarkedDown)));
        }
        let fut = self.underlying.acquire(conn);
        let tx = self.tx.clone();
        let mirror = Arc::clone(&self.mirror);
        Box::pin(async move {
            match fut.await {
                Ok(svc) => {
                    if mirror.is_retrying() {
                        let _ = tx.send(Observation::Success);
                    }
                    Ok(svc)
                }
                Err(err) => {
                    let _ = tx.send(Observation::Fail);
                    Err(err)
                }
            }
        })
    }

    fn is_available(&self) -> bool {
        !self.mirror.is_retrying() && self.underlying.is_available()
    }

    fn close(&self, deadline: Instant) -> BoxFuture<'static, ()> {
        let _ = self.tx.send(Observation::Close);
        let underlying = self.underlying.clone();
        Box::pin(async move { underlying.close(deadline).await })
    }
}

enum WorkerState {
    Ok,
    Retrying {
        since: Instant,
        ntries: u32,
        rest: Backoff,
        timer: JoinHandle<()>,
        probe: Option<JoinHandle<()>>,
    },
}

struct Worker<Req, Rsp> {
    underlying: SharedFactory<Req, Rsp>,
    tx: mpsc::UnboundedSender<Observation>,
    mirror: Arc<Mirror>,
    schedule: Backoff,
    label: String,
    listeners: EventListeners<FailFastEvent>,
    state: WorkerState,
}

fn schedule_timer(tx: mpsc::UnboundedSender<Observation>, wait: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(wait).await;
        let _ = tx.send(Observation::Timeout);
    })
}

impl<Req, Rsp> Worker<Req, Rsp>
where
    Req: Send + 'static,
    Rsp: Send + 'static,
{
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Observation>) {
        while let Some(obs) = rx.recv().await {
            match obs {
                Observation::Fail => self.mark_dead(),
                Observation::Success => self.revive(false),
                Observation::Timeout => self.probe(),
                Observation::TimeoutFail => self.next_backoff(),
                Observation::Close => break,
            }
        }
        self.shutdown();
    }

    fn mark_dead(&mut self) {
        if matches!(self.state, WorkerState::Retrying { .. }) {
            return;
        }
        let mut rest = self.schedule.clone();
        let Some(wait) = rest.next() else {
            // An empty schedule leaves nothing to probe with; stay
            // available and let traffic keep reporting.
            return;
        };
        let since = Instant::now();
        let timer = schedule_timer(self.tx.clone(), wait);
        self.state = WorkerState::Retrying {
            since,
            ntries: 0,
            rest,
            timer,
            probe: None,
        };
        self.mirror.set_retrying(since, 0);
        self.mirror.marked_dead.fetch_add(1, Ordering::Relaxed);
        counter!("failfast_marked_dead", "endpoint" => self.label.clone()).increment(1);
        gauge!("failfast_unhealthy_num_tries", "endpoint" => self.label.clone()).set(0.0);
        tracing::info!(endpoint = %self.label, first_wait = ?wait, "marking endpoint dead");
        self.listeners.emit(&FailFastEvent::MarkedDead {
            label: self.label.clone(),
        });
    }

    fn revive(&mut self, optimistic: bool) {
        let prior = std::mem::replace(&mut self.state, WorkerState::Ok);
        let WorkerState::Retrying { timer, .. } = prior else {
            return;
        };
        timer.abort();
        // An in-flight probe finishes on its own; its late observations
        // are no-ops against the Ok state.
        self.mirror.set_ok();
        if !optimistic {
            self.mirror.marked_available.fetch_add(1, Ordering::Relaxed);
            counter!("failfast_marked_available", "endpoint" => self.label.clone()).increment(1);
        }
        gauge!("failfast_unhealthy_for_ms", "endpoint" => self.label.clone()).set(0.0);
        gauge!("failfast_unhealthy_num_tries", "endpoint" => self.label.clone()).set(0.0);
        tracing::info!(endpoint = %self.label, optimistic, "endpoint revived");
        self.listeners.emit(&FailFastEvent::Revived {
            label: self.label.clone(),
            optimistic,
        });
    }

    fn probe(&mut self) {
        let WorkerState::Retrying { probe, .. } = &mut self.state else {
            return;
        };
        let underlying = self.underlying.clone();
        let tx = self.tx.clone();
        *probe = Some(tokio::spawn(async move {
            match underlying.acquire(ClientConnection::none()).await {
                Ok(svc) => {
                    let _ = tx.send(Observation::Success);
                    svc.close().await;
                }
                Err(_) => {
                    let _ = tx.send(Observation::TimeoutFail);
                }
            }
        }));
    }

    fn next_backoff(&mut self) {
        let next = match &mut self.state {
            WorkerState::Retrying { rest, .. } => rest.next(),
            WorkerState::Ok => return,
        };
        let Some(wait) = next else {
            // The schedule is exhausted: optimistically become available
            // so external traffic takes over probing.
            self.revive(true);
            return;
        };
        let new_timer = schedule_timer(self.tx.clone(), wait);
        let (tries, since) = match &mut self.state {
            WorkerState::Retrying {
                ntries,
                since,
                timer,
                ..
            } => {
                *ntries += 1;
                let expired = std::mem::replace(timer, new_timer);
                expired.abort();
                self.mirror.set_tries(*ntries);
                (*ntries, *since)
            }
            WorkerState::Ok => {
                new_timer.abort();
                return;
            }
        };
        gauge!("failfast_unhealthy_for_ms", "endpoint" => self.label.clone())
            .set(since.elapsed().as_millis() as f64);
        gauge!("failfast_unhealthy_num_tries", "endpoint" => self.label.clone())
            .set(tries as f64);
        tracing::debug!(endpoint = %self.label, tries, next_wait = ?wait, "probe failed; backing off");
        self.listeners.emit(&FailFastEvent::ProbeFailed {
            label: self.label.clone(),
            ntries: tries,
        });
    }

    fn shutdown(&mut self) {
        if let WorkerState::Retrying { timer, probe, .. } =
            std::mem::replace(&mut self.state, WorkerState::Ok)
        {
            timer.abort();
            if let Some(probe) = probe {
                probe.abort();
            }
        }
        self.mirror.set_ok();
        tracing::debug!(endpoint = %self.label, "fail-fast state machine stopped");
        self.listeners.emit(&FailFastEvent::Closed {
            label: self.label.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirror_tracks_the_unhealthy_window() {
        let mirror = Mirror::new();
        assert_eq!(
            mirror.status(),
            FailFastStatus {
                retrying: false,
                unhealthy_for: None,
                tries: 0
            }
        );

        mirror.set_retrying(Instant::now(), 0);
        mirror.set_tries(3);
        let status = mirror.status();
        assert!(status.retrying);
        assert_eq!(status.tries, 3);
        assert!(status.unhealthy_for.is_some());

        mirror.set_ok();
        assert_eq!(mirror.status().unhealthy_for, None);
    }
}
