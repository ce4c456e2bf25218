//! Bridging a reactive name to the synchronous acquisition interface.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use tether_name::{BoundName, NameFault, NameState, NameWatch};

use crate::error::Error;
use crate::factory::{ClientConnection, ServiceFactory, Svc, SvcFuture};

/// Starts a service on a bound name, typically a name cache's `acquire`.
pub type NewService<Req, Rsp> =
    Arc<dyn Fn(BoundName, ClientConnection) -> SvcFuture<Req, Rsp> + Send + Sync>;

/// Invoked once per acquisition that fails on a naming fault. Never
/// invoked for caller-initiated cancellation.
pub type FailureTracer = Arc<dyn Fn(&NameFault) + Send + Sync>;

/// Adapts a reactive name to [`ServiceFactory`].
///
/// While the name is pending, acquisitions queue; when it becomes bound,
/// the queue drains in arrival order through `new_service`; when it
/// fails, every queued acquisition fails with the fault. A queued caller
/// that drops its acquisition future is removed from the queue without
/// being counted as a naming failure.
pub struct DynNameFactory<Req, Rsp> {
    shared: Arc<Shared<Req, Rsp>>,
    subscription: JoinHandle<()>,
}

struct Shared<Req, Rsp> {
    state: Mutex<DynState<Req, Rsp>>,
    new_service: NewService<Req, Rsp>,
    on_failure: FailureTracer,
    next_waiter: AtomicU64,
}

enum DynState<Req, Rsp> {
    Pending(VecDeque<Waiter<Req, Rsp>>),
    Named(BoundName),
    Failed(NameFault),
    Closed,
}

struct Waiter<Req, Rsp> {
    id: u64,
    conn: ClientConnection,
    tx: oneshot::Sender<Result<Svc<Req, Rsp>, Error>>,
}

impl<Req, Rsp> DynNameFactory<Req, Rsp>
where
    Req: Send + 'static,
    Rsp: Send + 'static,
{
    /// Subscribes to `name` and serves acquisitions from its state.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(
        name: NameWatch,
        new_service: NewService<Req, Rsp>,
        on_failure: FailureTracer,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(DynState::Pending(VecDeque::new())),
            new_service,
            on_failure,
            next_waiter: AtomicU64::new(0),
        });

        let mut rx = name;
        shared.observe(rx.borrow_and_update().clone());

        let subscriber = Arc::clone(&shared);
        let subscription = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let next = rx.borrow_and_update().clone();
                subscriber.observe(next);
            }
        });

        DynNameFactory {
            shared,
            subscription,
        }
    }
}

impl<Req, Rsp> Drop for DynNameFactory<Req, Rsp> {
    fn drop(&mut self) {
        self.subscription.abort();
    }
}

impl<Req, Rsp> ServiceFactory<Req> for DynNameFactory<Req, Rsp>
where
    Req: Send + 'static,
    Rsp: Send + 'static,
{
    type Response = Rsp;

    fn acquire(&self, conn: ClientConnection) -> SvcFuture<Req, Rsp> {
        enum Step<Req, Rsp> {
            Queue(oneshot::Receiver<Result<Svc<Req, Rsp>, Error>>, u64),
            Start(BoundName),
            Fault(NameFault),
            Closed,
        }

        let mut conn = Some(conn);
        let step = {
            let mut state = self.shared.state.lock();
            match &mut *state {
                DynState::Pending(queue) => {
                    let id = self.shared.next_waiter.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = oneshot::channel();
                    queue.push_back(Waiter {
                        id,
                        conn: conn.take().expect("conn present"),
                        tx,
                    });
                    Step::Queue(rx, id)
                }
                DynState::Named(name) => Step::Start(name.clone()),
                DynState::Failed(fault) => Step::Fault(fault.clone()),
                DynState::Closed => Step::Closed,
            }
        };

        match step {
            Step::Start(name) => {
                (self.shared.new_service)(name, conn.take().expect("conn present"))
            }
            Step::Fault(fault) => {
                (self.shared.on_failure)(&fault);
                Box::pin(std::future::ready(Err(fault.into())))
            }
            Step::Closed => Box::pin(std::future::ready(Err(Error::ServiceClosed))),
            Step::Queue(rx, id) => Box::pin(QueuedAcquire {
                rx,
                shared: Arc::clone(&self.shared),
                guard: DequeueGuard {
                    shared: Arc::clone(&self.shared),
                    id,
                    armed: true,
                },
            }),
        }
    }

    fn is_available(&self) -> bool {
        matches!(
            &*self.shared.state.lock(),
            DynState::Pending(_) | DynState::Named(_)
        )
    }

    fn close(&self, _deadline: Instant) -> BoxFuture<'static, ()> {
        self.subscription.abort();
        let abandoned = {
            let mut state = self.shared.state.lock();
            match std::mem::replace(&mut *state, DynState::Closed) {
                DynState::Pending(queue) => queue,
                _ => VecDeque::new(),
            }
        };
        for waiter in abandoned {
            let _ = waiter.tx.send(Err(Error::ServiceClosed));
        }
        Box::pin(std::future::ready(()))
    }
}

impl<Req, Rsp> Shared<Req, Rsp>
where
    Req: Send + 'static,
    Rsp: Send + 'static,
{
    /// Applies one observed name state. Transitions happen under the
    /// state lock; the transitioned-out queue is worked after release.
    fn observe(self: &Arc<Self>, next: NameState) {
        enum Work<Req, Rsp> {
            None,
            Drain(VecDeque<Waiter<Req, Rsp>>, BoundName),
            FailAll(VecDeque<Waiter<Req, Rsp>>, NameFault),
        }

        let work = {
            let mut state = self.state.lock();
            let prior = std::mem::replace(&mut *state, DynState::Closed);
            let (next_state, work) = match (prior, next) {
                (DynState::Closed, _) => (DynState::Closed, Work::None),
                (prior, NameState::Pending) => (prior, Work::None),
                (DynState::Pending(queue), NameState::Bound(name)) => {
                    (DynState::Named(name.clone()), Work::Drain(queue, name))
                }
                (DynState::Pending(queue), NameState::Failed(fault)) => {
                    (DynState::Failed(fault.clone()), Work::FailAll(queue, fault))
                }
                (_, NameState::Bound(name)) => (DynState::Named(name), Work::None),
                (_, NameState::Failed(fault)) => (DynState::Failed(fault), Work::None),
            };
            *state = next_state;
            work
        };

        match work {
            Work::None => {}
            Work::Drain(queue, name) => {
                tracing::debug!(
                    name = %name.render(),
                    waiters = queue.len(),
                    "name bound; draining queued acquisitions"
                );
                for waiter in queue {
                    // new_service starts here, in enqueue order; binding
                    // the result to the waiter happens off this path.
                    let fut = (self.new_service)(name.clone(), waiter.conn);
                    tokio::spawn(async move {
                        if let Err(Ok(svc)) = waiter.tx.send(fut.await) {
                            // The caller went away after the queue drained;
                            // release the service it will never see.
                            svc.close().await;
                        }
                    });
                }
            }
            Work::FailAll(queue, fault) => {
                tracing::debug!(
                    fault = %fault,
                    waiters = queue.len(),
                    "name failed; failing queued acquisitions"
                );
                for waiter in queue {
                    let _ = waiter.tx.send(Err(Error::Naming(fault.clone())));
                }
            }
        }
    }
}

impl<Req, Rsp> Shared<Req, Rsp> {
    fn dequeue(&self, id: u64) {
        let mut state = self.state.lock();
        if let DynState::Pending(queue) = &mut *state {
            if let Some(pos) = queue.iter().position(|w| w.id == id) {
                if let Some(waiter) = queue.remove(pos) {
                    // Delivery is moot (the receiver is gone), but the
                    // slot completes with the cancellation error all the
                    // same.
                    let _ = waiter.tx.send(Err(Error::CancelledConnection { cause: None }));
                }
            }
        }
    }
}

/// The future handed to a caller whose acquisition is queued behind a
/// pending name. Dropping it before completion dequeues the acquisition.
struct QueuedAcquire<Req, Rsp> {
    rx: oneshot::Receiver<Result<Svc<Req, Rsp>, Error>>,
    shared: Arc<Shared<Req, Rsp>>,
    guard: DequeueGuard<Req, Rsp>,
}

struct DequeueGuard<Req, Rsp> {
    shared: Arc<Shared<Req, Rsp>>,
    id: u64,
    armed: bool,
}

impl<Req, Rsp> Future for QueuedAcquire<Req, Rsp>
where
    Req: Send + 'static,
    Rsp: Send + 'static,
{
    type Output = Result<Svc<Req, Rsp>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let result = match Pin::new(&mut this.rx).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Ok(result)) => result,
            // The slot was dropped without completing, which only happens
            // when the factory is torn down.
            Poll::Ready(Err(_)) => Err(Error::ServiceClosed),
        };
        this.guard.armed = false;
        match result {
            // Unwrap the in-queue fault: trace it and surface the
            // underlying failure.
            Err(Error::Naming(fault)) => {
                (this.shared.on_failure)(&fault);
                Poll::Ready(Err(fault.into()))
            }
            other => Poll::Ready(other),
        }
    }
}

impl<Req, Rsp> Drop for DequeueGuard<Req, Rsp> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.dequeue(self.id);
        }
    }
}
