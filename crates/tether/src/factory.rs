//! The service and service-factory abstractions the stack is built from.
//!
//! A [`ServiceFactory`] hands out connections on demand; every layer in
//! the stack wraps the factory below it and intercepts acquisition.
//! Factories are shared ([`SharedFactory`]) and long-lived; the
//! [`Service`]s they produce belong to one caller and are released by
//! closing (or dropping) them.
//!
//! Adapters to and from [`tower`] live here as well: [`from_tower`] lifts
//! a tower connector into a [`ServiceFactory`], and [`into_tower`] exposes
//! an acquired service as a `tower::Service` for the request path.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use tower::ServiceExt;

use crate::error::{BoxError, Error};

/// Connection-level metadata passed through acquisition.
#[derive(Debug, Clone, Default)]
pub struct ClientConnection {
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
}

impl ClientConnection {
    /// The null connection, used by internal probes.
    pub fn none() -> ClientConnection {
        ClientConnection::default()
    }

    pub fn to(remote: SocketAddr) -> ClientConnection {
        ClientConnection {
            local_addr: None,
            remote_addr: Some(remote),
        }
    }
}

/// A connected service handed to one caller.
pub trait Service<Req>: Send {
    type Response: Send + 'static;

    fn call(&mut self, req: Req) -> BoxFuture<'static, Result<Self::Response, Error>>;

    /// Releases the service. Closing is consumed exactly once by
    /// construction; dropping without closing releases synchronously.
    fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
        Box::pin(std::future::ready(()))
    }
}

impl<Req, Rsp> fmt::Debug for dyn Service<Req, Response = Rsp> + '_ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service").finish_non_exhaustive()
    }
}

/// A boxed service.
pub type Svc<Req, Rsp> = Box<dyn Service<Req, Response = Rsp>>;

/// The deferred result of an acquisition.
pub type SvcFuture<Req, Rsp> = BoxFuture<'static, Result<Svc<Req, Rsp>, Error>>;

/// Produces services on demand.
///
/// Dropping the future returned by [`acquire`](ServiceFactory::acquire)
/// cancels the acquisition; cancellation propagates through every layer.
pub trait ServiceFactory<Req>: Send + Sync {
    type Response: Send + 'static;

    fn acquire(&self, conn: ClientConnection) -> SvcFuture<Req, Self::Response>;

    fn is_available(&self) -> bool {
        true
    }

    fn close(&self, deadline: Instant) -> BoxFuture<'static, ()>;
}

/// A shared handle to a factory.
pub type SharedFactory<Req, Rsp> = Arc<dyn ServiceFactory<Req, Response = Rsp>>;

impl<Req, F> ServiceFactory<Req> for Arc<F>
where
    F: ServiceFactory<Req> + ?Sized,
{
    type Response = F::Response;

    fn acquire(&self, conn: ClientConnection) -> SvcFuture<Req, Self::Response> {
        (**self).acquire(conn)
    }

    fn is_available(&self) -> bool {
        (**self).is_available()
    }

    fn close(&self, deadline: Instant) -> BoxFuture<'static, ()> {
        (**self).close(deadline)
    }
}

/// A [`Service`] from a closure.
pub struct ServiceFn<F> {
    f: F,
}

/// Lifts a closure into a [`Service`].
pub fn service_fn<Req, Rsp, F>(f: F) -> ServiceFn<F>
where
    F: FnMut(Req) -> BoxFuture<'static, Result<Rsp, Error>> + Send,
    Rsp: Send + 'static,
{
    ServiceFn { f }
}

impl<Req, Rsp, F> Service<Req> for ServiceFn<F>
where
    F: FnMut(Req) -> BoxFuture<'static, Result<Rsp, Error>> + Send,
    Rsp: Send + 'static,
{
    type Response = Rsp;

    fn call(&mut self, req: Req) -> BoxFuture<'static, Result<Rsp, Error>> {
        (self.f)(req)
    }
}

/// A [`ServiceFactory`] from a closure.
pub struct FactoryFn<F> {
    f: F,
}

/// Lifts a closure into a [`ServiceFactory`].
pub fn factory_fn<Req, Rsp, F>(f: F) -> FactoryFn<F>
where
    F: Fn(ClientConnection) -> SvcFuture<Req, Rsp> + Send + Sync,
    Rsp: Send + 'static,
{
    FactoryFn { f }
}

impl<Req, Rsp, F> ServiceFactory<Req> for FactoryFn<F>
where
    F: Fn(ClientConnection) -> SvcFuture<Req, Rsp> + Send + Sync,
    Rsp: Send + 'static,
{
    type Response = Rsp;

    fn acquire(&self, conn: ClientConnection) -> SvcFuture<Req, Rsp> {
        (self.f)(conn)
    }

    fn close(&self, _deadline: Instant) -> BoxFuture<'static, ()> {
        Box::pin(std::future::ready(()))
    }
}

/// A [`ServiceFactory`] backed by a tower connector.
///
/// The connector is a `tower::Service` taking a [`ClientConnection`] and
/// yielding a `tower::Service` for the request path, the shape produced
/// by `tower::service_fn` and by transport `MakeService`s.
#[derive(Clone)]
pub struct TowerConnector<M> {
    make: M,
}

/// Lifts a tower connector into a [`ServiceFactory`].
pub fn from_tower<M>(make: M) -> TowerConnector<M> {
    TowerConnector { make }
}

impl<Req, M, S> ServiceFactory<Req> for TowerConnector<M>
where
    M: tower::Service<ClientConnection, Response = S> + Clone + Send + Sync + 'static,
    M::Error: Into<BoxError>,
    M::Future: Send + 'static,
    S: tower::Service<Req> + Send + 'static,
    S::Response: Send + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;

    fn acquire(&self, conn: ClientConnection) -> SvcFuture<Req, S::Response> {
        let mut make = self.make.clone();
        Box::pin(async move {
            let svc = make
                .ready()
                .await
                .map_err(Error::downstream)?
                .call(conn)
                .await
                .map_err(Error::downstream)?;
            Ok(Box::new(TowerAdapted { inner: svc }) as Svc<Req, S::Response>)
        })
    }

    fn close(&self, _deadline: Instant) -> BoxFuture<'static, ()> {
        Box::pin(std::future::ready(()))
    }
}

struct TowerAdapted<S> {
    inner: S,
}

impl<Req, S> Service<Req> for TowerAdapted<S>
where
    S: tower::Service<Req> + Send,
    S::Response: Send + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
{
    type Response = S::Response;

    fn call(&mut self, req: Req) -> BoxFuture<'static, Result<S::Response, Error>> {
        // The connector establishes readiness when it yields the service;
        // `tower::service_fn` services are always ready.
        let fut = self.inner.call(req);
        Box::pin(async move { fut.await.map_err(Error::downstream) })
    }
}

/// An acquired service exposed as a `tower::Service` for the request path.
pub struct IntoTower<Req, Rsp> {
    inner: Svc<Req, Rsp>,
}

/// Wraps an acquired service in a `tower::Service`.
pub fn into_tower<Req, Rsp>(inner: Svc<Req, Rsp>) -> IntoTower<Req, Rsp> {
    IntoTower { inner }
}

impl<Req, Rsp> tower::Service<Req> for IntoTower<Req, Rsp>
where
    Rsp: Send + 'static,
{
    type Response = Rsp;
    type Error = Error;
    type Future = BoxFuture<'static, Result<Rsp, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        self.inner.call(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower::Service as _;

    #[tokio::test]
    async fn factory_fn_round_trip() {
        let factory = factory_fn(|_conn| {
            Box::pin(async {
                Ok(Box::new(service_fn(|req: u32| {
                    Box::pin(async move { Ok::<_, Error>(req + 1) }) as BoxFuture<'static, _>
                })) as Svc<u32, u32>)
            }) as SvcFuture<u32, u32>
        });

        let mut svc = factory.acquire(ClientConnection::none()).await.unwrap();
        assert_eq!(svc.call(41).await.unwrap(), 42);
        svc.close().await;
        assert!(factory.is_available());
    }

    #[tokio::test]
    async fn tower_connector_adapts_both_directions() {
        let connector = from_tower(tower::service_fn(|_conn: ClientConnection| async {
            Ok::<_, std::io::Error>(tower::service_fn(|req: String| async move {
                Ok::<_, std::io::Error>(req.to_uppercase())
            }))
        }));

        let svc = connector.acquire(ClientConnection::none()).await.unwrap();
        let mut svc = into_tower(svc);
        let rsp = svc.ready().await.unwrap().call("hi".to_string()).await.unwrap();
        assert_eq!(rsp, "HI");
    }

    #[tokio::test]
    async fn tower_connector_surfaces_connect_failures() {
        let connector = from_tower(tower::service_fn(|_conn: ClientConnection| async {
            Err::<tower::util::BoxService<(), (), std::io::Error>, _>(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "refused",
            ))
        }));

        let err = connector
            .acquire(ClientConnection::none())
            .await
            .err()
            .expect("acquisition should fail");
        assert_eq!(err.kind(), crate::error::ErrorKind::Downstream);
    }
}
