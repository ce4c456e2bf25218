//! A bounded cache of child factories, keyed and evicted on idleness.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use metrics::{counter, gauge};
use parking_lot::Mutex;

use crate::error::Error;
use crate::factory::{ClientConnection, Service, ServiceFactory, SharedFactory, Svc, SvcFuture};

/// Builds the child factory for a key on a cache miss.
pub type NewFactory<K, Req, Rsp> = Arc<dyn Fn(&K) -> SharedFactory<Req, Rsp> + Send + Sync>;

/// A point-in-time view of a cache's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub size: usize,
    pub misses: u64,
    pub evictions: u64,
    pub oneshots: u64,
}

/// Caches child factories by key, bounded in size.
///
/// An entry is pinned while any of its services is outstanding; only
/// unpinned entries are evicted, least recently used first. When every
/// entry is pinned, the factory for a new key is built but not admitted:
/// it is torn down as soon as its one service is closed. This keeps the
/// factory count bounded without ever tearing down an entry in use.
pub struct ServiceFactoryCache<K, Req, Rsp>
where
    K: Eq + Hash,
{
    scope: &'static str,
    capacity: usize,
    new_factory: NewFactory<K, Req, Rsp>,
    inner: Mutex<Inner<K, Req, Rsp>>,
    misses: AtomicU64,
    evictions: AtomicU64,
    oneshots: AtomicU64,
}

struct Inner<K, Req, Rsp> {
    entries: HashMap<K, Entry<Req, Rsp>>,
    closed: bool,
}

struct Entry<Req, Rsp> {
    factory: SharedFactory<Req, Rsp>,
    refs: Arc<AtomicUsize>,
    last_use: Instant,
}

impl<K, Req, Rsp> ServiceFactoryCache<K, Req, Rsp>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    Req: Send + 'static,
    Rsp: Send + 'static,
{
    /// Creates a cache holding at most `capacity` factories. `scope`
    /// labels this cache's metrics.
    pub fn new(
        scope: &'static str,
        capacity: usize,
        new_factory: NewFactory<K, Req, Rsp>,
    ) -> Self {
        ServiceFactoryCache {
            scope,
            capacity: capacity.max(1),
            new_factory,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                closed: false,
            }),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            oneshots: AtomicU64::new(0),
        }
    }

    /// Acquires a service from the factory for `key`, creating and
    /// possibly admitting the factory on a miss.
    pub fn acquire(&self, key: K, conn: ClientConnection) -> SvcFuture<Req, Rsp> {
        let (factory, release, evicted) = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Box::pin(std::future::ready(Err(Error::ServiceClosed)));
            }
            match self.checkout(&mut inner, key) {
                Checkout::Hit(factory, refs) => (factory, Release::Cached(refs), None),
                Checkout::Admitted(factory, refs, evicted) => {
                    (factory, Release::Cached(refs), evicted)
                }
                Checkout::OneShot(factory) => {
                    (Arc::clone(&factory), Release::OneShot(factory), None)
                }
            }
        };
        self.publish_size();

        Box::pin(async move {
            if let Some(victim) = evicted {
                // Detached close; the acquisition does not wait on it.
                tokio::spawn(async move {
                    victim.close(Instant::now()).await;
                });
            }
            match factory.acquire(conn).await {
                Ok(svc) => Ok(Box::new(TrackedService {
                    inner: Some(svc),
                    release: Some(release),
                }) as Svc<Req, Rsp>),
                Err(err) => {
                    release.release().await;
                    Err(err)
                }
            }
        })
    }

    fn checkout(&self, inner: &mut Inner<K, Req, Rsp>, key: K) -> Checkout<Req, Rsp> {
        if let Some(entry) = inner.entries.get_mut(&key) {
            entry.last_use = Instant::now();
            entry.refs.fetch_add(1, Ordering::SeqCst);
            return Checkout::Hit(Arc::clone(&entry.factory), Arc::clone(&entry.refs));
        }

        let factory = (self.new_factory)(&key);
        self.misses.fetch_add(1, Ordering::Relaxed);
        counter!("binding_cache_misses", "cache" => self.scope).increment(1);

        let evicted = if inner.entries.len() >= self.capacity {
            match self.pick_victim(inner) {
                Some(victim_key) => inner.entries.remove(&victim_key).map(|e| {
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    counter!("binding_cache_evictions", "cache" => self.scope).increment(1);
                    tracing::debug!(cache = self.scope, "evicting idle factory");
                    e.factory
                }),
                None => {
                    // Everything is pinned: hand out an unadmitted factory
                    // that dies with its one service.
                    self.oneshots.fetch_add(1, Ordering::Relaxed);
                    counter!("binding_cache_oneshots", "cache" => self.scope).increment(1);
                    return Checkout::OneShot(factory);
                }
            }
        } else {
            None
        };

        let refs = Arc::new(AtomicUsize::new(1));
        inner.entries.insert(
            key,
            Entry {
                factory: Arc::clone(&factory),
                refs: Arc::clone(&refs),
                last_use: Instant::now(),
            },
        );
        Checkout::Admitted(factory, refs, evicted)
    }

    /// The least recently used entry with no outstanding services.
    fn pick_victim(&self, inner: &Inner<K, Req, Rsp>) -> Option<K> {
        inner
            .entries
            .iter()
            .filter(|(_, e)| e.refs.load(Ordering::SeqCst) == 0)
            .min_by_key(|(_, e)| e.last_use)
            .map(|(k, _)| k.clone())
    }

    /// True iff every cached factory is available (vacuously true when
    /// empty).
    pub fn is_available(&self) -> bool {
        let inner = self.inner.lock();
        !inner.closed && inner.entries.values().all(|e| e.factory.is_available())
    }

    /// Closes every cached factory in sequence; the cache rejects further
    /// acquisitions.
    pub fn close(&self, deadline: Instant) -> BoxFuture<'static, ()> {
        let factories: Vec<SharedFactory<Req, Rsp>> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.entries.drain().map(|(_, e)| e.factory).collect()
        };
        self.publish_size();
        Box::pin(async move {
            for factory in factories {
                factory.close(deadline).await;
            }
        })
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.len(),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            oneshots: self.oneshots.load(Ordering::Relaxed),
        }
    }

    fn publish_size(&self) {
        gauge!("binding_cache_size", "cache" => self.scope).set(self.len() as f64);
    }
}

enum Checkout<Req, Rsp> {
    Hit(SharedFactory<Req, Rsp>, Arc<AtomicUsize>),
    Admitted(
        SharedFactory<Req, Rsp>,
        Arc<AtomicUsize>,
        Option<SharedFactory<Req, Rsp>>,
    ),
    OneShot(SharedFactory<Req, Rsp>),
}

enum Release<Req, Rsp> {
    /// Unpin the cached entry.
    Cached(Arc<AtomicUsize>),
    /// Tear down the unadmitted factory.
    OneShot(SharedFactory<Req, Rsp>),
}

impl<Req, Rsp> Release<Req, Rsp>
where
    Req: Send + 'static,
    Rsp: Send + 'static,
{
    fn release(self) -> BoxFuture<'static, ()> {
        match self {
            Release::Cached(refs) => {
                refs.fetch_sub(1, Ordering::SeqCst);
                Box::pin(std::future::ready(()))
            }
            Release::OneShot(factory) => Box::pin(async move {
                factory.close(Instant::now()).await;
            }),
        }
    }
}

/// A service that releases its cache entry when closed (or dropped).
struct TrackedService<Req: Send + 'static, Rsp: Send + 'static> {
    inner: Option<Svc<Req, Rsp>>,
    release: Option<Release<Req, Rsp>>,
}

impl<Req, Rsp> Service<Req> for TrackedService<Req, Rsp>
where
    Req: Send + 'static,
    Rsp: Send + 'static,
{
    type Response = Rsp;

    fn call(&mut self, req: Req) -> BoxFuture<'static, Result<Rsp, Error>> {
        match self.inner.as_mut() {
            Some(svc) => svc.call(req),
            None => Box::pin(std::future::ready(Err(Error::ServiceClosed))),
        }
    }

    fn close(mut self: Box<Self>) -> BoxFuture<'static, ()> {
        let inner = self.inner.take();
        let release = self.release.take();
        Box::pin(async move {
            if let Some(svc) = inner {
                svc.close().await;
            }
            if let Some(release) = release {
                release.release().await;
            }
        })
    }
}

impl<Req: Send + 'static, Rsp: Send + 'static> Drop for TrackedService<Req, Rsp> {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            match release {
                Release::Cached(refs) => {
                    refs.fetch_sub(1, Ordering::SeqCst);
                }
                Release::OneShot(factory) => {
                    if let Ok(handle) = tokio::runtime::Handle::try_current() {
                        handle.spawn(async move {
                            factory.close(Instant::now()).await;
                        });
                    }
                }
            }
        }
    }
}
