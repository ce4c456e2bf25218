//! Resolving logical paths to endpoint factories, cached at two levels.
//!
//! A [`BindingFactory`] owns the top of the client stack:
//!
//! ```text
//! caller ──► BindingFactory ──► DynNameFactory (per dtab) ──► new_factory(bound) ──► ...
//! ```
//!
//! Two caches do the heavy lifting. The **dtab cache** keys on the
//! effective delegation table: most requests share the base table with no
//! local overrides, so the entire evaluation of the path is one lookup.
//! The **name cache** keys on the bound name's identity: distinct tables
//! frequently resolve to the same destination, and sharing the entry
//! avoids rebuilding the downstream stack (fail-fast, balancer,
//! transport) per table.

use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;

use tether_name::{BoundName, Dtab, NameFault, NameInterpreter, DefaultInterpreter, Path};

use crate::cache::{CacheStats, NewFactory, ServiceFactoryCache};
use crate::dynname::{DynNameFactory, FailureTracer, NewService};
use crate::error::Error;
use crate::factory::{ClientConnection, ServiceFactory, SharedFactory, SvcFuture};
use crate::trace::NamerTracing;

/// Builds the downstream factory for a freshly bound name; typically
/// wraps the transport in a
/// [`FailFastFactory`](crate::failfast::FailFastFactory) and a balancer.
pub type NewEndpointFactory<Req, Rsp> = NewFactory<BoundName, Req, Rsp>;

/// Configuration for a [`BindingFactory`].
pub struct BindingConfig {
    max_name_cache_size: usize,
    max_namer_cache_size: usize,
    base_dtab: Arc<dyn Fn() -> Dtab + Send + Sync>,
    interpreter: Arc<dyn NameInterpreter>,
    tracing: NamerTracing,
}

impl Default for BindingConfig {
    fn default() -> Self {
        BindingConfig::builder().build()
    }
}

impl BindingConfig {
    pub fn builder() -> BindingConfigBuilder {
        BindingConfigBuilder {
            max_name_cache_size: 8,
            max_namer_cache_size: 4,
            base_dtab: Arc::new(Dtab::base),
            interpreter: Arc::new(DefaultInterpreter::default()),
            tracing: NamerTracing::new(),
        }
    }
}

/// Builder for [`BindingConfig`].
pub struct BindingConfigBuilder {
    max_name_cache_size: usize,
    max_namer_cache_size: usize,
    base_dtab: Arc<dyn Fn() -> Dtab + Send + Sync>,
    interpreter: Arc<dyn NameInterpreter>,
    tracing: NamerTracing,
}

impl BindingConfigBuilder {
    /// Capacity of the bound-name cache.
    pub fn max_name_cache_size(mut self, size: usize) -> Self {
        self.max_name_cache_size = size;
        self
    }

    /// Capacity of the delegation-table cache.
    pub fn max_namer_cache_size(mut self, size: usize) -> Self {
        self.max_namer_cache_size = size;
        self
    }

    /// Where the process-wide base table is read from; defaults to
    /// [`Dtab::base`]. A snapshot is taken per acquisition.
    pub fn base_dtab<F>(mut self, base: F) -> Self
    where
        F: Fn() -> Dtab + Send + Sync + 'static,
    {
        self.base_dtab = Arc::new(base);
        self
    }

    pub fn interpreter(mut self, interpreter: Arc<dyn NameInterpreter>) -> Self {
        self.interpreter = interpreter;
        self
    }

    pub fn tracing(mut self, tracing: NamerTracing) -> Self {
        self.tracing = tracing;
        self
    }

    pub fn build(self) -> BindingConfig {
        BindingConfig {
            max_name_cache_size: self.max_name_cache_size,
            max_namer_cache_size: self.max_namer_cache_size,
            base_dtab: self.base_dtab,
            interpreter: self.interpreter,
            tracing: self.tracing,
        }
    }
}

/// Resolves one logical path under the effective delegation table and
/// routes acquisitions to the endpoint factory for the bound name.
pub struct BindingFactory<Req, Rsp> {
    path: Path,
    dtab_cache: Arc<ServiceFactoryCache<Dtab, Req, Rsp>>,
    name_cache: Arc<ServiceFactoryCache<BoundName, Req, Rsp>>,
    base_dtab: Arc<dyn Fn() -> Dtab + Send + Sync>,
    tracing: NamerTracing,
}

impl<Req, Rsp> BindingFactory<Req, Rsp>
where
    Req: Send + 'static,
    Rsp: Send + 'static,
{
    /// Binds `path` with the default configuration.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(path: Path, new_factory: NewEndpointFactory<Req, Rsp>) -> Self {
        Self::with_config(path, new_factory, BindingConfig::default())
    }

    pub fn with_config(
        path: Path,
        new_factory: NewEndpointFactory<Req, Rsp>,
        config: BindingConfig,
    ) -> Self {
        let name_cache = Arc::new(ServiceFactoryCache::new(
            "namecache",
            config.max_name_cache_size,
            new_factory,
        ));

        let interpreter = config.interpreter;
        let hooks = config.tracing.clone();
        let dyn_path = path.clone();
        let dyn_cache = Arc::clone(&name_cache);
        let make_dyn: NewFactory<Dtab, Req, Rsp> = Arc::new(move |dtab: &Dtab| {
            let watch = interpreter.bind(dtab, &dyn_path);
            let cache = Arc::clone(&dyn_cache);
            let name_hooks = hooks.clone();
            let new_service: NewService<Req, Rsp> =
                Arc::new(move |name: BoundName, conn: ClientConnection| {
                    name_hooks.record_name(&name);
                    cache.acquire(name, conn)
                });
            let failure_hooks = hooks.clone();
            let on_failure: FailureTracer = Arc::new(move |fault: &NameFault| {
                failure_hooks.record_naming_failure(fault);
            });
            Arc::new(DynNameFactory::new(watch, new_service, on_failure))
                as SharedFactory<Req, Rsp>
        });

        let dtab_cache = Arc::new(ServiceFactoryCache::new(
            "dtabcache",
            config.max_namer_cache_size,
            make_dyn,
        ));

        BindingFactory {
            path,
            dtab_cache,
            name_cache,
            base_dtab: config.base_dtab,
            tracing: config.tracing,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dtab_cache_stats(&self) -> CacheStats {
        self.dtab_cache.stats()
    }

    pub fn name_cache_stats(&self) -> CacheStats {
        self.name_cache.stats()
    }
}

impl<Req, Rsp> ServiceFactory<Req> for BindingFactory<Req, Rsp>
where
    Req: Send + 'static,
    Rsp: Send + 'static,
{
    type Response = Rsp;

    fn acquire(&self, conn: ClientConnection) -> SvcFuture<Req, Rsp> {
        let base = (self.base_dtab)();
        let local = Dtab::local();
        self.tracing.record_path(&self.path);
        self.tracing.record_base_dtab(&base);

        let effective = base.concat(&local);
        let fut = self.dtab_cache.acquire(effective, conn);
        if local.is_empty() {
            return fut;
        }

        // With a local table in play, annotate resolution misses with the
        // offending path and that exact table so misrouting is
        // diagnosable.
        let path = self.path.clone();
        Box::pin(async move {
            match fut.await {
                Err(Error::NoBrokersAvailable { .. }) => Err(Error::NoBrokersAvailable {
                    path,
                    local_dtab: local,
                }),
                other => other,
            }
        })
    }

    fn is_available(&self) -> bool {
        // Availability reflects the dtab cache only; a degraded
        // name-cache entry does not flip it. See DESIGN.md.
        self.dtab_cache.is_available()
    }

    fn close(&self, deadline: Instant) -> BoxFuture<'static, ()> {
        let dtab_cache = Arc::clone(&self.dtab_cache);
        let name_cache = Arc::clone(&self.name_cache);
        Box::pin(async move {
            dtab_cache.close(deadline).await;
            name_cache.close(deadline).await;
        })
    }
}
