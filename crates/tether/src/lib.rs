//! Client-side resilience and name resolution for layered RPC stacks.
//!
//! A tether client stack is a pipeline of [`ServiceFactory`]s, each layer
//! intercepting connection acquisition for the layer below:
//!
//! ```text
//! caller ──► BindingFactory ──► DynNameFactory (per bound name)
//!                 ──► FailFastFactory ──► balancer / transport
//! ```
//!
//! - [`binding::BindingFactory`] resolves a logical [`Path`](name::Path)
//!   under the effective delegation table and caches aggressively at two
//!   levels (per table, per bound name).
//! - [`dynname::DynNameFactory`] bridges a reactive name (pending, bound,
//!   or failed, and able to change at runtime) to the synchronous
//!   acquisition interface, queueing callers while resolution is pending.
//! - [`failfast::FailFastFactory`] marks a failing endpoint dead, probes
//!   it in the background on a jittered exponential backoff, and
//!   short-circuits acquisitions in the meantime.
//! - [`cache::ServiceFactoryCache`] is the bounded, pin-aware cache both
//!   binding levels are built from.
//!
//! Request filters, load balancing, and transports are deliberately out
//! of scope; they plug in below via [`ServiceFactory`] (adapters for
//! tower connectors are provided in [`factory`]).
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tether::binding::BindingFactory;
//! use tether::factory::{from_tower, ClientConnection, Service, ServiceFactory, SharedFactory};
//! use tether::failfast::FailFastFactory;
//! use tether::name::{BoundName, Dtab, Path};
//!
//! # async fn run() -> Result<(), tether::Error> {
//! Dtab::set_base(Dtab::read("/s => /$/inet/0/9990").unwrap());
//!
//! let binding: BindingFactory<String, String> = BindingFactory::new(
//!     Path::read("/s/echo").unwrap(),
//!     Arc::new(|_bound: &BoundName| {
//!         // Connect to the bound endpoint; wrapped in fail-fast so a
//!         // dead endpoint is probed in the background instead of being
//!         // hammered by every caller.
//!         let connect = from_tower(tower::service_fn(|_conn: ClientConnection| async {
//!             Ok::<_, std::io::Error>(tower::service_fn(|req: String| async move {
//!                 Ok::<_, std::io::Error>(req)
//!             }))
//!         }));
//!         Arc::new(FailFastFactory::new(Arc::new(connect))) as SharedFactory<String, String>
//!     }),
//! );
//!
//! let mut svc = binding.acquire(ClientConnection::none()).await?;
//! let rsp = svc.call("hello".to_string()).await?;
//! # let _ = rsp;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod binding;
pub mod cache;
pub mod dynname;
pub mod error;
pub mod events;
pub mod factory;
pub mod failfast;
pub mod trace;

/// The name data model: paths, delegation tables, and bound names.
pub use tether_name as name;

pub use backoff::Backoff;
pub use binding::{BindingConfig, BindingFactory};
pub use cache::{CacheStats, ServiceFactoryCache};
pub use dynname::DynNameFactory;
pub use error::{BoxError, Error, ErrorKind};
pub use factory::{ClientConnection, Service, ServiceFactory, SharedFactory, Svc, SvcFuture};
pub use failfast::{FailFastConfig, FailFastFactory, FailFastStatus};
pub use trace::{NamerTracing, TraceRecorder};
