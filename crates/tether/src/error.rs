//! The error taxonomy that crosses the stack's boundaries.

use std::fmt;
use std::sync::Arc;

use tether_name::{Dtab, NameFault, Path};

/// A type-erased downstream error.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Where operators are pointed when an endpoint is being fast-failed.
pub const FAILFAST_HELP_URL: &str = "https://docs.rs/tether/latest/tether/failfast/index.html";

/// Errors surfaced by the binding and fail-fast layers.
///
/// Upstream layers dispatch on the *kind* of an error, never its message;
/// see [`Error::kind`]. The type is cheaply cloneable so a single failure
/// can be fanned out to every caller queued on the same resolution.
#[derive(Debug, Clone)]
pub enum Error {
    /// The endpoint is marked down and the acquisition was short-circuited
    /// without touching it. Load balancers skip the endpoint on this kind
    /// rather than counting a request-level failure.
    EndpointMarkedDown,

    /// The path evaluated to no destinations under the effective
    /// delegation table.
    NoBrokersAvailable {
        path: Path,
        /// The request-scoped table in effect, for diagnosing misrouting.
        /// Empty when no local table was involved.
        local_dtab: Dtab,
    },

    /// The factory was closed; all queued and future acquisitions fail.
    ServiceClosed,

    /// The caller abandoned a connection request while it was still
    /// queued. Never recorded as a naming failure.
    CancelledConnection { cause: Option<Arc<Error>> },

    /// A name-resolution failure. While an acquisition is queued this
    /// wraps the fault exactly once; the acquire path unwraps it before
    /// surfacing.
    Naming(NameFault),

    /// A failure from the wrapped endpoint factory, passed through.
    Downstream(Arc<dyn std::error::Error + Send + Sync>),
}

/// The stable classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    EndpointMarkedDown,
    NoBrokersAvailable,
    ServiceClosed,
    CancelledConnection,
    Naming,
    Downstream,
}

impl Error {
    /// Wraps an arbitrary downstream error.
    pub fn downstream(err: impl Into<BoxError>) -> Error {
        Error::Downstream(Arc::from(err.into()))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::EndpointMarkedDown => ErrorKind::EndpointMarkedDown,
            Error::NoBrokersAvailable { .. } => ErrorKind::NoBrokersAvailable,
            Error::ServiceClosed => ErrorKind::ServiceClosed,
            Error::CancelledConnection { .. } => ErrorKind::CancelledConnection,
            Error::Naming(_) => ErrorKind::Naming,
            Error::Downstream(_) => ErrorKind::Downstream,
        }
    }

    /// A stable identifier for the error's kind, used in trace
    /// annotations.
    pub fn kind_label(&self) -> &'static str {
        match self {
            Error::EndpointMarkedDown => "endpoint_marked_down",
            Error::NoBrokersAvailable { .. } => "no_brokers_available",
            Error::ServiceClosed => "service_closed",
            Error::CancelledConnection { .. } => "cancelled_connection",
            Error::Naming(fault) => fault.kind_label(),
            Error::Downstream(_) => "downstream",
        }
    }
}

impl From<NameFault> for Error {
    fn from(fault: NameFault) -> Error {
        match fault {
            NameFault::NoBrokers { path } => Error::NoBrokersAvailable {
                path,
                local_dtab: Dtab::empty(),
            },
            other => Error::Naming(other),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::EndpointMarkedDown => {
                write!(
                    f,
                    "endpoint marked down by failure accrual; see {FAILFAST_HELP_URL}"
                )
            }
            Error::NoBrokersAvailable { path, local_dtab } => {
                if local_dtab.is_empty() {
                    write!(f, "no brokers available for {path}")
                } else {
                    write!(
                        f,
                        "no brokers available for {path} with local dtab {local_dtab}"
                    )
                }
            }
            Error::ServiceClosed => write!(f, "service factory is closed"),
            Error::CancelledConnection { cause } => match cause {
                Some(cause) => write!(f, "connection request cancelled: {cause}"),
                None => write!(f, "connection request cancelled"),
            },
            Error::Naming(fault) => write!(f, "name resolution failed: {fault}"),
            Error::Downstream(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::CancelledConnection { cause: Some(cause) } => Some(cause.as_ref()),
            Error::Naming(fault) => Some(fault),
            Error::Downstream(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}
