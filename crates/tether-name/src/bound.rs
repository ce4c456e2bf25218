//! Bound names and the reactive states a resolution moves through.

use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;

use crate::path::Path;

/// The identity of a bound name.
///
/// Identity is what caches key on and what tracing renders; the address
/// set is deliberately excluded so that two resolutions of the same
/// destination share downstream state.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NameId {
    Str(Arc<str>),
    Path(Path),
    /// The identity of a synthesised union over several bound names.
    Composite(Vec<NameId>),
}

impl NameId {
    /// Canonical rendering used for trace annotations: string ids
    /// verbatim, path ids in `/a/b` form, composites structurally.
    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for NameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NameId::Str(s) => write!(f, "{s}"),
            NameId::Path(p) => write!(f, "{p}"),
            NameId::Composite(ids) => {
                write!(f, "union(")?;
                for (i, id) in ids.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{id}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// A fully resolved destination: an identity plus an observable set of
/// socket addresses.
///
/// Equality, ordering, and hashing consider only the identity.
#[derive(Debug, Clone)]
pub struct BoundName {
    id: NameId,
    addrs: watch::Receiver<BTreeSet<SocketAddr>>,
    // Keeps a fixed address set's channel open for as long as any clone
    // of this name is alive.
    _retain: Option<Arc<watch::Sender<BTreeSet<SocketAddr>>>>,
}

impl PartialEq for BoundName {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for BoundName {}

impl PartialOrd for BoundName {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BoundName {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl std::hash::Hash for BoundName {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl BoundName {
    /// A name bound to a fixed address set.
    pub fn fixed(id: NameId, addrs: BTreeSet<SocketAddr>) -> BoundName {
        let (tx, rx) = watch::channel(addrs);
        BoundName {
            id,
            addrs: rx,
            _retain: Some(Arc::new(tx)),
        }
    }

    /// A name whose address set is published externally.
    pub fn watched(id: NameId, addrs: watch::Receiver<BTreeSet<SocketAddr>>) -> BoundName {
        BoundName {
            id,
            addrs,
            _retain: None,
        }
    }

    /// Synthesises an aggregate name over `members`.
    ///
    /// The aggregate's identity is composite over the member identities
    /// and its address set is the live union of the member sets,
    /// maintained by a background task for as long as the aggregate is
    /// watched. Must be called within a tokio runtime.
    pub fn union(members: impl IntoIterator<Item = BoundName>) -> BoundName {
        let members: Vec<BoundName> = members.into_iter().collect();
        let id = NameId::Composite(members.iter().map(|m| m.id.clone()).collect());
        let mut rxs: Vec<watch::Receiver<BTreeSet<SocketAddr>>> =
            members.iter().map(|m| m.addrs.clone()).collect();
        let initial: BTreeSet<SocketAddr> = rxs
            .iter()
            .flat_map(|rx| rx.borrow().iter().copied().collect::<Vec<_>>())
            .collect();
        let (tx, rx) = watch::channel(initial);
        tokio::spawn(async move {
            // Member names (and their retained senders) stay alive while
            // the union is being maintained.
            let _members = members;
            loop {
                if rxs.is_empty() {
                    break;
                }
                let step = {
                    let waits: Vec<_> = rxs.iter_mut().map(|rx| Box::pin(rx.changed())).collect();
                    tokio::select! {
                        _ = tx.closed() => None,
                        (res, idx, _) = futures::future::select_all(waits) => {
                            Some((res.is_ok(), idx))
                        }
                    }
                };
                match step {
                    None => break,
                    Some((true, _)) => {
                        let merged: BTreeSet<SocketAddr> = rxs
                            .iter()
                            .flat_map(|rx| rx.borrow().iter().copied().collect::<Vec<_>>())
                            .collect();
                        if tx.send(merged).is_err() {
                            break;
                        }
                    }
                    Some((false, idx)) => {
                        // That member's publisher is gone; its last value
                        // remains folded into the current union.
                        rxs.swap_remove(idx);
                    }
                }
            }
        });
        BoundName {
            id,
            addrs: rx,
            _retain: None,
        }
    }

    pub fn id(&self) -> &NameId {
        &self.id
    }

    /// Canonical rendering of the identity.
    pub fn render(&self) -> String {
        self.id.render()
    }

    /// The current address set.
    pub fn addresses(&self) -> BTreeSet<SocketAddr> {
        self.addrs.borrow().clone()
    }

    /// A subscription to the address set.
    pub fn watch_addresses(&self) -> watch::Receiver<BTreeSet<SocketAddr>> {
        self.addrs.clone()
    }
}

/// A name-resolution failure carried inside a reactive name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameFault {
    /// The path evaluated to no destinations.
    NoBrokers { path: Path },
    /// Delegation recursed past the interpreter's depth limit.
    TooDeep { path: Path },
    /// Any other resolution failure.
    Message(Arc<str>),
}

impl NameFault {
    pub fn msg(message: impl Into<Arc<str>>) -> NameFault {
        NameFault::Message(message.into())
    }

    /// A stable identifier for the failure's kind, used in trace
    /// annotations.
    pub fn kind_label(&self) -> &'static str {
        match self {
            NameFault::NoBrokers { .. } => "no_brokers_available",
            NameFault::TooDeep { .. } => "delegation_too_deep",
            NameFault::Message(_) => "name_resolution_error",
        }
    }
}

impl fmt::Display for NameFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NameFault::NoBrokers { path } => {
                write!(f, "no brokers available for {path}")
            }
            NameFault::TooDeep { path } => {
                write!(f, "delegation for {path} exceeded the recursion limit")
            }
            NameFault::Message(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for NameFault {}

/// The state of a reactive name at some moment.
#[derive(Debug, Clone)]
pub enum NameState {
    /// Resolution has not produced an answer yet.
    Pending,
    /// The name is bound.
    Bound(BoundName),
    /// Resolution failed.
    Failed(NameFault),
}

/// A subscription to a reactive name.
///
/// The channel carries the most recent state; subscribers observe
/// transitions in publication order, though rapidly superseded
/// intermediate states may coalesce.
pub type NameWatch = watch::Receiver<NameState>;

impl NameState {
    /// Maps a tree evaluation to a single reactive state.
    ///
    /// An undefined or empty evaluation means there is nothing to connect
    /// to; a multi-member evaluation becomes a synthesised
    /// [`BoundName::union`].
    pub fn of_eval(path: &Path, evaluated: Option<BTreeSet<BoundName>>) -> NameState {
        let no_brokers = || {
            NameState::Failed(NameFault::NoBrokers {
                path: path.clone(),
            })
        };
        match evaluated {
            None => no_brokers(),
            Some(set) => {
                let mut members = set.into_iter();
                match (members.next(), members.next()) {
                    (None, _) => no_brokers(),
                    (Some(only), None) => NameState::Bound(only),
                    (Some(a), Some(b)) => {
                        NameState::Bound(BoundName::union([a, b].into_iter().chain(members)))
                    }
                }
            }
        }
    }
}
