//! Binding logical paths to reactive names under a delegation table.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tokio::sync::watch;

use crate::bound::{BoundName, NameFault, NameId, NameState, NameWatch};
use crate::dtab::Dtab;
use crate::path::Path;
use crate::tree::{NameTree, Weighted};

/// Binds a `(Dtab, Path)` pair to a reactive name.
pub trait NameInterpreter: Send + Sync {
    fn bind(&self, dtab: &Dtab, path: &Path) -> NameWatch;
}

/// The standard interpreter.
///
/// Resolution is a pure function of the table and the path: the path is
/// looked up, leaves are delegated recursively up to a depth limit, and
/// `/$/`-prefixed leaves are resolved by the built-in namers:
///
/// - `/$/inet/<host>/<port>`: a bound inet address (`0` means the
///   unspecified address);
/// - `/$/nil`: a successful resolution to no destinations;
/// - `/$/fail`: negative resolution.
///
/// The published state is terminal; interpreters over genuinely dynamic
/// sources publish further transitions through the same [`NameWatch`]
/// contract.
#[derive(Debug, Clone)]
pub struct DefaultInterpreter {
    max_depth: usize,
}

impl Default for DefaultInterpreter {
    fn default() -> Self {
        DefaultInterpreter { max_depth: 8 }
    }
}

impl DefaultInterpreter {
    pub fn new(max_depth: usize) -> DefaultInterpreter {
        DefaultInterpreter { max_depth }
    }

    fn resolve_path(
        &self,
        dtab: &Dtab,
        path: &Path,
        depth: usize,
    ) -> Result<NameTree<BoundName>, NameFault> {
        if path.iter().next() == Some("$") {
            return self.global(path);
        }
        if depth == 0 {
            return Err(NameFault::TooDeep { path: path.clone() });
        }
        let tree = dtab.lookup(path);
        self.resolve_tree(dtab, tree, depth - 1)
    }

    fn resolve_tree(
        &self,
        dtab: &Dtab,
        tree: NameTree<Path>,
        depth: usize,
    ) -> Result<NameTree<BoundName>, NameFault> {
        Ok(match tree {
            NameTree::Leaf(path) => self.resolve_path(dtab, &path, depth)?,
            NameTree::Union(members) => NameTree::Union(
                members
                    .into_iter()
                    .map(|w| {
                        Ok(Weighted::new(
                            w.weight,
                            self.resolve_tree(dtab, w.tree, depth)?,
                        ))
                    })
                    .collect::<Result<Vec<_>, NameFault>>()?,
            ),
            NameTree::Alt(branches) => NameTree::Alt(
                branches
                    .into_iter()
                    .map(|t| self.resolve_tree(dtab, t, depth))
                    .collect::<Result<Vec<_>, NameFault>>()?,
            ),
            NameTree::Neg => NameTree::Neg,
            NameTree::Empty => NameTree::Empty,
            NameTree::Fail => NameTree::Fail,
        })
    }

    fn global(&self, path: &Path) -> Result<NameTree<BoundName>, NameFault> {
        let mut elems = path.iter();
        elems.next(); // "$"
        match elems.next() {
            Some("inet") => {
                let (host, port) = match (elems.next(), elems.next(), elems.next()) {
                    (Some(host), Some(port), None) => (host, port),
                    _ => {
                        return Err(NameFault::msg(format!(
                            "malformed inet name {path}: expected /$/inet/<host>/<port>"
                        )))
                    }
                };
                let ip = if host == "0" {
                    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
                } else {
                    host.parse::<IpAddr>().map_err(|_| {
                        NameFault::msg(format!("cannot parse inet host {host:?} in {path}"))
                    })?
                };
                let port = port.parse::<u16>().map_err(|_| {
                    NameFault::msg(format!("cannot parse inet port {port:?} in {path}"))
                })?;
                Ok(NameTree::Leaf(BoundName::fixed(
                    NameId::Path(path.clone()),
                    BTreeSet::from([SocketAddr::new(ip, port)]),
                )))
            }
            Some("nil") => Ok(NameTree::Empty),
            Some("fail") => Ok(NameTree::Fail),
            _ => Ok(NameTree::Neg),
        }
    }
}

impl NameInterpreter for DefaultInterpreter {
    fn bind(&self, dtab: &Dtab, path: &Path) -> NameWatch {
        let state = match self.resolve_path(dtab, path, self.max_depth) {
            Ok(tree) => NameState::of_eval(path, tree.eval()),
            Err(fault) => NameState::Failed(fault),
        };
        tracing::trace!(%path, %dtab, state = state_label(&state), "bound path");
        let (tx, rx) = watch::channel(state);
        // The resolution is terminal; there will be no further updates.
        drop(tx);
        rx
    }
}

fn state_label(state: &NameState) -> &'static str {
    match state {
        NameState::Pending => "pending",
        NameState::Bound(_) => "bound",
        NameState::Failed(_) => "failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bind(dtab: &str, path: &str) -> NameState {
        let interpreter = DefaultInterpreter::default();
        let dtab = Dtab::read(dtab).unwrap();
        let path = Path::read(path).unwrap();
        interpreter.bind(&dtab, &path).borrow().clone()
    }

    #[tokio::test]
    async fn binds_through_delegations() {
        // /foo/bar -> /t -> /$/inet/0/1010
        let state = bind("/t=>/$/inet/0/1010;/foo/bar=>/t", "/foo/bar");
        match state {
            NameState::Bound(name) => {
                assert_eq!(name.render(), "/$/inet/0/1010");
                assert_eq!(name.addresses(), ["0.0.0.0:1010".parse().unwrap()].into());
            }
            other => panic!("expected bound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn residual_suffix_survives_rewrites() {
        let state = bind("/zk=>/$/inet/127.0.0.1;/s=>/zk/9990", "/s");
        match state {
            NameState::Bound(name) => assert_eq!(name.render(), "/$/inet/127.0.0.1/9990"),
            other => panic!("expected bound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unmatched_path_has_no_brokers() {
        assert!(matches!(
            bind("/other=>/$/inet/0/1", "/foo"),
            NameState::Failed(NameFault::NoBrokers { .. })
        ));
    }

    #[tokio::test]
    async fn explicit_fail_has_no_brokers() {
        assert!(matches!(
            bind("/foo=>!", "/foo"),
            NameState::Failed(NameFault::NoBrokers { .. })
        ));
    }

    #[tokio::test]
    async fn nil_resolves_to_nothing() {
        assert!(matches!(
            bind("/foo=>/$/nil", "/foo"),
            NameState::Failed(NameFault::NoBrokers { .. })
        ));
    }

    #[tokio::test]
    async fn alternation_skips_negative_branches() {
        let state = bind("/foo=>/missing | /$/inet/0/2020", "/foo");
        match state {
            NameState::Bound(name) => assert_eq!(name.render(), "/$/inet/0/2020"),
            other => panic!("expected bound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn union_synthesises_an_aggregate() {
        let state = bind("/foo=>/$/inet/0/1 & /$/inet/0/2", "/foo");
        match state {
            NameState::Bound(name) => {
                assert!(matches!(name.id(), NameId::Composite(_)));
                assert_eq!(name.addresses().len(), 2);
            }
            other => panic!("expected bound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn delegation_cycles_hit_the_depth_limit() {
        assert!(matches!(
            bind("/a=>/b;/b=>/a", "/a"),
            NameState::Failed(NameFault::TooDeep { .. })
        ));
    }

    #[tokio::test]
    async fn malformed_inet_names_fail() {
        assert!(matches!(
            bind("/foo=>/$/inet/0/notaport", "/foo"),
            NameState::Failed(NameFault::Message(_))
        ));
        assert!(matches!(
            bind("/foo=>/$/inet/0", "/foo"),
            NameState::Failed(NameFault::Message(_))
        ));
    }
}
