//! Name trees: the combinator language delegation tables rewrite into.

use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A tree over bindings of type `T`.
///
/// A [`Dtab`](crate::Dtab) lookup produces a `NameTree<Path>`; an
/// interpreter resolves the leaves into a `NameTree<BoundName>`, which
/// [`eval`](NameTree::eval) then reduces to a set of destinations, or to
/// nothing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NameTree<T> {
    /// An individual (possibly still unresolved) name.
    Leaf(T),
    /// Concurrent use of all defined members, with optional weights.
    Union(Vec<Weighted<T>>),
    /// The first defined member wins; written `a | b`.
    Alt(Vec<NameTree<T>>),
    /// Negative resolution: the name is known not to exist here.
    Neg,
    /// A successful resolution to no destinations at all; written `$`.
    Empty,
    /// Resolution failed; written `!`.
    Fail,
}

/// A member of a [`NameTree::Union`] with its relative weight.
#[derive(Debug, Clone)]
pub struct Weighted<T> {
    pub weight: f64,
    pub tree: NameTree<T>,
}

impl<T> Weighted<T> {
    pub const DEFAULT_WEIGHT: f64 = 1.0;

    pub fn new(weight: f64, tree: NameTree<T>) -> Weighted<T> {
        Weighted { weight, tree }
    }
}

// Weights compare and hash by bit pattern so that trees can key caches.
impl<T: PartialEq> PartialEq for Weighted<T> {
    fn eq(&self, other: &Self) -> bool {
        self.weight.to_bits() == other.weight.to_bits() && self.tree == other.tree
    }
}

impl<T: Eq> Eq for Weighted<T> {}

impl<T: Hash> Hash for Weighted<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.weight.to_bits().hash(state);
        self.tree.hash(state);
    }
}

impl<T> NameTree<T> {
    /// Rewrites every leaf with `f`, preserving structure.
    pub fn map<U, F: FnMut(T) -> U>(self, f: &mut F) -> NameTree<U> {
        match self {
            NameTree::Leaf(t) => NameTree::Leaf(f(t)),
            NameTree::Union(ws) => NameTree::Union(
                ws.into_iter()
                    .map(|w| Weighted::new(w.weight, w.tree.map(&mut *f)))
                    .collect(),
            ),
            NameTree::Alt(ts) => {
                NameTree::Alt(ts.into_iter().map(|t| t.map(&mut *f)).collect())
            }
            NameTree::Neg => NameTree::Neg,
            NameTree::Empty => NameTree::Empty,
            NameTree::Fail => NameTree::Fail,
        }
    }
}

impl<T: Clone + Ord> NameTree<T> {
    /// Reduces the tree to a set of destinations, or to nothing.
    ///
    /// `Leaf` yields its binding, `Empty` yields the empty set, and `Neg`
    /// and `Fail` yield nothing. `Alt` takes its first defined branch.
    /// `Union` unions every defined member; a union whose members are all
    /// undefined is itself undefined.
    pub fn eval(&self) -> Option<BTreeSet<T>> {
        match self {
            NameTree::Leaf(t) => {
                let mut set = BTreeSet::new();
                set.insert(t.clone());
                Some(set)
            }
            NameTree::Neg | NameTree::Fail => None,
            NameTree::Empty => Some(BTreeSet::new()),
            NameTree::Alt(ts) => ts.iter().find_map(|t| t.eval()),
            NameTree::Union(ws) => {
                let defined: Vec<BTreeSet<T>> =
                    ws.iter().filter_map(|w| w.tree.eval()).collect();
                if defined.is_empty() && !ws.is_empty() {
                    return None;
                }
                Some(defined.into_iter().flatten().collect())
            }
        }
    }
}

impl<T: fmt::Display> NameTree<T> {
    fn fmt_member(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NameTree::Union(_) | NameTree::Alt(_) => write!(f, "({self})"),
            _ => write!(f, "{self}"),
        }
    }
}

impl<T: fmt::Display> fmt::Display for NameTree<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NameTree::Leaf(t) => write!(f, "{t}"),
            NameTree::Neg => write!(f, "~"),
            NameTree::Empty => write!(f, "$"),
            NameTree::Fail => write!(f, "!"),
            NameTree::Union(ws) => {
                for (i, w) in ws.iter().enumerate() {
                    if i > 0 {
                        write!(f, " & ")?;
                    }
                    if w.weight.to_bits() != Weighted::<T>::DEFAULT_WEIGHT.to_bits() {
                        write!(f, "{}*", w.weight)?;
                    }
                    w.tree.fmt_member(f)?;
                }
                Ok(())
            }
            NameTree::Alt(ts) => {
                for (i, t) in ts.iter().enumerate() {
                    if i > 0 {
                        write!(f, " | ")?;
                    }
                    t.fmt_member(f)?;
                }
                Ok(())
            }
        }
    }
}
