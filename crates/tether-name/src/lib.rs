//! Logical service names for the tether client stack.
//!
//! This crate models the *name side* of an RPC client: how a caller-facing
//! logical path such as `/s/users` turns into a concrete set of endpoint
//! addresses, and how that answer can change over time.
//!
//! # Types
//!
//! - [`Path`]: a hierarchical logical service name (`/s/users`).
//! - [`Dtab`]: a delegation table, an ordered list of `prefix => tree`
//!   rewrite rules. Tables compose by concatenation; a process-wide base
//!   table and a request-scoped local table are both supported.
//! - [`NameTree`]: a tree combinator over names with union, weighted
//!   union, alternation, and negation.
//! - [`BoundName`]: a fully resolved destination, an identity plus an
//!   observable set of socket addresses.
//! - [`NameState`] / [`NameWatch`]: a reactive name, `Pending`, `Bound`,
//!   or `Failed`, observed through a [`tokio::sync::watch`] channel.
//! - [`NameInterpreter`]: binds a `(Dtab, Path)` pair to a [`NameWatch`].
//!
//! # Example
//!
//! ```
//! use tether_name::{Dtab, Path};
//!
//! let dtab = Dtab::read("/s => /$/inet/0/9990").unwrap();
//! let path = Path::read("/s/users").unwrap();
//! let tree = dtab.lookup(&path);
//! assert_eq!(tree.to_string(), "/$/inet/0/9990/users");
//! ```

pub mod bound;
pub mod dtab;
pub mod interpreter;
pub mod path;
pub mod tree;

pub use bound::{BoundName, NameFault, NameId, NameState, NameWatch};
pub use dtab::{Dentry, Dtab};
pub use interpreter::{DefaultInterpreter, NameInterpreter};
pub use path::{ParseError, Path};
pub use tree::{NameTree, Weighted};
