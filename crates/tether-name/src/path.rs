//! Hierarchical logical service names.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// A hierarchical logical name for a service, e.g. `/s/users`.
///
/// Paths are immutable and cheap to clone; equality, ordering, and hashing
/// are structural over the path elements.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Path {
    elems: Arc<[Box<str>]>,
}

pub(crate) fn is_path_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '#' | '$' | '%' | ':')
}

impl Path {
    /// The empty path, printed as `/`.
    pub fn empty() -> Path {
        Path {
            elems: Vec::new().into(),
        }
    }

    pub(crate) fn from_elements(elems: Vec<Box<str>>) -> Path {
        Path {
            elems: elems.into(),
        }
    }

    /// Parses a path from its canonical `/a/b/c` form.
    ///
    /// `"/"` parses to the empty path. Elements may not be empty and are
    /// limited to alphanumerics and `_ - . # $ % :`.
    pub fn read(s: &str) -> Result<Path, ParseError> {
        let s = s.trim();
        if s == "/" {
            return Ok(Path::empty());
        }
        let rest = s
            .strip_prefix('/')
            .ok_or_else(|| ParseError::new(format!("path must begin with '/': {s:?}")))?;
        let mut elems = Vec::new();
        for seg in rest.split('/') {
            if seg.is_empty() {
                return Err(ParseError::new(format!("empty path element in {s:?}")));
            }
            if !seg.chars().all(is_path_char) {
                return Err(ParseError::new(format!(
                    "invalid character in path element {seg:?}"
                )));
            }
            elems.push(Box::from(seg));
        }
        Ok(Path::from_elements(elems))
    }

    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    pub fn len(&self) -> usize {
        self.elems.len()
    }

    /// Iterates over the path elements as `&str`.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.elems.iter().map(|s| s.as_ref())
    }

    /// True iff `prefix` is a (non-strict) prefix of this path.
    pub fn starts_with(&self, prefix: &Path) -> bool {
        prefix.elems.len() <= self.elems.len()
            && prefix.elems.iter().zip(self.elems.iter()).all(|(a, b)| a == b)
    }

    /// Removes `prefix` from the front of this path, if it matches.
    pub fn strip_prefix(&self, prefix: &Path) -> Option<Path> {
        if !self.starts_with(prefix) {
            return None;
        }
        Some(Path::from_elements(
            self.elems[prefix.elems.len()..].to_vec(),
        ))
    }

    /// Returns `self` followed by all elements of `suffix`.
    pub fn concat(&self, suffix: &Path) -> Path {
        if suffix.is_empty() {
            return self.clone();
        }
        if self.is_empty() {
            return suffix.clone();
        }
        Path::from_elements(
            self.elems
                .iter()
                .chain(suffix.elems.iter())
                .cloned()
                .collect(),
        )
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.elems.is_empty() {
            return write!(f, "/");
        }
        for elem in self.elems.iter() {
            write!(f, "/{elem}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Path({self})")
    }
}

impl FromStr for Path {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Path::read(s)
    }
}

/// Error parsing a [`Path`] or a [`Dtab`](crate::Dtab) from text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    message: String,
}

impl ParseError {
    pub(crate) fn new(message: impl Into<String>) -> ParseError {
        ParseError {
            message: message.into(),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ParseError {}
