//! Delegation tables: ordered rewrite rules from path prefixes to name trees.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};

use crate::path::{is_path_char, ParseError, Path};
use crate::tree::{NameTree, Weighted};

/// A single delegation: rewrite any path beginning with `prefix` into
/// `dst`, with the remainder of the path appended to every leaf.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Dentry {
    pub prefix: Path,
    pub dst: NameTree<Path>,
}

impl Dentry {
    pub fn new(prefix: Path, dst: NameTree<Path>) -> Dentry {
        Dentry { prefix, dst }
    }
}

impl fmt::Display for Dentry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=>{}", self.prefix, self.dst)
    }
}

/// An ordered list of delegations.
///
/// Later entries take precedence over earlier ones; tables compose by
/// concatenation, so the effective table for a request is
/// `base.concat(&local)`.
///
/// ```
/// use tether_name::{Dtab, Path};
///
/// let dtab = Dtab::read("/s => /s#/prod; /s/users => /$/inet/0/9990").unwrap();
/// let tree = dtab.lookup(&Path::read("/s/users").unwrap());
/// assert_eq!(tree.to_string(), "/$/inet/0/9990 | /s#/prod/users");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Dtab {
    entries: Vec<Dentry>,
}

static BASE: RwLock<Dtab> = RwLock::new(Dtab::empty());

tokio::task_local! {
    static LOCAL: Dtab;
}

impl Dtab {
    /// The empty table.
    pub const fn empty() -> Dtab {
        Dtab {
            entries: Vec::new(),
        }
    }

    pub fn new(entries: Vec<Dentry>) -> Dtab {
        Dtab { entries }
    }

    /// Parses a table from `prefix=>tree` entries separated by `;`.
    pub fn read(s: &str) -> Result<Dtab, ParseError> {
        Parser::new(s).parse_dtab()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Dentry> {
        self.entries.iter()
    }

    /// Returns `self` extended by all entries of `other`; `other`'s entries
    /// take precedence.
    pub fn concat(&self, other: &Dtab) -> Dtab {
        if other.is_empty() {
            return self.clone();
        }
        let mut entries = self.entries.clone();
        entries.extend(other.entries.iter().cloned());
        Dtab { entries }
    }

    /// Looks `path` up in the table.
    ///
    /// Every entry whose prefix matches contributes its destination tree
    /// with the residual path appended to each leaf; contributions are
    /// tried latest-first. A path no entry matches resolves to
    /// [`NameTree::Neg`].
    pub fn lookup(&self, path: &Path) -> NameTree<Path> {
        let mut rewrites: Vec<NameTree<Path>> = Vec::new();
        for dentry in self.entries.iter().rev() {
            if let Some(suffix) = path.strip_prefix(&dentry.prefix) {
                rewrites.push(
                    dentry
                        .dst
                        .clone()
                        .map(&mut |leaf: Path| leaf.concat(&suffix)),
                );
            }
        }
        match rewrites.len() {
            0 => NameTree::Neg,
            1 => match rewrites.pop() {
                Some(tree) => tree,
                None => NameTree::Neg,
            },
            _ => NameTree::Alt(rewrites),
        }
    }

    /// A snapshot of the process-wide base table.
    pub fn base() -> Dtab {
        BASE.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replaces the process-wide base table.
    pub fn set_base(dtab: Dtab) {
        *BASE.write().unwrap_or_else(PoisonError::into_inner) = dtab;
    }

    /// A snapshot of the request-scoped local table; empty outside any
    /// [`with_local`](Dtab::with_local) scope.
    pub fn local() -> Dtab {
        LOCAL.try_with(Dtab::clone).unwrap_or_else(|_| Dtab::empty())
    }

    /// Runs `fut` with `dtab` as the local table. The previous local table
    /// is restored when the future completes, on all paths.
    pub async fn with_local<F: Future>(dtab: Dtab, fut: F) -> F::Output {
        LOCAL.scope(dtab, fut).await
    }
}

impl fmt::Display for Dtab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, dentry) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ";")?;
            }
            write!(f, "{dentry}")?;
        }
        Ok(())
    }
}

impl FromStr for Dtab {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Dtab::read(s)
    }
}

impl FromIterator<Dentry> for Dtab {
    fn from_iter<I: IntoIterator<Item = Dentry>>(iter: I) -> Dtab {
        Dtab {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Recursive-descent parser over the dtab grammar:
///
/// ```text
/// dtab     := dentry (';' dentry)* ';'?
/// dentry   := path '=>' tree
/// tree     := union ('|' union)*
/// union    := weighted ('&' weighted)*
/// weighted := (number '*')? simple
/// simple   := path | '~' | '!' | '$' | '(' tree ')'
/// ```
struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Parser<'a> {
        Parser { src, pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.bump();
        }
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError::new(format!("{} at offset {}", message.into(), self.pos))
    }

    fn parse_dtab(&mut self) -> Result<Dtab, ParseError> {
        let mut entries = Vec::new();
        loop {
            self.skip_ws();
            if self.peek().is_none() {
                break;
            }
            entries.push(self.parse_dentry()?);
            self.skip_ws();
            if !self.eat(';') {
                self.skip_ws();
                if self.peek().is_some() {
                    return Err(self.error("expected ';' between delegations"));
                }
                break;
            }
        }
        Ok(Dtab { entries })
    }

    fn parse_dentry(&mut self) -> Result<Dentry, ParseError> {
        let prefix = self.parse_path()?;
        self.skip_ws();
        if !(self.eat('=') && self.eat('>')) {
            return Err(self.error("expected '=>'"));
        }
        self.skip_ws();
        let dst = self.parse_tree()?;
        Ok(Dentry { prefix, dst })
    }

    fn parse_tree(&mut self) -> Result<NameTree<Path>, ParseError> {
        let mut branches = vec![self.parse_union()?];
        loop {
            self.skip_ws();
            if self.peek() == Some('|') {
                self.bump();
                self.skip_ws();
                branches.push(self.parse_union()?);
            } else {
                break;
            }
        }
        if branches.len() == 1 {
            return Ok(branches.remove(0));
        }
        Ok(NameTree::Alt(branches))
    }

    fn parse_union(&mut self) -> Result<NameTree<Path>, ParseError> {
        let mut members = vec![self.parse_weighted()?];
        loop {
            self.skip_ws();
            if self.peek() == Some('&') {
                self.bump();
                self.skip_ws();
                members.push(self.parse_weighted()?);
            } else {
                break;
            }
        }
        if members.len() == 1
            && members[0].weight.to_bits() == Weighted::<Path>::DEFAULT_WEIGHT.to_bits()
        {
            return Ok(members.remove(0).tree);
        }
        Ok(NameTree::Union(members))
    }

    fn parse_weighted(&mut self) -> Result<Weighted<Path>, ParseError> {
        let weight = if matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            let w = self.parse_number()?;
            self.skip_ws();
            if !self.eat('*') {
                return Err(self.error("expected '*' after weight"));
            }
            self.skip_ws();
            w
        } else {
            Weighted::<Path>::DEFAULT_WEIGHT
        };
        Ok(Weighted::new(weight, self.parse_simple()?))
    }

    fn parse_simple(&mut self) -> Result<NameTree<Path>, ParseError> {
        match self.peek() {
            Some('/') => Ok(NameTree::Leaf(self.parse_path()?)),
            Some('~') => {
                self.bump();
                Ok(NameTree::Neg)
            }
            Some('!') => {
                self.bump();
                Ok(NameTree::Fail)
            }
            Some('$') => {
                self.bump();
                Ok(NameTree::Empty)
            }
            Some('(') => {
                self.bump();
                self.skip_ws();
                let tree = self.parse_tree()?;
                self.skip_ws();
                if !self.eat(')') {
                    return Err(self.error("expected ')'"));
                }
                Ok(tree)
            }
            _ => Err(self.error("expected a name tree")),
        }
    }

    fn parse_path(&mut self) -> Result<Path, ParseError> {
        if !self.eat('/') {
            return Err(self.error("expected '/'"));
        }
        let mut elems: Vec<Box<str>> = Vec::new();
        loop {
            let start = self.pos;
            while matches!(self.peek(), Some(c) if is_path_char(c)) {
                self.bump();
            }
            if start == self.pos {
                return Err(self.error("empty path element"));
            }
            elems.push(Box::from(&self.src[start..self.pos]));
            if !self.eat('/') {
                break;
            }
        }
        Ok(Path::from_elements(elems))
    }

    fn parse_number(&mut self) -> Result<f64, ParseError> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit() || c == '.') {
            self.bump();
        }
        self.src[start..self.pos]
            .parse::<f64>()
            .map_err(|_| self.error("invalid weight"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> Path {
        Path::read(s).unwrap()
    }

    #[test]
    fn read_and_show_round_trip() {
        for src in [
            "/foo/bar=>/t",
            "/foo=>/a & /b",
            "/foo=>/a | /b;/bar=>~",
            "/s=>0.5*/a & 0.5*/b",
            "/dead=>!",
            "/nowhere=>$",
        ] {
            let dtab = Dtab::read(src).unwrap();
            assert_eq!(dtab.to_string(), src, "round-trip for {src}");
        }
    }

    #[test]
    fn read_tolerates_whitespace_and_trailing_separator() {
        let dtab = Dtab::read("  /foo/bar => /t ;  /bar => /u ; ").unwrap();
        assert_eq!(dtab.len(), 2);
        assert_eq!(dtab.to_string(), "/foo/bar=>/t;/bar=>/u");
    }

    #[test]
    fn read_rejects_garbage() {
        assert!(Dtab::read("/foo").is_err());
        assert!(Dtab::read("/foo=>").is_err());
        assert!(Dtab::read("/foo=>bar").is_err());
        assert!(Dtab::read("/foo=>/a extra").is_err());
    }

    #[test]
    fn lookup_appends_residual_suffix() {
        let dtab = Dtab::read("/foo=>/t").unwrap();
        let tree = dtab.lookup(&path("/foo/bar/baz"));
        assert_eq!(tree, NameTree::Leaf(path("/t/bar/baz")));
    }

    #[test]
    fn lookup_prefers_later_entries() {
        let dtab = Dtab::read("/foo=>/old;/foo=>/new").unwrap();
        let tree = dtab.lookup(&path("/foo/x"));
        assert_eq!(
            tree,
            NameTree::Alt(vec![
                NameTree::Leaf(path("/new/x")),
                NameTree::Leaf(path("/old/x")),
            ])
        );
    }

    #[test]
    fn lookup_without_match_is_neg() {
        let dtab = Dtab::read("/foo=>/t").unwrap();
        assert_eq!(dtab.lookup(&path("/bar")), NameTree::Neg);
        assert_eq!(Dtab::empty().lookup(&path("/foo")), NameTree::Neg);
    }

    #[test]
    fn concat_orders_overrides_last() {
        let base = Dtab::read("/s=>/base").unwrap();
        let local = Dtab::read("/s=>/local").unwrap();
        let combined = base.concat(&local);
        assert_eq!(combined.to_string(), "/s=>/base;/s=>/local");
        // Later entry is tried first.
        match combined.lookup(&path("/s/x")) {
            NameTree::Alt(branches) => {
                assert_eq!(branches[0], NameTree::Leaf(path("/local/x")))
            }
            other => panic!("expected alt, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn local_dtab_is_scoped_to_the_task() {
        assert!(Dtab::local().is_empty());
        let inner = Dtab::read("/foo=>/bar").unwrap();
        let seen = Dtab::with_local(inner.clone(), async { Dtab::local() }).await;
        assert_eq!(seen, inner);
        assert!(Dtab::local().is_empty());
    }
}
