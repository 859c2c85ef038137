//! The `ResourceName` external collaborator.
//!
//! A resource name identifies one node in a tree (database ⊃ table ⊃ page
//! ⊃ row, or whatever granularity the host cares to model). The core only
//! needs value equality, hashing, a parent lookup, and a renderer for error
//! messages; it never interprets the name's internal structure.
//!
//! `PathName` below is a simple slash-joined concrete implementation used by
//! this crate's own tests; hosts embedding the manager in a real storage
//! engine are expected to supply their own `ResourceName` over whatever
//! identifier their catalog already uses.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

/// A node in a resource tree with a known parent.
///
/// A trait rather than a concrete type so a host can model whatever tree
/// shape its storage engine actually has (database/table/page/row, or any
/// other granularity scheme).
pub trait ResourceName: Clone + Eq + Hash + Ord + fmt::Debug + fmt::Display + Send + Sync + 'static {
    /// This node's parent, or `None` at the root.
    fn parent(&self) -> Option<Self>;

    /// All ancestors from nearest to furthest (root last).
    fn ancestors(&self) -> Vec<Self>
    where
        Self: Sized,
    {
        let mut out = Vec::new();
        let mut current = self.parent();
        while let Some(p) = current {
            current = p.parent();
            out.push(p);
        }
        out
    }

    /// Depth in the tree; the root is depth 0. Diagnostic-only.
    fn depth(&self) -> u32
    where
        Self: Sized,
    {
        let mut depth = 0;
        let mut current = self.parent();
        while let Some(p) = current {
            depth += 1;
            current = p.parent();
        }
        depth
    }
}

#[derive(Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct PathInner {
    segment: String,
    parent: Option<PathName>,
}

/// A simple slash-joined path implementation of `ResourceName`. The
/// conventional root name is `"database"`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathName(Arc<PathInner>);

impl PathName {
    /// Creates the root node, conventionally named `"database"`.
    pub fn root(segment: impl Into<String>) -> Self {
        Self(Arc::new(PathInner { segment: segment.into(), parent: None }))
    }

    /// Creates a child of `self` named `segment`.
    pub fn child(&self, segment: impl Into<String>) -> Self {
        Self(Arc::new(PathInner { segment: segment.into(), parent: Some(self.clone()) }))
    }

    /// This node's own path segment (not the full path).
    pub fn segment(&self) -> &str {
        &self.0.segment
    }
}

impl ResourceName for PathName {
    fn parent(&self) -> Option<Self> {
        self.0.parent.clone()
    }
}

impl fmt::Display for PathName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(p) = &self.0.parent {
            write!(f, "{p}/{}", self.0.segment)
        } else {
            f.write_str(&self.0.segment)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_has_no_parent() {
        let db = PathName::root("database");
        assert_eq!(db.parent(), None);
        assert_eq!(db.depth(), 0);
    }

    #[test]
    fn child_parent_chain() {
        let db = PathName::root("database");
        let table = db.child("accounts");
        let page = table.child("page1");
        assert_eq!(page.parent(), Some(table.clone()));
        assert_eq!(table.parent(), Some(db.clone()));
        assert_eq!(page.depth(), 2);
        assert_eq!(page.ancestors(), vec![table.clone(), db.clone()]);
    }

    #[test]
    fn display_joins_segments() {
        let db = PathName::root("database");
        let table = db.child("accounts");
        let page = table.child("page1");
        assert_eq!(page.to_string(), "database/accounts/page1");
    }

    #[test]
    fn equality_is_value_based() {
        let db = PathName::root("database");
        let a = db.child("accounts");
        let b = db.child("accounts");
        assert_eq!(a, b);
        assert_ne!(a, db);
    }
}
