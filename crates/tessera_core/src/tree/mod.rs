//! In-memory data tree.
//!
//! The tree store a partition applies committed transactions to. A tree is
//! a [`Node`] root (always a container) addressed by [`Path`]s and changed
//! only through ordered [`Modification`] lists, applied atomically.

mod modification;
mod node;
mod path;

pub use modification::Modification;
pub use node::Node;
pub use path::Path;

use crate::error::{DatastoreError, DatastoreResult};

/// A mutable tree owned by one partition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataTree {
    root: Node,
}

impl DataTree {
    /// Creates an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a tree from a snapshot root.
    #[must_use]
    pub fn from_root(root: Node) -> Self {
        Self { root }
    }

    /// Returns the root node.
    #[must_use]
    pub fn root(&self) -> &Node {
        &self.root
    }

    /// Returns an immutable view of the current state.
    #[must_use]
    pub fn snapshot(&self) -> TreeSnapshot {
        TreeSnapshot {
            root: self.root.clone(),
        }
    }

    /// Applies `modifications` in order. Either all apply or none do.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if a modification is structurally invalid against
    /// the state produced by its predecessors.
    pub fn apply(&mut self, modifications: &[Modification]) -> DatastoreResult<()> {
        let mut candidate = self.root.clone();
        for modification in modifications {
            if let Modification::Write { path, data } = modification {
                if path.is_root() && data.is_leaf() {
                    return Err(DatastoreError::validation(
                        "the tree root must be a container",
                    ));
                }
            }
            modification.apply_to(&mut candidate)?;
        }
        self.root = candidate;
        Ok(())
    }

    /// Checks that `modifications` would apply cleanly, returning the
    /// resulting state without changing `self`.
    ///
    /// # Errors
    ///
    /// Returns `Validation` describing the first failing modification.
    pub fn prepare(&self, modifications: &[Modification]) -> DatastoreResult<TreeSnapshot> {
        let mut candidate = self.clone();
        candidate.apply(modifications)?;
        Ok(candidate.snapshot())
    }

    /// Reads the node at `path`.
    #[must_use]
    pub fn read(&self, path: &Path) -> Option<Node> {
        self.root.descendant(path.segments()).cloned()
    }
}

/// Immutable, cheaply cloned view of a tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeSnapshot {
    root: Node,
}

impl TreeSnapshot {
    /// Reads the node at `path`.
    #[must_use]
    pub fn read(&self, path: &Path) -> Option<Node> {
        self.root.descendant(path.segments()).cloned()
    }

    /// Returns true if a node exists at `path`.
    #[must_use]
    pub fn exists(&self, path: &Path) -> bool {
        self.root.descendant(path.segments()).is_some()
    }

    /// Returns the root node.
    #[must_use]
    pub fn root(&self) -> &Node {
        &self.root
    }
}

/// Computes the node at `at` after `modifications`, given the node found
/// there before them.
///
/// Used to layer staged, not-yet-committed changes over a partition read.
///
/// # Errors
///
/// Returns `Validation` if a modification cannot apply.
pub fn overlay(
    at: &Path,
    base: Option<Node>,
    modifications: &[Modification],
) -> DatastoreResult<Option<Node>> {
    modifications
        .iter()
        .try_fold(base, |node, modification| modification.apply_at(at, node))
}
