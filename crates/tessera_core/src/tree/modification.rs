//! Ordered tree modifications.

use super::{Node, Path};
use crate::error::DatastoreResult;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One staged change to the tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Modification {
    /// Replace the node at `path`.
    Write {
        /// Target path.
        path: Path,
        /// New node.
        data: Node,
    },
    /// Merge `data` into the node at `path`.
    Merge {
        /// Target path.
        path: Path,
        /// Node to merge.
        data: Node,
    },
    /// Remove the node at `path`.
    Delete {
        /// Target path.
        path: Path,
    },
}

impl Modification {
    /// Returns the target path.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Write { path, .. } | Self::Merge { path, .. } | Self::Delete { path } => path,
        }
    }

    /// Returns true if this replaces the whole tree.
    ///
    /// Such a change cannot be expressed as a delta against the log, so
    /// applying it forces a snapshot.
    #[must_use]
    pub fn is_root_overwrite(&self) -> bool {
        matches!(self, Self::Write { path, .. } | Self::Delete { path } if path.is_root())
    }

    /// Applies this change to `root`.
    pub(crate) fn apply_to(&self, root: &mut Node) -> DatastoreResult<()> {
        match self {
            Self::Write { path, data } => root.write_at(path.segments(), data.clone()),
            Self::Merge { path, data } => root.merge_at(path.segments(), data),
            Self::Delete { path } => {
                root.delete_at(path.segments());
                Ok(())
            }
        }
    }

    /// Applies this change to `subtree`, the node found at `at` (or `None`
    /// if absent), and returns the new node at `at`.
    ///
    /// Changes above `at` are projected down onto it, changes below it are
    /// applied inside it, and unrelated changes leave it untouched.
    pub(crate) fn apply_at(&self, at: &Path, subtree: Option<Node>) -> DatastoreResult<Option<Node>> {
        if let Some(below) = self.path().relative_to(at) {
            // Target is `at` itself or beneath it.
            return match self {
                Self::Delete { .. } if below.is_empty() => Ok(None),
                Self::Delete { .. } => Ok(subtree.map(|mut node| {
                    node.delete_at(below);
                    node
                })),
                Self::Write { data, .. } => {
                    let mut node = subtree.unwrap_or_default();
                    node.write_at(below, data.clone())?;
                    Ok(Some(node))
                }
                Self::Merge { data, .. } => match subtree {
                    None if below.is_empty() => Ok(Some(data.clone())),
                    subtree => {
                        let mut node = subtree.unwrap_or_default();
                        node.merge_at(below, data)?;
                        Ok(Some(node))
                    }
                },
            };
        }

        let Some(above) = at.relative_to(self.path()) else {
            return Ok(subtree);
        };
        // Target is an ancestor of `at`.
        match self {
            Self::Delete { .. } => Ok(None),
            Self::Write { data, .. } => Ok(data.descendant(above).cloned()),
            Self::Merge { data, .. } => match (subtree, data.descendant(above)) {
                (subtree, None) => Ok(subtree),
                (None, Some(incoming)) => Ok(Some(incoming.clone())),
                (Some(mut node), Some(incoming)) => {
                    node.merge(incoming)?;
                    Ok(Some(node))
                }
            },
        }
    }
}

impl fmt::Display for Modification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Write { path, .. } => write!(f, "write {path}"),
            Self::Merge { path, .. } => write!(f, "merge {path}"),
            Self::Delete { path } => write!(f, "delete {path}"),
        }
    }
}
