//! Tree nodes with structural sharing.

use crate::error::{DatastoreError, DatastoreResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A node of the data tree.
///
/// Containers hold their children behind an `Arc`, so cloning a tree is
/// O(1) and a modification copies only the nodes on its path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Node {
    /// Opaque value.
    Leaf(Vec<u8>),
    /// Named children.
    Container(Arc<BTreeMap<String, Node>>),
}

impl Default for Node {
    fn default() -> Self {
        Self::container()
    }
}

impl Node {
    /// Creates an empty container.
    #[must_use]
    pub fn container() -> Self {
        Self::Container(Arc::new(BTreeMap::new()))
    }

    /// Creates a leaf holding `value`.
    #[must_use]
    pub fn leaf(value: impl Into<Vec<u8>>) -> Self {
        Self::Leaf(value.into())
    }

    /// Builder: returns this container with `child` inserted under `name`.
    ///
    /// Has no effect on a leaf.
    #[must_use]
    pub fn with_child(mut self, name: impl Into<String>, child: Node) -> Self {
        if let Self::Container(children) = &mut self {
            Arc::make_mut(children).insert(name.into(), child);
        }
        self
    }

    /// Returns true for a leaf.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        matches!(self, Self::Leaf(_))
    }

    /// Returns the value of a leaf.
    #[must_use]
    pub fn value(&self) -> Option<&[u8]> {
        match self {
            Self::Leaf(value) => Some(value),
            Self::Container(_) => None,
        }
    }

    /// Returns the direct child `name`.
    #[must_use]
    pub fn child(&self, name: &str) -> Option<&Node> {
        match self {
            Self::Container(children) => children.get(name),
            Self::Leaf(_) => None,
        }
    }

    /// Returns the children of a container, empty for a leaf.
    pub fn children(&self) -> impl Iterator<Item = (&String, &Node)> {
        let map = match self {
            Self::Container(children) => Some(children.as_ref()),
            Self::Leaf(_) => None,
        };
        map.into_iter().flat_map(|m| m.iter())
    }

    /// Returns the descendant at `segments`.
    #[must_use]
    pub fn descendant(&self, segments: &[String]) -> Option<&Node> {
        segments
            .iter()
            .try_fold(self, |node, segment| node.child(segment))
    }

    /// Number of nodes in this subtree, including itself.
    #[must_use]
    pub fn node_count(&self) -> usize {
        1 + self.children().map(|(_, c)| c.node_count()).sum::<usize>()
    }

    /// Replaces the node at `segments` with `data`, creating intermediate
    /// containers.
    pub(crate) fn write_at(&mut self, segments: &[String], data: Node) -> DatastoreResult<()> {
        match segments.split_first() {
            None => {
                *self = data;
                Ok(())
            }
            Some((head, rest)) => self.child_entry(head)?.write_at(rest, data),
        }
    }

    /// Merges `data` into the node at `segments`. Missing intermediate
    /// nodes become containers and a missing target becomes `data`.
    pub(crate) fn merge_at(&mut self, segments: &[String], data: &Node) -> DatastoreResult<()> {
        let Some((head, rest)) = segments.split_first() else {
            return self.merge(data);
        };
        let Self::Container(children) = self else {
            return Err(DatastoreError::validation(format!(
                "cannot create child '{head}' beneath a leaf"
            )));
        };

        let children = Arc::make_mut(children);
        if let Some(child) = children.get_mut(head) {
            return child.merge_at(rest, data);
        }
        let child = if rest.is_empty() {
            data.clone()
        } else {
            let mut child = Self::container();
            child.merge_at(rest, data)?;
            child
        };
        children.insert(head.clone(), child);
        Ok(())
    }

    /// Removes the node at `segments`. Removing the root empties it;
    /// removing a missing node is a no-op.
    pub(crate) fn delete_at(&mut self, segments: &[String]) {
        let Some((head, rest)) = segments.split_first() else {
            *self = Self::container();
            return;
        };
        let Self::Container(children) = self else {
            return;
        };
        let present = children
            .get(head)
            .is_some_and(|child| child.descendant(rest).is_some());
        if !present {
            return;
        }

        let children = Arc::make_mut(children);
        if rest.is_empty() {
            children.remove(head);
        } else if let Some(child) = children.get_mut(head) {
            child.delete_at(rest);
        }
    }

    /// Merges `data` over `self`: containers merge child by child, leaves
    /// replace leaves.
    pub(crate) fn merge(&mut self, data: &Node) -> DatastoreResult<()> {
        match data {
            Self::Leaf(_) => {
                if !self.is_leaf() {
                    return Err(DatastoreError::validation(
                        "cannot merge a leaf into a container",
                    ));
                }
                *self = data.clone();
                Ok(())
            }
            Self::Container(source) => {
                let Self::Container(target) = self else {
                    return Err(DatastoreError::validation(
                        "cannot merge a container into a leaf",
                    ));
                };
                let target = Arc::make_mut(target);
                for (name, child) in source.iter() {
                    match target.get_mut(name) {
                        Some(existing) => existing.merge(child)?,
                        None => {
                            target.insert(name.clone(), child.clone());
                        }
                    }
                }
                Ok(())
            }
        }
    }

    fn child_entry(&mut self, name: &str) -> DatastoreResult<&mut Node> {
        match self {
            Self::Container(children) => Ok(Arc::make_mut(children)
                .entry(name.to_owned())
                .or_insert_with(Self::container)),
            Self::Leaf(_) => Err(DatastoreError::validation(format!(
                "cannot create child '{name}' beneath a leaf"
            ))),
        }
    }
}
