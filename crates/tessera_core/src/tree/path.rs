//! Paths into the data tree.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Location of a node in the data tree, as a list of child names.
///
/// The empty path is the tree root.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Path(Vec<String>);

impl Path {
    /// The root path.
    #[must_use]
    pub const fn root() -> Self {
        Self(Vec::new())
    }

    /// Creates a path from its segments.
    #[must_use]
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Parses a slash-separated path such as `/network/topology`.
    /// Empty segments are ignored, so `/` and `` both denote the root.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        Self(
            text.split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect(),
        )
    }

    /// Returns the child path `self/name`.
    #[must_use]
    pub fn child(&self, name: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(name.into());
        Self(segments)
    }

    /// Returns the segments of the path.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Returns the first segment, which selects the shard.
    #[must_use]
    pub fn first(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// Returns true for the root path.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns true if `self` equals `ancestor` or lies beneath it.
    #[must_use]
    pub fn starts_with(&self, ancestor: &Path) -> bool {
        self.0.starts_with(&ancestor.0)
    }

    /// Returns the segments of `self` below `ancestor`, if it is one.
    #[must_use]
    pub fn relative_to(&self, ancestor: &Path) -> Option<&[String]> {
        self.0.strip_prefix(ancestor.0.as_slice())
    }

    /// Returns true if one path is an ancestor of (or equal to) the other.
    #[must_use]
    pub fn overlaps(&self, other: &Path) -> bool {
        self.starts_with(other) || other.starts_with(self)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.0 {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let path = Path::parse("/network//topology/");
        assert_eq!(path.segments(), &["network", "topology"]);
        assert_eq!(path.to_string(), "/network/topology");
        assert_eq!(Path::parse("/"), Path::root());
        assert_eq!(Path::root().to_string(), "/");
    }

    #[test]
    fn ancestry() {
        let parent = Path::parse("/a/b");
        let child = parent.child("c");
        assert!(child.starts_with(&parent));
        assert!(!parent.starts_with(&child));
        assert!(parent.overlaps(&child));
        assert!(!Path::parse("/a/x").overlaps(&child));
        assert_eq!(child.relative_to(&parent), Some(&["c".to_owned()][..]));
        assert_eq!(parent.relative_to(&child), None);
        assert!(child.starts_with(&Path::root()));
    }
}
