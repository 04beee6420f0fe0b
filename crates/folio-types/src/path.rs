//! Normalized resource paths.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a string cannot be used as a [`ResourcePath`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("resource path is empty")]
    Empty,
    #[error("resource path must be absolute: '{0}'")]
    NotAbsolute(String),
    #[error("resource path contains an empty segment: '{0}'")]
    EmptySegment(String),
}

/// An absolute, normalized path into the collection tree.
///
/// Stored with a leading `/`, no trailing `/`, and no empty segments, e.g.
/// `/db/shakespeare/plays`. The first segment is the tree root; every
/// non-root path has exactly one parent, so each target has a unique
/// root-to-leaf chain — the property the locking order relies on. Document
/// URIs use the same form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourcePath(String);

impl ResourcePath {
    /// Parse and normalize `raw`.
    ///
    /// Trailing slashes are dropped; everything else must already be in
    /// normal form.
    pub fn new(raw: &str) -> Result<Self, PathError> {
        let trimmed = raw.trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(PathError::Empty);
        }
        let Some(rest) = trimmed.strip_prefix('/') else {
            return Err(PathError::NotAbsolute(raw.to_owned()));
        };
        if rest.split('/').any(str::is_empty) {
            return Err(PathError::EmptySegment(raw.to_owned()));
        }
        Ok(Self(trimmed.to_owned()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Number of segments; at least 1.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.0.bytes().filter(|b| *b == b'/').count()
    }

    /// Whether this path is the tree root (a single segment).
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.depth() == 1
    }

    /// The parent path, or `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<ResourcePath> {
        let cut = self.0.rfind('/').unwrap_or(0);
        if cut == 0 {
            None
        } else {
            Some(Self(self.0[..cut].to_owned()))
        }
    }

    /// The path segments, root first.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0[1..].split('/')
    }

    /// The root-to-leaf chain of ancestor paths, ending with `self`:
    /// `/db/a/b` yields `/db`, `/db/a`, `/db/a/b`.
    pub fn chain(&self) -> impl Iterator<Item = &str> {
        let full = self.0.as_str();
        full.match_indices('/')
            .skip(1)
            .map(move |(at, _)| &full[..at])
            .chain(std::iter::once(full))
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ResourcePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for ResourcePath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ResourcePath {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<ResourcePath> for String {
    fn from(path: ResourcePath) -> Self {
        path.0
    }
}

impl PartialEq<&str> for ResourcePath {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}
