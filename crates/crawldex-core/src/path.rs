//! Hierarchical resource paths.
//!
//! A [`ResourcePath`] addresses a directory or file in the virtual resource
//! tree. It is stored as its segments, so comparison and prefix tests are
//! structural: `/a/b` is a prefix of `/a/b/c` but not of `/a/bc`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ResourcePath {
    segments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("path must be absolute: {0}")]
    NotAbsolute(String),
    #[error("path segment '{0}' is not allowed")]
    BadSegment(String),
}

impl ResourcePath {
    /// The root of the tree (`/`).
    pub fn root() -> Self {
        Self::default()
    }

    pub fn parse(s: &str) -> Result<Self, PathError> {
        if !s.starts_with('/') {
            return Err(PathError::NotAbsolute(s.to_string()));
        }
        let mut segments = Vec::new();
        for seg in s.split('/').filter(|seg| !seg.is_empty()) {
            if seg == "." || seg == ".." {
                return Err(PathError::BadSegment(seg.to_string()));
            }
            segments.push(seg.to_string());
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Number of segments; the root has depth 0.
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn parent(&self) -> Option<ResourcePath> {
        if self.is_root() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Appends one segment. Slashes inside `name` are not interpreted.
    pub fn child(&self, name: &str) -> ResourcePath {
        let mut segments = self.segments.clone();
        segments.push(name.to_string());
        Self { segments }
    }

    pub fn starts_with(&self, prefix: &ResourcePath) -> bool {
        self.segments.len() >= prefix.segments.len()
            && self.segments[..prefix.segments.len()] == prefix.segments[..]
    }

    /// Every ancestor from the root down to (but excluding) `self`.
    pub fn ancestors(&self) -> Vec<ResourcePath> {
        (0..self.segments.len())
            .map(|n| Self {
                segments: self.segments[..n].to_vec(),
            })
            .collect()
    }

    /// Canonical string form with a trailing slash, used as the key in the
    /// crawl state tables so that a plain string prefix test matches whole
    /// segments.
    pub fn to_collection_key(&self) -> String {
        let mut s = self.to_string();
        if !s.ends_with('/') {
            s.push('/');
        }
        s
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for seg in &self.segments {
            write!(f, "/{}", seg)?;
        }
        Ok(())
    }
}

impl FromStr for ResourcePath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<ResourcePath> for String {
    fn from(p: ResourcePath) -> Self {
        p.to_string()
    }
}

impl TryFrom<String> for ResourcePath {
    type Error = PathError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}
