//! Backing store locator
//!
//! Maps a mount-relative path onto one of the two real directory trees.
//! The primary root wins whenever it holds the path; everything else is
//! read through from the fallback root.

use std::fs;
use std::path::{Path, PathBuf};

/// Which backing tree a located path lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Primary,
    Fallback,
    /// Present in neither root; the located path is a fallback placeholder
    Missing,
}

/// Resolves request paths against the primary and fallback roots
#[derive(Debug, Clone)]
pub struct BackingLocator {
    /// Root of the primary tree
    primary: PathBuf,
    /// Root of the fallback tree
    fallback: PathBuf,
}

impl BackingLocator {
    pub fn new(primary: PathBuf, fallback: PathBuf) -> Self {
        Self { primary, fallback }
    }

    pub fn primary_root(&self) -> &Path {
        &self.primary
    }

    pub fn fallback_root(&self) -> &Path {
        &self.fallback
    }

    /// Resolve a request path to an absolute backing path.
    ///
    /// With `prefer_fallback` the fallback root is used unconditionally.
    /// Otherwise the primary copy is returned when it exists on disk, and the
    /// fallback path is returned in every other case, even when nothing is
    /// there, so callers always get a concrete path to fail against.
    ///
    /// Never cached: either tree may change between calls.
    pub fn locate(&self, path: &Path, prefer_fallback: bool) -> PathBuf {
        let relative = strip_root(path);

        if prefer_fallback {
            return self.fallback.join(relative);
        }

        let primary = self.primary.join(relative);
        if primary.exists() {
            primary
        } else {
            self.fallback.join(relative)
        }
    }

    /// Report which layer currently serves `path`
    pub fn layer_of(&self, path: &Path) -> Layer {
        let relative = strip_root(path);
        if self.primary.join(relative).exists() {
            Layer::Primary
        } else if fs::symlink_metadata(self.fallback.join(relative)).is_ok() {
            Layer::Fallback
        } else {
            Layer::Missing
        }
    }
}

/// Strip a single leading separator
pub(crate) fn strip_root(path: &Path) -> &Path {
    path.strip_prefix("/").unwrap_or(path)
}
