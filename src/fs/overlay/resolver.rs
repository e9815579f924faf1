//! Namespace resolver
//!
//! Decides, per call, whether a request path is served by the in-memory
//! table or delegated to the passthrough collaborator.

use std::fs;
use std::path::{Path, PathBuf};

use super::locator::BackingLocator;
use super::memory::MemoryTable;

/// Outcome of resolving a request path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Served by the in-memory table under `key`
    InMemory { key: PathBuf },
    /// Served by the passthrough; `backing` is the primary-wins location
    Delegate { backing: PathBuf },
}

impl Resolution {
    pub fn is_in_memory(&self) -> bool {
        matches!(self, Resolution::InMemory { .. })
    }

    /// Whether a delegated path exists in either backing root
    pub fn exists(&self) -> bool {
        match self {
            Resolution::InMemory { .. } => true,
            Resolution::Delegate { backing } => fs::symlink_metadata(backing).is_ok(),
        }
    }
}

/// Classifies request paths against the locator and the in-memory table
#[derive(Debug, Clone)]
pub struct Resolver {
    locator: BackingLocator,
}

impl Resolver {
    pub fn new(locator: BackingLocator) -> Self {
        Self { locator }
    }

    pub fn locator(&self) -> &BackingLocator {
        &self.locator
    }

    /// Key a newly created in-memory entry is stored under
    pub fn anchor(&self, path: &Path) -> PathBuf {
        self.locator.locate(path, true)
    }

    /// Classify `path`.
    ///
    /// Membership is always tested on resolved absolute paths, never on the
    /// raw request path. The fallback-anchored key is checked first so an
    /// in-memory entry keeps shadowing a same-named file that later shows up
    /// in the primary root.
    pub fn classify(&self, memory: &MemoryTable, path: &Path) -> Resolution {
        let anchored = self.anchor(path);
        if memory.contains(&anchored) {
            return Resolution::InMemory { key: anchored };
        }

        let backing = self.locator.locate(path, false);
        if memory.contains(&backing) {
            return Resolution::InMemory { key: backing };
        }

        Resolution::Delegate { backing }
    }
}
