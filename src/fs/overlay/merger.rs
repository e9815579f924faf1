//! Directory merger
//!
//! Builds one listing out of the primary tree, the fallback tree and the
//! in-memory table.

use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::path::Path;
use tracing::warn;

use super::inode::NodeKind;
use super::locator::BackingLocator;
use super::memory::MemoryTable;

/// Where a listed name came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntrySource {
    /// `.` and `..`
    Synthetic,
    Primary,
    Fallback,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedEntry {
    pub name: OsString,
    pub kind: NodeKind,
    pub source: EntrySource,
}

/// Merges directory listings across all three layers
#[derive(Debug, Clone)]
pub struct DirectoryMerger {
    locator: BackingLocator,
    deduplicate: bool,
}

impl DirectoryMerger {
    pub fn new(locator: BackingLocator, deduplicate: bool) -> Self {
        Self {
            locator,
            deduplicate,
        }
    }

    /// List `path`: `.` and `..`, then the primary-wins directory, then the
    /// fallback directory, then in-memory children.
    ///
    /// With deduplication a name is reported once, from the first layer in
    /// that order that has it.
    pub fn list(&self, memory: &MemoryTable, path: &Path) -> Vec<MergedEntry> {
        let mut entries = vec![
            MergedEntry {
                name: OsString::from("."),
                kind: NodeKind::Directory,
                source: EntrySource::Synthetic,
            },
            MergedEntry {
                name: OsString::from(".."),
                kind: NodeKind::Directory,
                source: EntrySource::Synthetic,
            },
        ];
        let mut seen: HashSet<OsString> =
            entries.iter().map(|e| e.name.clone()).collect();

        let read_through = self.locator.locate(path, false);
        let anchored = self.locator.locate(path, true);

        let primary_source = if read_through.starts_with(self.locator.primary_root()) {
            EntrySource::Primary
        } else {
            EntrySource::Fallback
        };

        let mut push = |entries: &mut Vec<MergedEntry>,
                        name: OsString,
                        kind: NodeKind,
                        source: EntrySource| {
            if self.deduplicate && !seen.insert(name.clone()) {
                return;
            }
            entries.push(MergedEntry { name, kind, source });
        };

        for (name, kind) in read_backing_dir(&read_through) {
            push(&mut entries, name, kind, primary_source);
        }

        // Read-through already landed on the fallback copy
        if anchored != read_through || !self.deduplicate {
            for (name, kind) in read_backing_dir(&anchored) {
                push(&mut entries, name, kind, EntrySource::Fallback);
            }
        }

        for (name, kind) in memory.children(&anchored) {
            push(&mut entries, name, kind, EntrySource::Memory);
        }

        entries
    }
}

/// Entries of a real directory; empty when it is not a directory
fn read_backing_dir(dir: &Path) -> Vec<(OsString, NodeKind)> {
    if !dir.is_dir() {
        return Vec::new();
    }

    let reader = match fs::read_dir(dir) {
        Ok(reader) => reader,
        Err(e) => {
            warn!("Failed to list backing directory {:?}: {}", dir, e);
            return Vec::new();
        }
    };

    let mut entries: Vec<_> = reader
        .flatten()
        .map(|entry| {
            let kind = entry
                .file_type()
                .map(NodeKind::from)
                .unwrap_or(NodeKind::RegularFile);
            (entry.file_name(), kind)
        })
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
}
