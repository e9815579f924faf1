//! In-memory entry table
//!
//! Holds files and directories created through the mount. They live for the
//! mount session only and never reach either backing tree. Entries are keyed
//! by their resolved absolute backing path; the root entry uses the key `/`.

use crate::config::DEFAULT_MAX_FILE_SIZE;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::inode::{NodeAttributes, NodeKind, PERM_MASK, S_IFMT};

/// Block size reported for in-memory entries
const MEMORY_BLKSIZE: u32 = 512;

/// Metadata records plus byte buffers for in-memory entries.
///
/// Every operation except `create` and `mkdir` expects a key the resolver has
/// already classified as in-memory; a missing key is reported as
/// `Error::Inconsistent`.
#[derive(Debug)]
pub struct MemoryTable {
    /// Resolved path -> metadata
    entries: HashMap<PathBuf, NodeAttributes>,
    /// Resolved path -> contents, present for every regular file
    data: HashMap<PathBuf, Vec<u8>>,
    uid: u32,
    gid: u32,
    /// Largest size a regular file may grow to
    max_file_size: u64,
}

impl MemoryTable {
    /// Create a table holding only the root entry
    pub fn new(root_perm: u32) -> Self {
        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };
        let mut entries = HashMap::new();
        entries.insert(
            root_key(),
            new_attributes(NodeKind::Directory, root_perm, 2, uid, gid),
        );

        Self {
            entries,
            data: HashMap::new(),
            uid,
            gid,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }

    /// Cap the size regular files may grow to
    pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
        self.max_file_size = max_file_size;
        self
    }

    pub fn contains(&self, key: &Path) -> bool {
        self.entries.contains_key(key)
    }

    /// Link count of the root entry
    pub fn root_nlink(&self) -> u32 {
        self.entries.get(&root_key()).map(|e| e.nlink).unwrap_or(2)
    }

    /// Insert a new empty regular file, replacing any entry under `key`
    pub fn create(&mut self, key: PathBuf, mode: u32) {
        let attrs = new_attributes(NodeKind::RegularFile, mode, 1, self.uid, self.gid);
        self.data.insert(key.clone(), Vec::new());
        self.entries.insert(key, attrs);
    }

    /// Insert a new directory and account for it in the root link count
    pub fn mkdir(&mut self, key: PathBuf, mode: u32) {
        let attrs = new_attributes(NodeKind::Directory, mode, 2, self.uid, self.gid);
        self.entries.insert(key, attrs);
        self.adjust_root_nlink(1);
    }

    pub fn attributes(&self, key: &Path) -> Result<NodeAttributes> {
        self.entries
            .get(key)
            .cloned()
            .ok_or_else(|| Error::Inconsistent(key.to_path_buf()))
    }

    /// Bytes `[offset, offset + length)` clipped to the buffer
    pub fn read(&mut self, key: &Path, length: usize, offset: u64) -> Result<Vec<u8>> {
        let entry = self.entry_mut(key)?;
        if entry.kind == NodeKind::Directory {
            return Err(Error::IsADirectory(key.to_path_buf()));
        }
        entry.atime = SystemTime::now();

        let buffer = self
            .data
            .get(key)
            .ok_or_else(|| Error::Inconsistent(key.to_path_buf()))?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(buffer.len());
        let end = start.saturating_add(length).min(buffer.len());
        Ok(buffer[start..end].to_vec())
    }

    /// Replace everything from `offset` onward with `bytes`.
    ///
    /// Content previously past `offset + bytes.len()` is dropped; a gap
    /// between the old end and `offset` is zero-filled.
    pub fn write(&mut self, key: &Path, bytes: &[u8], offset: u64) -> Result<usize> {
        if self.entry(key)?.kind == NodeKind::Directory {
            return Err(Error::IsADirectory(key.to_path_buf()));
        }
        let end = offset.saturating_add(bytes.len() as u64);
        self.check_size(key, end)?;
        let offset = offset as usize;

        let buffer = self
            .data
            .get_mut(key)
            .ok_or_else(|| Error::Inconsistent(key.to_path_buf()))?;
        buffer.resize(offset, 0);
        buffer.extend_from_slice(bytes);
        let size = buffer.len() as u64;

        let entry = self.entry_mut(key)?;
        let now = SystemTime::now();
        entry.size = size;
        entry.blocks = blocks_for(size);
        entry.mtime = now;
        entry.ctime = now;

        Ok(bytes.len())
    }

    /// Resize a file's buffer, zero-filling when it grows
    pub fn truncate(&mut self, key: &Path, size: u64) -> Result<()> {
        self.check_size(key, size)?;
        let len = size as usize;

        let buffer = match self.data.get_mut(key) {
            Some(buffer) => buffer,
            None if self.entries.contains_key(key) => {
                return Err(Error::IsADirectory(key.to_path_buf()))
            }
            None => return Err(Error::Inconsistent(key.to_path_buf())),
        };
        buffer.resize(len, 0);

        let entry = self.entry_mut(key)?;
        let now = SystemTime::now();
        entry.size = size;
        entry.blocks = blocks_for(size);
        entry.mtime = now;
        entry.ctime = now;
        Ok(())
    }

    /// Remove a non-directory entry and its buffer
    pub fn remove(&mut self, key: &Path) -> Result<()> {
        let entry = self.entry(key)?;
        if entry.kind == NodeKind::Directory {
            return Err(Error::IsADirectory(key.to_path_buf()));
        }
        self.entries.remove(key);
        self.data.remove(key);
        Ok(())
    }

    /// Remove an empty directory entry.
    ///
    /// Only the root link count is tracked, so every directory removal
    /// decrements the root's count by one regardless of the actual parent.
    pub fn remove_dir(&mut self, key: &Path) -> Result<()> {
        if key == root_key() {
            return Err(Error::InvalidArgument("cannot remove the root entry".to_string()));
        }
        let entry = self.entry(key)?;
        if entry.kind != NodeKind::Directory {
            return Err(Error::NotADirectory(key.to_path_buf()));
        }
        if self.entries.keys().any(|k| k.parent() == Some(key)) {
            return Err(Error::NotEmpty(key.to_path_buf()));
        }

        self.entries.remove(key);
        self.data.remove(key);
        self.adjust_root_nlink(-1);
        Ok(())
    }

    /// Replace the permission bits, keeping the file-type bits
    pub fn set_mode(&mut self, key: &Path, mode: u32) -> Result<()> {
        let entry = self.entry_mut(key)?;
        entry.mode = (entry.mode & S_IFMT) | (mode & PERM_MASK);
        entry.ctime = SystemTime::now();
        Ok(())
    }

    pub fn set_owner(&mut self, key: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        let entry = self.entry_mut(key)?;
        if let Some(uid) = uid {
            entry.uid = uid;
        }
        if let Some(gid) = gid {
            entry.gid = gid;
        }
        entry.ctime = SystemTime::now();
        Ok(())
    }

    pub fn set_times(
        &mut self,
        key: &Path,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<()> {
        let entry = self.entry_mut(key)?;
        if let Some(atime) = atime {
            entry.atime = atime;
        }
        if let Some(mtime) = mtime {
            entry.mtime = mtime;
        }
        entry.ctime = SystemTime::now();
        Ok(())
    }

    /// Direct children of `dir_key` as bare names
    pub fn children(&self, dir_key: &Path) -> Vec<(OsString, NodeKind)> {
        let mut children: Vec<_> = self
            .entries
            .iter()
            .filter(|(key, _)| key.as_path() != root_key() && key.parent() == Some(dir_key))
            .filter_map(|(key, attrs)| Some((key.file_name()?.to_os_string(), attrs.kind)))
            .collect();
        children.sort_by(|a, b| a.0.cmp(&b.0));
        children
    }

    fn check_size(&self, key: &Path, size: u64) -> Result<()> {
        if size > self.max_file_size || usize::try_from(size).is_err() {
            return Err(Error::FileTooLarge {
                path: key.to_path_buf(),
                size,
                limit: self.max_file_size,
            });
        }
        Ok(())
    }

    fn entry(&self, key: &Path) -> Result<&NodeAttributes> {
        self.entries
            .get(key)
            .ok_or_else(|| Error::Inconsistent(key.to_path_buf()))
    }

    fn entry_mut(&mut self, key: &Path) -> Result<&mut NodeAttributes> {
        self.entries
            .get_mut(key)
            .ok_or_else(|| Error::Inconsistent(key.to_path_buf()))
    }

    fn adjust_root_nlink(&mut self, delta: i64) {
        if let Some(root) = self.entries.get_mut(&root_key()) {
            root.nlink = (root.nlink as i64 + delta).max(2) as u32;
        }
    }
}

fn root_key() -> PathBuf {
    PathBuf::from("/")
}

fn blocks_for(size: u64) -> u64 {
    size.div_ceil(MEMORY_BLKSIZE as u64)
}

fn new_attributes(kind: NodeKind, perm: u32, nlink: u32, uid: u32, gid: u32) -> NodeAttributes {
    let type_bits = match kind {
        NodeKind::Directory => libc::S_IFDIR as u32,
        _ => libc::S_IFREG as u32,
    };
    let now = SystemTime::now();
    NodeAttributes {
        kind,
        mode: type_bits | (perm & PERM_MASK),
        size: 0,
        blocks: 0,
        atime: now,
        mtime: now,
        ctime: now,
        crtime: now,
        nlink,
        uid,
        gid,
        rdev: 0,
        blksize: MEMORY_BLKSIZE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(p: &str) -> PathBuf {
        PathBuf::from(p)
    }

    #[test]
    fn test_root_entry() {
        let table = MemoryTable::new(0o755);
        assert!(table.contains(Path::new("/")));
        assert_eq!(table.root_nlink(), 2);
        let root = table.attributes(Path::new("/")).unwrap();
        assert_eq!(root.kind, NodeKind::Directory);
        assert_eq!(root.perm(), 0o755);
    }

    #[test]
    fn test_create_write_read() {
        let mut table = MemoryTable::new(0o755);
        let a = key("/fb/a.txt");
        table.create(a.clone(), 0o644);

        let attrs = table.attributes(&a).unwrap();
        assert_eq!(attrs.kind, NodeKind::RegularFile);
        assert_eq!(attrs.size, 0);
        assert_eq!(attrs.nlink, 1);

        assert_eq!(table.write(&a, b"hello", 0).unwrap(), 5);
        assert_eq!(table.read(&a, 5, 0).unwrap(), b"hello");
        assert_eq!(table.write(&a, b"world", 5).unwrap(), 5);
        assert_eq!(table.read(&a, 10, 0).unwrap(), b"helloworld");
        assert_eq!(table.attributes(&a).unwrap().size, 10);
    }

    #[test]
    fn test_write_truncates_tail() {
        let mut table = MemoryTable::new(0o755);
        let a = key("/fb/a.txt");
        table.create(a.clone(), 0o644);
        table.write(&a, b"helloworld", 0).unwrap();
        table.write(&a, b"J", 0).unwrap();
        assert_eq!(table.read(&a, 100, 0).unwrap(), b"J");
        assert_eq!(table.attributes(&a).unwrap().size, 1);
    }

    #[test]
    fn test_write_past_end_zero_fills() {
        let mut table = MemoryTable::new(0o755);
        let a = key("/fb/a.txt");
        table.create(a.clone(), 0o644);
        table.write(&a, b"xy", 4).unwrap();
        assert_eq!(table.read(&a, 10, 0).unwrap(), b"\0\0\0\0xy");
    }

    #[test]
    fn test_read_is_clipped() {
        let mut table = MemoryTable::new(0o755);
        let a = key("/fb/a.txt");
        table.create(a.clone(), 0o644);
        table.write(&a, b"abc", 0).unwrap();

        assert_eq!(table.read(&a, 100, 1).unwrap(), b"bc");
        assert!(table.read(&a, 10, 50).unwrap().is_empty());
        assert!(table.read(&a, 0, 0).unwrap().is_empty());
    }

    #[test]
    fn test_set_mode_keeps_type_bits() {
        let mut table = MemoryTable::new(0o755);
        let a = key("/fb/a.txt");
        table.create(a.clone(), 0o644);
        table.set_mode(&a, 0o600).unwrap();

        let attrs = table.attributes(&a).unwrap();
        assert_eq!(attrs.mode & S_IFMT, libc::S_IFREG as u32);
        assert_eq!(attrs.mode & PERM_MASK, 0o600);

        // Type bits in the request are ignored
        table.set_mode(&a, libc::S_IFDIR as u32 | 0o700).unwrap();
        let attrs = table.attributes(&a).unwrap();
        assert_eq!(attrs.kind, NodeKind::RegularFile);
        assert_eq!(attrs.mode, libc::S_IFREG as u32 | 0o700);
    }

    #[test]
    fn test_set_owner() {
        let mut table = MemoryTable::new(0o755);
        let a = key("/fb/a.txt");
        table.create(a.clone(), 0o644);
        table.set_owner(&a, Some(1234), Some(5678)).unwrap();
        let attrs = table.attributes(&a).unwrap();
        assert_eq!((attrs.uid, attrs.gid), (1234, 5678));

        table.set_owner(&a, None, Some(42)).unwrap();
        let attrs = table.attributes(&a).unwrap();
        assert_eq!((attrs.uid, attrs.gid), (1234, 42));
    }

    #[test]
    fn test_remove_file() {
        let mut table = MemoryTable::new(0o755);
        let a = key("/fb/a.txt");
        table.create(a.clone(), 0o644);
        table.remove(&a).unwrap();
        assert!(!table.contains(&a));
        assert_eq!(table.root_nlink(), 2);
        assert!(matches!(table.remove(&a), Err(Error::Inconsistent(_))));
    }

    #[test]
    fn test_directory_bookkeeping() {
        let mut table = MemoryTable::new(0o755);
        let d1 = key("/fb/d1");
        let d2 = key("/fb/d2");
        table.mkdir(d1.clone(), 0o755);
        table.mkdir(d2.clone(), 0o755);
        assert_eq!(table.root_nlink(), 4);

        table.create(d1.join("inner"), 0o644);
        assert!(matches!(table.remove_dir(&d1), Err(Error::NotEmpty(_))));
        assert!(matches!(table.remove(&d2), Err(Error::IsADirectory(_))));
        assert!(matches!(
            table.remove_dir(&d1.join("inner")),
            Err(Error::NotADirectory(_))
        ));

        table.remove(&d1.join("inner")).unwrap();
        table.remove_dir(&d1).unwrap();
        assert_eq!(table.root_nlink(), 3);
        table.remove_dir(&d2).unwrap();
        assert_eq!(table.root_nlink(), 2);
        assert!(table.remove_dir(Path::new("/")).is_err());
    }

    #[test]
    fn test_truncate() {
        let mut table = MemoryTable::new(0o755);
        let a = key("/fb/a.txt");
        table.create(a.clone(), 0o644);
        table.write(&a, b"hello", 0).unwrap();
        table.truncate(&a, 2).unwrap();
        assert_eq!(table.read(&a, 10, 0).unwrap(), b"he");
        table.truncate(&a, 4).unwrap();
        assert_eq!(table.read(&a, 10, 0).unwrap(), b"he\0\0");
    }

    #[test]
    fn test_growth_past_limit_is_rejected() {
        let mut table = MemoryTable::new(0o755).with_max_file_size(16);
        let a = key("/fb/a.txt");
        table.create(a.clone(), 0o644);
        table.write(&a, b"keep", 0).unwrap();

        assert!(matches!(
            table.write(&a, b"x", 1u64 << 62),
            Err(Error::FileTooLarge { .. })
        ));
        assert!(matches!(
            table.write(&a, b"x", u64::MAX),
            Err(Error::FileTooLarge { .. })
        ));
        assert!(matches!(
            table.truncate(&a, 17),
            Err(Error::FileTooLarge { .. })
        ));

        // Rejected calls leave the file untouched
        assert_eq!(table.read(&a, 10, 0).unwrap(), b"keep");
        assert_eq!(table.attributes(&a).unwrap().size, 4);

        // Exactly at the limit is fine
        table.write(&a, b"y", 15).unwrap();
        assert_eq!(table.attributes(&a).unwrap().size, 16);
    }

    #[test]
    fn test_children_are_direct_only() {
        let mut table = MemoryTable::new(0o755);
        table.create(key("/fb/a.txt"), 0o644);
        table.mkdir(key("/fb/dir"), 0o755);
        table.create(key("/fb/dir/nested.txt"), 0o644);

        let names: Vec<_> = table
            .children(Path::new("/fb"))
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(names, vec![OsString::from("a.txt"), OsString::from("dir")]);
    }

    #[test]
    fn test_missing_key_is_inconsistent() {
        let mut table = MemoryTable::new(0o755);
        let ghost = key("/fb/ghost");
        assert!(matches!(table.attributes(&ghost), Err(Error::Inconsistent(_))));
        assert!(matches!(table.read(&ghost, 1, 0), Err(Error::Inconsistent(_))));
        assert!(matches!(table.write(&ghost, b"x", 0), Err(Error::Inconsistent(_))));
        assert!(matches!(table.set_mode(&ghost, 0o600), Err(Error::Inconsistent(_))));
    }
}
