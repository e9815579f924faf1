//! Overlay inode management
//!
//! The kernel addresses nodes by inode number while the overlay engine is
//! path based. This module owns the attribute record shared by all layers and
//! the table that maps kernel inode numbers to mount-relative paths.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Root inode number reserved by FUSE
pub const ROOT_INO: u64 = 1;

/// File type bits of a mode value
pub const S_IFMT: u32 = libc::S_IFMT as u32;

/// Permission bits of a mode value (setuid/setgid/sticky included)
pub const PERM_MASK: u32 = 0o7777;

/// Node kind as seen through the overlay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    RegularFile,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl From<std::fs::FileType> for NodeKind {
    fn from(ft: std::fs::FileType) -> Self {
        use std::os::unix::fs::FileTypeExt;
        if ft.is_file() {
            NodeKind::RegularFile
        } else if ft.is_dir() {
            NodeKind::Directory
        } else if ft.is_symlink() {
            NodeKind::Symlink
        } else if ft.is_block_device() {
            NodeKind::BlockDevice
        } else if ft.is_char_device() {
            NodeKind::CharDevice
        } else if ft.is_fifo() {
            NodeKind::Fifo
        } else if ft.is_socket() {
            NodeKind::Socket
        } else {
            NodeKind::RegularFile
        }
    }
}

impl NodeKind {
    pub fn to_fuser_type(&self) -> fuser::FileType {
        match self {
            NodeKind::RegularFile => fuser::FileType::RegularFile,
            NodeKind::Directory => fuser::FileType::Directory,
            NodeKind::Symlink => fuser::FileType::Symlink,
            NodeKind::BlockDevice => fuser::FileType::BlockDevice,
            NodeKind::CharDevice => fuser::FileType::CharDevice,
            NodeKind::Fifo => fuser::FileType::NamedPipe,
            NodeKind::Socket => fuser::FileType::Socket,
        }
    }
}

/// Layer-neutral attributes, built from in-memory entries or real metadata
#[derive(Debug, Clone, PartialEq)]
pub struct NodeAttributes {
    pub kind: NodeKind,
    /// Full mode: type bits and permission bits
    pub mode: u32,
    pub size: u64,
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub crtime: SystemTime,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
}

impl NodeAttributes {
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            kind: NodeKind::from(meta.file_type()),
            mode: meta.mode(),
            size: meta.len(),
            blocks: meta.blocks(),
            atime: meta.accessed().unwrap_or(SystemTime::UNIX_EPOCH),
            mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            ctime: SystemTime::UNIX_EPOCH
                + std::time::Duration::from_secs(meta.ctime().max(0) as u64),
            crtime: meta.created().unwrap_or(SystemTime::UNIX_EPOCH),
            nlink: meta.nlink() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev() as u32,
            blksize: meta.blksize() as u32,
        }
    }

    /// Permission bits only
    pub fn perm(&self) -> u16 {
        (self.mode & PERM_MASK) as u16
    }

    /// Convert to fuser FileAttr under the given inode number
    pub fn to_fuser_attr(&self, ino: u64) -> fuser::FileAttr {
        fuser::FileAttr {
            ino,
            size: self.size,
            blocks: self.blocks,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            crtime: self.crtime,
            kind: self.kind.to_fuser_type(),
            perm: self.perm(),
            nlink: self.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: self.rdev,
            blksize: self.blksize,
            flags: 0,
        }
    }
}

/// Maps kernel inode numbers to mount-relative paths and back.
///
/// Inode numbers are stable per path for the session; a removed path gets a
/// new number if it reappears.
pub struct InodeTable {
    next_ino: AtomicU64,
    paths: RwLock<HashMap<u64, PathBuf>>,
    path_to_ino: RwLock<HashMap<PathBuf, u64>>,
}

impl InodeTable {
    pub fn new() -> Self {
        let table = Self {
            next_ino: AtomicU64::new(ROOT_INO + 1),
            paths: RwLock::new(HashMap::new()),
            path_to_ino: RwLock::new(HashMap::new()),
        };
        table.paths.write().insert(ROOT_INO, PathBuf::from("/"));
        table.path_to_ino.write().insert(PathBuf::from("/"), ROOT_INO);
        table
    }

    /// Path of an inode
    pub fn path(&self, ino: u64) -> Option<PathBuf> {
        self.paths.read().get(&ino).cloned()
    }

    /// Path of `name` inside the directory `parent`
    pub fn child_path(&self, parent: u64, name: &std::ffi::OsStr) -> Option<PathBuf> {
        Some(self.path(parent)?.join(name))
    }

    /// Inode of a path, allocating one on first sight
    pub fn ino_for(&self, path: &Path) -> u64 {
        if let Some(ino) = self.path_to_ino.read().get(path) {
            return *ino;
        }

        let mut path_to_ino = self.path_to_ino.write();
        // Raced with another allocation for the same path
        if let Some(ino) = path_to_ino.get(path) {
            return *ino;
        }
        let ino = self.next_ino.fetch_add(1, Ordering::SeqCst);
        path_to_ino.insert(path.to_path_buf(), ino);
        self.paths.write().insert(ino, path.to_path_buf());
        ino
    }

    /// Parent inode of an inode (root is its own parent)
    pub fn parent_of(&self, ino: u64) -> u64 {
        match self.path(ino).as_deref().and_then(Path::parent) {
            Some(parent) => self.ino_for(parent),
            None => ROOT_INO,
        }
    }

    /// Detach a removed path from its inode.
    ///
    /// The inode keeps resolving to the old path until the kernel forgets
    /// it, so handles opened before the removal stay usable.
    pub fn invalidate_path(&self, path: &Path) {
        if path != Path::new("/") {
            self.path_to_ino.write().remove(path);
        }
    }

    /// Drop an inode the kernel no longer references
    pub fn forget(&self, ino: u64) {
        if ino == ROOT_INO {
            return;
        }
        let removed = self.paths.write().remove(&ino);
        if let Some(path) = removed {
            let mut path_to_ino = self.path_to_ino.write();
            if path_to_ino.get(&path) == Some(&ino) {
                path_to_ino.remove(&path);
            }
        }
    }

    /// Number of tracked inodes, root included
    pub(crate) fn len(&self) -> usize {
        self.paths.read().len()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    #[test]
    fn test_root_is_preregistered() {
        let table = InodeTable::new();
        assert_eq!(table.path(ROOT_INO), Some(PathBuf::from("/")));
        assert_eq!(table.ino_for(Path::new("/")), ROOT_INO);
        assert_eq!(table.parent_of(ROOT_INO), ROOT_INO);
    }

    #[test]
    fn test_inode_numbers_are_stable_per_path() {
        let table = InodeTable::new();
        let a = table.ino_for(Path::new("/a.txt"));
        let b = table.ino_for(Path::new("/dir/b.txt"));
        assert_ne!(a, b);
        assert_eq!(table.ino_for(Path::new("/a.txt")), a);
        assert_eq!(
            table.child_path(ROOT_INO, OsStr::new("a.txt")),
            Some(PathBuf::from("/a.txt"))
        );
    }

    #[test]
    fn test_invalidate_and_forget() {
        let table = InodeTable::new();
        let a = table.ino_for(Path::new("/a.txt"));
        table.invalidate_path(Path::new("/a.txt"));
        // Still reachable for handles opened before the removal
        assert_eq!(table.path(a), Some(PathBuf::from("/a.txt")));
        let recreated = table.ino_for(Path::new("/a.txt"));
        assert_ne!(recreated, a);

        // Forgetting the stale inode leaves the new mapping alone
        table.forget(a);
        assert!(table.path(a).is_none());
        assert_eq!(table.ino_for(Path::new("/a.txt")), recreated);

        let b = table.ino_for(Path::new("/b.txt"));
        table.forget(b);
        assert!(table.path(b).is_none());

        table.forget(ROOT_INO);
        assert!(table.path(ROOT_INO).is_some());
    }

    #[test]
    fn test_attributes_from_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"12345").unwrap();

        let attrs = NodeAttributes::from_metadata(&std::fs::metadata(&file).unwrap());
        assert_eq!(attrs.kind, NodeKind::RegularFile);
        assert_eq!(attrs.size, 5);
        assert_eq!(attrs.to_fuser_attr(42).ino, 42);
    }
}
