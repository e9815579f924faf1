//! Operation dispatcher
//!
//! Path-based entry point for every filesystem call. Each call is resolved
//! first; in-memory paths are served from the entry table and everything
//! else is forwarded, with the original request path, to the passthrough.

use parking_lot::Mutex;
use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::error::{Error, Result};

use super::handle::HandleCounter;
use super::inode::{NodeAttributes, NodeKind, PERM_MASK};
use super::locator::BackingLocator;
use super::memory::MemoryTable;
use super::merger::{DirectoryMerger, MergedEntry};
use super::passthrough::{LocalPassthrough, Passthrough, StatFs};
use super::resolver::{Resolution, Resolver};

#[cfg(target_os = "macos")]
const NO_ATTRIBUTE: libc::c_int = libc::ENOATTR;
#[cfg(not(target_os = "macos"))]
const NO_ATTRIBUTE: libc::c_int = libc::ENODATA;

/// The mount session: owns the in-memory table and routes every call
pub struct Dispatcher {
    resolver: Resolver,
    merger: DirectoryMerger,
    /// Single lock over both the metadata and the data maps
    memory: Mutex<MemoryTable>,
    handles: HandleCounter,
    passthrough: Box<dyn Passthrough>,
    /// Reported by statfs on in-memory paths
    synthetic_statfs: StatFs,
}

impl Dispatcher {
    pub fn new(locator: BackingLocator, passthrough: Box<dyn Passthrough>, config: &Config) -> Self {
        let synthetic_statfs = StatFs {
            blocks: config.memory.blocks,
            bfree: config.memory.blocks_available,
            bavail: config.memory.blocks_available,
            files: 0,
            ffree: 0,
            bsize: config.memory.block_size,
            namelen: 255,
            frsize: config.memory.block_size,
        };

        Self {
            resolver: Resolver::new(locator.clone()),
            merger: DirectoryMerger::new(locator, config.listing.deduplicate),
            memory: Mutex::new(
                MemoryTable::new(config.memory.root_mode)
                    .with_max_file_size(config.memory.max_file_size),
            ),
            handles: HandleCounter::new(),
            passthrough,
            synthetic_statfs,
        }
    }

    /// Session over two local directories with the bundled passthrough
    pub fn local(primary: PathBuf, fallback: PathBuf, config: &Config) -> Result<Self> {
        for root in [&primary, &fallback] {
            if !root.exists() {
                return Err(Error::NotFound(root.clone()));
            }
            if !root.is_dir() {
                return Err(Error::NotADirectory(root.clone()));
            }
        }
        if primary.canonicalize()? == fallback.canonicalize()? {
            return Err(Error::InvalidConfig(
                "Primary and fallback roots must differ".to_string(),
            ));
        }

        info!("Overlaying primary {:?} on fallback {:?}", primary, fallback);
        let locator = BackingLocator::new(primary, fallback);
        let passthrough = Box::new(LocalPassthrough::new(locator.clone()));
        Ok(Self::new(locator, passthrough, config))
    }

    pub fn locator(&self) -> &BackingLocator {
        self.resolver.locator()
    }

    /// Classify a request path against the current table
    pub fn resolve(&self, path: &Path) -> Resolution {
        self.resolver.classify(&self.memory.lock(), path)
    }

    /// Number of file handles issued so far
    pub fn handles_issued(&self) -> u64 {
        self.handles.issued()
    }

    /// Link count of the in-memory root entry
    pub fn root_nlink(&self) -> u32 {
        self.memory.lock().root_nlink()
    }

    /// Resolve, then run the in-memory branch under the table lock or forward
    /// to the passthrough. With `must_exist`, a delegated path present in
    /// neither root is reported as `NotFound` without calling the passthrough.
    fn route<T>(
        &self,
        op: &str,
        path: &Path,
        must_exist: bool,
        in_memory: impl FnOnce(&mut MemoryTable, &Path) -> Result<T>,
        delegate: impl FnOnce(&dyn Passthrough) -> io::Result<T>,
    ) -> Result<T> {
        let mut memory = self.memory.lock();
        match self.resolver.classify(&memory, path) {
            Resolution::InMemory { key } => {
                debug!("{}({:?}) -> memory {:?}", op, path, key);
                in_memory(&mut memory, &key).map_err(|e| {
                    if let Error::Inconsistent(_) = e {
                        error!("{}({:?}) hit an in-memory invariant violation: {}", op, path, e);
                    }
                    e
                })
            }
            resolution @ Resolution::Delegate { .. } => {
                drop(memory);
                if must_exist && !resolution.exists() {
                    debug!("{}({:?}) -> not found in any layer", op, path);
                    return Err(Error::NotFound(path.to_path_buf()));
                }
                debug!(
                    "{}({:?}) -> passthrough, served by {:?}",
                    op,
                    path,
                    self.locator().layer_of(path)
                );
                delegate(self.passthrough.as_ref()).map_err(Error::Delegated)
            }
        }
    }

    pub fn getattr(&self, path: &Path) -> Result<NodeAttributes> {
        self.route(
            "getattr",
            path,
            true,
            |memory, key| memory.attributes(key),
            |pt| pt.getattr(path),
        )
    }

    pub fn open(&self, path: &Path, flags: i32) -> Result<u64> {
        let fh = self.route(
            "open",
            path,
            true,
            |memory, key| {
                if flags & libc::O_TRUNC != 0
                    && memory.attributes(key)?.kind == NodeKind::RegularFile
                {
                    memory.truncate(key, 0)?;
                }
                Ok(self.handles.alloc())
            },
            |pt| {
                let fh = self.handles.alloc();
                pt.open(path, flags, fh)?;
                Ok(fh)
            },
        )?;
        debug!("open({:?}) issued fh {}", path, fh);
        Ok(fh)
    }

    /// Create an in-memory regular file anchored under the fallback root
    pub fn create(&self, path: &Path, mode: u32) -> Result<u64> {
        let key = self.resolver.anchor(path);
        self.memory.lock().create(key.clone(), mode & PERM_MASK);
        let fh = self.handles.alloc();
        debug!("create({:?}) -> memory {:?}, fh {}", path, key, fh);
        Ok(fh)
    }

    /// Create an in-memory directory anchored under the fallback root
    pub fn mkdir(&self, path: &Path, mode: u32) -> Result<()> {
        let key = self.resolver.anchor(path);
        debug!("mkdir({:?}) -> memory {:?}", path, key);
        self.memory.lock().mkdir(key, mode & PERM_MASK);
        Ok(())
    }

    pub fn read(&self, path: &Path, size: u32, offset: u64, fh: u64) -> Result<Vec<u8>> {
        self.route(
            "read",
            path,
            false,
            |memory, key| memory.read(key, size as usize, offset),
            |pt| pt.read(path, size, offset, fh),
        )
    }

    pub fn write(&self, path: &Path, data: &[u8], offset: u64, fh: u64) -> Result<usize> {
        self.route(
            "write",
            path,
            false,
            |memory, key| memory.write(key, data, offset),
            |pt| pt.write(path, data, offset, fh),
        )
    }

    pub fn readlink(&self, path: &Path) -> Result<PathBuf> {
        self.route(
            "readlink",
            path,
            true,
            |_, key| {
                Err(Error::InvalidArgument(format!(
                    "{:?} is not a symbolic link",
                    key
                )))
            },
            |pt| pt.readlink(path),
        )
    }

    /// Remove a directory. A backing directory that still has in-memory
    /// children under its anchored location is not empty.
    pub fn rmdir(&self, path: &Path) -> Result<()> {
        let mut memory = self.memory.lock();
        let resolution = self.resolver.classify(&memory, path);
        if let Resolution::InMemory { key } = &resolution {
            debug!("rmdir({:?}) -> memory {:?}", path, key);
            return memory.remove_dir(key);
        }

        if !resolution.exists() {
            debug!("rmdir({:?}) -> not found in any layer", path);
            return Err(Error::NotFound(path.to_path_buf()));
        }
        let anchored = self.resolver.anchor(path);
        let shadowed = memory.children(&anchored);
        if !shadowed.is_empty() {
            debug!(
                "rmdir({:?}) refused, {} in-memory children remain",
                path,
                shadowed.len()
            );
            return Err(Error::NotEmpty(path.to_path_buf()));
        }

        // Held across the delegated call so no child can appear meanwhile
        debug!("rmdir({:?}) -> passthrough", path);
        self.passthrough.rmdir(path).map_err(Error::Delegated)
    }

    pub fn unlink(&self, path: &Path) -> Result<()> {
        self.route(
            "unlink",
            path,
            true,
            |memory, key| memory.remove(key),
            |pt| pt.unlink(path),
        )
    }

    pub fn statfs(&self, path: &Path) -> Result<StatFs> {
        let synthetic = self.synthetic_statfs;
        self.route(
            "statfs",
            path,
            true,
            |_, _| Ok(synthetic),
            |pt| pt.statfs(path),
        )
    }

    /// Extended attribute value; in-memory entries carry none and report an
    /// empty value for every name
    pub fn getxattr(&self, path: &Path, name: &OsStr) -> Result<Vec<u8>> {
        self.route(
            "getxattr",
            path,
            true,
            |_, _| Ok(Vec::new()),
            |pt| {
                pt.getxattr(path, name)?
                    .ok_or_else(|| io::Error::from_raw_os_error(NO_ATTRIBUTE))
            },
        )
    }

    pub fn chmod(&self, path: &Path, mode: u32) -> Result<()> {
        self.route(
            "chmod",
            path,
            true,
            |memory, key| memory.set_mode(key, mode),
            |pt| pt.chmod(path, mode),
        )
    }

    pub fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        self.route(
            "chown",
            path,
            true,
            |memory, key| memory.set_owner(key, uid, gid),
            |pt| pt.chown(path, uid, gid),
        )
    }

    pub fn truncate(&self, path: &Path, size: u64, fh: Option<u64>) -> Result<()> {
        self.route(
            "truncate",
            path,
            true,
            |memory, key| memory.truncate(key, size),
            |pt| pt.truncate(path, size, fh),
        )
    }

    pub fn utimens(
        &self,
        path: &Path,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<()> {
        self.route(
            "utimens",
            path,
            true,
            |memory, key| memory.set_times(key, atime, mtime),
            |pt| pt.utimens(path, atime, mtime),
        )
    }

    pub fn access(&self, path: &Path, mask: i32) -> Result<()> {
        self.route("access", path, true, |_, _| Ok(()), |pt| pt.access(path, mask))
    }

    pub fn flush(&self, path: &Path, fh: u64) -> Result<()> {
        self.route("flush", path, false, |_, _| Ok(()), |pt| pt.flush(path, fh))
    }

    pub fn release(&self, path: &Path, fh: u64) -> Result<()> {
        self.route("release", path, false, |_, _| Ok(()), |pt| pt.release(path, fh))
    }

    /// Merged listing of a directory across all layers
    pub fn readdir(&self, path: &Path) -> Result<Vec<MergedEntry>> {
        let memory = self.memory.lock();
        match self.resolver.classify(&memory, path) {
            Resolution::InMemory { key } => {
                if memory.attributes(&key)?.kind != NodeKind::Directory {
                    return Err(Error::NotADirectory(path.to_path_buf()));
                }
            }
            Resolution::Delegate { backing } => {
                let anchored = self.resolver.anchor(path);
                if !backing.is_dir() && !anchored.is_dir() {
                    return Err(if backing.exists() {
                        Error::NotADirectory(path.to_path_buf())
                    } else {
                        Error::NotFound(path.to_path_buf())
                    });
                }
            }
        }
        let entries = self.merger.list(&memory, path);
        debug!("readdir({:?}) -> {} entries", path, entries.len());
        Ok(entries)
    }
}
