//! Overlay FUSE filesystem implementation
//!
//! Translates inode-addressed kernel requests into path-based calls on the
//! dispatcher.

use fuser::{
    Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use libc::{c_int, ENOENT};
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};

use super::dispatcher::Dispatcher;
use super::inode::{InodeTable, NodeAttributes, NodeKind, ROOT_INO};

/// Overlay FUSE filesystem
pub struct OverlayFs {
    dispatcher: Dispatcher,
    /// Kernel inode numbers <-> request paths
    inodes: InodeTable,
    /// Attribute and entry cache lifetime handed to the kernel
    ttl: Duration,
}

impl OverlayFs {
    /// Overlay `primary` on `fallback`; both must be existing, distinct directories
    pub fn new(primary: PathBuf, fallback: PathBuf, config: &Config) -> Result<Self> {
        config.validate()?;
        let dispatcher = Dispatcher::local(primary, fallback, config)?;
        Ok(Self::with_dispatcher(dispatcher, config))
    }

    pub fn with_dispatcher(dispatcher: Dispatcher, config: &Config) -> Self {
        Self {
            dispatcher,
            inodes: InodeTable::new(),
            ttl: config.attr_ttl(),
        }
    }

    fn path(&self, ino: u64) -> std::result::Result<PathBuf, c_int> {
        self.inodes.path(ino).ok_or(ENOENT)
    }

    fn child(&self, parent: u64, name: &OsStr) -> std::result::Result<PathBuf, c_int> {
        self.inodes.child_path(parent, name).ok_or(ENOENT)
    }

    /// Attributes of `path` as the kernel sees them under `ino`
    fn attr_for(&self, path: &Path, ino: u64) -> Result<fuser::FileAttr> {
        let attrs: NodeAttributes = self.dispatcher.getattr(path)?;
        Ok(attrs.to_fuser_attr(ino))
    }
}

/// Log a failed request and turn it into an errno
fn errno(op: &str, path: &Path, err: Error) -> c_int {
    match err {
        Error::NotFound(_) => debug!("{}({:?}): {}", op, path, err),
        _ => warn!("{}({:?}) failed: {}", op, path, err),
    }
    err.errno()
}

fn resolve_time(time: TimeOrNow) -> SystemTime {
    match time {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

impl Filesystem for OverlayFs {
    fn init(&mut self, _req: &Request, _config: &mut KernelConfig) -> std::result::Result<(), c_int> {
        info!(
            "Mounted overlay of {:?} over {:?}",
            self.dispatcher.locator().primary_root(),
            self.dispatcher.locator().fallback_root()
        );
        Ok(())
    }

    fn destroy(&mut self) {
        info!(
            "Unmounted overlay, {} inodes tracked, {} handles issued",
            self.inodes.len(),
            self.dispatcher.handles_issued()
        );
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup(parent={}, name={:?})", parent, name);

        let path = match self.child(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.dispatcher.getattr(&path) {
            Ok(attrs) => {
                let ino = self.inodes.ino_for(&path);
                reply.entry(&self.ttl, &attrs.to_fuser_attr(ino), 0);
            }
            Err(e) => reply.error(errno("lookup", &path, e)),
        }
    }

    fn forget(&mut self, _req: &Request, ino: u64, _nlookup: u64) {
        if ino != ROOT_INO {
            self.inodes.forget(ino);
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        debug!("getattr(ino={})", ino);

        let path = match self.path(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.attr_for(&path, ino) {
            Ok(attr) => reply.attr(&self.ttl, &attr),
            Err(e) => reply.error(errno("getattr", &path, e)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!(
            "setattr(ino={}, mode={:?}, uid={:?}, gid={:?}, size={:?})",
            ino, mode, uid, gid, size
        );

        let path = match self.path(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };

        let result = (|| -> Result<fuser::FileAttr> {
            if let Some(mode) = mode {
                self.dispatcher.chmod(&path, mode)?;
            }
            if uid.is_some() || gid.is_some() {
                self.dispatcher.chown(&path, uid, gid)?;
            }
            if let Some(size) = size {
                self.dispatcher.truncate(&path, size, fh)?;
            }
            if atime.is_some() || mtime.is_some() {
                self.dispatcher
                    .utimens(&path, atime.map(resolve_time), mtime.map(resolve_time))?;
            }
            self.attr_for(&path, ino)
        })();

        match result {
            Ok(attr) => reply.attr(&self.ttl, &attr),
            Err(e) => reply.error(errno("setattr", &path, e)),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        debug!("readlink(ino={})", ino);

        let path = match self.path(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.dispatcher.readlink(&path) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => reply.error(errno("readlink", &path, e)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir(parent={}, name={:?}, mode={:o})", parent, name, mode);

        let path = match self.child(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let result = self
            .dispatcher
            .mkdir(&path, mode & !umask)
            .and_then(|_| self.dispatcher.getattr(&path));
        match result {
            Ok(attrs) => {
                let ino = self.inodes.ino_for(&path);
                reply.entry(&self.ttl, &attrs.to_fuser_attr(ino), 0);
            }
            Err(e) => reply.error(errno("mkdir", &path, e)),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink(parent={}, name={:?})", parent, name);

        let path = match self.child(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.dispatcher.unlink(&path) {
            Ok(()) => {
                self.inodes.invalidate_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(errno("unlink", &path, e)),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir(parent={}, name={:?})", parent, name);

        let path = match self.child(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.dispatcher.rmdir(&path) {
            Ok(()) => {
                self.inodes.invalidate_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(errno("rmdir", &path, e)),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open(ino={}, flags={:#x})", ino, flags);

        let path = match self.path(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.dispatcher.open(&path, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(errno("open", &path, e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);

        let path = match self.path(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        if offset < 0 {
            return reply.error(libc::EINVAL);
        }
        match self.dispatcher.read(&path, size, offset as u64, fh) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno("read", &path, e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write(ino={}, fh={}, offset={}, len={})", ino, fh, offset, data.len());

        let path = match self.path(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        if offset < 0 {
            return reply.error(libc::EINVAL);
        }
        match self.dispatcher.write(&path, data, offset as u64, fh) {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(errno("write", &path, e)),
        }
    }

    fn flush(&mut self, _req: &Request, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        debug!("flush(ino={}, fh={})", ino, fh);

        let path = match self.path(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.dispatcher.flush(&path, fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("flush", &path, e)),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release(ino={}, fh={})", ino, fh);

        let path = match self.path(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.dispatcher.release(&path, fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("release", &path, e)),
        }
    }

    fn opendir(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        debug!("opendir(ino={})", ino);

        let path = match self.path(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.dispatcher.getattr(&path) {
            Ok(attrs) if attrs.kind == NodeKind::Directory => reply.opened(0, 0),
            Ok(_) => reply.error(libc::ENOTDIR),
            Err(e) => reply.error(errno("opendir", &path, e)),
        }
    }

    fn releasedir(&mut self, _req: &Request, ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        debug!("releasedir(ino={})", ino);
        reply.ok();
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir(ino={}, offset={})", ino, offset);

        let path = match self.path(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let entries = match self.dispatcher.readdir(&path) {
            Ok(entries) => entries,
            Err(e) => return reply.error(errno("readdir", &path, e)),
        };

        for (i, entry) in entries.iter().enumerate().skip(offset.max(0) as usize) {
            let child_ino = match entry.name.as_bytes() {
                b"." => ino,
                b".." => self.inodes.parent_of(ino),
                _ => self.inodes.ino_for(&path.join(&entry.name)),
            };
            let buffer_full = reply.add(
                child_ino,
                (i + 1) as i64,
                entry.kind.to_fuser_type(),
                &entry.name,
            );
            if buffer_full {
                break;
            }
        }

        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, ino: u64, reply: ReplyStatfs) {
        debug!("statfs(ino={})", ino);

        let path = self.inodes.path(ino).unwrap_or_else(|| PathBuf::from("/"));
        match self.dispatcher.statfs(&path) {
            Ok(st) => reply.statfs(
                st.blocks, st.bfree, st.bavail, st.files, st.ffree, st.bsize, st.namelen,
                st.frsize,
            ),
            Err(e) => reply.error(errno("statfs", &path, e)),
        }
    }

    fn getxattr(&mut self, _req: &Request, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        debug!("getxattr(ino={}, name={:?}, size={})", ino, name, size);

        let path = match self.path(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.dispatcher.getxattr(&path, name) {
            Ok(value) if size == 0 => reply.size(value.len() as u32),
            Ok(value) if value.len() <= size as usize => reply.data(&value),
            Ok(_) => reply.error(libc::ERANGE),
            Err(e) => reply.error(errno("getxattr", &path, e)),
        }
    }

    fn access(&mut self, _req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        debug!("access(ino={}, mask={})", ino, mask);

        let path = match self.path(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.dispatcher.access(&path, mask) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("access", &path, e)),
        }
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        debug!("create(parent={}, name={:?}, mode={:o}, flags={:#x})", parent, name, mode, flags);

        let path = match self.child(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let result = self
            .dispatcher
            .create(&path, mode & !umask)
            .and_then(|fh| Ok((fh, self.dispatcher.getattr(&path)?)));
        match result {
            Ok((fh, attrs)) => {
                let ino = self.inodes.ino_for(&path);
                reply.created(&self.ttl, &attrs.to_fuser_attr(ino), 0, fh, 0);
            }
            Err(e) => reply.error(errno("create", &path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_new_validates_roots() {
        let primary = tempdir().unwrap();
        let fallback = tempdir().unwrap();
        let config = Config::default();

        assert!(OverlayFs::new(
            primary.path().to_path_buf(),
            fallback.path().to_path_buf(),
            &config
        )
        .is_ok());

        let file = primary.path().join("plain");
        fs::write(&file, b"x").unwrap();
        assert!(matches!(
            OverlayFs::new(file, fallback.path().to_path_buf(), &config),
            Err(Error::NotADirectory(_))
        ));
    }

    #[test]
    fn test_ttl_follows_config() {
        let primary = tempdir().unwrap();
        let fallback = tempdir().unwrap();
        let mut config = Config::default();
        config.mount.attr_ttl_ms = 250;

        let fs = OverlayFs::new(
            primary.path().to_path_buf(),
            fallback.path().to_path_buf(),
            &config,
        )
        .unwrap();
        assert_eq!(fs.ttl, Duration::from_millis(250));
    }

    #[test]
    fn test_child_paths_resolve_from_root() {
        let primary = tempdir().unwrap();
        let fallback = tempdir().unwrap();
        let fs = OverlayFs::new(
            primary.path().to_path_buf(),
            fallback.path().to_path_buf(),
            &Config::default(),
        )
        .unwrap();

        assert_eq!(fs.child(ROOT_INO, OsStr::new("a")), Ok(PathBuf::from("/a")));
        assert_eq!(fs.child(9999, OsStr::new("a")), Err(ENOENT));
    }

    #[test]
    fn test_resolve_time() {
        let fixed = SystemTime::UNIX_EPOCH + Duration::from_secs(42);
        assert_eq!(resolve_time(TimeOrNow::SpecificTime(fixed)), fixed);
        assert!(resolve_time(TimeOrNow::Now) > fixed);
    }
}
