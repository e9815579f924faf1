//! Passthrough collaborator
//!
//! The overlay engine delegates every path that is not an in-memory entry to
//! a `Passthrough`. Implementations take the mount-relative request path and
//! do their own resolution against the backing trees.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::{self, File, FileTimes, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use nix::sys::statvfs::statvfs;
use nix::unistd::{AccessFlags, Gid, Uid};
use parking_lot::RwLock;
use tracing::{debug, warn};

use super::inode::NodeAttributes;
use super::locator::BackingLocator;

/// Filesystem statistics as replied to statfs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// File operations against real backing storage.
///
/// Errors use the conventional `io::Error` shape and are propagated by the
/// dispatcher without reinterpretation.
pub trait Passthrough: Send + Sync {
    fn getattr(&self, path: &Path) -> io::Result<NodeAttributes>;

    /// Open `path` and keep the file under the caller-issued handle `fh`
    fn open(&self, path: &Path, flags: i32, fh: u64) -> io::Result<()>;

    fn read(&self, path: &Path, size: u32, offset: u64, fh: u64) -> io::Result<Vec<u8>>;

    fn write(&self, path: &Path, data: &[u8], offset: u64, fh: u64) -> io::Result<usize>;

    fn readlink(&self, path: &Path) -> io::Result<PathBuf>;

    fn rmdir(&self, path: &Path) -> io::Result<()>;

    fn unlink(&self, path: &Path) -> io::Result<()>;

    fn statfs(&self, path: &Path) -> io::Result<StatFs>;

    fn access(&self, path: &Path, mask: i32) -> io::Result<()>;

    fn flush(&self, path: &Path, fh: u64) -> io::Result<()>;

    fn release(&self, path: &Path, fh: u64) -> io::Result<()>;

    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()>;

    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> io::Result<()>;

    /// Value of an extended attribute, `None` when the attribute is absent
    fn getxattr(&self, path: &Path, name: &OsStr) -> io::Result<Option<Vec<u8>>>;

    fn truncate(&self, path: &Path, size: u64, fh: Option<u64>) -> io::Result<()>;

    fn utimens(
        &self,
        path: &Path,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> io::Result<()>;
}

/// Passthrough over the local primary/fallback trees.
///
/// Each call re-resolves the request path with primary-wins precedence.
pub struct LocalPassthrough {
    locator: BackingLocator,
    /// Handle -> open backing file; dropping the `File` closes the fd
    files: RwLock<HashMap<u64, File>>,
}

impl LocalPassthrough {
    pub fn new(locator: BackingLocator) -> Self {
        Self {
            locator,
            files: RwLock::new(HashMap::new()),
        }
    }

    fn real(&self, path: &Path) -> PathBuf {
        self.locator.locate(path, false)
    }

    /// Number of backing files currently held open
    pub fn open_files(&self) -> usize {
        self.files.read().len()
    }

    fn with_file<R>(&self, fh: u64, f: impl FnOnce(&File) -> io::Result<R>) -> io::Result<R> {
        match self.files.read().get(&fh) {
            Some(file) => f(file),
            None => Err(io::Error::from_raw_os_error(libc::EBADF)),
        }
    }
}

impl Passthrough for LocalPassthrough {
    fn getattr(&self, path: &Path) -> io::Result<NodeAttributes> {
        let meta = fs::symlink_metadata(self.real(path))?;
        Ok(NodeAttributes::from_metadata(&meta))
    }

    fn open(&self, path: &Path, flags: i32, fh: u64) -> io::Result<()> {
        let real = self.real(path);

        let mut options = OpenOptions::new();
        match flags & libc::O_ACCMODE {
            libc::O_WRONLY => {
                options.write(true);
            }
            libc::O_RDWR => {
                options.read(true).write(true);
            }
            _ => {
                options.read(true);
            }
        }
        if flags & libc::O_APPEND != 0 {
            options.append(true);
        }
        if flags & libc::O_TRUNC != 0 {
            options.truncate(true);
        }
        options.custom_flags(
            flags & !(libc::O_ACCMODE | libc::O_APPEND | libc::O_TRUNC | libc::O_CREAT),
        );

        let file = options.open(&real)?;
        debug!("passthrough open {:?} as fh {}", real, fh);
        self.files.write().insert(fh, file);
        Ok(())
    }

    fn read(&self, _path: &Path, size: u32, offset: u64, fh: u64) -> io::Result<Vec<u8>> {
        self.with_file(fh, |file| {
            let mut buffer = vec![0u8; size as usize];
            let n = file.read_at(&mut buffer, offset)?;
            buffer.truncate(n);
            Ok(buffer)
        })
    }

    fn write(&self, _path: &Path, data: &[u8], offset: u64, fh: u64) -> io::Result<usize> {
        self.with_file(fh, |file| file.write_at(data, offset))
    }

    fn readlink(&self, path: &Path) -> io::Result<PathBuf> {
        fs::read_link(self.real(path))
    }

    fn rmdir(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir(self.real(path))
    }

    fn unlink(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(self.real(path))
    }

    fn statfs(&self, path: &Path) -> io::Result<StatFs> {
        let stat = statvfs(&self.real(path))?;
        Ok(StatFs {
            blocks: stat.blocks() as u64,
            bfree: stat.blocks_free() as u64,
            bavail: stat.blocks_available() as u64,
            files: stat.files() as u64,
            ffree: stat.files_free() as u64,
            bsize: stat.block_size() as u32,
            namelen: stat.name_max() as u32,
            frsize: stat.fragment_size() as u32,
        })
    }

    fn access(&self, path: &Path, mask: i32) -> io::Result<()> {
        nix::unistd::access(&self.real(path), AccessFlags::from_bits_truncate(mask))?;
        Ok(())
    }

    fn flush(&self, _path: &Path, fh: u64) -> io::Result<()> {
        match self.with_file(fh, |file| file.sync_all()) {
            // Already released or not a syncable fd
            Err(e) if matches!(e.raw_os_error(), Some(libc::EBADF) | Some(libc::EINVAL)) => Ok(()),
            other => other,
        }
    }

    fn release(&self, _path: &Path, fh: u64) -> io::Result<()> {
        if self.files.write().remove(&fh).is_none() {
            warn!("passthrough release of unknown fh {}", fh);
        }
        Ok(())
    }

    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()> {
        fs::set_permissions(self.real(path), fs::Permissions::from_mode(mode))
    }

    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
        nix::unistd::chown(
            &self.real(path),
            uid.map(Uid::from_raw),
            gid.map(Gid::from_raw),
        )?;
        Ok(())
    }

    fn getxattr(&self, path: &Path, name: &OsStr) -> io::Result<Option<Vec<u8>>> {
        xattr::get(self.real(path), name)
    }

    fn truncate(&self, path: &Path, size: u64, fh: Option<u64>) -> io::Result<()> {
        // A handle we hold pins the file; never fall back to the path then
        if let Some(fh) = fh {
            if let Some(file) = self.files.read().get(&fh) {
                return file.set_len(size);
            }
        }
        OpenOptions::new().write(true).open(self.real(path))?.set_len(size)
    }

    fn utimens(
        &self,
        path: &Path,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> io::Result<()> {
        let mut times = FileTimes::new();
        if let Some(atime) = atime {
            times = times.set_accessed(atime);
        }
        if let Some(mtime) = mtime {
            times = times.set_modified(mtime);
        }
        File::open(self.real(path))?.set_times(times)
    }
}
