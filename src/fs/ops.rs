//! Filesystem operation set
//!
//! Content operations go through the encryption boundary and must be
//! implemented. Everything else forwards to [`BackingStore`] by default.

use crate::error::Result;
use crate::fs::backing::{BackingDirEntry, BackingStatfs, BackingStore};
use crate::fs::inode::FileAttributes;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Path-addressed filesystem operations
pub trait FsOperations: Send + Sync {
    /// Storage the passthrough operations forward to
    fn backing(&self) -> &BackingStore;

    // Content lifecycle

    /// Create an empty file and open it; returns a handle id
    fn create(&self, path: &Path, mode: u32) -> Result<u64>;

    /// Open an existing file; returns a handle id
    fn open(&self, path: &Path, flags: i32) -> Result<u64>;

    fn read(&self, path: &Path, length: usize, offset: u64) -> Result<Vec<u8>>;

    /// Returns the number of bytes accepted
    fn write(&self, path: &Path, data: &[u8], offset: u64) -> Result<usize>;

    fn truncate(&self, path: &Path, length: u64) -> Result<()>;

    fn flush(&self, path: &Path) -> Result<()>;

    fn fsync(&self, path: &Path, full_sync: bool) -> Result<()>;

    fn release(&self, path: &Path) -> Result<()>;

    /// Write back every open file that still has unsaved changes
    fn flush_all(&self) -> Result<()>;

    // Passthrough

    fn getattr(&self, path: &Path) -> Result<FileAttributes> {
        self.backing()
            .metadata(path)
            .map(|m| FileAttributes::from_metadata(&m))
    }

    fn chmod(&self, path: &Path, mode: u32) -> Result<()> {
        self.backing().chmod(path, mode)
    }

    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        self.backing().chown(path, uid, gid)
    }

    fn utimens(&self, path: &Path, atime: Option<SystemTime>, mtime: Option<SystemTime>) -> Result<()> {
        self.backing().utimens(path, atime, mtime)
    }

    fn readdir(&self, path: &Path) -> Result<Vec<BackingDirEntry>> {
        self.backing().readdir(path)
    }

    fn readlink(&self, path: &Path) -> Result<PathBuf> {
        self.backing().readlink(path)
    }

    fn symlink(&self, target: &Path, link: &Path) -> Result<()> {
        self.backing().symlink(target, link)
    }

    fn link(&self, existing: &Path, new: &Path) -> Result<()> {
        self.backing().link(existing, new)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        self.backing().rename(from, to)
    }

    /// Remove a file; returns the key an open file's content moved to
    fn unlink(&self, path: &Path) -> Result<Option<PathBuf>> {
        self.backing().unlink(path).map(|()| None)
    }

    fn mkdir(&self, path: &Path, mode: u32) -> Result<()> {
        self.backing().mkdir(path, mode)
    }

    fn rmdir(&self, path: &Path) -> Result<()> {
        self.backing().rmdir(path)
    }

    fn mknod(&self, path: &Path, mode: u32, rdev: u64) -> Result<()> {
        self.backing().mknod(path, mode, rdev)
    }

    fn statfs(&self, path: &Path) -> Result<BackingStatfs> {
        self.backing().statfs(path)
    }

    fn access(&self, path: &Path, mask: i32) -> Result<()> {
        self.backing().access(path, mask)
    }
}
