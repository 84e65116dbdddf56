//! Backing storage pass-through
//!
//! Every externally visible path is mirrored 1:1 under the backing root.
//! Apart from `read_all`/`write_all`, which move whole ciphertexts, these
//! calls are forwarded unchanged to the host filesystem.

use crate::error::{Error, Result};
use nix::sys::stat::{Mode, SFlag};
use nix::sys::time::TimeVal;
use nix::unistd::{AccessFlags, Gid, Uid};
use std::ffi::OsString;
use std::os::unix::ffi::OsStrExt;
use std::fs::{self, Metadata, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Directory entry from backing storage
#[derive(Debug, Clone)]
pub struct BackingDirEntry {
    pub name: OsString,
    pub file_type: fs::FileType,
    pub ino: u64,
}

/// Filesystem statistics of the backing storage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackingStatfs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// Pass-through interface to the backing directory
#[derive(Debug, Clone)]
pub struct BackingStore {
    root: PathBuf,
}

impl BackingStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        if !root.is_dir() {
            return Err(Error::InvalidConfig(format!(
                "Backing root {:?} is not a directory",
                root
            )));
        }
        Ok(Self { root })
    }

    /// Resolve a visible path to its location under the root
    ///
    /// The path is always taken relative to the root; `..` and prefix
    /// components are rejected.
    pub fn resolve(&self, path: &Path) -> Result<PathBuf> {
        let mut resolved = self.root.clone();
        for component in path.components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                // Keys of unlinked open files have no backing file
                Component::Normal(name) if name.as_bytes().contains(&0) => {
                    return Err(Error::Storage(io::Error::from_raw_os_error(libc::ENOENT)));
                }
                Component::Normal(name) => resolved.push(name),
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(Error::InvalidPath(path.to_path_buf()));
                }
            }
        }
        Ok(resolved)
    }

    /// Read the whole stored content of a file
    pub fn read_all(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(fs::read(self.resolve(path)?)?)
    }

    /// Replace the stored content of a file and sync it
    ///
    /// The file is cut to the new length first when the new content is
    /// shorter, so no stale tail survives.
    pub fn write_all(&self, path: &Path, data: &[u8], full_sync: bool) -> Result<()> {
        let resolved = self.resolve(path)?;
        let mut file = OpenOptions::new().write(true).create(true).open(&resolved)?;

        let new_len = data.len() as u64;
        if new_len < file.metadata()?.len() {
            file.set_len(new_len)?;
        }
        file.write_all(data)?;

        if full_sync {
            file.sync_all()?;
        } else {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Create (or empty) a regular file with the given mode
    pub fn create_empty(&self, path: &Path, mode: u32) -> Result<()> {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(self.resolve(path)?)?;
        Ok(())
    }

    /// Metadata without following a final symlink
    pub fn metadata(&self, path: &Path) -> Result<Metadata> {
        Ok(fs::symlink_metadata(self.resolve(path)?)?)
    }

    pub fn readdir(&self, path: &Path) -> Result<Vec<BackingDirEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.resolve(path)?)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            entries.push(BackingDirEntry {
                name: entry.file_name(),
                file_type: metadata.file_type(),
                ino: metadata.ino(),
            });
        }
        Ok(entries)
    }

    /// Read a symlink target; absolute targets inside the root come back
    /// relative to it
    pub fn readlink(&self, path: &Path) -> Result<PathBuf> {
        let target = fs::read_link(self.resolve(path)?)?;
        if target.is_absolute() {
            if let Ok(relative) = target.strip_prefix(&self.root) {
                return Ok(relative.to_path_buf());
            }
        }
        Ok(target)
    }

    /// Create a symlink at `link` pointing to `target` (stored verbatim)
    pub fn symlink(&self, target: &Path, link: &Path) -> Result<()> {
        std::os::unix::fs::symlink(target, self.resolve(link)?)?;
        Ok(())
    }

    pub fn link(&self, existing: &Path, new: &Path) -> Result<()> {
        fs::hard_link(self.resolve(existing)?, self.resolve(new)?)?;
        Ok(())
    }

    pub fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(self.resolve(from)?, self.resolve(to)?)?;
        Ok(())
    }

    pub fn unlink(&self, path: &Path) -> Result<()> {
        fs::remove_file(self.resolve(path)?)?;
        Ok(())
    }

    pub fn mkdir(&self, path: &Path, mode: u32) -> Result<()> {
        fs::DirBuilder::new().mode(mode).create(self.resolve(path)?)?;
        Ok(())
    }

    pub fn rmdir(&self, path: &Path) -> Result<()> {
        fs::remove_dir(self.resolve(path)?)?;
        Ok(())
    }

    /// Create a special or regular file node; `mode` carries the file type bits
    pub fn mknod(&self, path: &Path, mode: u32, rdev: u64) -> Result<()> {
        let resolved = self.resolve(path)?;
        let kind = SFlag::from_bits_truncate(mode as libc::mode_t & libc::S_IFMT);
        let perm = Mode::from_bits_truncate(mode as libc::mode_t & 0o7777);
        nix::sys::stat::mknod(resolved.as_path(), kind, perm, rdev as libc::dev_t)?;
        Ok(())
    }

    pub fn chmod(&self, path: &Path, mode: u32) -> Result<()> {
        fs::set_permissions(self.resolve(path)?, fs::Permissions::from_mode(mode))?;
        Ok(())
    }

    pub fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        let resolved = self.resolve(path)?;
        nix::unistd::chown(
            resolved.as_path(),
            uid.map(Uid::from_raw),
            gid.map(Gid::from_raw),
        )?;
        Ok(())
    }

    /// Set access/modification times; `None` keeps the current value
    pub fn utimens(
        &self,
        path: &Path,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<()> {
        let resolved = self.resolve(path)?;
        let current = fs::metadata(&resolved)?;
        let atime = atime.unwrap_or(current.accessed()?);
        let mtime = mtime.unwrap_or(current.modified()?);
        nix::sys::stat::utimes(resolved.as_path(), &to_timeval(atime), &to_timeval(mtime))?;
        Ok(())
    }

    pub fn statfs(&self, path: &Path) -> Result<BackingStatfs> {
        let resolved = self.resolve(path)?;
        let stat = nix::sys::statvfs::statvfs(resolved.as_path())?;
        Ok(BackingStatfs {
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

    /// Check access permissions with the process credentials
    pub fn access(&self, path: &Path, mask: i32) -> Result<()> {
        let resolved = self.resolve(path)?;
        nix::unistd::access(resolved.as_path(), AccessFlags::from_bits_truncate(mask))?;
        Ok(())
    }
}

fn to_timeval(time: SystemTime) -> TimeVal {
    let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or_default();
    TimeVal::new(
        since_epoch.as_secs() as libc::time_t,
        since_epoch.subsec_micros() as libc::suseconds_t,
    )
}
