//! FUSE bridge
//!
//! Translates inode-addressed kernel requests into path-addressed
//! [`FsOperations`] calls and maps errors back to errno values.

use fuser::{
    Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use libc::{EINVAL, ENOENT};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};

use super::inode::{InodeTable, NodeKind, ROOT_INO};
use super::ops::FsOperations;
use crate::config::MountConfig;
use crate::error::{Error, Result};

const TTL: Duration = Duration::from_secs(1);

/// Kernel-facing filesystem wrapping a set of path operations
pub struct CryptFuse<F: FsOperations> {
    ops: F,
    inodes: InodeTable,
}

fn errno(op: &str, path: &Path, e: &Error) -> i32 {
    let code = e.to_errno();
    if code == ENOENT {
        debug!("{}({:?}): {}", op, path, e);
    } else {
        warn!("{}({:?}) failed: {}", op, path, e);
    }
    code
}

fn time_of(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

impl<F: FsOperations> CryptFuse<F> {
    pub fn new(ops: F) -> Self {
        Self {
            ops,
            inodes: InodeTable::new(),
        }
    }

    /// Attributes of `path` plus the inode counted as a kernel lookup
    fn entry_for(&self, path: &Path) -> Result<fuser::FileAttr> {
        let attrs = self.ops.getattr(path)?;
        let ino = self.inodes.lookup(path);
        Ok(attrs.to_fuser_attr(ino))
    }

    fn reply_entry(&self, op: &str, path: &Path, reply: ReplyEntry) {
        match self.entry_for(path) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(errno(op, path, &e)),
        }
    }

    /// Listing of `path` including `.` and `..`
    ///
    /// Listed children are not looked up by the kernel and never forgotten,
    /// so they get no inode entry here: a known child reports its inode,
    /// any other one the backing inode number.
    fn dir_entries(&self, path: &Path, ino: u64) -> Result<Vec<(u64, NodeKind, OsString)>> {
        let children = self.ops.readdir(path)?;

        let parent_ino = path
            .parent()
            .and_then(|p| self.inodes.ino(p))
            .unwrap_or(ROOT_INO);

        let mut entries = Vec::with_capacity(children.len() + 2);
        entries.push((ino, NodeKind::Directory, OsString::from(".")));
        entries.push((parent_ino, NodeKind::Directory, OsString::from("..")));
        for child in children {
            let child_ino = self.inodes.ino(&path.join(&child.name)).unwrap_or(child.ino);
            entries.push((child_ino, NodeKind::from(child.file_type), child.name));
        }
        Ok(entries)
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_setattr(
        &self,
        path: &Path,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
    ) -> Result<()> {
        if let Some(mode) = mode {
            self.ops.chmod(path, mode & 0o7777)?;
        }
        if uid.is_some() || gid.is_some() {
            self.ops.chown(path, uid, gid)?;
        }
        if let Some(size) = size {
            self.ops.truncate(path, size)?;
        }
        if atime.is_some() || mtime.is_some() {
            self.ops
                .utimens(path, atime.map(time_of), mtime.map(time_of))?;
        }
        Ok(())
    }
}

/// Mount `ops` and serve requests in the foreground until unmounted
pub fn mount<F: FsOperations>(ops: F, config: &MountConfig) -> Result<()> {
    let mut options = vec![MountOption::FSName(config.fs_name.clone())];
    if config.auto_unmount {
        options.push(MountOption::AutoUnmount);
    }
    if config.allow_other {
        options.push(MountOption::AllowOther);
    }
    if config.allow_root {
        options.push(MountOption::AllowRoot);
    }

    info!("Mounting at {:?}", config.mount_point);
    fuser::mount2(CryptFuse::new(ops), &config.mount_point, &options)
        .map_err(|e| Error::Internal(format!("Mount failed: {}", e)))?;
    info!("Unmounted {:?}", config.mount_point);
    Ok(())
}

macro_rules! path_or_reply {
    ($self:ident, $ino:expr, $reply:ident) => {
        match $self.inodes.path($ino) {
            Some(path) => path,
            None => {
                $reply.error(ENOENT);
                return;
            }
        }
    };
    ($self:ident, $parent:expr, $name:expr, $reply:ident) => {
        match $self.inodes.child_path($parent, $name) {
            Some(path) => path,
            None => {
                $reply.error(ENOENT);
                return;
            }
        }
    };
}

impl<F: FsOperations> Filesystem for CryptFuse<F> {
    fn destroy(&mut self) {
        // Last chance for content whose release failed
        if let Err(e) = self.ops.flush_all() {
            error!("Unmounting with unsaved changes: {}", e);
        }
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup(parent={}, name={:?})", parent, name);
        let path = path_or_reply!(self, parent, name, reply);
        self.reply_entry("lookup", &path, reply);
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        debug!("getattr(ino={})", ino);
        let path = path_or_reply!(self, ino, reply);
        match self.ops.getattr(&path) {
            Ok(attrs) => reply.attr(&TTL, &attrs.to_fuser_attr(ino)),
            Err(e) => reply.error(errno("getattr", &path, &e)),
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
            "setattr(ino={}, mode={:?}, uid={:?}, gid={:?}, size={:?}, fh={:?})",
            ino, mode, uid, gid, size, fh
        );
        let path = path_or_reply!(self, ino, reply);

        if let Err(e) = self.apply_setattr(&path, mode, uid, gid, size, atime, mtime) {
            reply.error(errno("setattr", &path, &e));
            return;
        }
        match self.ops.getattr(&path) {
            Ok(attrs) => reply.attr(&TTL, &attrs.to_fuser_attr(ino)),
            Err(e) => reply.error(errno("setattr", &path, &e)),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        debug!("readlink(ino={})", ino);
        let path = path_or_reply!(self, ino, reply);
        match self.ops.readlink(&path) {
            Ok(target) => reply.data(target.as_os_str().as_encoded_bytes()),
            Err(e) => reply.error(errno("readlink", &path, &e)),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        debug!("mknod(parent={}, name={:?}, mode={:o})", parent, name, mode);
        let path = path_or_reply!(self, parent, name, reply);
        match self.ops.mknod(&path, mode, u64::from(rdev)) {
            Ok(()) => self.reply_entry("mknod", &path, reply),
            Err(e) => reply.error(errno("mknod", &path, &e)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir(parent={}, name={:?}, mode={:o})", parent, name, mode);
        let path = path_or_reply!(self, parent, name, reply);
        match self.ops.mkdir(&path, mode & 0o7777) {
            Ok(()) => self.reply_entry("mkdir", &path, reply),
            Err(e) => reply.error(errno("mkdir", &path, &e)),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink(parent={}, name={:?})", parent, name);
        let path = path_or_reply!(self, parent, name, reply);
        match self.ops.unlink(&path) {
            Ok(Some(detached)) => {
                // open handles follow the content to its new key
                self.inodes.rename(&path, &detached);
                reply.ok();
            }
            Ok(None) => {
                self.inodes.invalidate(&path);
                reply.ok();
            }
            Err(e) => reply.error(errno("unlink", &path, &e)),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir(parent={}, name={:?})", parent, name);
        let path = path_or_reply!(self, parent, name, reply);
        match self.ops.rmdir(&path) {
            Ok(()) => {
                self.inodes.invalidate(&path);
                reply.ok();
            }
            Err(e) => reply.error(errno("rmdir", &path, &e)),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        debug!("symlink(parent={}, name={:?}, target={:?})", parent, link_name, target);
        let path = path_or_reply!(self, parent, link_name, reply);
        match self.ops.symlink(target, &path) {
            Ok(()) => self.reply_entry("symlink", &path, reply),
            Err(e) => reply.error(errno("symlink", &path, &e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        debug!(
            "rename(parent={}, name={:?}, newparent={}, newname={:?})",
            parent, name, newparent, newname
        );
        if flags != 0 {
            // RENAME_NOREPLACE / RENAME_EXCHANGE are not forwarded
            reply.error(EINVAL);
            return;
        }
        let from = path_or_reply!(self, parent, name, reply);
        let to = path_or_reply!(self, newparent, newname, reply);
        match self.ops.rename(&from, &to) {
            Ok(()) => {
                self.inodes.rename(&from, &to);
                reply.ok();
            }
            Err(e) => reply.error(errno("rename", &from, &e)),
        }
    }

    fn link(
        &mut self,
        _req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        debug!("link(ino={}, newparent={}, newname={:?})", ino, newparent, newname);
        let existing = path_or_reply!(self, ino, reply);
        let new = path_or_reply!(self, newparent, newname, reply);
        match self.ops.link(&existing, &new) {
            Ok(()) => self.reply_entry("link", &new, reply),
            Err(e) => reply.error(errno("link", &new, &e)),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open(ino={}, flags={:#x})", ino, flags);
        let path = path_or_reply!(self, ino, reply);
        match self.ops.open(&path, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(errno("open", &path, &e)),
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
        let path = path_or_reply!(self, ino, reply);
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(EINVAL);
            return;
        };
        match self.ops.read(&path, size as usize, offset) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno("read", &path, &e)),
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
        let path = path_or_reply!(self, ino, reply);
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(EINVAL);
            return;
        };
        match self.ops.write(&path, data, offset) {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(errno("write", &path, &e)),
        }
    }

    fn flush(&mut self, _req: &Request, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        debug!("flush(ino={}, fh={})", ino, fh);
        let path = path_or_reply!(self, ino, reply);
        match self.ops.flush(&path) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("flush", &path, &e)),
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
        let path = path_or_reply!(self, ino, reply);
        match self.ops.release(&path) {
            Ok(()) => reply.ok(),
            Err(e) => {
                // The kernel never retries a release; the state stays in memory
                error!("release({:?}) failed, unsaved content kept open: {}", path, e);
                reply.error(e.to_errno());
            }
        }
    }

    fn fsync(&mut self, _req: &Request, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        debug!("fsync(ino={}, fh={}, datasync={})", ino, fh, datasync);
        let path = path_or_reply!(self, ino, reply);
        match self.ops.fsync(&path, !datasync) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("fsync", &path, &e)),
        }
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
        let path = path_or_reply!(self, ino, reply);

        let entries = match self.dir_entries(&path, ino) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(errno("readdir", &path, &e));
                return;
            }
        };

        let skip = usize::try_from(offset).unwrap_or(0);
        for (i, (child_ino, kind, name)) in entries.iter().enumerate().skip(skip) {
            let buffer_full = reply.add(*child_ino, (i + 1) as i64, kind.to_fuser_type(), name);
            if buffer_full {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, ino: u64, reply: ReplyStatfs) {
        debug!("statfs(ino={})", ino);
        let path = self.inodes.path(ino).unwrap_or_else(|| PathBuf::from("/"));
        match self.ops.statfs(&path) {
            Ok(s) => reply.statfs(
                s.blocks, s.bfree, s.bavail, s.files, s.ffree, s.bsize, s.namelen, s.frsize,
            ),
            Err(e) => reply.error(errno("statfs", &path, &e)),
        }
    }

    fn access(&mut self, _req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        debug!("access(ino={}, mask={})", ino, mask);
        let path = path_or_reply!(self, ino, reply);
        match self.ops.access(&path, mask) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("access", &path, &e)),
        }
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        debug!("create(parent={}, name={:?}, mode={:o}, flags={:#x})", parent, name, mode, flags);
        let path = path_or_reply!(self, parent, name, reply);

        let fh = match self.ops.create(&path, mode & 0o7777) {
            Ok(fh) => fh,
            Err(e) => {
                reply.error(errno("create", &path, &e));
                return;
            }
        };
        match self.entry_for(&path) {
            Ok(attr) => reply.created(&TTL, &attr, 0, fh, 0),
            Err(e) => {
                // Undo the open so the state does not leak
                let _ = self.ops.release(&path);
                reply.error(errno("create", &path, &e));
            }
        }
    }
}
