//! Inode numbering and attributes
//!
//! FUSE addresses nodes by inode number while the core works on paths, so
//! the bridge keeps a path table here. Numbers are allocated on first sight
//! and dropped once the kernel forgets every lookup.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::Metadata;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

/// Inode number of the mount root
pub const ROOT_INO: u64 = 1;

/// Node type as reported to the kernel
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
        if ft.is_dir() {
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
    pub fn to_fuser_type(self) -> fuser::FileType {
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

/// Attributes of a visible node
#[derive(Debug, Clone)]
pub struct FileAttributes {
    pub kind: NodeKind,
    pub size: u64,
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub crtime: SystemTime,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
}

impl FileAttributes {
    pub fn from_metadata(meta: &Metadata) -> Self {
        Self {
            kind: NodeKind::from(meta.file_type()),
            size: meta.len(),
            blocks: meta.blocks(),
            atime: meta.accessed().unwrap_or(SystemTime::UNIX_EPOCH),
            mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            ctime: unix_time(meta.ctime(), meta.ctime_nsec()),
            crtime: meta.created().unwrap_or(SystemTime::UNIX_EPOCH),
            perm: (meta.mode() & 0o7777) as u16,
            nlink: meta.nlink() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: rdev_u32(meta.rdev()),
            blksize: meta.blksize() as u32,
        }
    }

    /// Replace the size, keeping the block count consistent
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self.blocks = size.div_ceil(512);
        self
    }

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
            perm: self.perm,
            nlink: self.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: self.rdev,
            blksize: self.blksize,
            flags: 0,
        }
    }
}

fn unix_time(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        SystemTime::UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        SystemTime::UNIX_EPOCH
    }
}

/// Device numbers that do not fit the kernel's 32-bit field are reported as 0
fn rdev_u32(rdev: u64) -> u32 {
    u32::try_from(rdev).unwrap_or(0)
}

struct InodeEntry {
    path: PathBuf,
    lookups: u64,
}

#[derive(Default)]
struct Maps {
    by_ino: HashMap<u64, InodeEntry>,
    by_path: HashMap<PathBuf, u64>,
}

/// Bidirectional inode number / path table
pub struct InodeTable {
    next_ino: AtomicU64,
    maps: RwLock<Maps>,
}

impl InodeTable {
    pub fn new() -> Self {
        let mut maps = Maps::default();
        let root = PathBuf::from("/");
        maps.by_ino.insert(
            ROOT_INO,
            InodeEntry {
                path: root.clone(),
                lookups: 1,
            },
        );
        maps.by_path.insert(root, ROOT_INO);

        Self {
            next_ino: AtomicU64::new(ROOT_INO + 1),
            maps: RwLock::new(maps),
        }
    }

    pub fn path(&self, ino: u64) -> Option<PathBuf> {
        self.maps.read().by_ino.get(&ino).map(|e| e.path.clone())
    }

    pub fn child_path(&self, parent: u64, name: &std::ffi::OsStr) -> Option<PathBuf> {
        self.path(parent).map(|p| p.join(name))
    }

    pub fn ino(&self, path: &Path) -> Option<u64> {
        self.maps.read().by_path.get(path).copied()
    }

    /// Inode for `path`, counting one kernel lookup
    pub fn lookup(&self, path: &Path) -> u64 {
        let mut maps = self.maps.write();
        if let Some(&ino) = maps.by_path.get(path) {
            if let Some(entry) = maps.by_ino.get_mut(&ino) {
                entry.lookups += 1;
            }
            return ino;
        }

        let ino = self.next_ino.fetch_add(1, Ordering::SeqCst);
        maps.by_ino.insert(
            ino,
            InodeEntry {
                path: path.to_path_buf(),
                lookups: 1,
            },
        );
        maps.by_path.insert(path.to_path_buf(), ino);
        ino
    }

    /// Drop `nlookup` kernel references; the entry goes when none remain
    pub fn forget(&self, ino: u64, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }
        let mut maps = self.maps.write();
        let remove = match maps.by_ino.get_mut(&ino) {
            Some(entry) => {
                entry.lookups = entry.lookups.saturating_sub(nlookup);
                entry.lookups == 0
            }
            None => false,
        };
        if remove {
            if let Some(entry) = maps.by_ino.remove(&ino) {
                if maps.by_path.get(&entry.path) == Some(&ino) {
                    maps.by_path.remove(&entry.path);
                }
            }
        }
    }

    /// Move `from` and everything below it to `to`
    pub fn rename(&self, from: &Path, to: &Path) {
        let mut maps = self.maps.write();

        // Whatever the destination named before is now unreachable by path
        let displaced: Vec<PathBuf> = maps
            .by_path
            .keys()
            .filter(|p| p.starts_with(to))
            .cloned()
            .collect();
        for path in displaced {
            maps.by_path.remove(&path);
        }

        let moved: Vec<(PathBuf, u64)> = maps
            .by_path
            .iter()
            .filter(|(p, _)| p.starts_with(from))
            .map(|(p, &ino)| (p.clone(), ino))
            .collect();

        for (old, ino) in moved {
            let new = match old.strip_prefix(from) {
                Ok(rest) if rest.as_os_str().is_empty() => to.to_path_buf(),
                Ok(rest) => to.join(rest),
                Err(_) => continue,
            };
            maps.by_path.remove(&old);
            maps.by_path.insert(new.clone(), ino);
            if let Some(entry) = maps.by_ino.get_mut(&ino) {
                entry.path = new;
            }
        }
    }

    /// Forget the path mapping of a removed node
    pub fn invalidate(&self, path: &Path) {
        self.maps.write().by_path.remove(path);
    }

    pub fn len(&self) -> usize {
        self.maps.read().by_ino.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
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
    fn test_root() {
        let table = InodeTable::new();
        assert_eq!(table.path(ROOT_INO), Some(PathBuf::from("/")));
        assert_eq!(
            table.child_path(ROOT_INO, OsStr::new("a")),
            Some(PathBuf::from("/a"))
        );
        table.forget(ROOT_INO, 100);
        assert_eq!(table.path(ROOT_INO), Some(PathBuf::from("/")));
    }

    #[test]
    fn test_lookup_is_stable() {
        let table = InodeTable::new();
        let a = table.lookup(Path::new("/a"));
        let b = table.lookup(Path::new("/b"));
        assert_ne!(a, b);
        assert_eq!(table.lookup(Path::new("/a")), a);
        assert_eq!(table.ino(Path::new("/a")), Some(a));
    }

    #[test]
    fn test_rdev_u32() {
        assert_eq!(rdev_u32(0), 0);
        assert_eq!(rdev_u32(0x0801), 0x0801);
        assert_eq!(rdev_u32(u64::from(u32::MAX)), u32::MAX);
        assert_eq!(rdev_u32(1 << 32), 0);
        assert_eq!(rdev_u32(u64::MAX), 0);
    }

    #[test]
    fn test_forget_counts_lookups() {
        let table = InodeTable::new();
        let a = table.lookup(Path::new("/a"));
        table.lookup(Path::new("/a"));

        table.forget(a, 1);
        assert!(table.path(a).is_some());
        table.forget(a, 1);
        assert!(table.path(a).is_none());
        assert!(table.ino(Path::new("/a")).is_none());
    }

    #[test]
    fn test_rename_moves_subtree() {
        let table = InodeTable::new();
        let dir = table.lookup(Path::new("/dir"));
        let file = table.lookup(Path::new("/dir/f"));
        let old_target = table.lookup(Path::new("/new"));

        table.rename(Path::new("/dir"), Path::new("/new"));

        assert_eq!(table.path(dir), Some(PathBuf::from("/new")));
        assert_eq!(table.path(file), Some(PathBuf::from("/new/f")));
        assert_eq!(table.ino(Path::new("/new")), Some(dir));
        assert!(table.ino(Path::new("/dir")).is_none());
        // the displaced inode keeps its number until forgotten
        assert!(table.path(old_target).is_some());
    }

    #[test]
    fn test_attributes_from_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"12345").unwrap();

        let attrs = FileAttributes::from_metadata(&std::fs::metadata(&file).unwrap());
        assert_eq!(attrs.kind, NodeKind::RegularFile);
        assert_eq!(attrs.size, 5);

        let resized = attrs.with_size(1025);
        assert_eq!(resized.blocks, 3);
        let fuse = resized.to_fuser_attr(42);
        assert_eq!(fuse.ino, 42);
        assert_eq!(fuse.size, 1025);
        assert_eq!(fuse.kind, fuser::FileType::RegularFile);

        let dir_attrs = FileAttributes::from_metadata(&std::fs::metadata(dir.path()).unwrap());
        assert_eq!(dir_attrs.kind, NodeKind::Directory);
    }
}
