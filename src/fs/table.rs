//! Open file table
//!
//! Maps each open path to its [`FileState`]. The map lock is only held to
//! look up, insert or remove an entry; every content operation then takes
//! the per-path lock for its whole duration, including the backing write of
//! a flush.
//!
//! Lock order is always entry before map. A state whose handle count has
//! dropped to zero is treated as absent even if a caller still holds its
//! `Arc`.

use crate::crypto::EncryptionCodec;
use crate::error::{Error, Result};
use crate::fs::state::FileState;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

type Entry = Arc<Mutex<FileState>>;

/// Outcome of a release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Released {
    /// Handles still open on the path
    pub remaining: u32,
    /// Dirty content was written before releasing
    pub flushed: bool,
}

/// Process-wide table of open paths
pub struct FileTable {
    codec: Arc<dyn EncryptionCodec>,
    next_handle: AtomicU64,
    files: RwLock<HashMap<PathBuf, Entry>>,
}

impl FileTable {
    pub fn new(codec: Arc<dyn EncryptionCodec>) -> Self {
        FileTable {
            codec,
            next_handle: AtomicU64::new(1),
            files: RwLock::new(HashMap::new()),
        }
    }

    pub fn codec(&self) -> &Arc<dyn EncryptionCodec> {
        &self.codec
    }

    fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::SeqCst)
    }

    fn entry(&self, path: &Path) -> Result<Entry> {
        self.files
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::NotFound(path.to_path_buf()))
    }

    /// Run `f` on the live state of `path` under its lock
    fn with_state<R>(&self, path: &Path, f: impl FnOnce(&mut FileState) -> Result<R>) -> Result<R> {
        let entry = self.entry(path)?;
        let mut state = entry.lock();
        if !state.is_live() {
            return Err(Error::NotFound(path.to_path_buf()));
        }
        f(&mut state)
    }

    fn insert(&self, path: &Path, state: FileState) -> Result<u64> {
        let mut files = self.files.write();
        if files.contains_key(path) {
            return Err(Error::Conflict(path.to_path_buf()));
        }
        files.insert(path.to_path_buf(), Arc::new(Mutex::new(state)));
        Ok(self.next_handle())
    }

    /// Start an empty state for a newly created file
    pub fn create(&self, path: &Path) -> Result<u64> {
        let fh = self.insert(path, FileState::new(Vec::new()))?;
        debug!("table create {:?} fh={}", path, fh);
        Ok(fh)
    }

    /// Start a state from the stored bytes of an existing file
    pub fn open(&self, path: &Path, ciphertext: &[u8]) -> Result<u64> {
        // Cheap rejection before paying for the decode
        if self.is_open(path) {
            return Err(Error::Conflict(path.to_path_buf()));
        }
        let plaintext = self.codec.decrypt(ciphertext)?;
        let fh = self.insert(path, FileState::new(plaintext))?;
        debug!("table open {:?} fh={}", path, fh);
        Ok(fh)
    }

    /// Take one more handle on an already open path
    pub fn share(&self, path: &Path) -> Result<u64> {
        self.with_state(path, |state| {
            state.acquire();
            Ok(())
        })?;
        Ok(self.next_handle())
    }

    pub fn write(&self, path: &Path, data: &[u8], offset: usize) -> Result<()> {
        if offset.checked_add(data.len()).is_none() {
            return Err(Error::Storage(std::io::Error::from_raw_os_error(libc::EFBIG)));
        }
        self.with_state(path, |state| {
            state.write(data, offset);
            Ok(())
        })
    }

    /// Resize the buffer; returns whether it changed
    pub fn truncate(&self, path: &Path, length: usize) -> Result<bool> {
        self.with_state(path, |state| Ok(state.truncate(length)))
    }

    /// Encrypted form of the current buffer, without touching the state
    pub fn ciphertext_snapshot(&self, path: &Path) -> Result<Vec<u8>> {
        self.with_state(path, |state| self.codec.encrypt(state.content()))
    }

    pub fn plaintext_view(&self, path: &Path, offset: usize, length: usize) -> Result<Vec<u8>> {
        self.with_state(path, |state| Ok(state.read(offset, length).to_vec()))
    }

    /// Encrypt the buffer and hand it to `store`, clearing `dirty` only if
    /// the store succeeds
    ///
    /// Unlinked states skip `store`. Returns whether `store` ran.
    pub fn flush_with<F>(&self, path: &Path, store: F) -> Result<bool>
    where
        F: FnOnce(&[u8]) -> Result<()>,
    {
        self.with_state(path, |state| self.flush_locked(path, state, store))
    }

    fn flush_locked<F>(&self, path: &Path, state: &mut FileState, store: F) -> Result<bool>
    where
        F: FnOnce(&[u8]) -> Result<()>,
    {
        if state.is_unlinked() {
            debug!("skipping flush of unlinked {:?}", path);
            state.mark_clean();
            return Ok(false);
        }
        let ciphertext = self.codec.encrypt(state.content())?;
        store(&ciphertext)?;
        state.mark_clean();
        Ok(true)
    }

    /// Drop one handle without flushing
    pub fn release(&self, path: &Path) -> Result<u32> {
        self.release_with(path, |_| Ok(())).map(|r| r.remaining)
    }

    /// Flush through `store` if dirty, then drop one handle
    ///
    /// If the flush fails the handle is kept, stranded, and the state stays
    /// dirty until a retry or an [`adopt`](Self::adopt). The entry is removed
    /// once no handles remain.
    pub fn release_with<F>(&self, path: &Path, store: F) -> Result<Released>
    where
        F: FnOnce(&[u8]) -> Result<()>,
    {
        let entry = self.entry(path)?;
        let mut state = entry.lock();
        if !state.is_live() {
            return Err(Error::NotFound(path.to_path_buf()));
        }

        let flushed = if state.is_dirty() {
            match self.flush_locked(path, &mut state, store) {
                Ok(ran) => ran,
                Err(e) => {
                    state.strand();
                    return Err(e);
                }
            }
        } else {
            false
        };

        let remaining = state.release();
        if remaining == 0 {
            let mut files = self.files.write();
            if files.get(path).is_some_and(|e| Arc::ptr_eq(e, &entry)) {
                files.remove(path);
            } else {
                // re-keyed by a rename while we held the entry
                files.retain(|_, e| !Arc::ptr_eq(e, &entry));
            }
            debug!("table evict {:?}", path);
        }

        Ok(Released { remaining, flushed })
    }

    pub fn is_open(&self, path: &Path) -> bool {
        self.files.read().contains_key(path)
    }

    pub fn is_dirty(&self, path: &Path) -> Result<bool> {
        self.with_state(path, |state| Ok(state.is_dirty()))
    }

    /// Plaintext length of an open path
    pub fn len(&self, path: &Path) -> Option<u64> {
        self.with_state(path, |state| Ok(state.len() as u64)).ok()
    }

    pub fn open_handles(&self, path: &Path) -> Option<u32> {
        self.with_state(path, |state| Ok(state.open_handles())).ok()
    }

    /// Take over a state that only failed releases keep alive
    ///
    /// Returns a fresh handle id for the adopted handle, or `None` when the
    /// state still has a live owner.
    pub fn adopt(&self, path: &Path) -> Result<Option<u64>> {
        let adopted = self.with_state(path, |state| Ok(state.is_orphaned() && state.adopt()))?;
        if adopted {
            debug!("table adopt {:?}", path);
        }
        Ok(adopted.then(|| self.next_handle()))
    }

    /// Open paths with unflushed changes that still have a backing file
    pub fn dirty_paths(&self) -> Vec<PathBuf> {
        let entries: Vec<(PathBuf, Entry)> = self
            .files
            .read()
            .iter()
            .map(|(path, entry)| (path.clone(), Arc::clone(entry)))
            .collect();

        entries
            .into_iter()
            .filter(|(_, entry)| {
                let state = entry.lock();
                state.is_live() && state.is_dirty() && !state.is_unlinked()
            })
            .map(|(path, _)| path)
            .collect()
    }

    /// Re-key `from` and every open path below it to live under `to`
    ///
    /// Fails with `Conflict` if the destination is itself open.
    pub fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut files = self.files.write();
        if from != to && files.contains_key(to) {
            return Err(Error::Conflict(to.to_path_buf()));
        }

        let moved: Vec<PathBuf> = files
            .keys()
            .filter(|p| p.starts_with(from))
            .cloned()
            .collect();

        for old in moved {
            if let Some(entry) = files.remove(&old) {
                let new = match old.strip_prefix(from) {
                    Ok(rest) if rest.as_os_str().is_empty() => to.to_path_buf(),
                    Ok(rest) => to.join(rest),
                    Err(_) => old.clone(),
                };
                debug!("table rename {:?} -> {:?}", old, new);
                files.insert(new, entry);
            }
        }
        Ok(())
    }

    /// Mark an open path as removed from backing storage and free the path
    ///
    /// The state moves to a detached key that no visible path can name,
    /// which remaining handles keep using until the last release. Returns
    /// that key.
    pub fn detach(&self, path: &Path) -> Result<PathBuf> {
        let entry = self.entry(path)?;
        let mut state = entry.lock();
        if !state.is_live() {
            return Err(Error::NotFound(path.to_path_buf()));
        }
        state.mark_unlinked();

        let key = detached_key(self.next_handle());
        let mut files = self.files.write();
        if files.get(path).is_some_and(|e| Arc::ptr_eq(e, &entry)) {
            files.remove(path);
        } else {
            files.retain(|_, e| !Arc::ptr_eq(e, &entry));
        }
        files.insert(key.clone(), Arc::clone(&entry));
        debug!("table detach {:?} -> {:?}", path, key);
        Ok(key)
    }
}

/// Key for the state of an unlinked file; the NUL byte keeps it out of
/// reach of any name the kernel can send
fn detached_key(id: u64) -> PathBuf {
    PathBuf::from(format!("/\0unlinked-{}", id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{IdentityCodec, ReverseCodec};
    use std::os::unix::ffi::OsStrExt;

    fn table() -> FileTable {
        FileTable::new(Arc::new(IdentityCodec))
    }

    fn p(s: &str) -> PathBuf {
        PathBuf::from(s)
    }

    #[test]
    fn test_create_conflict() {
        let table = table();
        let fh1 = table.create(&p("/a")).unwrap();
        assert!(matches!(table.create(&p("/a")), Err(Error::Conflict(_))));
        assert!(matches!(table.open(&p("/a"), b"x"), Err(Error::Conflict(_))));

        let fh2 = table.create(&p("/b")).unwrap();
        assert_ne!(fh1, fh2);
        assert!(table.is_open(&p("/a")));
        assert!(table.is_open(&p("/b")));
    }

    #[test]
    fn test_open_decodes_ciphertext() {
        let table = FileTable::new(Arc::new(ReverseCodec));
        table.open(&p("/a"), b"olleh").unwrap();
        assert_eq!(table.plaintext_view(&p("/a"), 0, 5).unwrap(), b"hello");
        assert!(!table.is_dirty(&p("/a")).unwrap());
        assert_eq!(table.ciphertext_snapshot(&p("/a")).unwrap(), b"olleh");
    }

    #[test]
    fn test_missing_path_not_found() {
        let table = table();
        let path = p("/missing");
        assert!(matches!(table.write(&path, b"x", 0), Err(Error::NotFound(_))));
        assert!(matches!(table.truncate(&path, 1), Err(Error::NotFound(_))));
        assert!(matches!(table.ciphertext_snapshot(&path), Err(Error::NotFound(_))));
        assert!(matches!(table.plaintext_view(&path, 0, 1), Err(Error::NotFound(_))));
        assert!(matches!(table.release(&path), Err(Error::NotFound(_))));
        assert!(matches!(table.share(&path), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_write_truncate_read() {
        let table = table();
        let a = p("/a");
        table.create(&a).unwrap();

        table.write(&a, b"hello", 0).unwrap();
        assert_eq!(table.plaintext_view(&a, 0, 5).unwrap(), b"hello");

        assert!(table.truncate(&a, 3).unwrap());
        assert_eq!(table.plaintext_view(&a, 0, 3).unwrap(), b"hel");

        assert!(table.truncate(&a, 6).unwrap());
        assert_eq!(table.plaintext_view(&a, 0, 6).unwrap(), b"hel\0\0\0");
        assert!(!table.truncate(&a, 6).unwrap());
        assert_eq!(table.len(&a), Some(6));
    }

    #[test]
    fn test_write_offset_overflow() {
        let table = table();
        table.create(&p("/a")).unwrap();
        assert!(matches!(
            table.write(&p("/a"), b"xy", usize::MAX),
            Err(Error::Storage(_))
        ));
    }

    #[test]
    fn test_snapshot_does_not_clear_dirty() {
        let table = table();
        let a = p("/a");
        table.create(&a).unwrap();
        table.write(&a, b"data", 0).unwrap();

        assert_eq!(table.ciphertext_snapshot(&a).unwrap(), b"data");
        assert!(table.is_dirty(&a).unwrap());
    }

    #[test]
    fn test_flush_clears_dirty_only_on_success() {
        let table = table();
        let a = p("/a");
        table.create(&a).unwrap();
        table.write(&a, b"data", 0).unwrap();

        let failed = table.flush_with(&a, |_| {
            Err(Error::Storage(std::io::Error::from_raw_os_error(libc::EIO)))
        });
        assert!(failed.is_err());
        assert!(table.is_dirty(&a).unwrap());

        let mut stored = Vec::new();
        assert!(table
            .flush_with(&a, |ct| {
                stored = ct.to_vec();
                Ok(())
            })
            .unwrap());
        assert_eq!(stored, b"data");
        assert!(!table.is_dirty(&a).unwrap());
    }

    #[test]
    fn test_refcounting() {
        let table = table();
        let a = p("/a");
        table.create(&a).unwrap();
        table.share(&a).unwrap();
        table.share(&a).unwrap();
        assert_eq!(table.open_handles(&a), Some(3));

        table.write(&a, b"latest", 0).unwrap();
        assert_eq!(table.release(&a).unwrap(), 2);
        assert_eq!(table.plaintext_view(&a, 0, 6).unwrap(), b"latest");
        assert_eq!(table.release(&a).unwrap(), 1);
        assert!(table.is_open(&a));
        assert_eq!(table.release(&a).unwrap(), 0);
        assert!(!table.is_open(&a));

        // Releasing past zero is reported, not a crash
        assert!(matches!(table.release(&a), Err(Error::NotFound(_))));
        table.create(&a).unwrap();
    }

    #[test]
    fn test_release_with_failed_flush_keeps_handle() {
        let table = table();
        let a = p("/a");
        table.create(&a).unwrap();
        table.write(&a, b"data", 0).unwrap();

        let result = table.release_with(&a, |_| {
            Err(Error::Storage(std::io::Error::from_raw_os_error(libc::ENOSPC)))
        });
        assert!(result.is_err());
        assert!(table.is_open(&a));
        assert!(table.is_dirty(&a).unwrap());

        let released = table.release_with(&a, |_| Ok(())).unwrap();
        assert_eq!(released, Released { remaining: 0, flushed: true });
        assert!(!table.is_open(&a));
    }

    #[test]
    fn test_release_clean_skips_store() {
        let table = table();
        let a = p("/a");
        table.open(&a, b"abc").unwrap();
        let released = table
            .release_with(&a, |_| panic!("clean state must not be stored"))
            .unwrap();
        assert!(!released.flushed);
    }

    #[test]
    fn test_stale_entry_is_not_found() {
        let table = table();
        let a = p("/a");
        table.create(&a).unwrap();
        let stale = table.entry(&a).unwrap();
        table.release(&a).unwrap();

        assert!(!stale.lock().is_live());
        assert!(matches!(table.write(&a, b"x", 0), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_rename_rekeys_descendants() {
        let table = table();
        table.create(&p("/dir/a")).unwrap();
        table.create(&p("/dir/sub/b")).unwrap();
        table.create(&p("/other")).unwrap();
        table.write(&p("/dir/a"), b"A", 0).unwrap();

        table.rename(&p("/dir"), &p("/moved")).unwrap();
        assert!(table.is_open(&p("/moved/a")));
        assert!(table.is_open(&p("/moved/sub/b")));
        assert!(table.is_open(&p("/other")));
        assert!(!table.is_open(&p("/dir/a")));
        assert_eq!(table.plaintext_view(&p("/moved/a"), 0, 1).unwrap(), b"A");

        assert!(matches!(
            table.rename(&p("/moved/a"), &p("/other")),
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn test_unlinked_flush_skips_store() {
        let table = table();
        let a = p("/a");
        table.create(&a).unwrap();
        table.write(&a, b"gone", 0).unwrap();
        let key = table.detach(&a).unwrap();

        let ran = table.flush_with(&key, |_| panic!("unlinked state must not be stored")).unwrap();
        assert!(!ran);
        assert!(!table.is_dirty(&key).unwrap());
    }

    #[test]
    fn test_detach_frees_the_path() {
        let table = table();
        let a = p("/a");
        table.create(&a).unwrap();
        table.write(&a, b"old", 0).unwrap();

        let key = table.detach(&a).unwrap();
        assert!(key.as_os_str().as_bytes().contains(&0));
        assert!(!table.is_open(&a));
        assert!(matches!(table.detach(&a), Err(Error::NotFound(_))));

        table.create(&a).unwrap();
        table.write(&a, b"new", 0).unwrap();
        table.write(&key, b"!", 3).unwrap();
        assert_eq!(table.plaintext_view(&key, 0, 10).unwrap(), b"old!");
        assert_eq!(table.plaintext_view(&a, 0, 10).unwrap(), b"new");

        // A second unlink of the new file gets its own key
        let second = table.detach(&a).unwrap();
        assert_ne!(key, second);

        assert_eq!(table.release(&key).unwrap(), 0);
        assert!(!table.is_open(&key));
        assert_eq!(table.plaintext_view(&second, 0, 10).unwrap(), b"new");
        assert!(table.dirty_paths().is_empty());
    }

    #[test]
    fn test_adopt_after_failed_release() {
        let table = table();
        let a = p("/a");
        table.create(&a).unwrap();
        table.write(&a, b"unsaved", 0).unwrap();

        // a live owner blocks adoption
        assert_eq!(table.adopt(&a).unwrap(), None);

        let failed = table.release_with(&a, |_| {
            Err(Error::Storage(std::io::Error::from_raw_os_error(libc::EIO)))
        });
        assert!(failed.is_err());
        assert!(matches!(table.open(&a, b""), Err(Error::Conflict(_))));

        let fh = table.adopt(&a).unwrap().expect("orphaned state should be adopted");
        assert!(fh > 0);
        assert_eq!(table.open_handles(&a), Some(1));
        assert_eq!(table.adopt(&a).unwrap(), None);
        assert_eq!(table.plaintext_view(&a, 0, 7).unwrap(), b"unsaved");

        let mut stored = Vec::new();
        let released = table
            .release_with(&a, |ct| {
                stored = ct.to_vec();
                Ok(())
            })
            .unwrap();
        assert_eq!(released, Released { remaining: 0, flushed: true });
        assert_eq!(stored, b"unsaved");
        assert!(!table.is_open(&a));
    }

    #[test]
    fn test_dirty_paths() {
        let table = table();
        table.create(&p("/clean")).unwrap();
        table.create(&p("/dirty")).unwrap();
        table.write(&p("/dirty"), b"x", 0).unwrap();

        assert_eq!(table.dirty_paths(), vec![p("/dirty")]);
    }

    #[test]
    fn test_concurrent_writes_to_one_path() {
        const WRITERS: usize = 8;
        const CHUNK: usize = 4096;

        let table = table();
        let a = p("/a");
        table.create(&a).unwrap();

        std::thread::scope(|s| {
            for i in 0..WRITERS {
                let (table, a) = (&table, &a);
                s.spawn(move || {
                    let data = vec![i as u8 + 1; CHUNK];
                    // several smaller writes per thread to interleave with the others
                    for piece in 0..4 {
                        let start = piece * CHUNK / 4;
                        let slice = &data[start..start + CHUNK / 4];
                        table.write(a, slice, i * CHUNK + start).unwrap();
                    }
                });
            }
        });

        let content = table.plaintext_view(&a, 0, usize::MAX).unwrap();
        assert_eq!(content.len(), WRITERS * CHUNK);
        for (i, chunk) in content.chunks(CHUNK).enumerate() {
            assert!(chunk.iter().all(|&b| b == i as u8 + 1), "chunk {} corrupted", i);
        }
    }

    #[test]
    fn test_slow_store_does_not_block_other_paths() {
        use std::sync::mpsc;

        let table = table();
        table.create(&p("/a")).unwrap();
        table.write(&p("/a"), b"slow", 0).unwrap();
        table.create(&p("/b")).unwrap();

        let (entered_tx, entered_rx) = mpsc::channel();
        let (resume_tx, resume_rx) = mpsc::channel::<()>();

        std::thread::scope(|s| {
            let shared = &table;
            let flusher = s.spawn(move || {
                shared.flush_with(&p("/a"), |ct| {
                    assert_eq!(ct, b"slow");
                    entered_tx.send(()).unwrap();
                    resume_rx.recv().unwrap();
                    Ok(())
                })
            });

            entered_rx.recv().unwrap();

            // /a is mid-store; the map and other paths stay usable
            table.write(&p("/b"), b"fast", 0).unwrap();
            assert_eq!(table.plaintext_view(&p("/b"), 0, 4).unwrap(), b"fast");
            table.create(&p("/c")).unwrap();
            assert_eq!(table.release(&p("/c")).unwrap(), 0);
            assert!(table.is_open(&p("/a")));

            resume_tx.send(()).unwrap();
            assert!(flusher.join().unwrap().unwrap());
        });

        assert!(!table.is_dirty(&p("/a")).unwrap());
        assert!(table.is_dirty(&p("/b")).unwrap());
    }
}
