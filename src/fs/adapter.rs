//! Encrypting filesystem adapter
//!
//! Binds the content operations to the [`FileTable`] and the backing store.
//! A path moves through `unopened -> clean -> dirty -> clean -> unopened`:
//! open/create start a clean state, write/truncate dirty it, flush/fsync
//! write the whole re-encrypted buffer back, and the final release flushes
//! if needed and evicts the state.

use crate::config::Config;
use crate::crypto::EncryptionCodec;
use crate::error::{Error, Result};
use crate::fs::backing::BackingStore;
use crate::fs::inode::{FileAttributes, NodeKind};
use crate::fs::ops::FsOperations;
use crate::fs::table::FileTable;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Filesystem that stores file contents through a codec
pub struct EncryptedFs {
    backing: BackingStore,
    table: FileTable,
    shared_opens: bool,
}

fn to_index(value: u64) -> Result<usize> {
    usize::try_from(value).map_err(|_| Error::Storage(std::io::Error::from_raw_os_error(libc::EFBIG)))
}

impl EncryptedFs {
    pub fn new(backing_root: PathBuf, codec: Arc<dyn EncryptionCodec>) -> Result<Self> {
        Ok(Self {
            backing: BackingStore::new(backing_root)?,
            table: FileTable::new(codec),
            shared_opens: false,
        })
    }

    pub fn from_config(config: &Config, codec: Arc<dyn EncryptionCodec>) -> Result<Self> {
        Ok(Self::new(config.mount.backing_root.clone(), codec)?
            .with_shared_opens(config.mount.shared_opens))
    }

    /// Let an open of an already-open path share its buffer
    pub fn with_shared_opens(mut self, enabled: bool) -> Self {
        self.shared_opens = enabled;
        self
    }

    pub fn table(&self) -> &FileTable {
        &self.table
    }

    pub fn codec(&self) -> &Arc<dyn EncryptionCodec> {
        self.table.codec()
    }

    pub fn is_open(&self, path: &Path) -> bool {
        self.table.is_open(path)
    }

    fn store(&self, path: &Path, ciphertext: &[u8], full_sync: bool) -> Result<()> {
        self.backing
            .write_all(path, ciphertext, full_sync)
            .inspect_err(|e| error!("Failed to write {:?} to backing storage: {}", path, e))?;
        info!("Flushed {:?} ({} bytes stored)", path, ciphertext.len());
        Ok(())
    }

    fn flush_synced(&self, path: &Path, full_sync: bool) -> Result<()> {
        self.table
            .flush_with(path, |ciphertext| self.store(path, ciphertext, full_sync))
            .map(|_| ())
    }

    fn open_existing(&self, path: &Path) -> Result<u64> {
        let ciphertext = self.backing.read_all(path).inspect_err(|e| {
            warn!("Failed to read {:?} from backing storage: {}", path, e)
        })?;

        match self.table.open(path, &ciphertext) {
            Err(Error::Conflict(_)) if self.shared_opens => self.table.share(path),
            Err(e @ Error::Codec(_)) => {
                error!("Failed to decode {:?}: {}", path, e);
                Err(e)
            }
            result => result,
        }
    }
}

impl FsOperations for EncryptedFs {
    fn backing(&self) -> &BackingStore {
        &self.backing
    }

    fn create(&self, path: &Path, mode: u32) -> Result<u64> {
        debug!("create(path={:?}, mode={:o})", path, mode);

        if self.table.is_open(path) {
            return Err(Error::Conflict(path.to_path_buf()));
        }
        self.backing.create_empty(path, mode)?;
        self.table.create(path)
    }

    fn open(&self, path: &Path, flags: i32) -> Result<u64> {
        debug!("open(path={:?}, flags={:#x})", path, flags);

        let fh = if self.table.is_open(path) {
            match self.table.adopt(path) {
                Ok(Some(fh)) => {
                    warn!("Reopened {:?} with unsaved changes from a failed release", path);
                    fh
                }
                Ok(None) if self.shared_opens => self.table.share(path)?,
                Ok(None) => return Err(Error::Conflict(path.to_path_buf())),
                // evicted since the check
                Err(Error::NotFound(_)) => self.open_existing(path)?,
                Err(e) => return Err(e),
            }
        } else {
            self.open_existing(path)?
        };

        if flags & libc::O_TRUNC != 0 {
            self.table.truncate(path, 0)?;
        }
        Ok(fh)
    }

    fn read(&self, path: &Path, length: usize, offset: u64) -> Result<Vec<u8>> {
        debug!("read(path={:?}, length={}, offset={})", path, length, offset);
        // Offsets past usize::MAX are past any buffer
        let offset = usize::try_from(offset).unwrap_or(usize::MAX);
        self.table.plaintext_view(path, offset, length)
    }

    fn write(&self, path: &Path, data: &[u8], offset: u64) -> Result<usize> {
        debug!("write(path={:?}, len={}, offset={})", path, data.len(), offset);
        self.table.write(path, data, to_index(offset)?)?;
        Ok(data.len())
    }

    fn truncate(&self, path: &Path, length: u64) -> Result<()> {
        debug!("truncate(path={:?}, length={})", path, length);
        let length = to_index(length)?;

        if self.table.is_open(path) {
            self.table.truncate(path, length)?;
            return Ok(());
        }

        // No handle: resize through a short-lived open
        self.open_existing(path)?;
        let resized = self.table.truncate(path, length);
        let released = self
            .table
            .release_with(path, |ciphertext| self.store(path, ciphertext, true));
        resized?;
        released.map(|_| ())
    }

    fn flush(&self, path: &Path) -> Result<()> {
        debug!("flush(path={:?})", path);
        self.flush_synced(path, true)
    }

    fn fsync(&self, path: &Path, full_sync: bool) -> Result<()> {
        debug!("fsync(path={:?}, full_sync={})", path, full_sync);
        self.flush_synced(path, full_sync)
    }

    fn release(&self, path: &Path) -> Result<()> {
        debug!("release(path={:?})", path);
        let released = self
            .table
            .release_with(path, |ciphertext| self.store(path, ciphertext, true))?;
        if released.remaining == 0 {
            debug!("closed {:?}", path);
        }
        Ok(())
    }

    fn flush_all(&self) -> Result<()> {
        let mut first_error = None;
        for path in self.table.dirty_paths() {
            match self.flush_synced(&path, true) {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(e) => {
                    error!("Unsaved changes to {:?} could not be written: {}", path, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn getattr(&self, path: &Path) -> Result<FileAttributes> {
        let attrs = FileAttributes::from_metadata(&self.backing.metadata(path)?);
        if attrs.kind != NodeKind::RegularFile {
            return Ok(attrs);
        }

        let size = match self.table.len(path) {
            Some(len) => len,
            None => self.codec().plaintext_len(attrs.size),
        };
        Ok(attrs.with_size(size))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        debug!("rename(from={:?}, to={:?})", from, to);
        if from != to && self.table.is_open(to) {
            return Err(Error::Conflict(to.to_path_buf()));
        }
        self.backing.rename(from, to)?;
        self.table.rename(from, to)
    }

    fn unlink(&self, path: &Path) -> Result<Option<PathBuf>> {
        debug!("unlink(path={:?})", path);
        self.backing.unlink(path)?;
        match self.table.detach(path) {
            Ok(key) => Ok(Some(key)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
