//! Filesystem layer
//!
//! Per-file plaintext state, the table of open files, the backing store,
//! the operation set with its encrypting implementation, and the FUSE
//! bridge on top.

mod adapter;
mod backing;
mod filesystem;
mod inode;
mod ops;
mod state;
mod table;

pub use adapter::EncryptedFs;
pub use backing::{BackingDirEntry, BackingStatfs, BackingStore};
pub use filesystem::{mount, CryptFuse};
pub use inode::{FileAttributes, InodeTable, NodeKind, ROOT_INO};
pub use ops::FsOperations;
pub use state::FileState;
pub use table::{FileTable, Released};
