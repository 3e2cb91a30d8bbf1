//! Tessera State - Storage and persistence
//!
//! This crate provides the per-contract key-value storage with its
//! optimistic/validated overlay, the command history used for replay
//! protection, the content-addressed blob store and the block index.

pub mod blob;
pub mod block_index;
pub mod error;
pub mod history;
pub mod kv;
pub mod lock;
pub mod storage;

pub use blob::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use block_index::BlockIndex;
pub use error::StateError;
pub use history::{CommandHistory, HistoryLog};
pub use kv::{ContractStorage, ExecutionMode, PendingWrite, StorageValue};
pub use lock::{KeyLock, KeyLockGuard, LockConfig};
pub use storage::{FileStorage, MemoryStorage, Storage};
