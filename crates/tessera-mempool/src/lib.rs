//! Tessera Mempool - Pending command queue
//!
//! This crate holds the commands waiting to be batched into a pBlock.

pub mod error;
pub mod queue;

pub use error::MempoolError;
pub use queue::{CommandQueue, QueueConfig};
