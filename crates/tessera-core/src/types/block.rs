use serde::{Deserialize, Serialize};

use crate::crypto::{hash_blake3, Hash};
use crate::error::CoreError;
use crate::serialize;

/// Number and handle of the latest finalized block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub number: u64,
    pub hash: Option<Hash>,
}

impl BlockInfo {
    /// State before any block has been finalized
    pub fn genesis() -> Self {
        BlockInfo {
            number: 0,
            hash: None,
        }
    }

    pub fn next_number(&self) -> u64 {
        self.number + 1
    }
}

impl Default for BlockInfo {
    fn default() -> Self {
        Self::genesis()
    }
}

/// An agreed set of pBlocks for one block number
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Handles of the non-empty pBlocks, sorted and deduplicated
    pub pblock_handles: Vec<Hash>,
    pub block_number: u64,
    pub previous_block_hash: Option<Hash>,
}

impl Block {
    pub fn new(
        block_number: u64,
        previous_block_hash: Option<Hash>,
        pblock_handles: impl IntoIterator<Item = Hash>,
    ) -> Self {
        let mut pblock_handles: Vec<Hash> = pblock_handles.into_iter().collect();
        pblock_handles.sort();
        pblock_handles.dedup();

        Block {
            pblock_handles,
            block_number,
            previous_block_hash,
        }
    }

    pub fn to_blob(&self) -> Result<Vec<u8>, CoreError> {
        serialize::to_json_bytes(self)
    }

    pub fn from_blob(bytes: &[u8]) -> Result<Self, CoreError> {
        serialize::from_json_bytes(bytes)
    }

    /// Content address of this block in the blob store
    pub fn handle(&self) -> Result<Hash, CoreError> {
        Ok(hash_blake3(&self.to_blob()?))
    }

    /// Block info describing this block once it becomes the latest
    pub fn info(&self) -> Result<BlockInfo, CoreError> {
        Ok(BlockInfo {
            number: self.block_number,
            hash: Some(self.handle()?),
        })
    }
}
