use serde::{Deserialize, Serialize};

use crate::crypto::{hash_blake3, verify, Hash, KeyPair, Sig, ValidatorId};
use crate::error::CoreError;
use crate::serialize;
use crate::types::block::BlockInfo;
use crate::types::command::Command;

/// One validator's signed batch of commands proposed for a block number
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PBlock {
    pub proposing_validator: ValidatorId,
    pub commands: Vec<Command>,
    pub previous_block_hash: Option<Hash>,
    pub block_number: u64,
    pub hash: Hash,
    pub signature: Sig,
}

/// Hash preimage (excludes proposer, hash and signature)
#[derive(Serialize)]
struct PBlockDigest {
    commands: Vec<u8>,
    previous_block_hash: Option<Hash>,
    block_number: u64,
}

impl PBlock {
    /// Build and sign a pBlock on top of the given latest block
    pub fn new_signed(
        keypair: &KeyPair,
        commands: Vec<Command>,
        latest: &BlockInfo,
    ) -> Result<Self, CoreError> {
        let mut pblock = PBlock {
            proposing_validator: keypair.public,
            commands,
            previous_block_hash: latest.hash,
            block_number: latest.number + 1,
            hash: Hash::ZERO,
            signature: Sig::default(),
        };
        pblock.hash = pblock.compute_hash()?;
        pblock.signature = keypair.sign_hash(&pblock.hash);
        Ok(pblock)
    }

    /// Recompute the hash from the content
    pub fn compute_hash(&self) -> Result<Hash, CoreError> {
        let digest = PBlockDigest {
            commands: serialize::to_json_bytes(&self.commands)?,
            previous_block_hash: self.previous_block_hash,
            block_number: self.block_number,
        };
        Ok(hash_blake3(&serialize::to_bytes(&digest)?))
    }

    /// Check the stored hash matches the content and is signed by the proposer
    pub fn verify(&self) -> Result<(), CoreError> {
        if self.compute_hash()? != self.hash {
            return Err(CoreError::HashMismatch);
        }
        verify(
            &self.proposing_validator,
            self.hash.as_bytes(),
            &self.signature,
        )
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Encoding used for the blob store
    pub fn to_blob(&self) -> Result<Vec<u8>, CoreError> {
        serialize::to_json_bytes(self)
    }

    pub fn from_blob(bytes: &[u8]) -> Result<Self, CoreError> {
        serialize::from_json_bytes(bytes)
    }

    /// Content address of this pBlock in the blob store
    pub fn handle(&self) -> Result<Hash, CoreError> {
        Ok(hash_blake3(&self.to_blob()?))
    }
}
