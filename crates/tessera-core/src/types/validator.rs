use serde::{Deserialize, Serialize};

use crate::crypto::{Hash, Sig, ValidatorId};
use crate::types::pblock::PBlock;

/// One entry of a domain's validator directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorRecord {
    pub id: ValidatorId,
    /// Base URL where the validator serves peer RPC
    pub url: String,
}

impl ValidatorRecord {
    pub fn new(id: ValidatorId, url: impl Into<String>) -> Self {
        ValidatorRecord { id, url: url.into() }
    }
}

/// Broadcast when a validator proposes a pBlock
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PBlockNotification {
    pub proposing_validator: ValidatorId,
    /// Where the pBlock can be fetched if it is not inlined
    pub url: String,
    pub block_number: u64,
    pub pblock_handle: Hash,
    pub signature: Sig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pblock: Option<PBlock>,
}

/// A validator's view of whose pBlocks it could not obtain for a round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonInclusionVote {
    pub validator: ValidatorId,
    pub block_number: u64,
    pub unreachable_validators: Vec<ValidatorId>,
}
