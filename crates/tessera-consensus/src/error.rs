use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("Consensus is not active yet")]
    NotActive,

    #[error("Validator directory is empty")]
    EmptyValidatorDirectory,

    #[error("Block number {block_number} is not ahead of the latest block {latest}")]
    StaleBlockNumber { block_number: u64, latest: u64 },

    #[error("Invalid pBlock: {0}")]
    InvalidPBlock(String),

    #[error("Validator not part of the round: {0}")]
    UnknownValidator(String),

    #[error("Duplicate pBlock from validator {0}")]
    DuplicatePBlock(String),

    #[error("Duplicate non-inclusion vote from validator {0}")]
    DuplicateVote(String),

    #[error("Round {block_number} is in the {phase} phase")]
    WrongPhase { block_number: u64, phase: String },

    #[error("No round in progress for block {0}")]
    UnknownRound(u64),

    #[error("pBlock was excluded from block {0}")]
    Excluded(u64),

    #[error("Round ended without a result")]
    RoundAborted,

    #[error("Block mismatch: {0}")]
    BlockMismatch(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Peer error: {0}")]
    Peer(String),

    #[error("State error: {0}")]
    State(#[from] tessera_state::StateError),

    #[error("Core error: {0}")]
    Core(#[from] tessera_core::CoreError),

    #[error("VM error: {0}")]
    Vm(#[from] tessera_vm::VmError),

    #[error("Mempool error: {0}")]
    Mempool(#[from] tessera_mempool::MempoolError),
}

impl From<reqwest::Error> for ConsensusError {
    fn from(e: reqwest::Error) -> Self {
        ConsensusError::Peer(e.to_string())
    }
}
