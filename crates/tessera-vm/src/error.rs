use thiserror::Error;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("Unknown domain: {0}")]
    UnknownDomain(String),

    #[error("Unknown contract: {0}")]
    UnknownContract(String),

    #[error("Unknown method: {contract}.{method}")]
    UnknownMethod { contract: String, method: String },

    #[error("Method {contract}.{method} cannot be called as a {kind} command")]
    MethodNotAllowed {
        contract: String,
        method: String,
        kind: String,
    },

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Missing signature")]
    MissingSignature,

    #[error("Command timestamp {timestamp} outside the accepted window (now {now})")]
    StaleTimestamp { timestamp: u64, now: u64 },

    #[error("Command block number {block_number} too far behind latest block {latest}")]
    StaleBlockNumber { block_number: u64, latest: u64 },

    #[error("Command already executed: {0}")]
    Replay(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Inter-contract call depth exceeded")]
    CallDepthExceeded,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("State error: {0}")]
    State(#[from] tessera_state::StateError),

    #[error("Core error: {0}")]
    Core(#[from] tessera_core::CoreError),
}
