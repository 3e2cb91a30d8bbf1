use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum MempoolError {
    #[error("Command already queued")]
    AlreadyQueued,

    #[error("Command queue is full")]
    QueueFull,

    #[error("Signer has reached the queued command limit")]
    SignerLimitReached,

    #[error("Invalid command: {0}")]
    InvalidCommand(String),
}
