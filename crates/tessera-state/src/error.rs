use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Timed out acquiring lock for key {0}")]
    LockTimeout(String),

    #[error("Command {0} already recorded")]
    AlreadyRecorded(String),

    #[error("Blob {0} does not match its handle")]
    CorruptBlob(String),

    #[error("Corrupt block index at line {line}: {reason}")]
    CorruptIndex { line: usize, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Core error: {0}")]
    Core(#[from] tessera_core::CoreError),
}
