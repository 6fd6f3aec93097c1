use thiserror::Error;

/// Crate-wide error type. Variants map directly onto the error kinds in
/// the bundle protocol core's error handling design: a failed allocation,
/// a corrupt or mistyped block, a lock/OS primitive failure, a file-store
/// I/O failure, and a blocking-call timeout.
#[derive(Error, Debug)]
pub enum BpError {
    #[error("pool exhausted")]
    PoolExhausted,

    #[error("invalid block: {0}")]
    InvalidBlock(String),

    #[error("OS primitive failure: {0}")]
    FailedOs(String),

    #[error("memory allocation failure: {0}")]
    FailedMem(String),

    #[error("file store failure: {0}")]
    FailedStore(String),

    #[error("operation timed out")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BpError {
    pub fn invalid_block(msg: impl Into<String>) -> Self {
        BpError::InvalidBlock(msg.into())
    }

    pub fn failed_store(msg: impl Into<String>) -> Self {
        BpError::FailedStore(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, BpError>;
