use thiserror::Error;

/// Errors that can occur inside a worker process.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Rank environment missing or malformed
    #[error("Environment error: {0}")]
    Env(String),

    /// Registry unreachable, timed out or replied with an error
    #[error("Registry error: {0}")]
    Registry(String),

    /// Unexpected reply from the registry
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid sampler inputs (empty dataset, bad rank, bad capabilities)
    #[error("Shard error: {0}")]
    Shard(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for worker operations.
pub type Result<T> = std::result::Result<T, WorkerError>;
