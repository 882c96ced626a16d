use thiserror::Error;

/// Top-level error type for worker operations.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("database error: {0}")]
    Database(String),

    #[error("buffer I/O error: {0}")]
    BufferIo(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for worker operations.
pub type Result<T> = std::result::Result<T, WorkerError>;
