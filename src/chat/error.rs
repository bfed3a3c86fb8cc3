//! Error types for the chat pipeline.

use thiserror::Error;

/// Errors raised by the keyed storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    /// `SQLite` storage error (async).
    #[error("tokio-rusqlite error: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),
}

/// Convenience result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised while configuring or running the chat pipeline.
///
/// Request-level failures (HTTP status, transport) never surface here: they
/// are turned into assistant turns by the conversation host.
#[derive(Debug, Error)]
pub enum ChatError {
    /// HTTP client could not be built.
    #[error("http client error: {0}")]
    HttpClient(#[from] reqwest::Error),
    /// Configured endpoint is not a valid URL.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),
    /// System prompt marker pattern failed to compile.
    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),
    /// Request body could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience result alias for chat operations.
pub type ChatResult<T> = Result<T, ChatError>;
