//! Memory collaborator for the chat pipeline.
//!
//! - `collaborator`: the trait the dispatcher consumes and its value types
//! - `rolling`: the default deterministic rolling-summary implementation

pub mod collaborator;
pub mod rolling;

use thiserror::Error;

pub use collaborator::{
    ContextRole, ContextTurn, CoverageMark, MemoryCollaborator, MemoryFuture, MemorySummary,
};
pub use rolling::RollingSummaryMemory;

/// Memory subsystem error type.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Summary could not be produced.
    #[error("summarization failed: {0}")]
    Summarization(String),
    /// Storage access failed.
    #[error("storage error: {0}")]
    Storage(#[from] crate::chat::error::StorageError),
}

/// Convenience result alias for memory operations.
pub type MemoryResult<T> = Result<T, MemoryError>;
