//! Streaming chat pipeline.
//!
//! - `message`: the conversation turn model
//! - `storage`: keyed storage injected into the log and memory
//! - `log`: ordered message log with undo and bounded persistence
//! - `decoder`: incremental event-stream decoder
//! - `dispatcher`: request shaping and failure classification
//! - `conversation`: host running one turn end to end

pub mod conversation;
pub mod decoder;
pub mod dispatcher;
pub mod error;
pub mod log;
pub mod message;
pub mod storage;

pub use conversation::{ChatEvent, Conversation, TurnOutcome, TurnStatus};
pub use decoder::{DeltaStream, RecordParse, StreamDecoder};
pub use dispatcher::{ChatDispatcher, DispatchFailure, OutboundRequest};
pub use error::{ChatError, ChatResult, StorageError, StorageResult};
pub use log::MessageLog;
pub use message::{Message, MessageId, Role};
pub use storage::{MemoryStorage, SqliteStorage, Storage, StorageFuture};
