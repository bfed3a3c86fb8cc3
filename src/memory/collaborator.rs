//! Interface consumed by the chat pipeline to compress older turns.

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chat::message::{Message, MessageId, Role};
use crate::memory::MemoryResult;

/// Boxed future type for collaborator operations.
pub type MemoryFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Role of a turn in the context window.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextRole {
    /// Instructions or summaries.
    System,
    /// Human input.
    User,
    /// Model output.
    Assistant,
}

impl ContextRole {
    /// Stable string form used on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl From<Role> for ContextRole {
    fn from(role: Role) -> Self {
        match role {
            Role::User => Self::User,
            Role::Assistant => Self::Assistant,
        }
    }
}

/// One turn of the context window sent to the model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextTurn {
    /// Role of the turn.
    pub role: ContextRole,
    /// Text content.
    pub content: String,
    /// Inline image carried by the turn, if any.
    pub image_url: Option<String>,
}

impl ContextTurn {
    /// Build a system turn.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ContextRole::System,
            content: content.into(),
            image_url: None,
        }
    }
}

impl From<&Message> for ContextTurn {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role.into(),
            content: message.content.clone(),
            image_url: message.image_url.clone(),
        }
    }
}

/// Last message folded into a summary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageMark {
    /// Id of the folded message.
    pub id: MessageId,
    /// Its creation instant, used when the message has since been deleted.
    pub timestamp: DateTime<Utc>,
}

impl From<&Message> for CoverageMark {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id,
            timestamp: message.timestamp,
        }
    }
}

/// Summary of older turns.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySummary {
    /// Summary text.
    pub text: String,
    /// Number of leading log entries folded into the summary when it was last
    /// extended.
    pub covered_count: usize,
    /// Last update time.
    pub last_updated: DateTime<Utc>,
    /// Last folded message; survives deletions of older turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub covered_through: Option<CoverageMark>,
}

/// Long-term memory collaborator.
///
/// Invoked on every send: `should_summarize` then, if it says so,
/// `summarize` completes before `build_context` is called.
pub trait MemoryCollaborator: Send + Sync {
    /// Whether older turns of `log` should be folded into the summary now.
    fn should_summarize(&self, log: &[Message]) -> bool;

    /// Fold older turns of `log` into the summary.
    ///
    /// # Errors
    /// Returns an error if the summary cannot be produced or stored.
    fn summarize<'a>(&'a self, log: &'a [Message]) -> MemoryFuture<'a, MemoryResult<()>>;

    /// Ordered context window: optional leading summary turn, then recent turns.
    fn build_context(&self, log: &[Message]) -> Vec<ContextTurn>;

    /// Current summary, if any.
    fn current_summary(&self) -> Option<MemorySummary>;

    /// Forget the summary.
    fn clear(&self) -> MemoryFuture<'_, ()>;

    /// Replace the summary text, keeping its coverage.
    fn update<'a>(&'a self, text: &'a str) -> MemoryFuture<'a, ()>;
}
