//! Rolling summary collaborator.
//!
//! Keeps the last `window` turns verbatim and folds everything older into a
//! role-prefixed transcript summary bounded to `max_chars`. No model call is
//! involved; hosts that want model-written summaries implement
//! [`MemoryCollaborator`] themselves.

use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;
use tracing::{debug, warn};

use crate::chat::message::{Message, Role};
use crate::chat::storage::Storage;
use crate::config::SummaryConfig;
use crate::memory::MemoryResult;
use crate::memory::collaborator::{
    ContextTurn, CoverageMark, MemoryCollaborator, MemoryFuture, MemorySummary,
};

/// Heading of the summary turn placed at the top of the context window.
const SUMMARY_HEADING: &str = "Summary of the earlier conversation:";

/// Default collaborator: deterministic rolling transcript summary.
pub struct RollingSummaryMemory {
    config: SummaryConfig,
    summary: RwLock<Option<MemorySummary>>,
    storage: Option<Arc<dyn Storage>>,
}

impl RollingSummaryMemory {
    /// Create a collaborator that keeps its summary in memory only.
    #[must_use]
    pub fn new(config: SummaryConfig) -> Self {
        Self {
            config,
            summary: RwLock::new(None),
            storage: None,
        }
    }

    /// Create a collaborator that persists its summary, restoring any stored one.
    pub async fn with_storage(config: SummaryConfig, storage: Arc<dyn Storage>) -> Self {
        let restored = match storage.get(&config.storage_key).await {
            Ok(Some(raw)) => serde_json::from_str::<MemorySummary>(&raw)
                .map_err(|err| warn!("discarding unreadable summary: {err}"))
                .ok(),
            Ok(None) => None,
            Err(err) => {
                warn!("failed to read summary: {err}");
                None
            }
        };

        Self {
            config,
            summary: RwLock::new(restored),
            storage: Some(storage),
        }
    }

    /// Number of leading entries of `log` already folded into the summary.
    fn covered(&self, log: &[Message]) -> usize {
        self.read()
            .as_ref()
            .map_or(0, |summary| covered_in(summary, log))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Option<MemorySummary>> {
        self.summary.read().unwrap_or_else(PoisonError::into_inner)
    }

    async fn replace(&self, next: Option<MemorySummary>) {
        {
            let mut guard = self.summary.write().unwrap_or_else(PoisonError::into_inner);
            guard.clone_from(&next);
        }
        self.persist(next.as_ref()).await;
    }

    async fn persist(&self, summary: Option<&MemorySummary>) {
        let Some(storage) = &self.storage else {
            return;
        };
        let key = self.config.storage_key.as_str();
        let result = match summary {
            Some(summary) => match serde_json::to_string(summary) {
                Ok(raw) => storage.set(key, &raw).await,
                Err(err) => {
                    warn!("failed to serialize summary: {err}");
                    return;
                }
            },
            None => storage.remove(key).await,
        };
        if let Err(err) = result {
            warn!("failed to persist summary: {err}");
        }
    }
}

impl MemoryCollaborator for RollingSummaryMemory {
    fn should_summarize(&self, log: &[Message]) -> bool {
        let covered = self.covered(log);
        log.len() - covered >= self.config.window + self.config.interval_turns
    }

    fn summarize<'a>(&'a self, log: &'a [Message]) -> MemoryFuture<'a, MemoryResult<()>> {
        Box::pin(async move {
            let fold_end = log.len().saturating_sub(self.config.window);
            let covered = self.covered(log).min(fold_end);
            if covered == fold_end {
                return Ok(());
            }

            let previous = self.read().as_ref().map(|summary| summary.text.clone());
            let addition = simple_summary(&log[covered..fold_end]);
            let combined = match previous {
                Some(text) if !text.is_empty() => format!("{text}{addition}"),
                _ => addition.trim_start().to_string(),
            };
            let text = keep_last_chars(&combined, self.config.max_chars);

            debug!(
                "folded turns {covered}..{fold_end} into summary ({} chars)",
                text.chars().count()
            );

            self.replace(Some(MemorySummary {
                text,
                covered_count: fold_end,
                last_updated: Utc::now(),
                covered_through: Some(CoverageMark::from(&log[fold_end - 1])),
            }))
            .await;
            Ok(())
        })
    }

    fn build_context(&self, log: &[Message]) -> Vec<ContextTurn> {
        let start = log.len().saturating_sub(self.config.window);
        let mut context = Vec::with_capacity(log.len() - start + 1);

        if let Some(summary) = self.read().as_ref() {
            if !summary.text.is_empty() {
                context.push(ContextTurn::system(format!(
                    "{SUMMARY_HEADING}\n{}",
                    summary.text
                )));
            }
        }

        context.extend(log[start..].iter().map(ContextTurn::from));
        context
    }

    fn current_summary(&self) -> Option<MemorySummary> {
        self.read().clone()
    }

    fn clear(&self) -> MemoryFuture<'_, ()> {
        Box::pin(self.replace(None))
    }

    fn update<'a>(&'a self, text: &'a str) -> MemoryFuture<'a, ()> {
        Box::pin(async move {
            let (covered_count, covered_through) = self
                .read()
                .as_ref()
                .map_or((0, None), |summary| (summary.covered_count, summary.covered_through));
            self.replace(Some(MemorySummary {
                text: keep_last_chars(text, self.config.max_chars),
                covered_count,
                last_updated: Utc::now(),
                covered_through,
            }))
            .await;
        })
    }
}

/// Leading entries of `log` folded into `summary`.
///
/// Follows the last folded message rather than a raw index, so deleting
/// older turns never marks unfolded ones as covered. When that message is
/// gone too, every entry not newer than it counts as covered.
fn covered_in(summary: &MemorySummary, log: &[Message]) -> usize {
    let Some(mark) = summary.covered_through else {
        return summary.covered_count.min(log.len());
    };
    log.iter()
        .position(|message| message.id == mark.id)
        .map_or_else(
            || {
                log.iter()
                    .take_while(|message| message.timestamp <= mark.timestamp)
                    .count()
            },
            |index| index + 1,
        )
}

/// Role-prefixed concatenation of turns.
fn simple_summary(messages: &[Message]) -> String {
    let mut summary = String::new();

    for message in messages {
        let prefix = match message.role {
            Role::User => "\nUser: ",
            Role::Assistant => "\nAssistant: ",
        };
        summary.push_str(prefix);
        summary.push_str(&message.content);
    }

    summary
}

/// Keep the trailing `max_chars` characters.
fn keep_last_chars(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        text.to_string()
    } else {
        text.chars().skip(count - max_chars).collect()
    }
}
