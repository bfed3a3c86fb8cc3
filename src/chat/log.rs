//! Ordered, mutable conversation log with single-slot undo.
//!
//! The log is owned by one host and mutated only through the methods below.
//! After every mutation the most recent `max_persisted` messages are written
//! to the injected [`Storage`]; storage failures are logged and never block
//! the in-memory sequence.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::chat::message::{Message, MessageId, Role};
use crate::chat::storage::Storage;
use crate::config::LogConfig;

/// Pre-destructive snapshot kept for undo.
#[derive(Clone, Debug)]
struct UndoSnapshot {
    messages: Vec<Message>,
    expires_at: Instant,
}

/// The conversation log.
pub struct MessageLog {
    messages: Vec<Message>,
    undo: Option<UndoSnapshot>,
    storage: Arc<dyn Storage>,
    config: LogConfig,
}

impl MessageLog {
    /// Create an empty log without reading storage.
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>, config: LogConfig) -> Self {
        Self {
            messages: Vec::new(),
            undo: None,
            storage,
            config,
        }
    }

    /// Rebuild the log from storage.
    ///
    /// Entries that fail to parse are dropped; an unreadable or corrupt entry
    /// yields an empty log.
    pub async fn load(storage: Arc<dyn Storage>, config: LogConfig) -> Self {
        let mut log = Self::new(storage, config);

        let raw = match log.storage.get(&log.config.storage_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return log,
            Err(err) => {
                warn!("failed to read persisted messages: {err}");
                return log;
            }
        };

        let entries: Vec<serde_json::Value> = match serde_json::from_str(&raw) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("persisted messages are not a JSON array: {err}");
                return log;
            }
        };

        let total = entries.len();
        log.messages = entries
            .into_iter()
            .filter_map(|entry| serde_json::from_value::<Message>(entry).ok())
            .collect();

        if log.messages.len() < total {
            warn!(
                "discarded {} unreadable persisted messages",
                total - log.messages.len()
            );
        }
        debug!("loaded {} messages", log.messages.len());

        log
    }

    /// Messages in insertion order.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Find a message by id.
    #[must_use]
    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|message| message.id == id)
    }

    /// Append a fully built message.
    pub async fn push(&mut self, message: Message) -> MessageId {
        let id = message.id;
        self.messages.push(message);
        self.persist().await;
        id
    }

    /// Append a new turn with a fresh id and timestamp.
    pub async fn append(
        &mut self,
        role: Role,
        content: impl Into<String>,
        image_url: Option<String>,
    ) -> MessageId {
        let mut message = Message::new(role, content);
        message.image_url = image_url;
        self.push(message).await
    }

    /// Append streamed text to an existing message in place.
    pub async fn append_content(&mut self, id: MessageId, delta: &str) -> bool {
        let Some(message) = self.find_mut(id) else {
            return false;
        };
        message.content.push_str(delta);
        self.persist().await;
        true
    }

    /// Replace the content of a message; no-op if absent.
    pub async fn edit(&mut self, id: MessageId, content: impl Into<String>) -> bool {
        let Some(message) = self.find_mut(id) else {
            return false;
        };
        message.content = content.into();
        self.persist().await;
        true
    }

    /// Remove every message whose id is in `ids`.
    ///
    /// The pre-delete sequence becomes the undo snapshot only when at least
    /// one message matched. Returns the number of removed messages.
    pub async fn delete(&mut self, ids: &[MessageId]) -> usize {
        let matched = self
            .messages
            .iter()
            .filter(|message| ids.contains(&message.id))
            .count();
        if matched == 0 {
            return 0;
        }

        self.snapshot();
        self.messages.retain(|message| !ids.contains(&message.id));
        self.persist().await;
        matched
    }

    /// Empty the log and its persisted entry; always snapshots for undo.
    pub async fn clear(&mut self) {
        self.snapshot();
        self.messages.clear();
        if let Err(err) = self.storage.remove(&self.config.storage_key).await {
            warn!("failed to clear persisted messages: {err}");
        }
    }

    /// Restore the undo snapshot if present and not expired.
    pub async fn undo(&mut self) -> bool {
        let Some(snapshot) = self.undo.take() else {
            return false;
        };
        if Instant::now() >= snapshot.expires_at {
            debug!("undo snapshot expired");
            return false;
        }

        self.messages = snapshot.messages;
        self.persist().await;
        true
    }

    /// Whether an unexpired undo snapshot is held.
    #[must_use]
    pub fn can_undo(&self) -> bool {
        self.undo
            .as_ref()
            .is_some_and(|snapshot| Instant::now() < snapshot.expires_at)
    }

    /// Flip the star on one message and return the new value.
    pub async fn toggle_star(&mut self, id: MessageId) -> Option<bool> {
        let message = self.find_mut(id)?;
        message.starred = !message.starred;
        let starred = message.starred;
        self.persist().await;
        Some(starred)
    }

    fn find_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|message| message.id == id)
    }

    fn snapshot(&mut self) {
        self.undo = Some(UndoSnapshot {
            messages: self.messages.clone(),
            expires_at: Instant::now() + Duration::from_secs(self.config.undo_window_secs),
        });
    }

    async fn persist(&self) {
        let start = self.messages.len().saturating_sub(self.config.max_persisted);
        let serialized = match serde_json::to_string(&self.messages[start..]) {
            Ok(serialized) => serialized,
            Err(err) => {
                warn!("failed to serialize messages: {err}");
                return;
            }
        };

        if let Err(err) = self.storage.set(&self.config.storage_key, &serialized).await {
            warn!("failed to persist messages: {err}");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::chat::storage::MemoryStorage;

    fn config() -> LogConfig {
        LogConfig {
            storage_key: "test.messages".to_string(),
            max_persisted: 3,
            undo_window_secs: 5,
        }
    }

    async fn log_with(
        storage: Arc<MemoryStorage>,
        contents: &[&str],
    ) -> (MessageLog, Vec<MessageId>) {
        let mut log = MessageLog::new(storage, config());
        let mut ids = Vec::with_capacity(contents.len());
        for content in contents {
            ids.push(log.append(Role::User, *content, None).await);
        }
        (log, ids)
    }

    fn contents(log: &MessageLog) -> Vec<&str> {
        log.messages().iter().map(|m| m.content.as_str()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_then_undo_restores_sequence() {
        let (mut log, ids) = log_with(Arc::new(MemoryStorage::new()), &["a", "b", "c"]).await;
        let before = log.messages().to_vec();

        assert_eq!(log.delete(&[ids[1]]).await, 1);
        assert_eq!(contents(&log), vec!["a", "c"]);

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(log.undo().await);
        assert_eq!(log.messages(), before.as_slice());
        assert!(!log.undo().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_undo_after_expiry_is_noop() {
        let (mut log, ids) = log_with(Arc::new(MemoryStorage::new()), &["a", "b"]).await;
        log.delete(&[ids[0]]).await;
        assert!(log.can_undo());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!log.can_undo());
        assert!(!log.undo().await);
        assert_eq!(contents(&log), vec!["b"]);
    }

    #[tokio::test]
    async fn test_delete_without_match_keeps_previous_snapshot() {
        let (mut log, ids) = log_with(Arc::new(MemoryStorage::new()), &["a", "b"]).await;
        log.delete(&[ids[0]]).await;
        assert_eq!(log.delete(&[MessageId::new()]).await, 0);

        assert!(log.undo().await);
        assert_eq!(contents(&log), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_second_clear_overwrites_snapshot() {
        let (mut log, _) = log_with(Arc::new(MemoryStorage::new()), &["a", "b"]).await;
        log.clear().await;
        log.append(Role::User, "c", None).await;
        log.clear().await;

        assert!(log.undo().await);
        assert_eq!(contents(&log), vec!["c"]);
    }

    #[tokio::test]
    async fn test_clear_twice_leaves_empty_snapshot() {
        let (mut log, _) = log_with(Arc::new(MemoryStorage::new()), &["a"]).await;
        log.clear().await;
        log.clear().await;

        assert!(log.undo().await);
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn test_star_toggle_is_reversible_and_not_undoable() {
        let (mut log, ids) = log_with(Arc::new(MemoryStorage::new()), &["a"]).await;
        let original = log.get(ids[0]).cloned().unwrap();

        assert_eq!(log.toggle_star(ids[0]).await, Some(true));
        assert_eq!(log.toggle_star(ids[0]).await, Some(false));
        assert_eq!(log.get(ids[0]), Some(&original));
        assert!(!log.can_undo());
        assert_eq!(log.toggle_star(MessageId::new()).await, None);
    }

    #[tokio::test]
    async fn test_edit_and_append_content() {
        let (mut log, ids) = log_with(Arc::new(MemoryStorage::new()), &["a"]).await;
        assert!(log.edit(ids[0], "edited").await);
        assert!(log.append_content(ids[0], "!").await);
        assert!(!log.edit(MessageId::new(), "nothing").await);
        assert_eq!(contents(&log), vec!["edited!"]);
    }

    #[tokio::test]
    async fn test_persists_bounded_suffix() {
        let storage = Arc::new(MemoryStorage::new());
        let (log, _) = log_with(Arc::clone(&storage), &["a", "b", "c", "d", "e"]).await;
        assert_eq!(log.len(), 5);

        let reloaded = MessageLog::load(storage, config()).await;
        assert_eq!(contents(&reloaded), vec!["c", "d", "e"]);
    }

    #[tokio::test]
    async fn test_clear_removes_persisted_entry() {
        let storage = Arc::new(MemoryStorage::new());
        let (mut log, _) = log_with(Arc::clone(&storage), &["a"]).await;
        log.clear().await;
        assert_eq!(storage.get("test.messages").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_load_discards_unparseable_entries() {
        let storage = Arc::new(MemoryStorage::new());
        let good = serde_json::to_value(Message::user("kept")).unwrap();
        let raw = serde_json::json!([
            good,
            {"id": "not-a-uuid", "role": "user", "content": "x", "timestamp": "2024-01-01T00:00:00Z"},
            {"id": "7f1d2c7e-2a53-4f55-9b0e-1f0d5f7c3a11", "role": "user", "content": "y", "timestamp": "yesterday"}
        ]);
        storage.set("test.messages", &raw.to_string()).await.unwrap();

        let log = MessageLog::load(storage, config()).await;
        assert_eq!(contents(&log), vec!["kept"]);
    }

    #[tokio::test]
    async fn test_load_tolerates_corrupt_storage() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set("test.messages", "{not json").await.unwrap();
        assert!(MessageLog::load(storage, config()).await.is_empty());
    }

    #[tokio::test]
    async fn test_sqlite_backed_log_reloads() {
        use crate::chat::storage::SqliteStorage;

        let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::open_in_memory().await.unwrap());
        let mut log = MessageLog::new(Arc::clone(&storage), config());
        let id = log.append(Role::Assistant, "", None).await;
        for delta in ["He", "llo"] {
            log.append_content(id, delta).await;
        }

        let reloaded = MessageLog::load(storage, config()).await;
        assert_eq!(contents(&reloaded), vec!["Hello"]);
    }
}
