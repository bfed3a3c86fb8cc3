//! Conversation host: runs one turn end to end against the message log.
//!
//! A turn appends the user message, lets the memory collaborator fold older
//! turns, dispatches the context window and streams the reply into an
//! assistant message in place. The log lock is never held across a network
//! await.

use std::sync::Arc;

use chrono::Local;
use futures::StreamExt;
use tokio::sync::{Mutex, broadcast, watch};
use tracing::{debug, info, warn};

use crate::chat::dispatcher::{ChatDispatcher, DispatchFailure};
use crate::chat::error::ChatResult;
use crate::chat::log::MessageLog;
use crate::chat::message::{Message, MessageId, Role};
use crate::chat::storage::Storage;
use crate::config::{ChatConfig, OverlapPolicy};
use crate::memory::{MemoryCollaborator, RollingSummaryMemory};

const EVENT_CAPACITY: usize = 256;

/// Progress of a turn, broadcast to subscribers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChatEvent {
    /// An empty assistant message was created for a streaming reply.
    AssistantStarted {
        /// Assistant message id.
        id: MessageId,
    },
    /// Text was appended to an assistant message.
    Delta {
        /// Assistant message id.
        id: MessageId,
        /// Appended text.
        text: String,
    },
    /// The reply stream ended.
    Completed {
        /// Assistant message id.
        id: MessageId,
    },
    /// The turn failed; `id` holds the failure text.
    Failed {
        /// Assistant message carrying the failure text.
        id: MessageId,
        /// Failure text.
        text: String,
    },
}

/// How a turn ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnStatus {
    /// The reply streamed to completion.
    Completed,
    /// The request or stream failed; the failure is in the log.
    Failed,
    /// A newer send abandoned this turn.
    Cancelled,
}

/// Result of [`Conversation::send`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TurnOutcome {
    /// The user message of the turn.
    pub user: MessageId,
    /// The assistant message, if one was created.
    pub assistant: Option<MessageId>,
    /// How the turn ended.
    pub status: TurnStatus,
}

/// Host of the message log.
pub struct Conversation {
    log: Mutex<MessageLog>,
    memory: Arc<dyn MemoryCollaborator>,
    dispatcher: ChatDispatcher,
    policy: OverlapPolicy,
    turn_gate: Mutex<()>,
    generation: watch::Sender<u64>,
    events: broadcast::Sender<ChatEvent>,
}

impl Conversation {
    /// Restore the log from `storage` and wire it to `memory`.
    ///
    /// # Errors
    /// Returns an error if the dispatcher cannot be built.
    pub async fn new(
        config: &ChatConfig,
        storage: Arc<dyn Storage>,
        memory: Arc<dyn MemoryCollaborator>,
    ) -> ChatResult<Self> {
        let dispatcher = ChatDispatcher::new(config)?;
        let log = MessageLog::load(storage, config.log.clone()).await;
        let (generation, _) = watch::channel(0);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        info!(
            "conversation ready: {} messages, overlap {:?}",
            log.len(),
            config.overlap
        );

        Ok(Self {
            log: Mutex::new(log),
            memory,
            dispatcher,
            policy: config.overlap,
            turn_gate: Mutex::new(()),
            generation,
            events,
        })
    }

    /// Like [`Conversation::new`] with the rolling summary persisted in `storage`.
    ///
    /// # Errors
    /// Returns an error if the dispatcher cannot be built.
    pub async fn with_rolling_memory(
        config: &ChatConfig,
        storage: Arc<dyn Storage>,
    ) -> ChatResult<Self> {
        let memory = Arc::new(
            RollingSummaryMemory::with_storage(config.summary.clone(), Arc::clone(&storage)).await,
        );
        Self::new(config, storage, memory).await
    }

    /// Subscribe to turn progress.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    /// The memory collaborator.
    #[must_use]
    pub const fn memory(&self) -> &Arc<dyn MemoryCollaborator> {
        &self.memory
    }

    /// Send a user turn and stream the reply into the log.
    ///
    /// Request failures never surface as errors: they become an assistant
    /// message holding the classified failure text.
    pub async fn send(&self, text: impl Into<String>, image_url: Option<String>) -> TurnOutcome {
        let _turn = match self.policy {
            OverlapPolicy::Queue => Some(self.turn_gate.lock().await),
            OverlapPolicy::CancelPrevious | OverlapPolicy::Concurrent => None,
        };
        let mut cancelled = self.begin_turn();

        let (user, messages) = {
            let mut log = self.log.lock().await;
            let user = log.append(Role::User, text, image_url).await;
            (user, log.messages().to_vec())
        };

        if self.memory.should_summarize(&messages) {
            if let Err(err) = self.memory.summarize(&messages).await {
                warn!("memory summarization failed: {err}");
            }
        }
        let context = self.memory.build_context(&messages);

        let request = match self.dispatcher.build_request(&context, &Local::now()) {
            Ok(request) => request,
            Err(err) => {
                let text = self
                    .dispatcher
                    .error_texts()
                    .generic
                    .replace("{detail}", &err.to_string());
                return self.fail_turn(user, None, text).await;
            }
        };

        let opened = tokio::select! {
            biased;
            Ok(()) = cancelled.changed() => {
                debug!("turn abandoned before the reply started");
                return TurnOutcome { user, assistant: None, status: TurnStatus::Cancelled };
            }
            opened = self.dispatcher.open_stream(request) => opened,
        };

        let mut stream = match opened {
            Ok(stream) => stream,
            Err(failure) => {
                warn!("chat request failed: {failure}");
                let text = failure.user_text(self.dispatcher.error_texts());
                return self.fail_turn(user, None, text).await;
            }
        };

        let assistant = self.log.lock().await.append(Role::Assistant, "", None).await;
        self.emit(ChatEvent::AssistantStarted { id: assistant });

        loop {
            // Cancellation wins over a delta that is ready at the same time.
            let next = tokio::select! {
                biased;
                Ok(()) = cancelled.changed() => {
                    debug!("turn abandoned after {} chars", stream.content().len());
                    self.emit(ChatEvent::Completed { id: assistant });
                    return TurnOutcome {
                        user,
                        assistant: Some(assistant),
                        status: TurnStatus::Cancelled,
                    };
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(delta)) => {
                    self.log.lock().await.append_content(assistant, &delta).await;
                    self.emit(ChatEvent::Delta {
                        id: assistant,
                        text: delta,
                    });
                }
                Some(Err(err)) => {
                    warn!("reply stream interrupted: {err}");
                    let text = DispatchFailure::from(err).user_text(self.dispatcher.error_texts());
                    return self.fail_turn(user, Some(assistant), text).await;
                }
                None => break,
            }
        }

        debug!("reply complete: {} chars", stream.content().len());
        self.emit(ChatEvent::Completed { id: assistant });
        TurnOutcome {
            user,
            assistant: Some(assistant),
            status: TurnStatus::Completed,
        }
    }

    /// Snapshot of the log.
    pub async fn messages(&self) -> Vec<Message> {
        self.log.lock().await.messages().to_vec()
    }

    /// Replace a message's content.
    pub async fn edit(&self, id: MessageId, content: impl Into<String>) -> bool {
        self.log.lock().await.edit(id, content).await
    }

    /// Delete messages by id; returns how many were removed.
    pub async fn delete(&self, ids: &[MessageId]) -> usize {
        self.log.lock().await.delete(ids).await
    }

    /// Empty the log and forget the memory summary.
    pub async fn clear(&self) {
        self.log.lock().await.clear().await;
        self.memory.clear().await;
    }

    /// Restore the last deleted or cleared messages if still allowed.
    pub async fn undo(&self) -> bool {
        self.log.lock().await.undo().await
    }

    /// Whether an undo is currently available.
    pub async fn can_undo(&self) -> bool {
        self.log.lock().await.can_undo()
    }

    /// Flip the star on a message.
    pub async fn toggle_star(&self, id: MessageId) -> Option<bool> {
        self.log.lock().await.toggle_star(id).await
    }

    fn begin_turn(&self) -> watch::Receiver<u64> {
        if self.policy == OverlapPolicy::CancelPrevious {
            self.generation.send_modify(|generation| *generation = generation.wrapping_add(1));
        }
        self.generation.subscribe()
    }

    /// Record `text` as the turn's failure.
    ///
    /// An in-progress assistant message that is still empty takes the text;
    /// otherwise a new assistant message is appended.
    async fn fail_turn(
        &self,
        user: MessageId,
        in_progress: Option<MessageId>,
        text: String,
    ) -> TurnOutcome {
        let assistant = {
            let mut log = self.log.lock().await;
            match in_progress {
                Some(id) if log.get(id).is_some_and(|message| message.content.is_empty()) => {
                    log.edit(id, text.clone()).await;
                    id
                }
                _ => log.append(Role::Assistant, text.clone(), None).await,
            }
        };

        self.emit(ChatEvent::Failed {
            id: assistant,
            text,
        });
        TurnOutcome {
            user,
            assistant: Some(assistant),
            status: TurnStatus::Failed,
        }
    }

    fn emit(&self, event: ChatEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::time::Duration;

    use axum::Router;
    use axum::body::{Body, Bytes};
    use axum::routing::post;
    use futures::stream;

    use super::*;
    use crate::chat::storage::MemoryStorage;
    use crate::config::TransportConfig;

    fn config_for(endpoint: String, overlap: OverlapPolicy) -> ChatConfig {
        ChatConfig {
            transport: TransportConfig::Custom {
                endpoint,
                api_key: String::new(),
                model: "m".to_string(),
                system_prompt: String::new(),
            },
            overlap,
            ..ChatConfig::default()
        }
    }

    fn unreachable_config() -> ChatConfig {
        config_for("http://127.0.0.1:1/v1".to_string(), OverlapPolicy::Queue)
    }

    /// Provider sending `one`, `two`, `three` 100ms apart, then stalling.
    async fn spawn_trickle_provider() -> SocketAddr {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                let body = stream::iter(["one", "two", "three"])
                    .then(|text| async move {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        let record = serde_json::json!({"choices": [{"delta": {"content": text}}]});
                        Ok::<_, Infallible>(Bytes::from(format!("data: {record}\n\n")))
                    })
                    .chain(stream::pending());
                Body::from_stream(body)
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_transport_failure_becomes_assistant_turn() {
        let conversation =
            Conversation::with_rolling_memory(&unreachable_config(), Arc::new(MemoryStorage::new()))
                .await
                .unwrap();
        let mut events = conversation.subscribe();

        let outcome = conversation.send("hi", None).await;
        assert_eq!(outcome.status, TurnStatus::Failed);

        let messages = conversation.messages().await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "hi");
        assert_eq!(messages[1].role, Role::Assistant);
        assert!(messages[1].content.starts_with("Sorry, something went wrong"));

        match events.recv().await.unwrap() {
            ChatEvent::Failed { id, .. } => assert_eq!(Some(id), outcome.assistant),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_clear_then_undo_through_host() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let conversation = Conversation::with_rolling_memory(&unreachable_config(), storage)
            .await
            .unwrap();
        conversation.send("hi", None).await;

        conversation.clear().await;
        assert!(conversation.messages().await.is_empty());
        assert!(conversation.can_undo().await);
        assert!(conversation.undo().await);
        assert_eq!(conversation.messages().await.len(), 2);
    }

    #[tokio::test]
    async fn test_log_is_restored_from_storage() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let first = Conversation::with_rolling_memory(&unreachable_config(), Arc::clone(&storage))
            .await
            .unwrap();
        let outcome = first.send("remember me", None).await;
        assert_eq!(first.toggle_star(outcome.user).await, Some(true));

        let second = Conversation::with_rolling_memory(&unreachable_config(), storage)
            .await
            .unwrap();
        let messages = second.messages().await;
        assert_eq!(messages[0].content, "remember me");
        assert!(messages[0].starred);
    }

    #[tokio::test]
    async fn test_cancellation_wins_over_a_ready_delta() {
        let addr = spawn_trickle_provider().await;
        let config = config_for(format!("http://{addr}/v1"), OverlapPolicy::CancelPrevious);
        let conversation = Arc::new(
            Conversation::with_rolling_memory(&config, Arc::new(MemoryStorage::new()))
                .await
                .unwrap(),
        );
        let mut events = conversation.subscribe();

        let turn = {
            let conversation = Arc::clone(&conversation);
            tokio::spawn(async move { conversation.send("go", None).await })
        };
        loop {
            if let ChatEvent::Delta { .. } = events.recv().await.unwrap() {
                break;
            }
        }

        // Holding the log parks the turn on `two` while `three` arrives.
        let log = conversation.log.lock().await;
        tokio::time::sleep(Duration::from_millis(350)).await;
        conversation
            .generation
            .send_modify(|generation| *generation = generation.wrapping_add(1));
        drop(log);

        assert_eq!(turn.await.unwrap().status, TurnStatus::Cancelled);
        assert_eq!(conversation.messages().await[1].content, "onetwo");
    }
}
