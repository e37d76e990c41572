//! Chat orchestration: resolve the chat, store the user turn, produce the reply.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parley_config::ChatConfig;
use parley_core::{truncate_title, Chat, ChatId, PromptMessage, StoredMessage, NEW_CHAT};
use parley_gateway::{ChatFrame, ChatHandler, ChatMessage, Connection, ErrorPayload, ServerEnvelope};
use parley_store::{ChatStore, NewChat, NewMessage};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, instrument, warn};

use crate::bridge::{Deadline, StreamFailure, StreamingBridge};
use crate::error::RelayError;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Budget for the whole request
    pub request_timeout: Duration,
    /// Prior turns sent upstream
    pub history_window: usize,
    pub title_max_chars: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&ChatConfig::default())
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &ChatConfig) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            history_window: config.history_window,
            title_max_chars: config.title_max_chars,
        }
    }
}

/// Result of one orchestrated request
#[derive(Debug)]
pub struct ChatOutcome {
    /// The chat the turns were written to
    pub chat_id: ChatId,
    /// The stored assistant turn, if one was written
    pub reply: Option<StoredMessage>,
}

pub struct ChatOrchestrator {
    store: Arc<dyn ChatStore>,
    bridge: Arc<StreamingBridge>,
    settings: OrchestratorSettings,
}

impl ChatOrchestrator {
    pub fn new(
        store: Arc<dyn ChatStore>,
        bridge: Arc<StreamingBridge>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            bridge,
            settings,
        }
    }

    /// Handle one user message.
    ///
    /// With a connection the reply is streamed to it; without one it is
    /// generated in full, stored and returned.
    #[instrument(skip(self, connection, content), fields(chars = content.len()))]
    pub async fn handle_message(
        &self,
        connection: Option<Arc<Connection>>,
        chat_id: ChatId,
        content: &str,
        user_id: &str,
    ) -> Result<ChatOutcome, RelayError> {
        let deadline = Deadline::after(self.settings.request_timeout);

        let (chat, history) = timeout_at(deadline.at(), self.prepare(chat_id, content, user_id))
            .await
            .map_err(|_| deadline.error())??;

        match connection {
            Some(connection) => {
                self.stream_reply(&connection, chat.id, content, &history, &deadline)
                    .await
            }
            None => self.generate_reply(chat.id, content, &history, &deadline).await,
        }
    }

    /// Resolve the chat, snapshot its history and store the user turn.
    async fn prepare(
        &self,
        chat_id: ChatId,
        content: &str,
        user_id: &str,
    ) -> Result<(Chat, Vec<PromptMessage>), RelayError> {
        let chat = self.resolve_chat(chat_id, content, user_id).await?;
        let history: Vec<PromptMessage> = chat
            .recent_messages(self.settings.history_window)
            .iter()
            .map(PromptMessage::from)
            .collect();

        let turn = self
            .store
            .create_message(NewMessage::user(chat.id, content))
            .await?;
        debug!(chat_id = chat.id, message_id = turn.id, "stored user turn");

        Ok((chat, history))
    }

    async fn resolve_chat(&self, chat_id: ChatId, content: &str, user_id: &str) -> Result<Chat, RelayError> {
        if chat_id != NEW_CHAT {
            match self.store.get_chat(chat_id).await {
                Ok(chat) => return Ok(chat),
                Err(e) if e.is_not_found() => {
                    debug!(chat_id, "chat not found, starting a new one");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let chat = self
            .store
            .create_chat(NewChat {
                title: truncate_title(content, self.settings.title_max_chars),
                user_id: user_id.to_string(),
            })
            .await?;
        info!(chat_id = chat.id, user_id, title = %chat.title, "created chat");
        Ok(chat)
    }

    async fn stream_reply(
        &self,
        connection: &Connection,
        chat_id: ChatId,
        content: &str,
        history: &[PromptMessage],
        deadline: &Deadline,
    ) -> Result<ChatOutcome, RelayError> {
        match self
            .bridge
            .stream_response(connection, chat_id, content, history, deadline)
            .await
        {
            Ok(outcome) => Ok(ChatOutcome {
                chat_id,
                reply: outcome.persisted,
            }),
            Err(failure) => {
                self.fall_back(connection, chat_id, content, history, deadline, failure)
                    .await
            }
        }
    }

    /// Replace a failed stream with one complete reply
    async fn fall_back(
        &self,
        connection: &Connection,
        chat_id: ChatId,
        content: &str,
        history: &[PromptMessage],
        deadline: &Deadline,
        failure: StreamFailure,
    ) -> Result<ChatOutcome, RelayError> {
        if matches!(
            failure.error,
            RelayError::ClientDisconnected | RelayError::Timeout(_)
        ) {
            return Err(failure.error);
        }
        if !connection.is_connected() {
            return Err(RelayError::ClientDisconnected);
        }
        if deadline.expired() {
            return Err(deadline.error());
        }

        warn!(chat_id, "streaming failed, falling back to a complete reply: {}", failure.error);
        let started = Instant::now();
        let text = timeout_at(deadline.at(), self.bridge.generate_response(content, history))
            .await
            .map_err(|_| deadline.error())??;
        let processing_time_ms = started.elapsed().as_millis() as u64;

        // a stored prefix already stands for this reply
        let reply = if failure.persisted || text.is_empty() {
            None
        } else {
            match self
                .bridge
                .persist_assistant_turn(chat_id, &text, processing_time_ms, false)
                .await
            {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(chat_id, "failed to store fallback reply: {}", e);
                    None
                }
            }
        };

        let frame = ChatFrame::full(text, processing_time_ms, Some(chat_id));
        connection.send_envelope(&ServerEnvelope::chat(frame)).await?;
        Ok(ChatOutcome { chat_id, reply })
    }

    async fn generate_reply(
        &self,
        chat_id: ChatId,
        content: &str,
        history: &[PromptMessage],
        deadline: &Deadline,
    ) -> Result<ChatOutcome, RelayError> {
        let started = Instant::now();
        let text = timeout_at(deadline.at(), self.bridge.generate_response(content, history))
            .await
            .map_err(|_| deadline.error())??;
        let processing_time_ms = started.elapsed().as_millis() as u64;

        let message = self
            .bridge
            .persist_assistant_turn(chat_id, &text, processing_time_ms, false)
            .await?;
        Ok(ChatOutcome {
            chat_id,
            reply: Some(message),
        })
    }
}

#[async_trait]
impl ChatHandler for ChatOrchestrator {
    async fn handle_chat(
        &self,
        connection: Arc<Connection>,
        message: ChatMessage,
    ) -> Result<(), ErrorPayload> {
        let user_id = connection.user_id().to_string();
        match self
            .handle_message(Some(connection), message.chat_id, &message.content, &user_id)
            .await
        {
            Ok(outcome) => {
                debug!(chat_id = outcome.chat_id, "chat request finished");
                Ok(())
            }
            Err(e) => {
                warn!(user_id = %user_id, "chat request failed: {}", e);
                Err(e.into())
            }
        }
    }
}
