//! Streaming bridge between a client connection and the completion provider

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parley_config::LlmConfig;
use parley_core::{
    ChatId, CompletionRequest, MessageMetadata, PromptMessage, StoredMessage, NEW_CHAT,
};
use parley_gateway::{ChatFrame, Connection, ServerEnvelope};
use parley_llm::CompletionProvider;
use parley_store::{ChatStore, NewMessage, StorageResult};
use tokio::time::{sleep, sleep_until, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::error::RelayError;

/// Upstream request settings
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Total attempts for a non-streaming request
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self::from_config(&LlmConfig::default())
    }
}

impl BridgeSettings {
    pub fn from_config(config: &LlmConfig) -> Self {
        Self {
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
        }
    }
}

/// Point in time by which a request must finish
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    pub fn at(&self) -> Instant {
        self.at
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    pub fn error(&self) -> RelayError {
        RelayError::Timeout(self.budget)
    }
}

/// A stream that ran to completion
#[derive(Debug)]
pub struct StreamOutcome {
    pub text: String,
    pub processing_time_ms: u64,
    /// The stored assistant turn, when one was written
    pub persisted: Option<StoredMessage>,
}

/// A stream that was interrupted
#[derive(Debug)]
pub struct StreamFailure {
    pub error: RelayError,
    /// Whether an assistant turn was already stored for this request
    pub persisted: bool,
}

impl StreamFailure {
    fn new(error: impl Into<RelayError>, persisted: bool) -> Self {
        Self {
            error: error.into(),
            persisted,
        }
    }
}

pub struct StreamingBridge {
    provider: Arc<dyn CompletionProvider>,
    store: Arc<dyn ChatStore>,
    settings: BridgeSettings,
}

impl StreamingBridge {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        store: Arc<dyn ChatStore>,
        settings: BridgeSettings,
    ) -> Self {
        Self {
            provider,
            store,
            settings,
        }
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    fn build_request(&self, prompt: &str, history: &[PromptMessage]) -> CompletionRequest {
        CompletionRequest::new(&self.settings.model)
            .with_history(history.iter().cloned())
            .with_message(PromptMessage::user(prompt))
            .temperature(self.settings.temperature)
            .max_tokens(self.settings.max_tokens)
    }

    /// Fetch a complete reply, retrying transport failures with a fixed delay.
    pub async fn generate_response(
        &self,
        prompt: &str,
        history: &[PromptMessage],
    ) -> Result<String, RelayError> {
        let request = self.build_request(prompt, history);
        let attempts = self.settings.max_retries.max(1);

        let mut attempt = 1;
        loop {
            match self.provider.complete(request.clone()).await {
                Ok(text) => {
                    debug!(attempt, chars = text.len(), "completion received");
                    return Ok(text);
                }
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(
                        attempt,
                        attempts,
                        provider = self.provider.provider_id(),
                        "completion failed, retrying in {:?}: {}",
                        self.settings.retry_delay,
                        e
                    );
                    sleep(self.settings.retry_delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(attempt, "completion failed: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    /// Stream a reply to `connection` fragment by fragment.
    ///
    /// With a real chat id the finished reply is stored. An interrupted stream
    /// stores its non-empty prefix as a partial turn.
    pub async fn stream_response(
        &self,
        connection: &Connection,
        chat_id: ChatId,
        prompt: &str,
        history: &[PromptMessage],
        deadline: &Deadline,
    ) -> Result<StreamOutcome, StreamFailure> {
        let started = Instant::now();
        connection
            .send_envelope(&ServerEnvelope::typing())
            .await
            .map_err(|e| StreamFailure::new(e, false))?;

        let request = self.build_request(prompt, history).stream();
        let mut deltas = match timeout_at(deadline.at(), self.provider.stream(request)).await {
            Ok(Ok(deltas)) => deltas,
            Ok(Err(e)) => return Err(StreamFailure::new(e, false)),
            Err(_) => return Err(StreamFailure::new(deadline.error(), false)),
        };

        let mut text = String::new();
        let interruption = loop {
            tokio::select! {
                _ = sleep_until(deadline.at()) => break Some(deadline.error()),
                next = deltas.next() => match next {
                    None => break None,
                    Some(Ok(delta)) => {
                        if delta.is_empty() {
                            continue;
                        }
                        text.push_str(&delta);
                        let frame = ServerEnvelope::chat(ChatFrame::fragment(delta));
                        if let Err(e) = connection.send_envelope(&frame).await {
                            break Some(e.into());
                        }
                    }
                    Some(Err(e)) => break Some(e.into()),
                },
            }
        };
        // dropping the stream cancels the upstream request
        drop(deltas);
        let processing_time_ms = started.elapsed().as_millis() as u64;

        if let Some(error) = interruption {
            warn!(chat_id, chars = text.len(), "stream interrupted: {}", error);
            let persisted = self
                .persist_partial(chat_id, &text, processing_time_ms)
                .await;
            return Err(StreamFailure::new(error, persisted));
        }

        let persisted = if chat_id != NEW_CHAT && !text.is_empty() {
            match self
                .persist_assistant_turn(chat_id, &text, processing_time_ms, false)
                .await
            {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(chat_id, "failed to store assistant turn: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let terminal = ServerEnvelope::chat(ChatFrame::complete(processing_time_ms, Some(chat_id)));
        if let Err(e) = connection.send_envelope(&terminal).await {
            return Err(StreamFailure::new(e, persisted.is_some()));
        }

        info!(chat_id, chars = text.len(), processing_time_ms, "stream complete");
        Ok(StreamOutcome {
            text,
            processing_time_ms,
            persisted,
        })
    }

    async fn persist_partial(&self, chat_id: ChatId, text: &str, processing_time_ms: u64) -> bool {
        if chat_id == NEW_CHAT || text.is_empty() {
            return false;
        }
        match self
            .persist_assistant_turn(chat_id, text, processing_time_ms, true)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!(chat_id, "failed to store partial reply: {}", e);
                false
            }
        }
    }

    /// Store an assistant turn tagged with model, timing and token estimate
    pub async fn persist_assistant_turn(
        &self,
        chat_id: ChatId,
        text: &str,
        processing_time_ms: u64,
        partial: bool,
    ) -> StorageResult<StoredMessage> {
        let mut metadata = MessageMetadata::generated(&self.settings.model, text, processing_time_ms);
        if partial {
            metadata = metadata.into_partial();
        }
        self.store
            .create_message(NewMessage::assistant(chat_id, text, metadata))
            .await
    }
}
