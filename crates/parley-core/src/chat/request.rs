use serde::{Deserialize, Serialize};

use crate::types::{Role, StoredMessage};

/// One message in the provider-facing conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

impl PromptMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

impl From<&StoredMessage> for PromptMessage {
    fn from(message: &StoredMessage) -> Self {
        Self {
            role: message.role,
            content: message.content.clone(),
        }
    }
}

/// Chat completion request
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<PromptMessage>,
    pub options: CompletionOptions,
}

impl CompletionRequest {
    /// Create a new completion request
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    /// Append prior turns
    pub fn with_history(mut self, history: impl IntoIterator<Item = PromptMessage>) -> Self {
        self.messages.extend(history);
        self
    }

    /// Add a message to the request
    pub fn with_message(mut self, message: PromptMessage) -> Self {
        self.messages.push(message);
        self
    }

    pub fn with_options(mut self, options: CompletionOptions) -> Self {
        self.options = options;
        self
    }

    /// Enable streaming
    pub fn stream(mut self) -> Self {
        self.options.stream = true;
        self
    }

    /// Set temperature
    pub fn temperature(mut self, temp: f32) -> Self {
        self.options.temperature = Some(temp);
        self
    }

    /// Set max tokens
    pub fn max_tokens(mut self, max: u32) -> Self {
        self.options.max_tokens = Some(max);
        self
    }
}

/// Options for chat completion
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub stream: bool,
}
