use parley_core::{CompletionRequest, PromptMessage};
use serde::{Deserialize, Serialize};

use crate::error::ConversionError;

/// Request body for an OpenAI-compatible `/chat/completions` endpoint.
#[derive(Debug, Serialize)]
pub struct CompletionBody<'a> {
    pub model: &'a str,
    pub messages: &'a [PromptMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    pub stream: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<ResponseChoice>,
}

#[derive(Debug, Deserialize)]
struct ResponseChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI wire format used by OpenRouter.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAiTransformer;

impl OpenAiTransformer {
    pub fn new() -> Self {
        Self
    }

    /// Build the request body; `fallback_model` is used when the request names none.
    pub fn transform_request<'a>(
        &self,
        request: &'a CompletionRequest,
        fallback_model: &'a str,
        stream: bool,
    ) -> CompletionBody<'a> {
        let model = if request.model.is_empty() {
            fallback_model
        } else {
            request.model.as_str()
        };
        CompletionBody {
            model,
            messages: &request.messages,
            temperature: request.options.temperature,
            max_tokens: request.options.max_tokens,
            stream,
        }
    }

    /// Extract the first choice's text from a non-streaming response.
    pub fn parse_response(&self, body: &[u8]) -> Result<String, ConversionError> {
        let response: CompletionResponse = serde_json::from_slice(body)?;
        response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content.unwrap_or_default())
            .ok_or_else(|| ConversionError::MissingField("choices".to_string()))
    }

    /// Extract the delta text of one SSE payload.
    ///
    /// Undecodable payloads and chunks without text yield `None`.
    pub fn parse_stream_chunk(&self, data: &str) -> Option<String> {
        let chunk: StreamChunk = serde_json::from_str(data).ok()?;
        chunk
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta)
            .and_then(|delta| delta.content)
            .filter(|content| !content.is_empty())
    }
}
