//! WebSocket envelope protocol
//!
//! Every frame is `{"type": <kind>, "content": <kind-specific>}`. Inbound frames are
//! decoded into [`Inbound`]; outbound frames are built as [`ServerEnvelope`].

use chrono::{DateTime, Utc};
use parley_core::{ChatId, Role, NEW_CHAT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Client-facing error codes
pub mod codes {
    pub const INVALID_MESSAGE: &str = "INVALID_MESSAGE";
    pub const MESSAGE_TOO_LARGE: &str = "MESSAGE_TOO_LARGE";
    pub const INVALID_CHAT_ID: &str = "INVALID_CHAT_ID";
    pub const UNKNOWN_MESSAGE_TYPE: &str = "UNKNOWN_MESSAGE_TYPE";
}

/// Envelope kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    ChatMessage,
    Typing,
    Ping,
    Pong,
    Error,
    System,
}

impl MessageType {
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "chat_message" => Some(Self::ChatMessage),
            "typing" => Some(Self::Typing),
            "ping" => Some(Self::Ping),
            "pong" => Some(Self::Pong),
            "error" => Some(Self::Error),
            "system" => Some(Self::System),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChatMessage => "chat_message",
            Self::Typing => "typing",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Error => "error",
            Self::System => "system",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("invalid message format: {0}")]
    InvalidMessageFormat(String),

    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("invalid chat ID: {0}")]
    InvalidChatId(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),
}

impl ProtocolError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidMessageFormat(_) => codes::INVALID_MESSAGE,
            Self::MessageTooLarge { .. } => codes::MESSAGE_TOO_LARGE,
            Self::InvalidChatId(_) => codes::INVALID_CHAT_ID,
            Self::UnknownType(_) => codes::UNKNOWN_MESSAGE_TYPE,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawChatContent {
    #[serde(default)]
    chat_id: Value,
    content: String,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

/// A decoded inbound chat message
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    /// Zero starts a new chat
    pub chat_id: ChatId,
    pub content: String,
    pub role: Role,
    pub timestamp: DateTime<Utc>,
}

/// Inbound envelope kinds after decoding
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Chat(ChatMessage),
    Typing,
    Ping,
    Pong,
    /// A kind only the server emits
    ServerOnly(MessageType),
}

/// Decode one inbound text frame.
pub fn decode_inbound(text: &str) -> Result<Inbound, ProtocolError> {
    let raw: RawEnvelope = serde_json::from_str(text)
        .map_err(|e| ProtocolError::InvalidMessageFormat(e.to_string()))?;

    let kind = MessageType::parse(&raw.kind).ok_or(ProtocolError::UnknownType(raw.kind))?;
    match kind {
        MessageType::ChatMessage => decode_chat(raw.content).map(Inbound::Chat),
        MessageType::Typing => Ok(Inbound::Typing),
        MessageType::Ping => Ok(Inbound::Ping),
        MessageType::Pong => Ok(Inbound::Pong),
        other => Ok(Inbound::ServerOnly(other)),
    }
}

fn decode_chat(content: Value) -> Result<ChatMessage, ProtocolError> {
    let raw: RawChatContent = serde_json::from_value(content)
        .map_err(|e| ProtocolError::InvalidMessageFormat(e.to_string()))?;

    Ok(ChatMessage {
        chat_id: normalize_chat_id(&raw.chat_id)?,
        content: raw.content,
        role: raw.role.as_deref().map(Role::parse_lossy).unwrap_or(Role::User),
        timestamp: raw.timestamp.unwrap_or_else(Utc::now),
    })
}

/// Largest float whose integral value is still exact
const MAX_EXACT_FLOAT_ID: f64 = 9_007_199_254_740_992.0;

/// Normalize a loosely typed chat id.
///
/// Accepts unsigned integers, integral non-negative floats up to 2^53 and
/// decimal strings. A missing id means a new chat.
pub fn normalize_chat_id(value: &Value) -> Result<ChatId, ProtocolError> {
    match value {
        Value::Null => Ok(NEW_CHAT),
        Value::Number(number) => {
            if let Some(id) = number.as_u64() {
                return Ok(id);
            }
            match number.as_f64() {
                Some(f) if f >= 0.0 && f.fract() == 0.0 && f <= MAX_EXACT_FLOAT_ID => Ok(f as u64),
                _ => Err(ProtocolError::InvalidChatId(number.to_string())),
            }
        }
        Value::String(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| ProtocolError::InvalidChatId(format!("{:?}", s))),
        other => Err(ProtocolError::InvalidChatId(other.to_string())),
    }
}

/// Terminal metadata of a reply
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionMetadata {
    pub complete: bool,
    /// Milliseconds from request start to the last fragment
    pub processing_time: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<ChatId>,
}

/// Content of an outbound `chat_message`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatFrame {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<CompletionMetadata>,
}

impl ChatFrame {
    /// One streamed piece of assistant text
    pub fn fragment(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            role: Some(Role::Assistant),
            timestamp: Some(Utc::now()),
            metadata: None,
        }
    }

    /// End-of-reply marker
    pub fn complete(processing_time_ms: u64, chat_id: Option<ChatId>) -> Self {
        Self {
            content: None,
            role: None,
            timestamp: None,
            metadata: Some(CompletionMetadata {
                complete: true,
                processing_time: processing_time_ms,
                chat_id,
            }),
        }
    }

    /// A whole reply delivered in one frame
    pub fn full(text: impl Into<String>, processing_time_ms: u64, chat_id: Option<ChatId>) -> Self {
        Self {
            metadata: Self::complete(processing_time_ms, chat_id).metadata,
            ..Self::fragment(text)
        }
    }
}

/// Content of an outbound `error`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorPayload {
    pub message: String,
    pub code: String,
}

impl ErrorPayload {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: code.into(),
        }
    }
}

impl From<ProtocolError> for ErrorPayload {
    fn from(err: ProtocolError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

/// Content of an outbound `system`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemPayload {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EnvelopeContent {
    Chat(ChatFrame),
    Error(ErrorPayload),
    System(SystemPayload),
}

/// Frame sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerEnvelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<EnvelopeContent>,
}

impl ServerEnvelope {
    pub fn chat(frame: ChatFrame) -> Self {
        Self {
            kind: MessageType::ChatMessage,
            content: Some(EnvelopeContent::Chat(frame)),
        }
    }

    pub fn typing() -> Self {
        Self {
            kind: MessageType::Typing,
            content: None,
        }
    }

    pub fn pong() -> Self {
        Self {
            kind: MessageType::Pong,
            content: None,
        }
    }

    pub fn error(payload: ErrorPayload) -> Self {
        Self {
            kind: MessageType::Error,
            content: Some(EnvelopeContent::Error(payload)),
        }
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self {
            kind: MessageType::System,
            content: Some(EnvelopeContent::System(SystemPayload {
                message: message.into(),
            })),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
