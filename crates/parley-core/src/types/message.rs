use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::types::chat::ChatId;

/// Identifier of a stored turn.
pub type MessageId = u64;

/// Message role in the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    /// Parse a role, falling back to `System` for anything unrecognized.
    pub fn parse_lossy(value: &str) -> Self {
        value.parse().unwrap_or(Role::System)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Metadata attached to a stored turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_count: Option<usize>,
    /// Generation time in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_time: Option<u64>,
    /// Set when the turn is the prefix of an interrupted stream.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub partial: bool,
}

impl MessageMetadata {
    /// Metadata for a generated reply: model, elapsed time and token estimate.
    pub fn generated(model: impl Into<String>, content: &str, process_time_ms: u64) -> Self {
        Self {
            model: Some(model.into()),
            token_count: Some(estimate_tokens(content)),
            process_time: Some(process_time_ms),
            partial: false,
        }
    }

    pub fn into_partial(mut self) -> Self {
        self.partial = true;
        self
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// A persisted conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub content: String,
    pub role: Role,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "MessageMetadata::is_empty")]
    pub metadata: MessageMetadata,
}

/// Rough token estimate: one token per four bytes of text.
pub fn estimate_tokens(content: &str) -> usize {
    content.len() / 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse_lossy() {
        assert_eq!(Role::parse_lossy("user"), Role::User);
        assert_eq!(Role::parse_lossy(" Assistant "), Role::Assistant);
        assert_eq!(Role::parse_lossy("tool"), Role::System);
        assert_eq!(Role::parse_lossy(""), Role::System);
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 0);
        assert_eq!(estimate_tokens("Hello world!"), 3);
    }

    #[test]
    fn test_metadata_serialization_skips_unset_fields() {
        let meta = MessageMetadata::generated("test-model", "abcdefgh", 120);
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["model"], "test-model");
        assert_eq!(json["token_count"], 2);
        assert_eq!(json["process_time"], 120);
        assert!(json.get("partial").is_none());

        let partial = meta.into_partial();
        let json = serde_json::to_value(&partial).unwrap();
        assert_eq!(json["partial"], true);
    }
}
