use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::message::StoredMessage;

/// Numeric chat identifier. Zero means "start a new chat".
pub type ChatId = u64;

pub const NEW_CHAT: ChatId = 0;

/// A conversation and its stored turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: ChatId,
    pub title: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    /// Bumped every time a turn is appended.
    pub last_message: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<StoredMessage>,
}

impl Chat {
    pub fn summary(&self) -> ChatSummary {
        ChatSummary {
            id: self.id,
            title: self.title.clone(),
            user_id: self.user_id.clone(),
            created_at: self.created_at,
            last_message: self.last_message,
            message_count: self.messages.len(),
        }
    }

    /// The most recent `window` turns, oldest first.
    pub fn recent_messages(&self, window: usize) -> &[StoredMessage] {
        let start = self.messages.len().saturating_sub(window);
        &self.messages[start..]
    }
}

/// Listing view of a chat without its turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSummary {
    pub id: ChatId,
    pub title: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub last_message: DateTime<Utc>,
    pub message_count: usize,
}

/// Derive a chat title from the first message, cut to `max_chars` characters.
pub fn truncate_title(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(max_chars) {
        Some((idx, _)) => trimmed[..idx].to_string(),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::message::{MessageMetadata, Role};

    fn message(id: u64, content: &str) -> StoredMessage {
        StoredMessage {
            id,
            chat_id: 1,
            content: content.to_string(),
            role: Role::User,
            timestamp: Utc::now(),
            metadata: MessageMetadata::default(),
        }
    }

    #[test]
    fn test_truncate_title() {
        assert_eq!(truncate_title("hello", 30), "hello");
        let long = "a".repeat(45);
        assert_eq!(truncate_title(&long, 30).len(), 30);
        // multi-byte characters are never split
        assert_eq!(truncate_title("héllo wörld", 4), "héll");
    }

    #[test]
    fn test_recent_messages_window() {
        let now = Utc::now();
        let mut chat = Chat {
            id: 1,
            title: "t".into(),
            user_id: "u".into(),
            created_at: now,
            last_message: now,
            messages: Vec::new(),
        };
        assert!(chat.recent_messages(10).is_empty());

        for i in 0..15 {
            chat.messages.push(message(i, &format!("m{}", i)));
        }
        let recent = chat.recent_messages(10);
        assert_eq!(recent.len(), 10);
        assert_eq!(recent[0].content, "m5");
        assert_eq!(recent[9].content, "m14");
        assert_eq!(chat.summary().message_count, 15);
    }
}
