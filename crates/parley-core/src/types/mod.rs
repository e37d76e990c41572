pub mod chat;
pub mod message;

pub use chat::{truncate_title, Chat, ChatId, ChatSummary, NEW_CHAT};
pub use message::{estimate_tokens, MessageId, MessageMetadata, Role, StoredMessage};
