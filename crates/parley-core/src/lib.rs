//! Domain types shared by the Parley relay crates.

pub mod chat;
pub mod types;

pub use chat::{CompletionOptions, CompletionRequest, PromptMessage};
pub use types::{
    estimate_tokens, truncate_title, Chat, ChatId, ChatSummary, MessageId, MessageMetadata, Role,
    StoredMessage, NEW_CHAT,
};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
