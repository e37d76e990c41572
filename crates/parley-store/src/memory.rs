use async_trait::async_trait;
use parley_core::{Chat, ChatId, StoredMessage};
use tokio::sync::RwLock;

use crate::error::StorageResult;
use crate::storage::ChatStore;
use crate::table::ChatTable;
use crate::types::{ChatPage, MessagePage, NewChat, NewMessage, Page};

/// 内存聊天存储（用于开发/测试）
#[derive(Debug, Default)]
pub struct MemoryChatStore {
    table: RwLock<ChatTable>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn chat_count(&self) -> usize {
        self.table.read().await.len()
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn create_chat(&self, chat: NewChat) -> StorageResult<Chat> {
        let mut table = self.table.write().await;
        let chat = table.prepare_chat(chat);
        table.commit(chat.clone());
        Ok(chat)
    }

    async fn get_chat(&self, chat_id: ChatId) -> StorageResult<Chat> {
        let table = self.table.read().await;
        table.get(chat_id).cloned()
    }

    async fn list_chats(&self, user_id: &str, page: Page) -> StorageResult<ChatPage> {
        Ok(self.table.read().await.list(user_id, page))
    }

    async fn rename_chat(&self, chat_id: ChatId, title: String) -> StorageResult<Chat> {
        let mut table = self.table.write().await;
        let chat = table.prepare_rename(chat_id, title)?;
        table.commit(chat.clone());
        Ok(chat)
    }

    async fn delete_chat(&self, chat_id: ChatId) -> StorageResult<()> {
        self.table.write().await.remove(chat_id).map(|_| ())
    }

    async fn create_message(&self, message: NewMessage) -> StorageResult<StoredMessage> {
        let mut table = self.table.write().await;
        let (chat, message) = table.prepare_message(message)?;
        table.commit(chat);
        Ok(message)
    }

    async fn list_messages(&self, chat_id: ChatId, page: Page) -> StorageResult<MessagePage> {
        self.table.read().await.messages(chat_id, page)
    }

    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}
