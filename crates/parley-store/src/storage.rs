//! # Storage Traits
//!
//! 定义聊天存储的核心 trait。

use async_trait::async_trait;
use parley_core::{Chat, ChatId, StoredMessage};

use crate::error::StorageResult;
use crate::types::{ChatPage, MessagePage, NewChat, NewMessage, Page};

/// 聊天存储 trait
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// 创建新会话
    async fn create_chat(&self, chat: NewChat) -> StorageResult<Chat>;

    /// 加载会话及其全部消息，不存在时返回 `ChatNotFound`
    async fn get_chat(&self, chat_id: ChatId) -> StorageResult<Chat>;

    /// 按最后活动时间倒序列出用户的会话
    async fn list_chats(&self, user_id: &str, page: Page) -> StorageResult<ChatPage>;

    /// 修改会话标题
    async fn rename_chat(&self, chat_id: ChatId, title: String) -> StorageResult<Chat>;

    /// 删除会话及其全部消息
    async fn delete_chat(&self, chat_id: ChatId) -> StorageResult<()>;

    /// 追加消息并更新会话的 `last_message`（原子操作）
    async fn create_message(&self, message: NewMessage) -> StorageResult<StoredMessage>;

    /// 按时间顺序列出会话消息
    async fn list_messages(&self, chat_id: ChatId, page: Page) -> StorageResult<MessagePage>;

    /// 健康检查
    async fn health_check(&self) -> StorageResult<()>;
}
