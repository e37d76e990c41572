//! 内存中的会话表，供各存储实现共享。

use std::collections::HashMap;

use chrono::Utc;
use parley_core::{Chat, ChatId, MessageId, StoredMessage};

use crate::error::{StorageError, StorageResult};
use crate::types::{ChatPage, MessagePage, NewChat, NewMessage, Page};

#[derive(Debug)]
pub(crate) struct ChatTable {
    chats: HashMap<ChatId, Chat>,
    next_chat_id: ChatId,
    next_message_id: MessageId,
}

impl Default for ChatTable {
    fn default() -> Self {
        Self {
            chats: HashMap::new(),
            next_chat_id: 1,
            next_message_id: 1,
        }
    }
}

impl ChatTable {
    /// 从已持久化的会话重建索引，ID 计数从现有最大值之后继续
    pub(crate) fn from_chats(chats: impl IntoIterator<Item = Chat>) -> Self {
        let mut table = Self::default();
        for chat in chats {
            table.next_chat_id = table.next_chat_id.max(chat.id + 1);
            if let Some(max_id) = chat.messages.iter().map(|m| m.id).max() {
                table.next_message_id = table.next_message_id.max(max_id + 1);
            }
            table.chats.insert(chat.id, chat);
        }
        table
    }

    /// 生成新会话但不提交
    pub(crate) fn prepare_chat(&self, new_chat: NewChat) -> Chat {
        let now = Utc::now();
        Chat {
            id: self.next_chat_id,
            title: new_chat.title,
            user_id: new_chat.user_id,
            created_at: now,
            last_message: now,
            messages: Vec::new(),
        }
    }

    /// 生成追加消息后的会话副本但不提交
    pub(crate) fn prepare_message(&self, new_message: NewMessage) -> StorageResult<(Chat, StoredMessage)> {
        let mut chat = self.get(new_message.chat_id)?.clone();
        let message = StoredMessage {
            id: self.next_message_id,
            chat_id: chat.id,
            content: new_message.content,
            role: new_message.role,
            timestamp: Utc::now(),
            metadata: new_message.metadata,
        };
        chat.last_message = message.timestamp;
        chat.messages.push(message.clone());
        Ok((chat, message))
    }

    /// 生成改名后的会话副本但不提交
    pub(crate) fn prepare_rename(&self, chat_id: ChatId, title: String) -> StorageResult<Chat> {
        let mut chat = self.get(chat_id)?.clone();
        chat.title = title;
        Ok(chat)
    }

    /// 移除会话；ID 计数不回退
    pub(crate) fn remove(&mut self, chat_id: ChatId) -> StorageResult<Chat> {
        self.chats
            .remove(&chat_id)
            .ok_or(StorageError::ChatNotFound { id: chat_id })
    }

    /// 提交会话，推进 ID 计数
    pub(crate) fn commit(&mut self, chat: Chat) {
        self.next_chat_id = self.next_chat_id.max(chat.id + 1);
        if let Some(last) = chat.messages.last() {
            self.next_message_id = self.next_message_id.max(last.id + 1);
        }
        self.chats.insert(chat.id, chat);
    }

    pub(crate) fn get(&self, chat_id: ChatId) -> StorageResult<&Chat> {
        self.chats
            .get(&chat_id)
            .ok_or(StorageError::ChatNotFound { id: chat_id })
    }

    pub(crate) fn list(&self, user_id: &str, page: Page) -> ChatPage {
        let mut summaries: Vec<_> = self
            .chats
            .values()
            .filter(|chat| chat.user_id == user_id)
            .map(Chat::summary)
            .collect();
        summaries.sort_by(|a, b| b.last_message.cmp(&a.last_message).then(b.id.cmp(&a.id)));

        ChatPage {
            chats: page.slice(&summaries),
            total: summaries.len(),
            page: page.page,
            page_size: page.page_size,
        }
    }

    pub(crate) fn messages(&self, chat_id: ChatId, page: Page) -> StorageResult<MessagePage> {
        let chat = self.get(chat_id)?;
        Ok(MessagePage {
            messages: page.slice(&chat.messages),
            total: chat.messages.len(),
            page: page.page,
            page_size: page.page_size,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.chats.len()
    }
}
