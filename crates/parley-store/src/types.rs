use parley_core::{ChatId, ChatSummary, MessageMetadata, Role, StoredMessage};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

/// 新建会话参数
#[derive(Debug, Clone)]
pub struct NewChat {
    pub title: String,
    pub user_id: String,
}

/// 追加消息参数
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub chat_id: ChatId,
    pub content: String,
    pub role: Role,
    pub metadata: MessageMetadata,
}

impl NewMessage {
    pub fn user(chat_id: ChatId, content: impl Into<String>) -> Self {
        Self {
            chat_id,
            content: content.into(),
            role: Role::User,
            metadata: MessageMetadata::default(),
        }
    }

    pub fn assistant(chat_id: ChatId, content: impl Into<String>, metadata: MessageMetadata) -> Self {
        Self {
            chat_id,
            content: content.into(),
            role: Role::Assistant,
            metadata,
        }
    }
}

/// 分页参数（页码从 1 开始）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub page: u32,
    pub page_size: u32,
}

impl Page {
    /// 规范化分页参数：页码小于 1 取 1，页大小超出 1..=100 取默认值
    pub fn new(page: u32, page_size: u32) -> Self {
        Self {
            page: page.max(1),
            page_size: if (1..=MAX_PAGE_SIZE).contains(&page_size) {
                page_size
            } else {
                DEFAULT_PAGE_SIZE
            },
        }
    }

    pub fn offset(&self) -> usize {
        (self.page.saturating_sub(1) as usize) * self.page_size as usize
    }

    pub(crate) fn slice<T: Clone>(&self, items: &[T]) -> Vec<T> {
        items
            .iter()
            .skip(self.offset())
            .take(self.page_size as usize)
            .cloned()
            .collect()
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(1, DEFAULT_PAGE_SIZE)
    }
}

/// 会话列表结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatPage {
    pub chats: Vec<ChatSummary>,
    pub total: usize,
    pub page: u32,
    pub page_size: u32,
}

/// 消息列表结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<StoredMessage>,
    pub total: usize,
    pub page: u32,
    pub page_size: u32,
}
