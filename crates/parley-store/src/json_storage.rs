//! # JsonFileStore Implementation
//!
//! 基于 JSON 文件的聊天持久化存储实现。
//!
//! 每个会话保存为 `<base_path>/chats/<chat_id>.json`，包含元数据和全部消息。
//! 写入先落到临时文件再 rename，保证追加消息与 `last_message` 更新同时生效。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parley_core::{Chat, ChatId, StoredMessage};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::StorageResult;
use crate::storage::ChatStore;
use crate::table::ChatTable;
use crate::types::{ChatPage, MessagePage, NewChat, NewMessage, Page};

/// JsonFileStore 配置
#[derive(Debug, Clone)]
pub struct JsonFileStoreConfig {
    /// 存储根目录
    pub base_path: PathBuf,
    /// 写入后 fsync
    pub sync_writes: bool,
}

impl JsonFileStoreConfig {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            sync_writes: true,
        }
    }

    /// 关闭 fsync（测试用）
    pub fn without_sync(mut self) -> Self {
        self.sync_writes = false;
        self
    }

    fn chats_dir(&self) -> PathBuf {
        self.base_path.join("chats")
    }
}

/// JSON 文件聊天存储
#[derive(Debug)]
pub struct JsonFileStore {
    config: JsonFileStoreConfig,
    // 写锁跨越文件写入，写者串行
    table: RwLock<ChatTable>,
}

impl JsonFileStore {
    /// 打开存储目录并加载已有会话
    pub async fn open(config: JsonFileStoreConfig) -> StorageResult<Self> {
        let dir = config.chats_dir();
        fs::create_dir_all(&dir).await?;

        let mut chats = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_chat(&path).await {
                Ok(chat) => chats.push(chat),
                Err(e) => warn!("Skipping unreadable chat file {:?}: {}", path, e),
            }
        }

        info!("Loaded {} chats from {:?}", chats.len(), dir);
        Ok(Self {
            config,
            table: RwLock::new(ChatTable::from_chats(chats)),
        })
    }

    async fn read_chat(path: &Path) -> StorageResult<Chat> {
        let content = fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&content)?)
    }

    fn chat_path(&self, chat_id: ChatId) -> PathBuf {
        self.config.chats_dir().join(format!("{}.json", chat_id))
    }

    async fn write_chat(&self, chat: &Chat) -> StorageResult<()> {
        let path = self.chat_path(chat.id);
        let tmp_path = path.with_extension("json.tmp");
        let content = serde_json::to_vec_pretty(chat)?;

        let mut file = fs::File::create(&tmp_path).await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, &content).await?;
        if self.config.sync_writes {
            file.sync_all().await?;
        }
        drop(file);

        fs::rename(&tmp_path, &path).await?;
        debug!("Wrote chat {} to {:?}", chat.id, path);
        Ok(())
    }
}

#[async_trait]
impl ChatStore for JsonFileStore {
    async fn create_chat(&self, chat: NewChat) -> StorageResult<Chat> {
        let mut table = self.table.write().await;
        let chat = table.prepare_chat(chat);
        self.write_chat(&chat).await?;
        table.commit(chat.clone());
        Ok(chat)
    }

    async fn get_chat(&self, chat_id: ChatId) -> StorageResult<Chat> {
        self.table.read().await.get(chat_id).cloned()
    }

    async fn list_chats(&self, user_id: &str, page: Page) -> StorageResult<ChatPage> {
        Ok(self.table.read().await.list(user_id, page))
    }

    async fn rename_chat(&self, chat_id: ChatId, title: String) -> StorageResult<Chat> {
        let mut table = self.table.write().await;
        let chat = table.prepare_rename(chat_id, title)?;
        self.write_chat(&chat).await?;
        table.commit(chat.clone());
        Ok(chat)
    }

    async fn delete_chat(&self, chat_id: ChatId) -> StorageResult<()> {
        let mut table = self.table.write().await;
        table.get(chat_id)?;
        match fs::remove_file(self.chat_path(chat_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Chat file for {} was already gone", chat_id);
            }
            Err(e) => return Err(e.into()),
        }
        table.remove(chat_id)?;
        debug!("Deleted chat {}", chat_id);
        Ok(())
    }

    async fn create_message(&self, message: NewMessage) -> StorageResult<StoredMessage> {
        let mut table = self.table.write().await;
        let (chat, message) = table.prepare_message(message)?;
        self.write_chat(&chat).await?;
        table.commit(chat);
        Ok(message)
    }

    async fn list_messages(&self, chat_id: ChatId, page: Page) -> StorageResult<MessagePage> {
        self.table.read().await.messages(chat_id, page)
    }

    async fn health_check(&self) -> StorageResult<()> {
        fs::metadata(self.config.chats_dir()).await?;
        Ok(())
    }
}
