//! # Parley Chat Storage
//!
//! 聊天会话与消息的持久化存储。
//!
//! - **MemoryChatStore**：进程内存储，适合开发与测试
//! - **JsonFileStore**：每个会话一个 JSON 文件，写入采用临时文件 + rename
//!
//! 追加消息与更新会话的 `last_message` 是同一个原子操作：两者同时成功或同时失败。
//!
//! ## 存储结构
//!
//! ```text
//! <base_path>/
//! └── chats/
//!     ├── 1.json      # 会话元数据和全部消息
//!     └── ...
//! ```

pub mod error;
pub mod json_storage;
pub mod memory;
pub mod storage;
mod table;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use json_storage::{JsonFileStore, JsonFileStoreConfig};
pub use memory::MemoryChatStore;
pub use storage::ChatStore;
pub use types::{ChatPage, MessagePage, NewChat, NewMessage, Page};
