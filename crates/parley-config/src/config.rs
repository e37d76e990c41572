use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 主配置结构体
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub version: String,
    pub server: ServerConfig,
    pub gateway: GatewayConfig,
    pub llm: LlmConfig,
    pub chat: ChatConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            server: ServerConfig::default(),
            gateway: GatewayConfig::default(),
            llm: LlmConfig::default(),
            chat: ChatConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Server 配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
            cors: true,
        }
    }
}

/// WebSocket 连接管理配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    /// 心跳探测间隔（秒）
    pub keepalive_interval_secs: u64,
    /// 空闲超时（秒），清理周期为其一半
    pub idle_timeout_secs: u64,
    /// 单帧最大字节数
    pub max_frame_bytes: usize,
    /// 注册/注销/广播队列容量
    pub event_queue_capacity: usize,
    /// 单次写入超时（秒）
    pub write_timeout_secs: u64,
    /// 广播时每个连接的发送上限（秒），超时即移除
    pub broadcast_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_secs: 30,
            idle_timeout_secs: 300,
            max_frame_bytes: 1024 * 1024,
            event_queue_capacity: 256,
            write_timeout_secs: 10,
            broadcast_timeout_secs: 2,
        }
    }
}

impl GatewayConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn broadcast_timeout(&self) -> Duration {
        Duration::from_secs(self.broadcast_timeout_secs)
    }
}

/// LLM 配置（OpenRouter 兼容接口）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// 非流式请求的总尝试次数
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub timeout_secs: u64,
    pub app_title: String,
    pub app_referer: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://openrouter.ai/api/v1".to_string(),
            api_key: None,
            model: "google/gemini-2.0-flash-001".to_string(),
            temperature: 0.7,
            max_tokens: 1000,
            max_retries: 3,
            retry_delay_ms: 2000,
            timeout_secs: 60,
            app_title: "Parley Chat".to_string(),
            app_referer: "http://localhost:8080".to_string(),
        }
    }
}

impl LlmConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// 对话编排配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChatConfig {
    /// 发送给模型的历史消息条数上限
    pub history_window: usize,
    /// 新会话标题的最大字符数
    pub title_max_chars: usize,
    /// 单次请求的总超时（秒）
    pub request_timeout_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            history_window: 10,
            title_max_chars: 30,
            request_timeout_secs: 60,
        }
    }
}

impl ChatConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Storage 类型
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    Memory,
    File,
}

/// Storage 配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub storage_type: StorageType,
    pub path: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: StorageType::Memory,
            path: Some("~/.parley/data".to_string()),
        }
    }
}

/// 日志级别
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(ConfigError::Validation(format!("Invalid log level: {}", s))),
        }
    }
}

/// Logging 配置
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    /// 输出 JSON 格式日志
    pub json: bool,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
