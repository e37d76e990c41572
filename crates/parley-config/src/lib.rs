pub mod config;
pub mod manager;

pub use config::{
    ChatConfig, Config, ConfigError, ConfigResult, GatewayConfig, LlmConfig, LogLevel,
    LoggingConfig, ServerConfig, StorageConfig, StorageType,
};
pub use manager::ConfigManager;

use std::path::PathBuf;

/// 获取 Parley 配置目录路径
pub fn parley_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".parley"))
}

/// 获取默认配置文件路径
pub fn default_config_path() -> Option<PathBuf> {
    parley_dir().map(|dir| dir.join("config.json"))
}

/// 展开路径中的 ~ 为用户主目录
pub fn expand_tilde(path: &str) -> Option<PathBuf> {
    if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir().map(|home| home.join(rest))
    } else {
        Some(PathBuf::from(path))
    }
}
