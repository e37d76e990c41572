use crate::config::{Config, ConfigError, ConfigResult};
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::info;

/// 启动时加载的配置及其来源文件
#[derive(Debug, Clone)]
pub struct ConfigManager {
    path: PathBuf,
    config: Config,
}

impl ConfigManager {
    /// 解析配置文件路径：显式路径优先（支持 ~），否则使用 ~/.parley/config.json
    pub fn resolve_path(explicit: Option<&str>) -> ConfigResult<PathBuf> {
        match explicit.map(str::trim).filter(|p| !p.is_empty()) {
            Some(path) => crate::expand_tilde(path)
                .ok_or_else(|| ConfigError::InvalidPath(format!("Cannot expand {}", path))),
            None => crate::default_config_path().ok_or_else(|| {
                ConfigError::InvalidPath("Could not find home directory".to_string())
            }),
        }
    }

    /// 加载配置文件，不存在时写入默认配置
    pub async fn load(path: &Path) -> ConfigResult<Self> {
        let config = if path.exists() {
            info!("Loading config from {:?}", path);
            Self::read(path).await?
        } else {
            info!("Config file not found, writing defaults to {:?}", path);
            Self::write_default(path).await?
        };

        Ok(Self {
            path: path.to_path_buf(),
            config,
        })
    }

    async fn read(path: &Path) -> ConfigResult<Config> {
        let raw = tokio::fs::read_to_string(path).await?;
        let expanded = Self::expand_env_vars(&raw)?;
        Ok(serde_json::from_str(&expanded)?)
    }

    async fn write_default(path: &Path) -> ConfigResult<Config> {
        let config = Config::default();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, serde_json::to_string_pretty(&config)?).await?;
        Ok(config)
    }

    /// 当前配置的副本，供 CLI 覆盖
    pub fn snapshot(&self) -> Config {
        self.config.clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 验证配置
    pub fn validate(config: &Config) -> ConfigResult<()> {
        if config.server.port == 0 {
            return Err(ConfigError::Validation(
                "Server port cannot be 0".to_string(),
            ));
        }

        let gateway = &config.gateway;
        if gateway.keepalive_interval_secs == 0 || gateway.idle_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "Gateway keepalive and idle intervals must be greater than 0".to_string(),
            ));
        }
        if gateway.broadcast_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "Gateway broadcast_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if gateway.max_frame_bytes == 0 || gateway.event_queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "Gateway frame ceiling and queue capacity must be greater than 0".to_string(),
            ));
        }

        if config.llm.max_retries == 0 {
            return Err(ConfigError::Validation(
                "LLM max_retries must be at least 1".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&config.llm.temperature) {
            return Err(ConfigError::Validation(format!(
                "LLM temperature {} is outside 0.0..=2.0",
                config.llm.temperature
            )));
        }

        if config.chat.history_window == 0 || config.chat.request_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "Chat history_window and request_timeout_secs must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// 展开 ${VAR} 与 ${VAR:-default}
    fn expand_env_vars(content: &str) -> ConfigResult<String> {
        let re = Regex::new(r"\$\{([^}]+)\}")
            .map_err(|e| ConfigError::Validation(format!("Invalid env pattern: {}", e)))?;

        let mut missing = None;
        let expanded = re.replace_all(content, |cap: &regex::Captures<'_>| {
            let (name, fallback) = match cap[1].split_once(":-") {
                Some((name, fallback)) => (name.to_string(), Some(fallback.to_string())),
                None => (cap[1].to_string(), None),
            };
            match std::env::var(&name).ok().or(fallback) {
                Some(value) => value,
                None => {
                    missing.get_or_insert(name);
                    String::new()
                }
            }
        });

        match missing {
            Some(name) => Err(ConfigError::EnvVarNotFound(name)),
            None => Ok(expanded.into_owned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_load_default_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.json");

        let manager = ConfigManager::load(&config_path).await.unwrap();
        let config = manager.snapshot();

        assert!(config_path.exists());
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.llm.model, "google/gemini-2.0-flash-001");
        assert_eq!(manager.path(), config_path.as_path());
    }

    #[tokio::test]
    async fn test_written_defaults_load_back() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.json");

        ConfigManager::load(&config_path).await.unwrap();
        let reloaded = ConfigManager::load(&config_path).await.unwrap();
        assert_eq!(reloaded.snapshot().gateway.idle_timeout_secs, 300);
    }

    #[tokio::test]
    async fn test_load_expands_env_vars() {
        std::env::set_var("PARLEY_TEST_MODEL", "openai/gpt-4o-mini");
        std::env::remove_var("PARLEY_TEST_MISSING_PORT");

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.json");
        tokio::fs::write(
            &config_path,
            r#"{
                "server": {"port": ${PARLEY_TEST_MISSING_PORT:-9090}},
                "llm": {"model": "${PARLEY_TEST_MODEL}"}
            }"#,
        )
        .await
        .unwrap();

        let config = ConfigManager::load(&config_path).await.unwrap().snapshot();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.llm.model, "openai/gpt-4o-mini");
    }

    #[test]
    fn test_env_var_missing_without_default() {
        std::env::remove_var("PARLEY_TEST_UNSET");
        let result = ConfigManager::expand_env_vars(r#"{"key": "${PARLEY_TEST_UNSET}"}"#);
        assert!(matches!(result, Err(ConfigError::EnvVarNotFound(name)) if name == "PARLEY_TEST_UNSET"));
    }

    #[test]
    fn test_resolve_path() {
        assert_eq!(
            ConfigManager::resolve_path(Some("/etc/parley.json")).unwrap(),
            PathBuf::from("/etc/parley.json")
        );

        if dirs::home_dir().is_some() {
            let fallback = ConfigManager::resolve_path(None).unwrap();
            assert!(fallback.ends_with(".parley/config.json"));
            assert_eq!(ConfigManager::resolve_path(Some("  ")).unwrap(), fallback);
        }
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(ConfigManager::validate(&config).is_ok());

        config.server.port = 0;
        assert!(ConfigManager::validate(&config).is_err());
        config.server.port = 8080;

        config.llm.max_retries = 0;
        assert!(ConfigManager::validate(&config).is_err());
        config.llm.max_retries = 3;

        config.llm.temperature = 3.5;
        assert!(ConfigManager::validate(&config).is_err());
        config.llm.temperature = 0.7;

        config.gateway.max_frame_bytes = 0;
        assert!(ConfigManager::validate(&config).is_err());
    }
}
