use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use parley_config::{Config, ConfigManager, StorageConfig, StorageType};
use parley_llm::{OpenRouterProvider, ProviderConfig};
use parley_server::logging::init_logging;
use parley_server::{run_server, AppState};
use parley_store::{ChatStore, JsonFileStore, JsonFileStoreConfig, MemoryChatStore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug, Clone)]
#[command(name = "parley-server")]
#[command(about = "Parley real-time chat relay")]
#[command(version)]
struct Cli {
    /// Config file path (defaults to ~/.parley/config.json)
    #[arg(long, env = "PARLEY_CONFIG")]
    config: Option<String>,

    /// Server port (overrides config)
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// OpenRouter API key (overrides config)
    #[arg(long, env = "OPENROUTER_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Model name (overrides config)
    #[arg(long, env = "OPENROUTER_MODEL")]
    model: Option<String>,

    /// Completion API base URL (overrides config)
    #[arg(long)]
    base_url: Option<String>,

    /// Log filter (overrides config)
    #[arg(long, env = "RUST_LOG")]
    log_level: Option<String>,

    /// Emit JSON logs
    #[arg(long, default_value = "false")]
    json_logs: bool,
}

impl Cli {
    /// CLI 参数覆盖配置文件
    fn apply(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(key) = &self.api_key {
            config.llm.api_key = Some(key.clone());
        }
        if let Some(model) = &self.model {
            config.llm.model = model.clone();
        }
        if let Some(base_url) = &self.base_url {
            config.llm.base_url = base_url.clone();
        }
        if self.json_logs {
            config.logging.json = true;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = ConfigManager::resolve_path(cli.config.as_deref())?;
    let manager = ConfigManager::load(&config_path)
        .await
        .with_context(|| format!("failed to load config from {:?}", config_path))?;

    let mut config = manager.snapshot();
    cli.apply(&mut config);

    let log_level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.as_str().to_string());
    init_logging(&log_level, config.logging.json)?;

    ConfigManager::validate(&config).context("invalid configuration")?;
    let api_key = config
        .llm
        .api_key
        .clone()
        .filter(|key| !key.trim().is_empty())
        .context("no API key: set OPENROUTER_API_KEY or llm.api_key")?;

    info!("Starting Parley server on {}:{}", config.server.host, config.server.port);
    info!("  Base URL: {}", config.llm.base_url);
    info!("  Model: {}", config.llm.model);
    info!("  Storage: {:?}", config.storage.storage_type);

    let store = open_store(&config.storage).await?;
    let provider = OpenRouterProvider::new(
        ProviderConfig::openrouter(&config.llm.app_title, &config.llm.app_referer)
            .with_api_key(api_key)
            .with_base_url(&config.llm.base_url)
            .with_model(&config.llm.model)
            .with_timeout(config.llm.timeout()),
    )?;

    let shutdown = CancellationToken::new();
    let (state, registry_task) =
        AppState::build(&config, Arc::new(provider), store, shutdown.clone());
    tokio::spawn(watch_signals(shutdown.clone()));

    run_server(state, &config.server, shutdown.clone()).await?;

    shutdown.cancel();
    if let Err(e) = registry_task.await {
        warn!("registry task ended abnormally: {}", e);
    }
    Ok(())
}

async fn open_store(config: &StorageConfig) -> anyhow::Result<Arc<dyn ChatStore>> {
    match config.storage_type {
        StorageType::Memory => Ok(Arc::new(MemoryChatStore::new())),
        StorageType::File => {
            let path = config
                .path
                .as_deref()
                .and_then(parley_config::expand_tilde)
                .or_else(|| parley_config::parley_dir().map(|dir| dir.join("data")))
                .context("no storage path configured")?;
            let store = JsonFileStore::open(JsonFileStoreConfig::new(path)).await?;
            Ok(Arc::new(store))
        }
    }
}

async fn watch_signals(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("ctrl-c received, shutting down"),
        _ = terminate => info!("SIGTERM received, shutting down"),
    }
    shutdown.cancel();
}
