use std::sync::Arc;

use parley_config::Config;
use parley_gateway::{Dispatcher, InboundConfig, Registry, RegistryConfig};
use parley_llm::CompletionProvider;
use parley_store::ChatStore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::{BridgeSettings, StreamingBridge};
use crate::orchestrator::{ChatOrchestrator, OrchestratorSettings};

/// 应用状态 - 所有 handler 共享
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ChatStore>,
    pub registry: Registry,
    pub orchestrator: Arc<ChatOrchestrator>,
    pub dispatcher: Arc<Dispatcher>,
    pub inbound: InboundConfig,
}

impl AppState {
    pub fn new(
        store: Arc<dyn ChatStore>,
        registry: Registry,
        orchestrator: Arc<ChatOrchestrator>,
        inbound: InboundConfig,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(orchestrator.clone()));
        Self {
            store,
            registry,
            orchestrator,
            dispatcher,
            inbound,
        }
    }

    /// 按配置组装全部组件并启动连接注册表
    ///
    /// 返回注册表控制循环的句柄；取消 `shutdown` 后它会关闭所有连接并退出。
    pub fn build(
        config: &Config,
        provider: Arc<dyn CompletionProvider>,
        store: Arc<dyn ChatStore>,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let registry_config = RegistryConfig {
            keepalive_interval: config.gateway.keepalive_interval(),
            idle_timeout: config.gateway.idle_timeout(),
            queue_capacity: config.gateway.event_queue_capacity,
            broadcast_timeout: config.gateway.broadcast_timeout(),
        };
        let (registry, registry_task) = Registry::start(registry_config, shutdown);

        let bridge = Arc::new(StreamingBridge::new(
            provider,
            store.clone(),
            BridgeSettings::from_config(&config.llm),
        ));
        let orchestrator = Arc::new(ChatOrchestrator::new(
            store.clone(),
            bridge,
            OrchestratorSettings::from_config(&config.chat),
        ));
        let inbound = InboundConfig {
            max_frame_bytes: config.gateway.max_frame_bytes,
            write_timeout: config.gateway.write_timeout(),
        };

        (Self::new(store, registry, orchestrator, inbound), registry_task)
    }
}
