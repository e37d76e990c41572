//! Connection registry
//!
//! A single control loop owns every mutation of the membership set. Other tasks
//! push register, unregister and broadcast events onto bounded queues, or take
//! the read lock for lookups. Keepalive and idle sweeps only read membership and
//! queue unregister events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::protocol::ServerEnvelope;

type Members = Arc<RwLock<HashMap<String, Arc<Connection>>>>;

/// Registry configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How often every member is probed
    pub keepalive_interval: Duration,
    /// Members idle longer than this are evicted
    pub idle_timeout: Duration,
    /// Capacity of each event queue
    pub queue_capacity: usize,
    /// Per-member send budget during a broadcast; slower members are evicted
    pub broadcast_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            queue_capacity: 256,
            broadcast_timeout: Duration::from_secs(2),
        }
    }
}

impl RegistryConfig {
    pub fn idle_sweep_interval(&self) -> Duration {
        (self.idle_timeout / 2).max(Duration::from_millis(1))
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry control loop has stopped")]
    Closed,

    #[error("failed to encode broadcast: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Handle to the registry; cheap to clone.
#[derive(Clone)]
pub struct Registry {
    members: Members,
    register_tx: mpsc::Sender<Arc<Connection>>,
    unregister_tx: mpsc::Sender<String>,
    broadcast_tx: mpsc::Sender<String>,
    config: Arc<RegistryConfig>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// Spawn the control loop and both sweeps.
    ///
    /// Cancelling `shutdown` closes every member and stops all three tasks.
    pub fn start(config: RegistryConfig, shutdown: CancellationToken) -> (Self, JoinHandle<()>) {
        let capacity = config.queue_capacity.max(1);
        let (register_tx, register_rx) = mpsc::channel(capacity);
        let (unregister_tx, unregister_rx) = mpsc::channel(capacity);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(capacity);
        let members: Members = Arc::new(RwLock::new(HashMap::new()));

        let registry = Self {
            members: members.clone(),
            register_tx,
            unregister_tx,
            broadcast_tx,
            config: Arc::new(config),
        };

        let control = ControlLoop {
            members,
            register_rx,
            unregister_rx,
            broadcast_rx,
            broadcast_timeout: registry.config.broadcast_timeout,
            shutdown: shutdown.clone(),
        };
        let handle = tokio::spawn(control.run());

        tokio::spawn(run_sweep(
            registry.clone(),
            registry.config.keepalive_interval,
            shutdown.clone(),
            Sweep::Keepalive,
        ));
        tokio::spawn(run_sweep(
            registry.clone(),
            registry.config.idle_sweep_interval(),
            shutdown,
            Sweep::Idle,
        ));

        (registry, handle)
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub async fn register(&self, connection: Arc<Connection>) -> Result<(), RegistryError> {
        self.register_tx
            .send(connection)
            .await
            .map_err(|_| RegistryError::Closed)
    }

    pub async fn unregister(&self, connection_id: &str) -> Result<(), RegistryError> {
        self.unregister_tx
            .send(connection_id.to_string())
            .await
            .map_err(|_| RegistryError::Closed)
    }

    /// Queue a raw text payload for every member
    pub async fn broadcast(&self, payload: String) -> Result<(), RegistryError> {
        self.broadcast_tx
            .send(payload)
            .await
            .map_err(|_| RegistryError::Closed)
    }

    pub async fn broadcast_envelope(&self, envelope: &ServerEnvelope) -> Result<(), RegistryError> {
        self.broadcast(envelope.to_json()?).await
    }

    pub async fn connection_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn get(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.members.read().await.get(connection_id).cloned()
    }

    pub async fn is_user_connected(&self, user_id: &str) -> bool {
        self.members
            .read()
            .await
            .values()
            .any(|conn| conn.user_id() == user_id)
    }

    pub async fn user_connections(&self, user_id: &str) -> Vec<Arc<Connection>> {
        self.members
            .read()
            .await
            .values()
            .filter(|conn| conn.user_id() == user_id)
            .cloned()
            .collect()
    }

    async fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.members.read().await.values().cloned().collect()
    }

    /// Probe every member; queue unregister for each failed probe.
    pub(crate) async fn keepalive_sweep(&self) -> usize {
        let members = self.snapshot().await;
        let results = join_all(members.iter().map(|conn| conn.probe())).await;

        let mut queued = 0;
        for (conn, result) in members.iter().zip(results) {
            if let Err(e) = result {
                info!(connection_id = %conn.id(), user_id = %conn.user_id(), "keepalive probe failed: {}", e);
                if self.unregister(conn.id()).await.is_ok() {
                    queued += 1;
                }
            }
        }
        queued
    }

    /// Queue unregister for every member idle past the timeout.
    pub(crate) async fn idle_sweep(&self) -> usize {
        let idle_timeout = self.config.idle_timeout;
        let idle: Vec<_> = self
            .snapshot()
            .await
            .into_iter()
            .filter(|conn| conn.is_idle(idle_timeout))
            .collect();

        let mut queued = 0;
        for conn in idle {
            info!(
                connection_id = %conn.id(),
                user_id = %conn.user_id(),
                idle_secs = conn.idle_for().as_secs(),
                "evicting idle connection"
            );
            if self.unregister(conn.id()).await.is_ok() {
                queued += 1;
            }
        }
        queued
    }
}

#[derive(Debug, Clone, Copy)]
enum Sweep {
    Keepalive,
    Idle,
}

async fn run_sweep(registry: Registry, period: Duration, shutdown: CancellationToken, sweep: Sweep) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let queued = match sweep {
                    Sweep::Keepalive => registry.keepalive_sweep().await,
                    Sweep::Idle => registry.idle_sweep().await,
                };
                if queued > 0 {
                    debug!(?sweep, queued, "sweep queued evictions");
                }
            }
        }
    }
}

struct ControlLoop {
    members: Members,
    register_rx: mpsc::Receiver<Arc<Connection>>,
    unregister_rx: mpsc::Receiver<String>,
    broadcast_rx: mpsc::Receiver<String>,
    broadcast_timeout: Duration,
    shutdown: CancellationToken,
}

impl ControlLoop {
    async fn run(mut self) {
        loop {
            // register before unregister so a short-lived connection is never left behind
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(conn) = self.register_rx.recv() => self.on_register(conn).await,
                Some(id) = self.unregister_rx.recv() => self.on_unregister(&id).await,
                Some(payload) = self.broadcast_rx.recv() => self.on_broadcast(payload).await,
                else => break,
            }
        }
        self.close_all().await;
    }

    async fn on_register(&mut self, conn: Arc<Connection>) {
        if !conn.is_connected() {
            debug!(connection_id = %conn.id(), "skipping registration of closed connection");
            return;
        }
        let total = {
            let mut members = self.members.write().await;
            members.insert(conn.id().to_string(), conn.clone());
            members.len()
        };
        info!(connection_id = %conn.id(), user_id = %conn.user_id(), total, "Client connected");
    }

    async fn on_unregister(&mut self, connection_id: &str) {
        let (removed, total) = {
            let mut members = self.members.write().await;
            let removed = members.remove(connection_id);
            if let Some(conn) = &removed {
                conn.mark_disconnecting();
            }
            (removed, members.len())
        };

        if let Some(conn) = removed {
            conn.close().await;
            info!(connection_id = %conn.id(), user_id = %conn.user_id(), total, "Client disconnected");
        }
    }

    async fn on_broadcast(&mut self, payload: String) {
        let members: Vec<_> = self.members.read().await.values().cloned().collect();
        // the control loop is blocked for at most one broadcast_timeout
        let budget = self.broadcast_timeout;
        let results = join_all(
            members
                .iter()
                .map(|conn| timeout(budget, conn.send_text(payload.clone()))),
        )
        .await;

        let mut failed = Vec::new();
        for (conn, result) in members.iter().zip(results) {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(connection_id = %conn.id(), "broadcast delivery failed: {}", e);
                    failed.push(conn.id().to_string());
                }
                Err(_) => {
                    warn!(connection_id = %conn.id(), ?budget, "broadcast delivery timed out");
                    failed.push(conn.id().to_string());
                }
            }
        }
        debug!(recipients = members.len(), failed = failed.len(), "broadcast delivered");

        for id in failed {
            self.on_unregister(&id).await;
        }
    }

    async fn close_all(&mut self) {
        let drained: Vec<_> = {
            let mut members = self.members.write().await;
            members.drain().map(|(_, conn)| conn).collect()
        };
        for conn in &drained {
            conn.mark_disconnecting();
        }
        join_all(drained.iter().map(|conn| conn.close())).await;
        info!(closed = drained.len(), "registry stopped");
    }
}
