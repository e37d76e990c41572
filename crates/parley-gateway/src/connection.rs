//! A single client connection
//!
//! Owns the transport write half behind a lock so frames to one client never
//! interleave, and tracks liveness for the registry's sweeps.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::protocol::ServerEnvelope;
use crate::transport::{Frame, FrameSink, TransportError, NORMAL_CLOSURE};

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnecting,
    Disconnected,
    Error,
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("client disconnected")]
    Disconnected,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug)]
struct ConnectionState {
    status: ConnectionStatus,
    last_activity: Instant,
    error_count: u32,
    metadata: HashMap<String, Value>,
}

pub struct Connection {
    id: String,
    user_id: String,
    connected_at: DateTime<Utc>,
    write_timeout: Duration,
    state: Mutex<ConnectionState>,
    sink: tokio::sync::Mutex<Box<dyn FrameSink>>,
    close_started: AtomicBool,
    closed: CancellationToken,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("status", &self.status())
            .finish()
    }
}

impl Connection {
    pub fn new(user_id: impl Into<String>, sink: impl FrameSink + 'static) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            connected_at: Utc::now(),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            state: Mutex::new(ConnectionState {
                status: ConnectionStatus::Connected,
                last_activity: Instant::now(),
                error_count: 0,
                metadata: HashMap::new(),
            }),
            sink: tokio::sync::Mutex::new(Box::new(sink)),
            close_started: AtomicBool::new(false),
            closed: CancellationToken::new(),
        }
    }

    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.lock().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Consecutive failed writes since the last successful one
    pub fn error_count(&self) -> u32 {
        self.state.lock().error_count
    }

    /// Refresh the last-activity instant
    pub fn touch(&self) {
        self.state.lock().last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.state.lock().last_activity.elapsed()
    }

    pub fn is_idle(&self, threshold: Duration) -> bool {
        self.idle_for() > threshold
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: Value) {
        self.state.lock().metadata.insert(key.into(), value);
    }

    pub fn metadata(&self, key: &str) -> Option<Value> {
        self.state.lock().metadata.get(key).cloned()
    }

    /// Connected -> Disconnecting. Returns false from any other state.
    pub fn mark_disconnecting(&self) -> bool {
        let mut state = self.state.lock();
        if state.status == ConnectionStatus::Connected {
            state.status = ConnectionStatus::Disconnecting;
            true
        } else {
            false
        }
    }

    /// Record an unrecoverable transport failure
    pub fn mark_error(&self) {
        let mut state = self.state.lock();
        if state.status != ConnectionStatus::Disconnected {
            state.status = ConnectionStatus::Error;
        }
    }

    pub async fn send_envelope(&self, envelope: &ServerEnvelope) -> Result<(), ConnectionError> {
        let text = envelope.to_json()?;
        self.send_text(text).await
    }

    pub async fn send_text(&self, text: String) -> Result<(), ConnectionError> {
        self.write(Frame::Text(text), true).await
    }

    /// Send a protocol ping without waiting for the reply
    pub async fn probe(&self) -> Result<(), ConnectionError> {
        self.write(Frame::Ping, false).await
    }

    async fn write(&self, frame: Frame, refresh_activity: bool) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::Disconnected);
        }

        let mut sink = self.sink.lock().await;
        // closed while waiting for the writer
        if !self.is_connected() {
            return Err(ConnectionError::Disconnected);
        }
        if refresh_activity {
            self.touch();
        }

        let result = match timeout(self.write_timeout, sink.send_frame(frame)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.write_timeout)),
        };
        drop(sink);

        let mut state = self.state.lock();
        match result {
            Ok(()) => {
                state.error_count = 0;
                Ok(())
            }
            Err(e) => {
                state.error_count += 1;
                Err(e.into())
            }
        }
    }

    /// Close the connection. Idempotent; never waits on a busy writer.
    pub async fn close(&self) {
        if self.close_started.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            // Error goes straight to Disconnected
            let mut state = self.state.lock();
            if state.status == ConnectionStatus::Connected {
                state.status = ConnectionStatus::Disconnecting;
            }
        }

        if let Ok(mut sink) = self.sink.try_lock() {
            let frame = Frame::Close {
                code: NORMAL_CLOSURE,
                reason: "connection closed".to_string(),
            };
            match timeout(CLOSE_FRAME_TIMEOUT, sink.send_frame(frame)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(connection_id = %self.id, "close frame not delivered: {}", e),
                Err(_) => debug!(connection_id = %self.id, "close frame timed out"),
            }
        }

        self.state.lock().status = ConnectionStatus::Disconnected;
        self.closed.cancel();
    }

    /// Resolves once [`close`](Self::close) has finished
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}
