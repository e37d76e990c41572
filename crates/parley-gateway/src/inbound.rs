//! Per-connection read loop

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::connection::{Connection, DEFAULT_WRITE_TIMEOUT};
use crate::dispatch::{Dispatcher, Route};
use crate::protocol::{codes, ErrorPayload, ProtocolError, ServerEnvelope};
use crate::registry::Registry;
use crate::transport::WsSink;

/// Largest inbound frame accepted by default
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct InboundConfig {
    pub max_frame_bytes: usize,
    pub write_timeout: Duration,
}

impl Default for InboundConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

/// Why a read loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Close frame or end of stream
    PeerClosed,
    ReadError,
    FrameTooLarge,
    /// A reply to this client could not be written
    WriteFailed,
    /// Closed by the registry
    Evicted,
    RegistryClosed,
}

/// Serve an upgraded socket until either side hangs up.
pub async fn serve_socket(
    socket: WebSocket,
    user_id: String,
    registry: Registry,
    dispatcher: Arc<Dispatcher>,
    config: InboundConfig,
) -> ExitReason {
    let (sink, stream) = socket.split();
    let connection = Arc::new(
        Connection::new(user_id, WsSink::new(sink)).with_write_timeout(config.write_timeout),
    );
    tracing::Span::current().record("connection_id", connection.id());
    serve_connection(connection, stream, &registry, &dispatcher, &config).await
}

/// Register `connection`, pump `incoming` into the dispatcher, then unregister.
///
/// Unregistration happens exactly once whatever ends the loop.
pub async fn serve_connection<S>(
    connection: Arc<Connection>,
    mut incoming: S,
    registry: &Registry,
    dispatcher: &Dispatcher,
    config: &InboundConfig,
) -> ExitReason
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    if registry.register(connection.clone()).await.is_err() {
        connection.close().await;
        return ExitReason::RegistryClosed;
    }

    let reason = read_loop(&connection, &mut incoming, dispatcher, config).await;

    if registry.unregister(connection.id()).await.is_err() {
        connection.close().await;
    }
    info!(
        connection_id = %connection.id(),
        user_id = %connection.user_id(),
        ?reason,
        "read loop finished"
    );
    reason
}

async fn read_loop<S>(
    connection: &Arc<Connection>,
    incoming: &mut S,
    dispatcher: &Dispatcher,
    config: &InboundConfig,
) -> ExitReason
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    loop {
        let message = tokio::select! {
            _ = connection.closed() => return ExitReason::Evicted,
            message = incoming.next() => message,
        };

        let message = match message {
            None => return ExitReason::PeerClosed,
            Some(Err(e)) => {
                warn!(connection_id = %connection.id(), "read error: {}", e);
                connection.mark_error();
                return ExitReason::ReadError;
            }
            Some(Ok(message)) => message,
        };
        connection.touch();

        let text = match message {
            Message::Text(text) => text,
            Message::Binary(bytes) => {
                if bytes.len() > config.max_frame_bytes {
                    return reject_oversize(connection, bytes.len(), config.max_frame_bytes).await;
                }
                match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => {
                        let payload =
                            ErrorPayload::new(codes::INVALID_MESSAGE, "binary frame is not UTF-8");
                        if connection.send_envelope(&ServerEnvelope::error(payload)).await.is_err() {
                            return ExitReason::WriteFailed;
                        }
                        continue;
                    }
                }
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => return ExitReason::PeerClosed,
        };

        if text.len() > config.max_frame_bytes {
            return reject_oversize(connection, text.len(), config.max_frame_bytes).await;
        }

        match dispatcher.dispatch(connection, &text).await {
            Ok(Route::Rejected(code)) => debug!(connection_id = %connection.id(), %code, "frame rejected"),
            Ok(_) => {}
            Err(e) => {
                debug!(connection_id = %connection.id(), "reply failed: {}", e);
                return ExitReason::WriteFailed;
            }
        }
    }
}

async fn reject_oversize(connection: &Connection, size: usize, limit: usize) -> ExitReason {
    let err = ProtocolError::MessageTooLarge { size, limit };
    warn!(connection_id = %connection.id(), "{}", err);
    if let Err(e) = connection.send_envelope(&ServerEnvelope::error(err.into())).await {
        debug!("could not report oversize frame: {}", e);
    }
    ExitReason::FrameTooLarge
}
