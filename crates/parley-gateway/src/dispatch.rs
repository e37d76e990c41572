//! Inbound message routing
//!
//! Decodes one text frame and decides what to do with it. Chat requests run on
//! their own task so the read loop keeps draining the socket while a reply is
//! generated.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, warn, Instrument};

use crate::connection::{Connection, ConnectionError};
use crate::protocol::{decode_inbound, ChatMessage, ErrorPayload, Inbound, ServerEnvelope};

/// Produces the reply to one chat request
#[async_trait]
pub trait ChatHandler: Send + Sync {
    /// Stream the reply to `connection`.
    ///
    /// An `Err` is reported to the client as an `error` envelope.
    async fn handle_chat(
        &self,
        connection: Arc<Connection>,
        message: ChatMessage,
    ) -> Result<(), ErrorPayload>;
}

/// Result of routing an inbound frame
#[derive(Debug)]
pub enum Route {
    /// Chat request handed to the handler
    Chat(JoinHandle<()>),
    /// Replied to a ping
    Pong,
    /// Accepted with no reply
    Ignored,
    /// Answered with an error envelope carrying this code
    Rejected(String),
}

#[derive(Clone)]
pub struct Dispatcher {
    handler: Arc<dyn ChatHandler>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(handler: Arc<dyn ChatHandler>) -> Self {
        Self { handler }
    }

    /// Route one text frame.
    ///
    /// Only a failed write back to this client is an error.
    pub async fn dispatch(
        &self,
        connection: &Arc<Connection>,
        text: &str,
    ) -> Result<Route, ConnectionError> {
        let inbound = match decode_inbound(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!(connection_id = %connection.id(), "rejected inbound frame: {}", e);
                let payload = ErrorPayload::from(e);
                let code = payload.code.clone();
                connection.send_envelope(&ServerEnvelope::error(payload)).await?;
                return Ok(Route::Rejected(code));
            }
        };

        match inbound {
            Inbound::Chat(message) => Ok(Route::Chat(self.spawn_chat(connection.clone(), message))),
            Inbound::Ping => {
                connection.send_envelope(&ServerEnvelope::pong()).await?;
                Ok(Route::Pong)
            }
            Inbound::Typing | Inbound::Pong => Ok(Route::Ignored),
            Inbound::ServerOnly(kind) => {
                let payload = ErrorPayload::new(
                    crate::protocol::codes::UNKNOWN_MESSAGE_TYPE,
                    format!("clients may not send {}", kind.as_str()),
                );
                let code = payload.code.clone();
                connection.send_envelope(&ServerEnvelope::error(payload)).await?;
                Ok(Route::Rejected(code))
            }
        }
    }

    fn spawn_chat(&self, connection: Arc<Connection>, message: ChatMessage) -> JoinHandle<()> {
        let handler = self.handler.clone();
        debug!(
            connection_id = %connection.id(),
            chat_id = message.chat_id,
            "dispatching chat request"
        );

        tokio::spawn(
            async move {
                if let Err(payload) = handler.handle_chat(connection.clone(), message).await {
                    if !connection.is_connected() {
                        debug!("client gone before error could be reported: {}", payload.message);
                        return;
                    }
                    if let Err(e) = connection.send_envelope(&ServerEnvelope::error(payload)).await {
                        debug!("failed to report chat error: {}", e);
                    }
                }
            }
            .in_current_span(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codes;
    use crate::test_support::{channel_connection, recv_json};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<ChatMessage>>,
        fail_with: Option<ErrorPayload>,
    }

    #[async_trait]
    impl ChatHandler for RecordingHandler {
        async fn handle_chat(
            &self,
            _connection: Arc<Connection>,
            message: ChatMessage,
        ) -> Result<(), ErrorPayload> {
            self.seen.lock().push(message);
            match &self.fail_with {
                Some(payload) => Err(payload.clone()),
                None => Ok(()),
            }
        }
    }

    #[tokio::test]
    async fn test_chat_is_handed_to_handler() {
        let handler = Arc::new(RecordingHandler::default());
        let dispatcher = Dispatcher::new(handler.clone());
        let (conn, _rx) = channel_connection("alice");

        let route = dispatcher
            .dispatch(
                &conn,
                r#"{"type":"chat_message","content":{"chatId":"42","content":"hi"}}"#,
            )
            .await
            .unwrap();
        match route {
            Route::Chat(task) => task.await.unwrap(),
            other => panic!("expected a chat route, got {:?}", other),
        }

        let seen = handler.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].chat_id, 42);
        assert_eq!(seen[0].content, "hi");
    }

    #[tokio::test]
    async fn test_handler_error_is_reported() {
        let handler = Arc::new(RecordingHandler {
            fail_with: Some(ErrorPayload::new("UPSTREAM_REQUEST_FAILED", "provider down")),
            ..Default::default()
        });
        let dispatcher = Dispatcher::new(handler);
        let (conn, mut rx) = channel_connection("alice");

        let route = dispatcher
            .dispatch(&conn, r#"{"type":"chat_message","content":{"content":"hi"}}"#)
            .await
            .unwrap();
        if let Route::Chat(task) = route {
            task.await.unwrap();
        }

        let frame = recv_json(&mut rx).await;
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["content"]["code"], "UPSTREAM_REQUEST_FAILED");
    }

    #[tokio::test]
    async fn test_ping_gets_pong() {
        let dispatcher = Dispatcher::new(Arc::new(RecordingHandler::default()));
        let (conn, mut rx) = channel_connection("alice");

        let route = dispatcher.dispatch(&conn, r#"{"type":"ping"}"#).await.unwrap();
        assert!(matches!(route, Route::Pong));
        assert_eq!(recv_json(&mut rx).await["type"], "pong");
    }

    #[tokio::test]
    async fn test_typing_and_pong_are_ignored() {
        let dispatcher = Dispatcher::new(Arc::new(RecordingHandler::default()));
        let (conn, mut rx) = channel_connection("alice");

        for text in [r#"{"type":"typing"}"#, r#"{"type":"pong"}"#] {
            let route = dispatcher.dispatch(&conn, text).await.unwrap();
            assert!(matches!(route, Route::Ignored));
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_bad_frames_are_rejected() {
        let dispatcher = Dispatcher::new(Arc::new(RecordingHandler::default()));
        let (conn, mut rx) = channel_connection("alice");

        let cases = [
            ("not json", codes::INVALID_MESSAGE),
            (r#"{"type":"dance"}"#, codes::UNKNOWN_MESSAGE_TYPE),
            (r#"{"type":"error","content":{}}"#, codes::UNKNOWN_MESSAGE_TYPE),
            (
                r#"{"type":"chat_message","content":{"chatId":"abc","content":"x"}}"#,
                codes::INVALID_CHAT_ID,
            ),
        ];
        for (text, code) in cases {
            let route = dispatcher.dispatch(&conn, text).await.unwrap();
            assert!(matches!(route, Route::Rejected(ref c) if c == code), "{}", text);
            let frame = recv_json(&mut rx).await;
            assert_eq!(frame["type"], "error");
            assert_eq!(frame["content"]["code"], code);
        }
        assert!(conn.is_connected());
    }
}
