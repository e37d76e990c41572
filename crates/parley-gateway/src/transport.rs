//! Write side of a client transport.

use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use thiserror::Error;
use tokio::sync::mpsc;

/// Normal closure status code
pub const NORMAL_CLOSURE: u16 = 1000;

/// Transport-level frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Ping,
    Close { code: u16, reason: String },
}

impl Frame {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Frame::Text(text) => Some(text),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("write timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport closed")]
    Closed,

    #[error("transport error: {0}")]
    Io(String),
}

/// Something frames can be written to
#[async_trait]
pub trait FrameSink: Send {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), TransportError>;
}

/// Write half of an axum WebSocket
pub struct WsSink {
    inner: SplitSink<WebSocket, Message>,
}

impl WsSink {
    pub fn new(inner: SplitSink<WebSocket, Message>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Ping => Message::Ping(Vec::new()),
            Frame::Close { code, reason } => Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })),
        };
        self.inner
            .send(message)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }
}

/// In-process sink that forwards frames to a channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Frame>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.tx.send(frame).map_err(|_| TransportError::Closed)
    }
}
