//! WebSocket side of the chat relay
//!
//! Envelope codec, per-client connections, the connection registry and the
//! inbound read loop that feeds chat requests to a [`ChatHandler`].

pub mod connection;
pub mod dispatch;
pub mod inbound;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use connection::{Connection, ConnectionError, ConnectionStatus};
pub use dispatch::{ChatHandler, Dispatcher, Route};
pub use inbound::{serve_connection, serve_socket, ExitReason, InboundConfig};
pub use protocol::{
    codes, decode_inbound, normalize_chat_id, ChatFrame, ChatMessage, ErrorPayload, Inbound,
    ProtocolError, ServerEnvelope,
};
pub use registry::{Registry, RegistryConfig, RegistryError};
pub use transport::{ChannelSink, Frame, FrameSink, TransportError, WsSink};
