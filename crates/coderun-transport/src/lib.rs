//! Remote session channel.
//!
//! Provides:
//! - Wire protocol (JSON control frames + binary data frames)
//! - `RemoteConnector` trait and `RemoteHandle`
//! - WebSocket client transport (`WsConnector`)
//! - Scripted transport for embedding and tests (`ScriptedConnector`)

pub mod channel;
pub mod protocol;
pub mod scripted;
pub mod websocket;

pub use channel::{
    BinaryHeader, ConnectError, EventSender, Outbound, RemoteConnector, RemoteEnvelope,
    RemoteEvent, RemoteHandle, RemoteSession, SessionId, TransportError,
};
pub use protocol::{ClientMessage, ServerMessage};
pub use scripted::{ScriptedConnector, ScriptedPeer};
pub use websocket::WsConnector;
