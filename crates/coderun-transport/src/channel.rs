//! Remote session channel types.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Remote session identifier.
pub type SessionId = Uuid;

/// Parameters of one remote session. Immutable once connected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSession {
    pub problem: String,
    pub service: String,
    pub args: Vec<String>,
    pub token: Option<String>,
    /// Initial file bundle, argument name to content.
    pub files: BTreeMap<String, String>,
    pub tty: bool,
}

/// Header announcing file content on the data stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryHeader {
    pub name: String,
    pub size: Option<u64>,
}

/// Transport failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    Closed,
    #[error("WebSocket error: {0}")]
    WebSocket(String),
    #[error("Remote error: {0}")]
    Remote(String),
}

/// Connect failure.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("Handshake failed: {0}")]
    Handshake(String),
}

/// Inbound event from a remote session, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteEvent {
    /// Transport established; precedes any data.
    Start,
    /// Greeting from the peer.
    Begin(Vec<String>),
    /// A text chunk.
    Data(String),
    /// Data that follows is content for the named file.
    BinaryHeader(BinaryHeader),
    /// The service finished. A non-empty first line lists output files.
    Stop(Vec<String>),
    /// The transport ended. Emitted exactly once per session.
    Closed(Option<TransportError>),
}

/// Remote event tagged with the session it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEnvelope {
    pub session: SessionId,
    pub event: RemoteEvent,
}

/// Sender half used by connectors to report events of one session.
#[derive(Debug, Clone)]
pub struct EventSender {
    session: SessionId,
    tx: mpsc::UnboundedSender<RemoteEnvelope>,
}

impl EventSender {
    #[must_use]
    pub const fn new(session: SessionId, tx: mpsc::UnboundedSender<RemoteEnvelope>) -> Self {
        Self { session, tx }
    }

    #[must_use]
    pub const fn session(&self) -> SessionId {
        self.session
    }

    /// Report `event`. Returns false once nobody listens.
    pub fn emit(&self, event: RemoteEvent) -> bool {
        self.tx
            .send(RemoteEnvelope {
                session: self.session,
                event,
            })
            .is_ok()
    }
}

/// Outbound frame requested through a [`RemoteHandle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Data(String),
    Close,
}

/// Handle to an open remote session.
#[derive(Debug, Clone)]
pub struct RemoteHandle {
    id: SessionId,
    outbound: mpsc::UnboundedSender<Outbound>,
    closing: Arc<AtomicBool>,
}

impl RemoteHandle {
    /// Create a handle and the receiver the connector drains.
    #[must_use]
    pub fn new(id: SessionId) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        (
            Self {
                id,
                outbound,
                closing: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Push a text chunk to the peer. Never blocks.
    ///
    /// # Errors
    /// Returns `Closed` once the connection is closing or gone.
    pub fn send_binary(&self, text: impl Into<String>) -> Result<(), TransportError> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.outbound
            .send(Outbound::Data(text.into()))
            .map_err(|_| TransportError::Closed)
    }

    /// Close the connection. Idempotent; the connector reports
    /// `RemoteEvent::Closed` once.
    pub fn close_connection(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(session = %self.id, "Closing remote connection");
        let _ = self.outbound.send(Outbound::Close);
    }

    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}

/// Opens remote sessions.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    /// Open `session`, shipping its file bundle, and report its events
    /// through `events`.
    async fn connect(
        &self,
        session: RemoteSession,
        events: EventSender,
    ) -> Result<RemoteHandle, ConnectError>;
}
