//! Channel-driven connector.
//!
//! Each successful connect hands a [`ScriptedPeer`] to the holder of the
//! receiver returned by [`ScriptedConnector::new`], who then plays the
//! remote service.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::channel::{
    BinaryHeader, ConnectError, EventSender, Outbound, RemoteConnector, RemoteEvent, RemoteHandle,
    RemoteSession, SessionId, TransportError,
};

/// Connector whose sessions are driven through channels.
pub struct ScriptedConnector {
    peers: mpsc::UnboundedSender<ScriptedPeer>,
    fail_next: Mutex<Option<ConnectError>>,
}

impl ScriptedConnector {
    /// Create the connector and the receiver of its peers.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ScriptedPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        (
            Self {
                peers,
                fail_next: Mutex::new(None),
            },
            rx,
        )
    }

    /// Make the next connect fail with `error`.
    pub fn fail_next_connect(&self, error: ConnectError) {
        *self.fail_next.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
    }
}

#[async_trait]
impl RemoteConnector for ScriptedConnector {
    async fn connect(
        &self,
        session: RemoteSession,
        events: EventSender,
    ) -> Result<RemoteHandle, ConnectError> {
        if let Some(error) = self
            .fail_next
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            return Err(error);
        }

        let (handle, outbound) = RemoteHandle::new(events.session());
        events.emit(RemoteEvent::Start);
        self.peers
            .send(ScriptedPeer {
                session,
                events,
                outbound,
            })
            .map_err(|_| ConnectError::ConnectionRefused("scripted peer dropped".into()))?;
        Ok(handle)
    }
}

/// The service side of one scripted session.
pub struct ScriptedPeer {
    pub session: RemoteSession,
    pub events: EventSender,
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
}

impl ScriptedPeer {
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.events.session()
    }

    pub fn begin(&self, lines: &[&str]) {
        self.events
            .emit(RemoteEvent::Begin(lines.iter().map(|s| (*s).to_owned()).collect()));
    }

    pub fn data(&self, text: &str) {
        self.events.emit(RemoteEvent::Data(text.to_owned()));
    }

    pub fn header(&self, name: &str) {
        self.events.emit(RemoteEvent::BinaryHeader(BinaryHeader {
            name: name.to_owned(),
            size: None,
        }));
    }

    /// Finish the service, declaring `manifest` as output files.
    pub fn stop(&self, manifest: &[&str]) {
        self.events
            .emit(RemoteEvent::Stop(manifest.iter().map(|s| (*s).to_owned()).collect()));
    }

    /// End the transport, with `error` if it failed.
    pub fn closed(&self, error: Option<TransportError>) {
        self.events.emit(RemoteEvent::Closed(error));
    }

    /// Outbound frames sent so far, without waiting.
    pub fn drain_outbound(&mut self) -> Vec<Outbound> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.outbound.try_recv() {
            frames.push(frame);
        }
        frames
    }
}
