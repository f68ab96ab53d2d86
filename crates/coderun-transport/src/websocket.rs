//! WebSocket client transport for remote services.

use std::{io, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message, client::IntoClientRequest},
};

use crate::{
    channel::{
        BinaryHeader, ConnectError, EventSender, Outbound, RemoteConnector, RemoteEvent,
        RemoteHandle, RemoteSession, TransportError,
    },
    protocol::{ClientMessage, ServerMessage},
};

/// Default time allowed for the websocket handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connects to a remote service over a websocket.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    timeout: Duration,
}

impl WsConnector {
    /// Create a connector for `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Override the handshake timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl RemoteConnector for WsConnector {
    async fn connect(
        &self,
        session: RemoteSession,
        events: EventSender,
    ) -> Result<RemoteHandle, ConnectError> {
        let request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectError::InvalidEndpoint(format!("{}: {e}", self.url)))?;

        let (socket, _response) = match tokio::time::timeout(self.timeout, connect_async(request)).await {
            Err(_) => return Err(ConnectError::Timeout(self.timeout)),
            Ok(Err(e)) => return Err(map_connect_error(&self.url, e)),
            Ok(Ok(pair)) => pair,
        };
        let (mut sink, stream) = socket.split();
        events.emit(RemoteEvent::Start);

        let hello = serde_json::to_string(&ClientMessage::connect(&session))
            .map_err(|e| ConnectError::Handshake(e.to_string()))?;
        sink.send(Message::text(hello))
            .await
            .map_err(|e| ConnectError::Handshake(e.to_string()))?;
        tracing::info!(
            session = %events.session(),
            problem = %session.problem,
            service = %session.service,
            files = session.files.len(),
            "Remote session opened"
        );

        let (handle, outbound) = RemoteHandle::new(events.session());
        let (written, write_outcome) = oneshot::channel();

        tokio::spawn(write_loop(sink, outbound, written));
        tokio::spawn(read_loop(stream, events, write_outcome));

        Ok(handle)
    }
}

fn map_connect_error(url: &str, err: WsError) -> ConnectError {
    match err {
        WsError::Io(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
            ConnectError::ConnectionRefused(url.to_owned())
        }
        WsError::Url(e) => ConnectError::InvalidEndpoint(format!("{url}: {e}")),
        other => ConnectError::Handshake(other.to_string()),
    }
}

/// Drain outbound frames into the socket. Ends the session through
/// `done`, carrying the send failure if there was one.
async fn write_loop<S>(
    mut sink: S,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    done: oneshot::Sender<Option<TransportError>>,
) where
    S: futures::Sink<Message, Error = WsError> + Unpin,
{
    let mut error = None;
    while let Some(frame) = outbound.recv().await {
        match frame {
            Outbound::Data(text) => match sink.send(Message::Binary(Bytes::from(text.into_bytes()))).await {
                Ok(()) => {}
                Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => break,
                Err(e) => {
                    tracing::error!("Failed to send to remote: {e}");
                    error = Some(TransportError::WebSocket(e.to_string()));
                    break;
                }
            },
            Outbound::Close => break,
        }
    }
    // Every handle dropped, close requested or the socket failed.
    if error.is_none() {
        let _ = sink.send(Message::Close(None)).await;
    }
    let _ = done.send(error);
}

async fn read_loop<S>(
    mut stream: S,
    events: EventSender,
    mut write_outcome: oneshot::Receiver<Option<TransportError>>,
) where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let error = loop {
        tokio::select! {
            outcome = &mut write_outcome => break outcome.ok().flatten(),
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ServerMessage>(text.as_str()) {
                        Ok(ServerMessage::Error { message }) => {
                            break Some(TransportError::Remote(message));
                        }
                        Ok(message) => {
                            events.emit(to_event(message));
                        }
                        Err(e) => tracing::warn!("Invalid server message: {e}"),
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    events.emit(RemoteEvent::Data(String::from_utf8_lossy(&data).into_owned()));
                }
                Some(Ok(Message::Close(_))) | None => break None,
                Some(Ok(_)) => {}
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => break None,
                Some(Err(e)) => {
                    tracing::error!(session = %events.session(), "WebSocket error: {e}");
                    break Some(TransportError::WebSocket(e.to_string()));
                }
            },
        }
    };
    tracing::info!(session = %events.session(), ?error, "Remote session closed");
    events.emit(RemoteEvent::Closed(error));
}

fn to_event(message: ServerMessage) -> RemoteEvent {
    match message {
        ServerMessage::ConnectBegin { message } => RemoteEvent::Begin(message),
        ServerMessage::BinaryDataHeader { name, size } => {
            RemoteEvent::BinaryHeader(BinaryHeader { name, size })
        }
        ServerMessage::ConnectStop { message } => RemoteEvent::Stop(message),
        ServerMessage::Error { message } => RemoteEvent::Closed(Some(TransportError::Remote(message))),
    }
}

#[cfg(test)]
mod tests {
    use futures::{sink, stream};
    use uuid::Uuid;

    use super::*;

    #[tokio::test]
    async fn test_send_failure_closes_with_error() {
        let session = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (handle, outbound) = RemoteHandle::new(session);
        let (written, write_outcome) = oneshot::channel();

        let broken = Box::pin(sink::unfold((), |(), _: Message| async {
            Err::<(), WsError>(WsError::Io(io::Error::from(io::ErrorKind::BrokenPipe)))
        }));
        tokio::spawn(write_loop(broken, outbound, written));
        tokio::spawn(read_loop(
            stream::pending::<Result<Message, WsError>>(),
            EventSender::new(session, tx),
            write_outcome,
        ));

        tokio_test::assert_ok!(handle.send_binary("2+2=\n"));
        let envelope = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            envelope.event,
            RemoteEvent::Closed(Some(TransportError::WebSocket(_)))
        ));
    }

    #[tokio::test]
    async fn test_requested_close_is_clean() {
        let session = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (handle, outbound) = RemoteHandle::new(session);
        let (written, write_outcome) = oneshot::channel();

        tokio::spawn(write_loop(
            sink::drain::<Message>().sink_map_err(|e| -> WsError { match e {} }),
            outbound,
            written,
        ));
        tokio::spawn(read_loop(
            stream::pending::<Result<Message, WsError>>(),
            EventSender::new(session, tx),
            write_outcome,
        ));

        handle.close_connection();
        let envelope = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.event, RemoteEvent::Closed(None));
    }
}
