//! WebSocket transport against a local service.

use std::{collections::BTreeMap, net::SocketAddr, time::Duration};

use axum::{
    Router,
    body::Bytes,
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use coderun_transport::{
    BinaryHeader, ClientMessage, ConnectError, EventSender, RemoteConnector, RemoteEnvelope,
    RemoteEvent, RemoteSession, ServerMessage, TransportError, WsConnector,
};
use tokio::sync::mpsc;
use uuid::Uuid;

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn send_json(socket: &mut WebSocket, message: &ServerMessage) {
    let json = serde_json::to_string(message).unwrap();
    socket.send(Message::Text(json.into())).await.unwrap();
}

/// Greets, asks a question, then returns one output file.
async fn grader(mut socket: WebSocket) {
    let Some(Ok(Message::Text(text))) = socket.recv().await else {
        return;
    };
    let hello: ClientMessage = serde_json::from_str(text.as_str()).unwrap();
    let ClientMessage::Connect { problem, .. } = &hello;
    let input = String::from_utf8(hello.decode_files()["input"].clone()).unwrap();

    send_json(
        &mut socket,
        &ServerMessage::ConnectBegin {
            message: vec![format!("welcome to {problem}"), input],
        },
    )
    .await;
    socket
        .send(Message::Binary(Bytes::from_static(b"2+2=\n")))
        .await
        .unwrap();

    let answer = loop {
        match socket.recv().await {
            Some(Ok(Message::Binary(data))) => break data,
            Some(Ok(_)) => {}
            _ => return,
        }
    };

    send_json(
        &mut socket,
        &ServerMessage::ConnectStop {
            message: vec!["result.txt".into()],
        },
    )
    .await;
    send_json(
        &mut socket,
        &ServerMessage::BinaryDataHeader {
            name: "result.txt".into(),
            size: None,
        },
    )
    .await;
    socket
        .send(Message::Binary(Bytes::from_static(b"answer=")))
        .await
        .unwrap();
    socket.send(Message::Binary(answer)).await.unwrap();
    let _ = socket.send(Message::Close(None)).await;
}

/// Reads until the client goes away.
async fn idle(mut socket: WebSocket) {
    while let Some(Ok(message)) = socket.recv().await {
        if matches!(message, Message::Close(_)) {
            break;
        }
    }
}

async fn rejecting(mut socket: WebSocket) {
    let _ = socket.recv().await;
    send_json(
        &mut socket,
        &ServerMessage::Error {
            message: "invalid token".into(),
        },
    )
    .await;
    let _ = socket.recv().await;
}

fn route<F, Fut>(handler: F) -> Router
where
    F: Fn(WebSocket) -> Fut + Clone + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Router::new().route(
        "/",
        get(move |ws: WebSocketUpgrade| {
            let handler = handler.clone();
            async move { ws.on_upgrade(handler).into_response() }
        }),
    )
}

async fn next(rx: &mut mpsc::UnboundedReceiver<RemoteEnvelope>) -> RemoteEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out")
        .expect("closed")
        .event
}

fn session() -> RemoteSession {
    RemoteSession {
        problem: "sum".into(),
        service: "eval".into(),
        args: vec!["size=small".into()],
        token: Some("secret".into()),
        files: BTreeMap::from([("input".to_owned(), "1 2".to_owned())]),
        tty: false,
    }
}

#[tokio::test]
async fn test_full_session() {
    let addr = serve(route(grader)).await;
    let connector = WsConnector::new(format!("ws://{addr}/"));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = Uuid::new_v4();

    let handle = connector
        .connect(session(), EventSender::new(id, tx))
        .await
        .unwrap();
    assert_eq!(handle.id(), id);

    assert_eq!(next(&mut rx).await, RemoteEvent::Start);
    assert_eq!(
        next(&mut rx).await,
        RemoteEvent::Begin(vec!["welcome to sum".into(), "1 2".into()])
    );
    assert_eq!(next(&mut rx).await, RemoteEvent::Data("2+2=\n".into()));

    handle.send_binary("4\n").unwrap();

    assert_eq!(next(&mut rx).await, RemoteEvent::Stop(vec!["result.txt".into()]));
    assert_eq!(
        next(&mut rx).await,
        RemoteEvent::BinaryHeader(BinaryHeader {
            name: "result.txt".into(),
            size: None
        })
    );
    assert_eq!(next(&mut rx).await, RemoteEvent::Data("answer=".into()));
    assert_eq!(next(&mut rx).await, RemoteEvent::Data("4\n".into()));
    assert_eq!(next(&mut rx).await, RemoteEvent::Closed(None));
}

#[tokio::test]
async fn test_close_reports_once() {
    let addr = serve(route(idle)).await;
    let connector = WsConnector::new(format!("ws://{addr}/"));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let handle = connector
        .connect(session(), EventSender::new(Uuid::new_v4(), tx))
        .await
        .unwrap();
    assert_eq!(next(&mut rx).await, RemoteEvent::Start);

    handle.close_connection();
    handle.close_connection();

    assert_eq!(next(&mut rx).await, RemoteEvent::Closed(None));
    let extra = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(!matches!(extra, Ok(Some(_))));
    assert_eq!(handle.send_binary("late"), Err(TransportError::Closed));
}

#[tokio::test]
async fn test_remote_error_closes_session() {
    let addr = serve(route(rejecting)).await;
    let connector = WsConnector::new(format!("ws://{addr}/"));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let _handle = connector
        .connect(session(), EventSender::new(Uuid::new_v4(), tx))
        .await
        .unwrap();
    assert_eq!(next(&mut rx).await, RemoteEvent::Start);
    assert_eq!(
        next(&mut rx).await,
        RemoteEvent::Closed(Some(TransportError::Remote("invalid token".into())))
    );
}

#[tokio::test]
async fn test_connection_refused() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let connector = WsConnector::new(format!("ws://{addr}/"));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let result = connector
        .connect(session(), EventSender::new(Uuid::new_v4(), tx))
        .await;

    assert!(matches!(result, Err(ConnectError::ConnectionRefused(_))));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_invalid_endpoint() {
    let connector = WsConnector::new("not a url");
    let (tx, _rx) = mpsc::unbounded_channel();
    let result = connector
        .connect(session(), EventSender::new(Uuid::new_v4(), tx))
        .await;
    assert!(matches!(result, Err(ConnectError::InvalidEndpoint(_))));
}
