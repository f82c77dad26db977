//! Realtime transport against a local WebSocket server

use crate::{assert_consistent, assert_ok};
use crate::common::*;
use assert_matches::assert_matches;
use cartsync::broadcast::PlatformCapabilities;
use cartsync::realtime::{EventSourceTransport, RealtimeTransport, TransportEvent, WebSocketTransport};
use cartsync::session::{CartSession, ConnectionStatus, SessionParts};
use cartsync::shared::config::TransportConfig;
use cartsync::shared::{ServerEvent, TransportError};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

/// Serves one connection. Text frames from the client come out of the
/// receiver; frames pushed into the sender go to the client.
async fn spawn_server() -> (String, mpsc::UnboundedReceiver<String>, mpsc::UnboundedSender<Message>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws/cart", listener.local_addr().unwrap());
    let (from_client_tx, from_client_rx) = mpsc::unbounded_channel();
    let (to_client_tx, mut to_client_rx) = mpsc::unbounded_channel::<Message>();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        drop(listener);
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let (mut sink, mut source) = ws.split();
        loop {
            tokio::select! {
                frame = source.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        let _ = from_client_tx.send(text);
                    }
                    Some(Ok(_)) => {}
                    _ => break,
                },
                outgoing = to_client_rx.recv() => match outgoing {
                    Some(message) => {
                        if sink.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    });

    (url, from_client_rx, to_client_tx)
}

/// Answers one request with a `text/event-stream` carrying `events`, then
/// keeps the connection open
async fn spawn_event_stream(events: Vec<ServerEvent>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/events/s1", listener.local_addr().unwrap());

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                return;
            }
            request.extend_from_slice(&buf[..n]);
        }
        stream
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ncache-control: no-cache\r\n\r\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        for event in events {
            let frame = format!("event: cart\ndata: {}\n\n", serde_json::to_string(&event).unwrap());
            stream.write_all(frame.as_bytes()).await.unwrap();
        }
        stream.flush().await.unwrap();
        std::future::pending::<()>().await;
    });

    url
}

/// Address nothing listens on
async fn refused_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{}/ws/cart", addr)
}

fn fast_config() -> TransportConfig {
    TransportConfig {
        reconnect_interval: Duration::from_millis(50),
        max_reconnect_attempts: 2,
        handshake_timeout: Duration::from_secs(2),
        ..TransportConfig::default()
    }
}

async fn next_event(events: &mut broadcast::Receiver<TransportEvent>) -> TransportEvent {
    timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap()
}

fn push(event: &ServerEvent) -> Message {
    Message::Text(serde_json::to_string(event).unwrap())
}

#[tokio::test]
async fn test_subscribes_and_delivers_server_events() {
    let (url, mut from_client, to_client) = spawn_server().await;
    let transport = WebSocketTransport::new(url, fast_config());
    transport.subscribe_session("s1");
    let mut events = transport.subscribe();

    assert_ok!(transport.connect().await);
    assert!(transport.is_connected());
    assert_eq!(next_event(&mut events).await, TransportEvent::Opened);

    let subscribe = timeout(Duration::from_secs(2), from_client.recv()).await.unwrap().unwrap();
    let subscribe: serde_json::Value = serde_json::from_str(&subscribe).unwrap();
    assert_eq!(subscribe["type"], "SUBSCRIBE");
    assert_eq!(subscribe["sessionId"], "s1");

    let event = ServerEvent::CartUpdated {
        session_id: "s1".into(),
        cart: cart_with("s1", &[("book", 2)]),
    };
    to_client.send(push(&event)).unwrap();
    assert_eq!(next_event(&mut events).await, TransportEvent::Message(event));

    // Garbage is dropped without ending the connection
    to_client.send(Message::Text("{not json".into())).unwrap();
    to_client
        .send(push(&ServerEvent::CartCleared { session_id: "s1".into() }))
        .unwrap();
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::Message(ServerEvent::CartCleared { session_id: "s1".into() })
    );

    transport.close().await;
    assert!(!transport.is_connected());
}

#[tokio::test]
async fn test_normal_close_from_server_does_not_reconnect() {
    let (url, _from_client, to_client) = spawn_server().await;
    let transport = WebSocketTransport::new(url, fast_config());
    let mut events = transport.subscribe();
    assert_ok!(transport.connect().await);
    assert_eq!(next_event(&mut events).await, TransportEvent::Opened);

    to_client
        .send(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        })))
        .unwrap();
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::Closed {
            code: Some(1000),
            reason: "bye".into()
        }
    );

    let more = timeout(Duration::from_millis(300), events.recv()).await;
    assert!(more.is_err(), "unexpected event after normal close: {more:?}");
    assert!(!transport.is_connected());
}

#[tokio::test]
async fn test_abnormal_close_reconnects() {
    let (url, _from_client, to_client) = spawn_server().await;
    let transport = WebSocketTransport::new(url, fast_config());
    let mut events = transport.subscribe();
    assert_ok!(transport.connect().await);
    assert_eq!(next_event(&mut events).await, TransportEvent::Opened);

    to_client
        .send(Message::Close(Some(CloseFrame {
            code: CloseCode::Away,
            reason: "restarting".into(),
        })))
        .unwrap();

    // The test server only accepts once, so reconnection runs out of attempts.
    let mut saw_reconnecting = false;
    loop {
        match next_event(&mut events).await {
            TransportEvent::Reconnecting { .. } => saw_reconnecting = true,
            TransportEvent::MaxAttemptsReached { attempts } => {
                assert_eq!(attempts, 2);
                break;
            }
            _ => {}
        }
    }
    assert!(saw_reconnecting);
    transport.close().await;
}

#[tokio::test]
async fn test_session_adopts_pushed_cart() {
    let (url, _from_client, to_client) = spawn_server().await;
    let transport: Arc<dyn RealtimeTransport> = Arc::new(WebSocketTransport::new(url, fast_config()));
    let parts = SessionParts {
        api: FakeCartApi::new(),
        store: memory_store(),
        capabilities: PlatformCapabilities::default(),
        transport: Some(transport),
        fallback: None,
    };
    let session = CartSession::new(test_config("s1"), parts).unwrap();
    let mut status = session.watch();

    assert_ok!(session.connect().await);
    wait_for_status(&mut status, Duration::from_secs(2), |s| {
        s.is_connected && s.connection_status == ConnectionStatus::Connected
    })
    .await;

    let other_session = ServerEvent::CartUpdated {
        session_id: "someone-else".into(),
        cart: cart_with("someone-else", &[("pen", 9)]),
    };
    to_client.send(push(&other_session)).unwrap();
    let event = ServerEvent::ItemAdded {
        session_id: "s1".into(),
        product_id: "book".into(),
        quantity: 2,
        cart: cart_with("s1", &[("book", 2)]),
    };
    to_client.send(push(&event)).unwrap();

    let updated = wait_for_status(&mut status, Duration::from_secs(2), |s| s.cart.quantity_of("book") == 2).await;
    assert_eq!(updated.cart.quantity_of("pen"), 0);
    assert!(updated.last_sync_time.is_some());

    session.shutdown().await;
    assert!(!session.is_connected());
}

#[tokio::test]
async fn test_silent_server_is_dropped_after_two_heartbeats() {
    let (url, mut from_client, _to_client) = spawn_server().await;
    let config = TransportConfig {
        heartbeat_interval: Duration::from_millis(100),
        ..fast_config()
    };
    let transport = WebSocketTransport::new(url, config);
    let mut events = transport.subscribe();
    assert_ok!(transport.connect().await);
    assert_eq!(next_event(&mut events).await, TransportEvent::Opened);
    let opened = Instant::now();

    let ping = timeout(Duration::from_secs(2), from_client.recv()).await.unwrap().unwrap();
    let ping: serde_json::Value = serde_json::from_str(&ping).unwrap();
    assert_eq!(ping["type"], "PING");

    let error = loop {
        if let TransportEvent::Error(error) = next_event(&mut events).await {
            break error;
        }
    };
    assert_eq!(error, TransportError::HeartbeatTimeout(Duration::from_millis(200)));
    assert!(opened.elapsed() >= Duration::from_millis(150));
    assert_matches!(next_event(&mut events).await, TransportEvent::Closed { code: None, .. });
    assert!(!transport.is_connected());
    assert_matches!(next_event(&mut events).await, TransportEvent::Reconnecting { attempt: 1 });

    transport.close().await;
}

#[tokio::test]
async fn test_session_falls_back_to_event_stream() {
    let pushed = ServerEvent::CartUpdated {
        session_id: "s1".into(),
        cart: cart_with("s1", &[("book", 2)]),
    };
    let events_url = spawn_event_stream(vec![pushed]).await;
    let transport: Arc<dyn RealtimeTransport> = Arc::new(WebSocketTransport::new(refused_url().await, fast_config()));
    let fallback: Arc<dyn RealtimeTransport> = Arc::new(EventSourceTransport::new(events_url, fast_config()));
    let parts = SessionParts {
        api: FakeCartApi::new(),
        store: memory_store(),
        capabilities: PlatformCapabilities::default(),
        transport: Some(transport),
        fallback: Some(Arc::clone(&fallback)),
    };
    let session = CartSession::new(test_config("s1"), parts).unwrap();
    let mut status = session.watch();

    assert!(session.connect().await.is_err());
    let settled = wait_for_status(&mut status, Duration::from_secs(5), |s| {
        s.connection_status == ConnectionStatus::Fallback && s.cart.quantity_of("book") == 2
    })
    .await;

    assert!(settled.is_connected);
    assert!(fallback.is_connected());
    assert_consistent!(settled.cart);

    session.shutdown().await;
    assert!(!fallback.is_connected());
}
