//! End-to-end: lifecycle, real TCP listener, hub and relay together.

use iorelay_protocol::{encode_line, ClientMessage, ErrorCode, RelayEvent, ServerMessage};
use iorelay_server::{
    AuthGate, BruteForceGuard, Capabilities, ConnectivityState, LifecycleError, LifecycleState,
    PasswordValidator, ServerLifecycle, ServerSettings, SessionStore, SocketHubFactory,
};
use serde_json::json;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

struct Relay {
    lifecycle: ServerLifecycle,
    connectivity: ConnectivityState,
}

fn relay(settings: ServerSettings) -> Relay {
    let validator = PasswordValidator::new([("Admin", PasswordValidator::hash_password("hunter2"))]);
    let gate = Arc::new(AuthGate::new(
        Arc::new(BruteForceGuard::new()),
        Arc::new(validator),
    ));
    let sessions = Arc::new(SessionStore::new(settings.ttl));
    let connectivity = ConnectivityState::new();
    let hubs = SocketHubFactory::new(gate, sessions, Arc::new(connectivity.clone()));
    let caps = Capabilities::standard(Arc::new(connectivity.clone()), Arc::new(hubs));
    Relay {
        lifecycle: ServerLifecycle::new(settings, caps),
        connectivity,
    }
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn local_settings(port: u16, auth: bool) -> ServerSettings {
    let mut settings = ServerSettings::new(port);
    settings.bind = Some(IpAddr::V4(Ipv4Addr::LOCALHOST));
    settings.auth = auth;
    settings
}

struct Client {
    lines: tokio::io::Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, writer) = stream.into_split();
        let mut client = Self {
            lines: BufReader::new(read).lines(),
            writer,
        };
        match client.recv().await {
            ServerMessage::Hello { .. } => {}
            other => panic!("expected hello, got {:?}", other),
        }
        client
    }

    async fn send(&mut self, message: &ClientMessage) {
        self.writer
            .write_all(&encode_line(message).unwrap())
            .await
            .unwrap();
    }

    async fn recv(&mut self) -> ServerMessage {
        let line = timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("timed out")
            .unwrap()
            .expect("connection closed");
        serde_json::from_str(&line).unwrap()
    }

    async fn login(&mut self, user: &str, password: &str) -> ServerMessage {
        self.send(&ClientMessage::Auth {
            user: user.into(),
            password: password.into(),
        })
        .await;
        self.recv().await
    }
}

#[tokio::test]
async fn test_authenticated_relay() {
    let port = free_port().await;
    let relay = relay(local_settings(port, true));
    let events = relay.lifecycle.relay();

    // Nothing is listening yet.
    assert!(!events.dispatch(&RelayEvent::LogEntry {
        payload: json!("too early")
    }));

    let addr = relay.lifecycle.start().await.unwrap();
    assert_eq!(addr.port(), port);
    assert!(relay.connectivity.is_connected());

    let mut watcher = Client::connect(addr).await;
    let mut client = Client::connect(addr).await;

    match client.login("admin", "wrong").await {
        ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::AuthFailed),
        other => panic!("expected AUTH_FAILED, got {:?}", other),
    }
    match client.login(" ADMIN", "hunter2").await {
        ServerMessage::AuthOk {
            identity, token, ..
        } => {
            assert_eq!(identity, "admin");
            assert!(token.is_some());
        }
        other => panic!("expected auth_ok, got {:?}", other),
    }
    assert_eq!(relay.connectivity.connected_clients(), vec!["admin".to_string()]);

    let event = RelayEvent::ObjectChanged {
        id: "system.adapter.admin.0".into(),
        object: json!({"common": {"enabled": true}}),
    };
    assert!(events.dispatch(&event));
    match client.recv().await {
        ServerMessage::Event { event: received } => assert_eq!(received, event),
        other => panic!("expected event, got {:?}", other),
    }

    // The watcher never logged in and must not see the event.
    assert!(
        timeout(Duration::from_millis(200), watcher.lines.next_line())
            .await
            .is_err()
    );

    let completions = AtomicUsize::new(0);
    relay
        .lifecycle
        .shutdown(|| {
            completions.fetch_add(1, Ordering::SeqCst);
        })
        .await;
    assert_eq!(completions.load(Ordering::SeqCst), 1);
    assert_eq!(relay.lifecycle.current_state(), LifecycleState::Stopped);
    assert!(!relay.connectivity.is_connected());
    assert!(relay.connectivity.connected_clients().is_empty());

    match client.recv().await {
        ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::ShuttingDown),
        other => panic!("expected shutdown notice, got {:?}", other),
    }
}

#[tokio::test]
async fn test_lockout_after_repeated_failures() {
    let port = free_port().await;
    let relay = relay(local_settings(port, true));
    let addr = relay.lifecycle.start().await.unwrap();

    let mut client = Client::connect(addr).await;
    for _ in 0..5 {
        match client.login("Admin", "nope").await {
            ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::AuthFailed),
            other => panic!("expected AUTH_FAILED, got {:?}", other),
        }
    }

    // Even the right password is refused while locked.
    match client.login("admin", "hunter2").await {
        ServerMessage::Error {
            code,
            retry_after_minutes,
            message,
            ..
        } => {
            assert_eq!(code, ErrorCode::AuthLocked);
            assert_eq!(retry_after_minutes, Some(1));
            assert_eq!(message, "Too many errors. Try again in 1 minute.");
        }
        other => panic!("expected AUTH_LOCKED, got {:?}", other),
    }

    relay.lifecycle.shutdown(|| {}).await;
}

#[tokio::test]
async fn test_strict_port_conflict_is_fatal() {
    let held = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let busy = held.local_addr().unwrap().port();

    let relay = relay(local_settings(busy, false));
    match relay.lifecycle.start().await {
        Err(e @ LifecycleError::PortInUse { .. }) => assert_eq!(e.exit_code(), 11),
        other => panic!("expected PortInUse, got {:?}", other),
    }
    assert!(!relay.connectivity.is_connected());
}

#[tokio::test]
async fn test_find_next_port() {
    let held = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let busy = held.local_addr().unwrap().port();

    let mut settings = local_settings(busy, false);
    settings.find_next_port = true;
    let relay = relay(settings);

    let addr = relay.lifecycle.start().await.unwrap();
    assert_ne!(addr.port(), busy);
    assert_eq!(relay.lifecycle.settings().port, addr.port());

    let mut client = Client::connect(addr).await;
    client.send(&ClientMessage::Ping).await;
    assert_eq!(client.recv().await, ServerMessage::Pong);

    relay.lifecycle.shutdown(|| {}).await;
}
