//! Transport hub: live client connections and event fan-out.
//!
//! The [`SocketHub`] owns every connection accepted by the lifecycle. Each
//! connection speaks line-delimited JSON: the server greets with `hello`,
//! the client logs in (or resumes a session token) and from then on receives
//! every relayed event as an `event` line. Events are encoded once per
//! publish and shared across connections through a broadcast channel.
//!
//! A connection subscribes to that channel only after it is authenticated,
//! so unauthenticated peers never observe events and nothing is replayed to
//! late joiners.

use crate::auth::{AuthError, AuthGate, Identity};
use crate::error::ServerError;
use crate::listener::Incoming;
use crate::metrics::Metrics;
use crate::session::{Session, SessionStore};
use crate::settings::ServerSettings;
use crate::state::ConnectionStateSink;
use crate::stream::MaybeTlsStream;
use dashmap::DashMap;
use iorelay_protocol::{
    encode_line, ClientMessage, ErrorCode, LineDecoder, ProtocolError, RelayEvent, ServerMessage,
    PROTOCOL_VERSION,
};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast;

/// Default event channel capacity.
const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Receives relayed events and owns client connections.
pub trait TransportHub: Send + Sync {
    fn publish_object_change(&self, id: &str, object: &Value);

    fn publish_state_change(&self, id: &str, state: &Value);

    fn publish_file_change(&self, id: &str, file_name: &str, size: Option<u64>);

    /// `socket_id` restricts delivery to one connection.
    fn publish_instance_message(
        &self,
        from_id: &str,
        message_type: &str,
        socket_id: Option<&str>,
        data: &Value,
    );

    fn publish_log(&self, entry: &Value);

    /// Takes ownership of a newly accepted connection.
    fn attach(self: Arc<Self>, incoming: Incoming, addr: SocketAddr);

    /// Whether the hub accepts publishes and connections.
    fn is_ready(&self) -> bool;

    /// Disconnects every client. Publishing afterwards is a no-op.
    fn close(&self) -> Result<(), ServerError>;
}

/// Creates the hub once the listener is up.
pub trait HubFactory: Send + Sync {
    fn create(&self, settings: &ServerSettings) -> Arc<dyn TransportHub>;
}

/// One encoded event line, optionally addressed to a single connection.
#[derive(Debug)]
struct Frame {
    target: Option<String>,
    bytes: Vec<u8>,
}

/// Line-delimited JSON hub over TCP or TLS.
pub struct SocketHub {
    gate: Arc<AuthGate>,
    sessions: Arc<SessionStore>,
    state: Arc<dyn ConnectionStateSink>,
    metrics: Option<Arc<Metrics>>,
    events: broadcast::Sender<Arc<Frame>>,
    shutdown: broadcast::Sender<()>,
    /// Session id to display name, for every connection receiving events.
    clients: DashMap<String, String>,
    closed: AtomicBool,
    active: AtomicUsize,
    auth_required: bool,
    max_connections: usize,
    idle_timeout: Duration,
}

impl SocketHub {
    pub fn new(
        settings: &ServerSettings,
        gate: Arc<AuthGate>,
        sessions: Arc<SessionStore>,
        state: Arc<dyn ConnectionStateSink>,
    ) -> Self {
        let (events, _) = broadcast::channel(DEFAULT_EVENT_CAPACITY);
        let (shutdown, _) = broadcast::channel(1);
        Self {
            gate,
            sessions,
            state,
            metrics: None,
            events,
            shutdown,
            clients: DashMap::new(),
            closed: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            auth_required: settings.auth,
            max_connections: settings.max_connections,
            idle_timeout: settings.idle_timeout,
        }
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Number of open connections, authenticated or not.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Display names of connections currently receiving events.
    pub fn connected_clients(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clients.iter().map(|e| e.value().clone()).collect();
        names.sort();
        names
    }

    fn publish(&self, target: Option<&str>, event: RelayEvent) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let kind = event.kind();
        let bytes = match encode_line(&ServerMessage::Event { event }) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Failed to encode {} event: {}", kind.as_str(), e);
                return;
            }
        };
        let frame = Arc::new(Frame {
            target: target.map(str::to_string),
            bytes,
        });
        // No receivers simply means nobody is logged in.
        let delivered = self.events.send(frame).unwrap_or(0);
        tracing::trace!("Relayed {} event to {} connection(s)", kind.as_str(), delivered);
    }

    fn register_client(&self, session: &Session) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.clients
            .insert(session.id.clone(), session.display_name());
        self.report_clients();
    }

    fn unregister_client(&self, session: &Session) {
        if self.clients.remove(&session.id).is_some() && !self.closed.load(Ordering::Acquire) {
            self.report_clients();
        }
    }

    fn report_clients(&self) {
        self.state.set_connected_clients(&self.connected_clients());
    }

    async fn serve(
        self: Arc<Self>,
        incoming: Incoming,
        addr: SocketAddr,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let stream = tokio::select! {
            result = incoming.establish() => match result {
                Ok(stream) => Some(stream),
                Err(e) => {
                    tracing::warn!("[{}] {}", addr, e);
                    None
                }
            },
            _ = shutdown.recv() => None,
        };

        if let Some(stream) = stream {
            tracing::info!("Client connected: {} ({})", addr, stream.transport());
            let mut session = Session::new(addr, self.auth_required);
            let result = self
                .handle_connection(stream, &mut session, &mut shutdown)
                .await;
            if let Err(e) = result {
                tracing::debug!("Connection {} error: {}", addr, e);
            }
            self.unregister_client(&session);
            tracing::info!(
                "Client disconnected: {} ({} requests, {:?})",
                session.display_name(),
                session.request_count(),
                session.age()
            );
        }

        self.active.fetch_sub(1, Ordering::Relaxed);
        if let Some(ref metrics) = self.metrics {
            metrics.connections_active.dec();
        }
    }

    async fn handle_connection(
        &self,
        mut stream: MaybeTlsStream,
        session: &mut Session,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let addr = session.remote_addr;
        let mut decoder = LineDecoder::new();
        let mut buf = [0u8; 8192];
        let mut events: Option<broadcast::Receiver<Arc<Frame>>> = None;
        let mut last_activity = Instant::now();

        write_message(
            &mut stream,
            &ServerMessage::Hello {
                protocol_version: PROTOCOL_VERSION,
                session_id: session.id.clone(),
                auth_required: self.auth_required,
            },
        )
        .await?;

        if session.is_authenticated() {
            events = Some(self.events.subscribe());
            self.register_client(session);
        }

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    tracing::debug!("[{}] Shutdown signal received", addr);
                    let message = ServerMessage::error(ErrorCode::ShuttingDown, "server shutting down");
                    let _ = write_message(&mut stream, &message).await;
                    return Err(ServerError::ShuttingDown);
                }

                frame = next_frame(&mut events) => {
                    match frame {
                        Ok(frame) => {
                            if frame.target.as_deref().map_or(true, |t| t == session.id) {
                                let write = stream.write_all(&frame.bytes);
                                match tokio::time::timeout(self.idle_timeout, write).await {
                                    Ok(result) => result?,
                                    Err(_) => {
                                        tracing::warn!("[{}] Client stopped reading, dropping connection", addr);
                                        return Ok(());
                                    }
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!("[{}] Lagged {} events", addr, n);
                        }
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    }
                }

                result = stream.read(&mut buf) => {
                    match result {
                        Ok(0) => {
                            tracing::debug!("[{}] Connection closed by client", addr);
                            return Ok(());
                        }
                        Ok(n) => {
                            last_activity = Instant::now();
                            decoder.extend(&buf[..n]);
                        }
                        Err(e) => return Err(ServerError::Io(e)),
                    }
                }

                _ = tokio::time::sleep(self.idle_timeout) => {
                    if last_activity.elapsed() >= self.idle_timeout {
                        tracing::debug!("[{}] Idle timeout", addr);
                        return Ok(());
                    }
                }
            }

            loop {
                let message = match decoder.decode_line::<ClientMessage>() {
                    Ok(Some(message)) => message,
                    Ok(None) => break,
                    Err(e @ ProtocolError::LineTooLarge { .. }) => {
                        let reply = ServerMessage::error(ErrorCode::BadRequest, e.to_string());
                        let _ = write_message(&mut stream, &reply).await;
                        return Err(e.into());
                    }
                    Err(e) => {
                        tracing::debug!("[{}] Bad request: {}", addr, e);
                        let reply = ServerMessage::error(ErrorCode::BadRequest, e.to_string());
                        write_message(&mut stream, &reply).await?;
                        continue;
                    }
                };

                session.record_request();
                match message {
                    ClientMessage::Ping => {
                        write_message(&mut stream, &ServerMessage::Pong).await?;
                    }
                    ClientMessage::Bye => {
                        if let Some(token) = session.take_token() {
                            self.sessions.revoke(&token);
                        }
                        session.close();
                        return Ok(());
                    }
                    ClientMessage::Auth { user, password } => {
                        let reply = self
                            .login(session, &mut events, &user, &password)
                            .await;
                        write_message(&mut stream, &reply).await?;
                    }
                    ClientMessage::Resume { token } => {
                        let reply = self.resume(session, &mut events, &token);
                        write_message(&mut stream, &reply).await?;
                    }
                }
            }
        }
    }

    async fn login(
        &self,
        session: &mut Session,
        events: &mut Option<broadcast::Receiver<Arc<Frame>>>,
        user: &str,
        password: &str,
    ) -> ServerMessage {
        if !self.auth_required {
            let identity = Identity::normalize(user);
            self.admit(session, events, identity.clone());
            return ServerMessage::AuthOk {
                identity: identity.to_string(),
                token: None,
                ttl_secs: None,
            };
        }

        match self.gate.authenticate(user, password).await {
            Ok(identity) => {
                let token = self.sessions.issue(&identity);
                session.set_token(token.clone());
                self.admit(session, events, identity.clone());
                if let Some(ref metrics) = self.metrics {
                    metrics.sessions_active.set(self.sessions.len() as f64);
                }
                ServerMessage::AuthOk {
                    identity: identity.to_string(),
                    token: Some(token),
                    ttl_secs: Some(self.sessions.ttl().as_secs()),
                }
            }
            Err(AuthError::Locked {
                retry_after_minutes,
            }) => ServerMessage::locked(retry_after_minutes),
            Err(AuthError::InvalidCredentials) => {
                ServerMessage::error(ErrorCode::AuthFailed, "invalid user name or password")
            }
        }
    }

    fn resume(
        &self,
        session: &mut Session,
        events: &mut Option<broadcast::Receiver<Arc<Frame>>>,
        token: &str,
    ) -> ServerMessage {
        match self.sessions.resolve(token) {
            Some(identity) => {
                tracing::debug!("[{}] Resumed session for {}", session.remote_addr, identity);
                session.set_token(token.to_string());
                self.admit(session, events, identity.clone());
                ServerMessage::AuthOk {
                    identity: identity.to_string(),
                    token: Some(token.to_string()),
                    ttl_secs: Some(self.sessions.ttl().as_secs()),
                }
            }
            None => ServerMessage::error(ErrorCode::SessionExpired, "session expired"),
        }
    }

    /// Marks the session logged in and subscribes it to events before the
    /// reply is written, so no event published after `auth_ok` is missed.
    fn admit(
        &self,
        session: &mut Session,
        events: &mut Option<broadcast::Receiver<Arc<Frame>>>,
        identity: Identity,
    ) {
        session.authenticate(identity);
        if events.is_none() {
            *events = Some(self.events.subscribe());
        }
        self.register_client(session);
    }
}

impl TransportHub for SocketHub {
    fn publish_object_change(&self, id: &str, object: &Value) {
        self.publish(
            None,
            RelayEvent::ObjectChanged {
                id: id.to_string(),
                object: object.clone(),
            },
        );
    }

    fn publish_state_change(&self, id: &str, state: &Value) {
        self.publish(
            None,
            RelayEvent::StateChanged {
                id: id.to_string(),
                state: state.clone(),
            },
        );
    }

    fn publish_file_change(&self, id: &str, file_name: &str, size: Option<u64>) {
        self.publish(
            None,
            RelayEvent::FileChanged {
                id: id.to_string(),
                file_name: file_name.to_string(),
                size,
            },
        );
    }

    fn publish_instance_message(
        &self,
        from_id: &str,
        message_type: &str,
        socket_id: Option<&str>,
        data: &Value,
    ) {
        self.publish(
            socket_id,
            RelayEvent::InstanceMessage {
                from_id: from_id.to_string(),
                message_type: message_type.to_string(),
                socket_id: socket_id.map(str::to_string),
                data: data.clone(),
            },
        );
    }

    fn publish_log(&self, entry: &Value) {
        self.publish(
            None,
            RelayEvent::LogEntry {
                payload: entry.clone(),
            },
        );
    }

    fn attach(self: Arc<Self>, incoming: Incoming, addr: SocketAddr) {
        if self.closed.load(Ordering::Acquire) {
            tracing::debug!("Hub closed, dropping connection from {}", addr);
            return;
        }
        if self.active.load(Ordering::Relaxed) >= self.max_connections {
            tracing::warn!("Connection limit reached, rejecting {}", addr);
            if let Some(ref metrics) = self.metrics {
                metrics.connections_rejected_total.inc();
            }
            return;
        }

        self.active.fetch_add(1, Ordering::Relaxed);
        if let Some(ref metrics) = self.metrics {
            metrics.connections_total.inc();
            metrics.connections_active.inc();
        }

        let shutdown = self.shutdown.subscribe();
        tokio::spawn(self.serve(incoming, addr, shutdown));
    }

    fn is_ready(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    fn close(&self) -> Result<(), ServerError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let open = self.active.load(Ordering::Relaxed);
        tracing::info!("Closing transport hub ({} open connections)", open);
        let _ = self.shutdown.send(());
        self.clients.clear();
        Ok(())
    }
}

/// Builds [`SocketHub`]s sharing one auth gate and session store.
pub struct SocketHubFactory {
    gate: Arc<AuthGate>,
    sessions: Arc<SessionStore>,
    state: Arc<dyn ConnectionStateSink>,
    metrics: Option<Arc<Metrics>>,
}

impl SocketHubFactory {
    pub fn new(
        gate: Arc<AuthGate>,
        sessions: Arc<SessionStore>,
        state: Arc<dyn ConnectionStateSink>,
    ) -> Self {
        Self {
            gate,
            sessions,
            state,
            metrics: None,
        }
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

impl HubFactory for SocketHubFactory {
    fn create(&self, settings: &ServerSettings) -> Arc<dyn TransportHub> {
        let mut hub = SocketHub::new(
            settings,
            self.gate.clone(),
            self.sessions.clone(),
            self.state.clone(),
        );
        if let Some(ref metrics) = self.metrics {
            hub = hub.with_metrics(metrics.clone());
        }
        Arc::new(hub)
    }
}

async fn next_frame(
    events: &mut Option<broadcast::Receiver<Arc<Frame>>>,
) -> Result<Arc<Frame>, broadcast::error::RecvError> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn write_message(
    stream: &mut MaybeTlsStream,
    message: &ServerMessage,
) -> Result<(), ServerError> {
    let bytes = encode_line(message)?;
    stream.write_all(&bytes).await?;
    Ok(())
}
