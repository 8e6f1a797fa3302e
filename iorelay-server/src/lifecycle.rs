//! Server lifecycle.
//!
//! Drives the relay from configuration to a running listener and back:
//!
//! ```text
//! Idle -> PortResolving -> Listening -> Running -> ShuttingDown -> Stopped
//!              |               |
//!              +----> Error <--+
//! ```
//!
//! Every failure before the listener is bound is fatal and returned as a
//! [`LifecycleError`]; the binary logs it and exits with
//! [`TERMINATION_EXIT_CODE`]. Failures after that point (accept errors,
//! misbehaving peers) are logged and the relay keeps running.

use crate::error::ServerError;
use crate::hub::{HubFactory, TransportHub};
use crate::listener::{Listener, ListenerFactory};
use crate::port::PortAllocator;
use crate::relay::{EventRelay, HubSlot};
use crate::settings::ServerSettings;
use crate::state::ConnectionStateSink;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

/// Process exit code for fatal startup errors.
pub const TERMINATION_EXIT_CODE: i32 = 11;

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// How long shutdown waits for the accept loop to finish.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    PortResolving,
    Listening,
    Running,
    ShuttingDown,
    Stopped,
    Error,
}

/// Fatal startup errors.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("no port configured")]
    PortMissing,

    #[error("secure mode requested but no certificates are loaded")]
    MissingCertificates,

    #[error("port {desired} is in use (next free port is {allocated}), enable find_next_port to use it")]
    PortInUse { desired: u16, allocated: u16 },

    #[error("port allocation failed: {0}")]
    PortAllocation(#[source] ServerError),

    #[error("cannot create listener: {0}")]
    ListenerConstruction(#[source] ServerError),

    #[error("cannot listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: ServerError,
    },

    #[error("server already started")]
    AlreadyStarted,

    #[error("start abandoned, shutdown was requested")]
    Cancelled,
}

impl LifecycleError {
    /// Exit code the process terminates with.
    pub fn exit_code(&self) -> i32 {
        TERMINATION_EXIT_CODE
    }
}

/// External capabilities the lifecycle drives.
#[derive(Clone)]
pub struct Capabilities {
    pub port_allocator: Arc<dyn PortAllocator>,
    pub listener_factory: Arc<dyn ListenerFactory>,
    pub state_sink: Arc<dyn ConnectionStateSink>,
    pub hub_factory: Arc<dyn HubFactory>,
}

impl Capabilities {
    /// TCP listeners and probing port allocation with the given sink and hub.
    pub fn standard(
        state_sink: Arc<dyn ConnectionStateSink>,
        hub_factory: Arc<dyn HubFactory>,
    ) -> Self {
        Self {
            port_allocator: Arc::new(crate::port::ProbingPortAllocator::default()),
            listener_factory: Arc::new(crate::listener::TcpListenerFactory),
            state_sink,
            hub_factory,
        }
    }
}

/// A running server: its hub and accept loop.
struct ServerHandle {
    hub: Arc<dyn TransportHub>,
    acceptor: JoinHandle<()>,
    stop: oneshot::Sender<()>,
    local_addr: SocketAddr,
}

/// Owns the listener and hub for the lifetime of the relay.
pub struct ServerLifecycle {
    settings: Mutex<ServerSettings>,
    caps: Capabilities,
    slot: HubSlot,
    state: watch::Sender<LifecycleState>,
    handle: Mutex<Option<ServerHandle>>,
    /// Bumped by every shutdown, under the `handle` lock.
    generation: AtomicU64,
}

impl ServerLifecycle {
    pub fn new(settings: ServerSettings, caps: Capabilities) -> Self {
        let (state, _) = watch::channel(LifecycleState::Idle);
        Self {
            settings: Mutex::new(settings),
            caps,
            slot: HubSlot::new(),
            state,
            handle: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Returns a relay that forwards into this lifecycle's hub.
    pub fn relay(&self) -> EventRelay {
        EventRelay::new(self.slot.clone())
    }

    /// Subscribes to lifecycle state changes.
    pub fn state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    pub fn current_state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Current settings, with the port rewritten once resolved.
    pub fn settings(&self) -> ServerSettings {
        self.settings.lock().clone()
    }

    /// Address the listener is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.handle.lock().as_ref().map(|h| h.local_addr)
    }

    fn set_state(&self, state: LifecycleState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!("Lifecycle {:?} -> {:?}", previous, state);
        }
    }

    fn cancelled(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) != generation
    }

    /// Moves to `state` unless a shutdown ran since `generation` was read.
    fn advance(&self, generation: u64, state: LifecycleState) -> bool {
        let _handle = self.handle.lock();
        if self.cancelled(generation) {
            return false;
        }
        self.set_state(state);
        true
    }

    fn fail<T>(&self, generation: u64, error: LifecycleError) -> Result<T, LifecycleError> {
        self.advance(generation, LifecycleState::Error);
        tracing::error!("Relay failed to start: {}", error);
        Err(error)
    }

    fn abandon<T>(&self, listener: Option<Box<dyn Listener>>) -> Result<T, LifecycleError> {
        if let Some(mut listener) = listener {
            if let Err(e) = listener.close() {
                tracing::warn!("Error closing listener: {}", e);
            }
        }
        tracing::info!("Shutdown requested while starting, relay not started");
        Err(LifecycleError::Cancelled)
    }

    /// Resolves the port, binds the listener and starts accepting.
    pub async fn start(&self) -> Result<SocketAddr, LifecycleError> {
        let generation = self.generation.load(Ordering::Acquire);
        if !matches!(
            self.current_state(),
            LifecycleState::Idle | LifecycleState::Stopped
        ) {
            return Err(LifecycleError::AlreadyStarted);
        }

        let mut settings = self.settings();
        if settings.port == 0 {
            return self.fail(generation, LifecycleError::PortMissing);
        }

        let certificates = if settings.secure {
            match settings.certificates.clone() {
                Some(certificates) => Some(certificates),
                None => return self.fail(generation, LifecycleError::MissingCertificates),
            }
        } else {
            None
        };

        if !self.advance(generation, LifecycleState::PortResolving) {
            return self.abandon(None);
        }
        let resolved = self
            .caps
            .port_allocator
            .resolve_port(settings.port, settings.bind)
            .await;
        if self.cancelled(generation) {
            return self.abandon(None);
        }
        let port = match resolved {
            Ok(port) => port,
            Err(e) => return self.fail(generation, LifecycleError::PortAllocation(e)),
        };
        if port != settings.port {
            if !settings.find_next_port {
                return self.fail(generation, LifecycleError::PortInUse {
                    desired: settings.port,
                    allocated: port,
                });
            }
            tracing::info!("Port {} is in use, using {} instead", settings.port, port);
        }
        settings.port = port;
        self.settings.lock().port = port;

        if !self.advance(generation, LifecycleState::Listening) {
            return self.abandon(None);
        }
        let constructed = match certificates {
            Some(ref certificates) => {
                self.caps
                    .listener_factory
                    .secure(&settings, certificates, &settings.tls)
                    .await
            }
            None => self.caps.listener_factory.plain().await,
        };
        let mut listener = match constructed {
            Ok(listener) => listener,
            Err(_) if self.cancelled(generation) => return self.abandon(None),
            Err(e) => return self.fail(generation, LifecycleError::ListenerConstruction(e)),
        };
        if self.cancelled(generation) {
            return self.abandon(Some(listener));
        }

        let addr = settings.socket_addr();
        let listened = listener.listen(addr).await;
        if self.cancelled(generation) {
            return self.abandon(Some(listener));
        }
        let local_addr = match listened {
            Ok(local_addr) => local_addr,
            Err(e) => {
                if e.is_permission_denied() && port <= 1024 {
                    tracing::error!(
                        "Port {} is privileged: run with elevated rights or choose a port above 1024",
                        port
                    );
                }
                return self.fail(generation, LifecycleError::Bind { addr, source: e });
            }
        };

        let mut handle = self.handle.lock();
        if self.cancelled(generation) {
            drop(handle);
            return self.abandon(Some(listener));
        }
        self.set_state(LifecycleState::Running);
        self.caps.state_sink.set_connection_state(true);

        let hub = self.caps.hub_factory.create(&settings);
        self.slot.install(hub.clone());

        let (stop, stop_rx) = oneshot::channel();
        let acceptor = tokio::spawn(accept_loop(listener, hub.clone(), stop_rx));
        *handle = Some(ServerHandle {
            hub,
            acceptor,
            stop,
            local_addr,
        });
        drop(handle);

        tracing::info!(
            "Relay listening on {} ({}, auth {})",
            local_addr,
            if settings.secure { "TLS" } else { "plain" },
            if settings.auth { "required" } else { "off" }
        );
        Ok(local_addr)
    }

    /// Stops the relay. `on_complete` runs exactly once, whatever fails.
    pub async fn shutdown<F: FnOnce()>(&self, on_complete: F) {
        let handle = {
            let mut handle = self.handle.lock();
            self.generation.fetch_add(1, Ordering::AcqRel);
            handle.take()
        };
        self.set_state(LifecycleState::ShuttingDown);

        guarded("clearing connected clients", || {
            self.caps.state_sink.set_connected_clients(&[])
        });
        guarded("clearing connection state", || {
            self.caps.state_sink.set_connection_state(false)
        });

        self.slot.take();

        if let Some(handle) = handle {
            match catch_unwind(AssertUnwindSafe(|| handle.hub.close())) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Error closing transport hub: {}", e),
                Err(_) => tracing::warn!("Transport hub panicked while closing"),
            }

            let _ = handle.stop.send(());
            let mut acceptor = handle.acceptor;
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut acceptor).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Accept loop ended abnormally: {}", e),
                Err(_) => {
                    tracing::warn!("Timed out waiting for the listener to close");
                    acceptor.abort();
                }
            }
        }

        self.set_state(LifecycleState::Stopped);
        tracing::info!("Relay stopped");
        on_complete();
    }
}

fn guarded(step: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::warn!("Shutdown step panicked: {}", step);
    }
}

async fn accept_loop(
    mut listener: Box<dyn Listener>,
    hub: Arc<dyn TransportHub>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut stop => break,
            result = listener.accept() => match result {
                Ok((incoming, addr)) => hub.clone().attach(incoming, addr),
                Err(ServerError::ListenerClosed) => break,
                Err(e) => {
                    tracing::warn!("Accept error: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    if let Err(e) = listener.close() {
        tracing::warn!("Error closing listener: {}", e);
    }
}
