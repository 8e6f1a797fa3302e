//! # iorelay-server
//!
//! Socket server for iorelay.
//!
//! This crate provides:
//! - Brute-force guarded authentication with identity normalization
//! - Session tokens with a sliding time-to-live
//! - Listener lifecycle with port resolution and fatal-before-listen policy
//! - A transport hub fanning store events out to authenticated connections
//! - Optional TLS and Prometheus metrics

pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod guard;
pub mod hub;
pub mod lifecycle;
pub mod listener;
pub mod metrics;
pub mod port;
pub mod relay;
pub mod session;
pub mod settings;
pub mod state;
pub mod stream;
pub mod tls;

pub use auth::{AuthError, AuthGate, CredentialValidator, Identity, PasswordValidator};
pub use config::{AuthConfig, Config, MetricsConfig, NetworkConfig, TlsConfig};
pub use error::ServerError;
pub use guard::{BruteForceGuard, Lockout};
pub use hub::{HubFactory, SocketHub, SocketHubFactory, TransportHub};
pub use lifecycle::{
    Capabilities, LifecycleError, LifecycleState, ServerLifecycle, TERMINATION_EXIT_CODE,
};
pub use listener::{Incoming, Listener, ListenerFactory, TcpListenerFactory};
pub use metrics::Metrics;
pub use port::{PortAllocator, ProbingPortAllocator};
pub use relay::{EventRelay, HubSlot};
pub use session::{Session, SessionStore};
pub use settings::ServerSettings;
pub use state::{ConnectionStateSink, ConnectivityState};
