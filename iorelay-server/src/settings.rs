//! Resolved runtime settings handed to the lifecycle and hub.

use crate::config::{Config, ConfigError};
use crate::tls::{Certificates, TlsOptions};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

/// Settings the lifecycle consumes. Built once at startup from [`Config`].
#[derive(Clone)]
pub struct ServerSettings {
    /// Port to listen on. Rewritten to the allocated port once resolved.
    pub port: u16,
    /// Interface to bind; `None` means all interfaces.
    pub bind: Option<IpAddr>,
    /// Serve TLS instead of plain TCP.
    pub secure: bool,
    pub certificates: Option<Arc<Certificates>>,
    pub tls: TlsOptions,
    /// Clients must log in before receiving events.
    pub auth: bool,
    /// Session token lifetime.
    pub ttl: Duration,
    /// Accept connections from any origin. Always on for socket clients.
    pub cross_domain: bool,
    pub force_transport: bool,
    /// Accept the next free port instead of failing when `port` is taken.
    pub find_next_port: bool,
    pub max_connections: usize,
    pub idle_timeout: Duration,
}

impl ServerSettings {
    /// Plain, unauthenticated settings for the given port.
    pub fn new(port: u16) -> Self {
        Self {
            port,
            bind: None,
            secure: false,
            certificates: None,
            tls: TlsOptions::default(),
            auth: false,
            ttl: crate::session::DEFAULT_SESSION_TTL,
            cross_domain: true,
            force_transport: false,
            find_next_port: false,
            max_connections: 1000,
            idle_timeout: Duration::from_secs(300),
        }
    }

    /// Builds settings from configuration and already loaded TLS material.
    pub fn from_config(
        config: &Config,
        certificates: Option<Arc<Certificates>>,
        tls: TlsOptions,
    ) -> Result<Self, ConfigError> {
        let bind = parse_bind(&config.network.bind)?;
        Ok(Self {
            port: config.network.port,
            bind,
            secure: config.tls.enabled,
            certificates,
            tls,
            auth: config.auth.required,
            ttl: config.auth.ttl(),
            cross_domain: true,
            force_transport: config.network.force_transport,
            find_next_port: config.network.find_next_port,
            max_connections: config.network.max_connections,
            idle_timeout: config.network.idle_timeout(),
        })
    }

    /// Address the listener binds to.
    pub fn socket_addr(&self) -> SocketAddr {
        let ip = self.bind.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        SocketAddr::new(ip, self.port)
    }
}

impl std::fmt::Debug for ServerSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSettings")
            .field("port", &self.port)
            .field("bind", &self.bind)
            .field("secure", &self.secure)
            .field("certificates_loaded", &self.certificates.is_some())
            .field("require_client_cert", &self.tls.require_client_cert)
            .field("auth", &self.auth)
            .field("ttl", &self.ttl)
            .field("force_transport", &self.force_transport)
            .field("find_next_port", &self.find_next_port)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

fn parse_bind(bind: &str) -> Result<Option<IpAddr>, ConfigError> {
    let bind = bind.trim();
    if bind.is_empty() || bind == "0.0.0.0" {
        return Ok(None);
    }
    bind.parse()
        .map(Some)
        .map_err(|_| ConfigError::ValidationError(format!("invalid bind address '{}'", bind)))
}
