//! Port allocation.

use crate::error::ServerError;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::net::TcpListener;

/// Resolves the port the server will actually listen on.
#[async_trait]
pub trait PortAllocator: Send + Sync {
    /// Returns `desired` if it is free, otherwise some other free port.
    async fn resolve_port(&self, desired: u16, bind: Option<IpAddr>) -> Result<u16, ServerError>;
}

/// Finds a free port by trying to bind `desired`, `desired + 1`, ...
#[derive(Debug, Clone, Copy)]
pub struct ProbingPortAllocator {
    max_probes: u16,
}

impl ProbingPortAllocator {
    pub fn new(max_probes: u16) -> Self {
        Self {
            max_probes: max_probes.max(1),
        }
    }
}

impl Default for ProbingPortAllocator {
    fn default() -> Self {
        Self::new(100)
    }
}

#[async_trait]
impl PortAllocator for ProbingPortAllocator {
    async fn resolve_port(&self, desired: u16, bind: Option<IpAddr>) -> Result<u16, ServerError> {
        let ip = bind.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let mut port = desired;

        for _ in 0..self.max_probes {
            match TcpListener::bind(SocketAddr::new(ip, port)).await {
                Ok(probe) => {
                    drop(probe);
                    if port != desired {
                        tracing::debug!("Port {} busy, found free port {}", desired, port);
                    }
                    return Ok(port);
                }
                Err(e) if e.kind() == ErrorKind::AddrInUse => {
                    port = port.checked_add(1).ok_or_else(|| {
                        ServerError::PortAllocation(format!(
                            "no free port at or above {}",
                            desired
                        ))
                    })?;
                }
                // Permission and address errors belong to the real bind.
                Err(e) => {
                    tracing::debug!("Port probe for {} failed: {}", port, e);
                    return Ok(desired);
                }
            }
        }

        Err(ServerError::PortAllocation(format!(
            "no free port in {}..{}",
            desired,
            desired.saturating_add(self.max_probes)
        )))
    }
}
