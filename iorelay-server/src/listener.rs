//! Listener capability and its TCP implementation.
//!
//! A [`ListenerFactory`] produces an unbound [`Listener`]; the lifecycle
//! then calls [`Listener::listen`] once and drives [`Listener::accept`]
//! from its accept loop. TLS handshakes are deferred to
//! [`Incoming::establish`] so a slow peer never stalls the accept loop.

use crate::error::ServerError;
use crate::settings::ServerSettings;
use crate::stream::MaybeTlsStream;
use crate::tls::{create_tls_acceptor, Certificates, TlsOptions};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

/// A freshly accepted connection, before any TLS handshake.
pub struct Incoming {
    stream: TcpStream,
    acceptor: Option<TlsAcceptor>,
}

impl Incoming {
    pub fn new(stream: TcpStream, acceptor: Option<TlsAcceptor>) -> Self {
        Self { stream, acceptor }
    }

    /// Completes the TLS handshake if the listener is secure.
    pub async fn establish(self) -> Result<MaybeTlsStream, ServerError> {
        if let Err(e) = self.stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY: {}", e);
        }
        match self.acceptor {
            Some(acceptor) => {
                let stream = acceptor
                    .accept(self.stream)
                    .await
                    .map_err(|e| ServerError::TlsHandshake(e.to_string()))?;
                Ok(MaybeTlsStream::Tls { stream })
            }
            None => Ok(MaybeTlsStream::Plain {
                stream: self.stream,
            }),
        }
    }
}

/// A server socket that the lifecycle binds and accepts from.
#[async_trait]
pub trait Listener: Send {
    /// Binds to `addr` and returns the bound address.
    async fn listen(&mut self, addr: SocketAddr) -> Result<SocketAddr, ServerError>;

    /// Waits for the next connection.
    async fn accept(&mut self) -> Result<(Incoming, SocketAddr), ServerError>;

    fn is_secure(&self) -> bool;

    /// Stops accepting. Further `accept` calls fail with `ListenerClosed`.
    fn close(&mut self) -> Result<(), ServerError>;
}

/// Constructs listeners.
#[async_trait]
pub trait ListenerFactory: Send + Sync {
    async fn plain(&self) -> Result<Box<dyn Listener>, ServerError>;

    async fn secure(
        &self,
        settings: &ServerSettings,
        certificates: &Certificates,
        tls: &TlsOptions,
    ) -> Result<Box<dyn Listener>, ServerError>;
}

/// Listener over tokio's TCP socket, optionally wrapped in TLS.
pub struct TcpRelayListener {
    inner: Option<TcpListener>,
    acceptor: Option<TlsAcceptor>,
    closed: bool,
}

impl TcpRelayListener {
    pub fn plain() -> Self {
        Self {
            inner: None,
            acceptor: None,
            closed: false,
        }
    }

    pub fn secure(acceptor: TlsAcceptor) -> Self {
        Self {
            inner: None,
            acceptor: Some(acceptor),
            closed: false,
        }
    }
}

#[async_trait]
impl Listener for TcpRelayListener {
    async fn listen(&mut self, addr: SocketAddr) -> Result<SocketAddr, ServerError> {
        if self.closed {
            return Err(ServerError::ListenerClosed);
        }
        if self.inner.is_some() {
            return Err(ServerError::Listener(format!(
                "already listening, refusing to bind {}",
                addr
            )));
        }
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        self.inner = Some(listener);
        Ok(local)
    }

    async fn accept(&mut self) -> Result<(Incoming, SocketAddr), ServerError> {
        if self.closed {
            return Err(ServerError::ListenerClosed);
        }
        let listener = self
            .inner
            .as_ref()
            .ok_or_else(|| ServerError::Listener("accept before listen".into()))?;
        let (stream, addr) = listener.accept().await?;
        Ok((Incoming::new(stream, self.acceptor.clone()), addr))
    }

    fn is_secure(&self) -> bool {
        self.acceptor.is_some()
    }

    fn close(&mut self) -> Result<(), ServerError> {
        self.closed = true;
        self.inner = None;
        Ok(())
    }
}

/// Builds [`TcpRelayListener`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpListenerFactory;

#[async_trait]
impl ListenerFactory for TcpListenerFactory {
    async fn plain(&self) -> Result<Box<dyn Listener>, ServerError> {
        Ok(Box::new(TcpRelayListener::plain()))
    }

    async fn secure(
        &self,
        settings: &ServerSettings,
        certificates: &Certificates,
        tls: &TlsOptions,
    ) -> Result<Box<dyn Listener>, ServerError> {
        let acceptor = create_tls_acceptor(certificates, tls)?;
        tracing::debug!(
            port = settings.port,
            mtls = tls.require_client_cert,
            "TLS acceptor ready"
        );
        Ok(Box::new(TcpRelayListener::secure(acceptor)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_accept_before_listen() {
        let mut listener = TcpRelayListener::plain();
        assert!(!listener.is_secure());
        match listener.accept().await {
            Err(ServerError::Listener(msg)) => assert!(msg.contains("before listen")),
            _ => panic!("expected listener error"),
        }
    }

    #[tokio::test]
    async fn test_plain_accept_roundtrip() {
        let mut listener = TcpListenerFactory.plain().await.unwrap();
        let addr = listener
            .listen("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        assert_ne!(addr.port(), 0);

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"hi").await.unwrap();
        });

        let (incoming, _) = listener.accept().await.unwrap();
        let mut stream = incoming.establish().await.unwrap();
        assert!(!stream.is_tls());
        assert_eq!(stream.transport(), "tcp");

        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_listen_twice_fails() {
        let mut listener = TcpRelayListener::plain();
        listener
            .listen("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        assert!(listener
            .listen("127.0.0.1:0".parse().unwrap())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_accept_after_close() {
        let mut listener = TcpRelayListener::plain();
        listener
            .listen("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        listener.close().unwrap();
        assert!(matches!(
            listener.accept().await,
            Err(ServerError::ListenerClosed)
        ));
    }

    #[tokio::test]
    async fn test_bind_conflict_is_io_error() {
        let held = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = held.local_addr().unwrap();

        let mut listener = TcpRelayListener::plain();
        match listener.listen(addr).await {
            Err(ServerError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::AddrInUse),
            other => panic!("expected AddrInUse, got {:?}", other.map(|_| ())),
        }
    }
}
