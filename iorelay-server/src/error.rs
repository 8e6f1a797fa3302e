//! Server error types.

use iorelay_protocol::ErrorCode;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] iorelay_protocol::ProtocolError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("session not authenticated")]
    NotAuthenticated,

    #[error("authentication failed: {0}")]
    AuthFailed(#[from] crate::auth::AuthError),

    #[error("port allocation failed: {0}")]
    PortAllocation(String),

    #[error("listener error: {0}")]
    Listener(String),

    #[error("listener closed")]
    ListenerClosed,

    #[error("server shutting down")]
    ShuttingDown,

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),
}

impl ServerError {
    /// Converts to protocol error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ServerError::Protocol(_) | ServerError::Json(_) => ErrorCode::BadRequest,
            ServerError::NotAuthenticated => ErrorCode::Unauthorized,
            ServerError::AuthFailed(crate::auth::AuthError::Locked { .. }) => ErrorCode::AuthLocked,
            ServerError::AuthFailed(_) => ErrorCode::AuthFailed,
            ServerError::ShuttingDown | ServerError::ListenerClosed => ErrorCode::ShuttingDown,
            ServerError::Io(_)
            | ServerError::PortAllocation(_)
            | ServerError::Listener(_)
            | ServerError::TlsConfig(_)
            | ServerError::TlsHandshake(_) => ErrorCode::InternalError,
        }
    }

    /// Returns whether this is a permission error from the OS.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, ServerError::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied)
    }
}
