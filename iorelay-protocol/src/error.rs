//! Protocol error types and error codes.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors that can occur while encoding or decoding messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("line too large: {size} bytes (max {max})")]
    LineTooLarge { size: usize, max: usize },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid UTF-8 in payload")]
    InvalidUtf8,
}

/// Stable error codes returned in `error` replies.
///
/// These codes are part of the protocol contract and must remain stable
/// across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Protocol errors
    BadRequest,

    // Authentication errors
    Unauthorized,
    AuthFailed,
    AuthLocked,
    SessionExpired,

    // System errors
    InternalError,
    ShuttingDown,
}

impl ErrorCode {
    /// Returns whether the client may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::AuthLocked | ErrorCode::InternalError | ErrorCode::ShuttingDown
        )
    }

    /// Returns the wire name of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::AuthLocked => "AUTH_LOCKED",
            ErrorCode::SessionExpired => "SESSION_EXPIRED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::ShuttingDown => "SHUTTING_DOWN",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
