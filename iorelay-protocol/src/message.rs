//! Client commands and server replies.

use crate::error::ErrorCode;
use crate::event::RelayEvent;
use serde::{Deserialize, Serialize};

/// Messages sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Log in with a user name and password.
    Auth { user: String, password: String },
    /// Re-attach to a previously issued session token.
    Resume { token: String },
    /// Keep-alive.
    Ping,
    /// Close the connection.
    Bye,
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First message on every connection.
    Hello {
        protocol_version: u16,
        session_id: String,
        auth_required: bool,
    },
    /// Login or resume succeeded.
    AuthOk {
        identity: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ttl_secs: Option<u64>,
    },
    /// Request rejected.
    Error {
        code: ErrorCode,
        message: String,
        retryable: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after_minutes: Option<u32>,
    },
    /// Reply to `ping`.
    Pong,
    /// A relayed store event.
    Event { event: RelayEvent },
}

impl ServerMessage {
    /// Builds an error reply for the given code.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            retryable: code.is_retryable(),
            code,
            message: message.into(),
            retry_after_minutes: None,
        }
    }

    /// Builds the reply for a login attempt rejected by the lockout policy.
    pub fn locked(retry_after_minutes: u32) -> Self {
        let unit = if retry_after_minutes == 1 {
            "minute"
        } else {
            "minutes"
        };
        ServerMessage::Error {
            code: ErrorCode::AuthLocked,
            message: format!(
                "Too many errors. Try again in {} {}.",
                retry_after_minutes, unit
            ),
            retryable: true,
            retry_after_minutes: Some(retry_after_minutes),
        }
    }

    /// Returns whether this is an error reply.
    pub fn is_error(&self) -> bool {
        matches!(self, ServerMessage::Error { .. })
    }
}
