//! Session management.
//!
//! A [`Session`] describes one live connection. A [`SessionStore`] keeps the
//! login tokens handed out after a successful authentication so that clients
//! can reconnect without sending their password again.

use crate::auth::Identity;
use crate::clock::{Clock, SystemClock};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Default session lifetime.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(3600);

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, waiting for credentials.
    Connected,
    /// Authenticated (or auth disabled); receives relayed events.
    Authenticated,
    /// Session is closing.
    Closing,
}

/// A client connection.
pub struct Session {
    /// Unique session ID.
    pub id: String,

    /// Remote address.
    pub remote_addr: SocketAddr,

    state: SessionState,

    identity: Option<Identity>,

    /// Login token held by this connection.
    token: Option<String>,

    /// Request counter.
    request_count: AtomicU64,

    /// Session creation time.
    created_at: Instant,
}

impl Session {
    /// Creates a new session. Without auth the session starts authenticated.
    pub fn new(remote_addr: SocketAddr, auth_required: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            remote_addr,
            state: if auth_required {
                SessionState::Connected
            } else {
                SessionState::Authenticated
            },
            identity: None,
            token: None,
            request_count: AtomicU64::new(0),
            created_at: Instant::now(),
        }
    }

    /// Returns the session state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Marks the session as closing.
    pub fn close(&mut self) {
        self.state = SessionState::Closing;
    }

    /// Returns whether the session may receive events.
    pub fn is_authenticated(&self) -> bool {
        self.state == SessionState::Authenticated
    }

    /// Records a successful login.
    pub fn authenticate(&mut self, identity: Identity) {
        self.identity = Some(identity);
        self.state = SessionState::Authenticated;
    }

    /// Returns the logged-in identity, if any.
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Remembers the login token so it can be revoked on logout.
    pub fn set_token(&mut self, token: String) {
        self.token = Some(token);
    }

    /// Removes and returns the login token.
    pub fn take_token(&mut self) -> Option<String> {
        self.token.take()
    }

    /// Name reported in the connected-clients list.
    pub fn display_name(&self) -> String {
        match self.identity {
            Some(ref identity) => identity.to_string(),
            None => self.remote_addr.to_string(),
        }
    }

    /// Records a request.
    pub fn record_request(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the request count.
    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    /// Returns the session age.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

#[derive(Debug, Clone)]
struct StoredSession {
    identity: Identity,
    expires_at: Instant,
}

/// Login tokens with a sliding time-to-live.
pub struct SessionStore {
    tokens: DashMap<String, StoredSession>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            tokens: DashMap::new(),
            ttl,
            clock,
        }
    }

    /// Returns the configured lifetime.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issues a new token for an identity.
    pub fn issue(&self, identity: &Identity) -> String {
        let token = Uuid::new_v4().simple().to_string();
        self.tokens.insert(
            token.clone(),
            StoredSession {
                identity: identity.clone(),
                expires_at: self.clock.now() + self.ttl,
            },
        );
        token
    }

    /// Resolves a token, extending its lifetime. Expired tokens are removed.
    pub fn resolve(&self, token: &str) -> Option<Identity> {
        let now = self.clock.now();
        let mut entry = self.tokens.get_mut(token)?;
        if entry.expires_at <= now {
            drop(entry);
            self.tokens.remove(token);
            return None;
        }
        entry.expires_at = now + self.ttl;
        Some(entry.identity.clone())
    }

    /// Revokes a token. Returns true if it existed.
    pub fn revoke(&self, token: &str) -> bool {
        self.tokens.remove(token).is_some()
    }

    /// Removes all expired tokens, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut purged = 0;
        self.tokens.retain(|_, session| {
            let keep = session.expires_at > now;
            if !keep {
                purged += 1;
            }
            keep
        });
        purged
    }

    /// Drops every token.
    pub fn clear(&self) {
        self.tokens.clear();
    }

    /// Returns the number of stored tokens.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
