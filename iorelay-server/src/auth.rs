//! Login handling.
//!
//! User names are normalized into an [`Identity`] before anything else looks
//! at them, so lockout tracking cannot be sidestepped by changing case or
//! punctuation. Passwords are checked against SHA-256 hashes stored in
//! configuration.

use crate::guard::BruteForceGuard;
use crate::metrics::Metrics;
use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Normalized user name. The only key used for lockout tracking.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(String);

impl Identity {
    /// Normalizes a raw user name.
    ///
    /// Surrounding whitespace is dropped, the name is lowercased, every run of
    /// characters outside the permitted set becomes a single `_`, and each
    /// remaining space or period becomes `_`.
    pub fn normalize(raw: &str) -> Self {
        let lowered = raw.trim().to_lowercase();
        let mut out = String::with_capacity(lowered.len());
        let mut in_forbidden_run = false;

        for c in lowered.chars() {
            if !is_permitted(c) {
                if !in_forbidden_run {
                    out.push('_');
                    in_forbidden_run = true;
                }
                continue;
            }
            in_forbidden_run = false;
            if c == '.' || c.is_whitespace() {
                out.push('_');
            } else {
                out.push(c);
            }
        }

        Identity(out)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_permitted(c: char) -> bool {
    const PUNCTUATION: &str = "._-/ :!#$%&()+=@^{}|~";
    c.is_lowercase() || c.is_uppercase() || c.is_numeric() || PUNCTUATION.contains(c)
}

/// Verifies a password for an already-normalized identity.
#[async_trait]
pub trait CredentialValidator: Send + Sync {
    async fn verify(&self, identity: &Identity, password: &str) -> bool;
}

/// Validates passwords against pre-configured SHA-256 hashes.
#[derive(Debug, Clone, Default)]
pub struct PasswordValidator {
    /// Identity -> password hash (lowercase hex).
    hashes: HashMap<Identity, String>,
}

impl PasswordValidator {
    /// Creates a validator from `(user name, hash)` pairs. Names are normalized.
    pub fn new<I, K, V>(users: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        Self {
            hashes: users
                .into_iter()
                .map(|(name, hash)| {
                    let hash: String = hash.into();
                    (Identity::normalize(name.as_ref()), hash.to_lowercase())
                })
                .collect(),
        }
    }

    /// Returns the number of configured users.
    pub fn user_count(&self) -> usize {
        self.hashes.len()
    }

    /// Hashes a password using SHA-256, returning a lowercase hex string.
    pub fn hash_password(password: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(password.as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[async_trait]
impl CredentialValidator for PasswordValidator {
    async fn verify(&self, identity: &Identity, password: &str) -> bool {
        let candidate = Self::hash_password(password);
        match self.hashes.get(identity) {
            Some(expected) => constant_time_eq(expected, &candidate),
            None => false,
        }
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Login rejection returned to the connecting client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("too many failed logins, retry in {retry_after_minutes} minute(s)")]
    Locked { retry_after_minutes: u32 },

    #[error("invalid user name or password")]
    InvalidCredentials,
}

/// Authenticates logins, enforcing the brute-force lockout policy.
pub struct AuthGate {
    guard: Arc<BruteForceGuard>,
    validator: Arc<dyn CredentialValidator>,
    /// One async mutex per identity with an attempt in flight.
    in_flight: DashMap<Identity, Arc<tokio::sync::Mutex<()>>>,
    metrics: Option<Arc<Metrics>>,
}

impl AuthGate {
    pub fn new(guard: Arc<BruteForceGuard>, validator: Arc<dyn CredentialValidator>) -> Self {
        Self {
            guard,
            validator,
            in_flight: DashMap::new(),
            metrics: None,
        }
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns the lockout guard.
    pub fn guard(&self) -> &Arc<BruteForceGuard> {
        &self.guard
    }

    /// Authenticates a login attempt.
    ///
    /// A locked identity is rejected without consulting the validator.
    /// Attempts for the same identity run one at a time so concurrent
    /// failures are all counted.
    pub async fn authenticate(
        &self,
        raw_username: &str,
        password: &str,
    ) -> Result<Identity, AuthError> {
        let identity = Identity::normalize(raw_username);
        let lock = self
            .in_flight
            .entry(identity.clone())
            .or_default()
            .clone();

        let result = {
            let _serialized = lock.lock().await;
            self.attempt(&identity, password).await
        };

        // Forget the mutex once nobody else is queued on it.
        self.in_flight
            .remove_if(&identity, |_, entry| Arc::strong_count(entry) <= 2);

        let label = match &result {
            Ok(_) => "ok",
            Err(AuthError::Locked { .. }) => "locked",
            Err(AuthError::InvalidCredentials) => "invalid",
        };
        if let Some(ref metrics) = self.metrics {
            metrics.auth_attempts_total.with_label_values(&[label]).inc();
        }

        result
    }

    async fn attempt(&self, identity: &Identity, password: &str) -> Result<Identity, AuthError> {
        let lockout = self.guard.check_lockout(identity.as_str());
        if lockout.locked {
            tracing::warn!(
                "Rejecting login for {}: locked for {} more minute(s)",
                identity,
                lockout.retry_after_minutes
            );
            return Err(AuthError::Locked {
                retry_after_minutes: lockout.retry_after_minutes,
            });
        }

        let valid = self.validator.verify(identity, password).await;
        self.guard.record_result(identity.as_str(), valid);

        if valid {
            tracing::info!("User {} authenticated", identity);
            Ok(identity.clone())
        } else {
            tracing::info!("Failed login for {}", identity);
            Err(AuthError::InvalidCredentials)
        }
    }

    /// Returns the number of identities with an attempt in flight.
    pub fn pending_identities(&self) -> usize {
        self.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Validator that counts calls and accepts one fixed password.
    struct CountingValidator {
        password: &'static str,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl CountingValidator {
        fn new(password: &'static str) -> Self {
            Self {
                password,
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CredentialValidator for CountingValidator {
        async fn verify(&self, _identity: &Identity, password: &str) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            password == self.password
        }
    }

    fn gate_with(validator: Arc<CountingValidator>) -> (Arc<ManualClock>, AuthGate) {
        let clock = Arc::new(ManualClock::new());
        let guard = Arc::new(BruteForceGuard::with_clock(clock.clone()));
        (clock, AuthGate::new(guard, validator))
    }

    #[test]
    fn test_normalize_examples() {
        assert_eq!(Identity::normalize("Alice.Doe").as_str(), "alice_doe");
        assert_eq!(Identity::normalize("alice_doe ").as_str(), "alice_doe");
        assert_eq!(Identity::normalize("ALICE DOE").as_str(), "alice_doe");
        assert_eq!(Identity::normalize("admin").as_str(), "admin");
        assert_eq!(Identity::normalize("a<>b").as_str(), "a_b");
        assert_eq!(Identity::normalize("a\tb").as_str(), "a_b");
        assert_eq!(Identity::normalize("").as_str(), "");
    }

    #[test]
    fn test_normalize_idempotent() {
        for raw in [
            "Alice.Doe",
            " bob ",
            "Ünïcödé.Üser",
            "x<script>y",
            "a..b  c",
            "user@example.com",
            "İstanbul",
        ] {
            let once = Identity::normalize(raw);
            let twice = Identity::normalize(once.as_str());
            assert_eq!(once, twice, "normalize not idempotent for {:?}", raw);
        }
    }

    #[test]
    fn test_normalize_collapses_variants() {
        let expected = Identity::normalize("john_smith");
        for raw in ["John.Smith", "JOHN SMITH", "john.smith", "John_Smith"] {
            assert_eq!(Identity::normalize(raw), expected);
        }
    }

    #[test]
    fn test_hash_password() {
        let hash = PasswordValidator::hash_password("secret");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, PasswordValidator::hash_password("secret"));
        assert_ne!(hash, PasswordValidator::hash_password("Secret"));
    }

    #[tokio::test]
    async fn test_password_validator() {
        let validator = PasswordValidator::new([(
            "Admin",
            PasswordValidator::hash_password("iobroker").to_uppercase(),
        )]);
        assert_eq!(validator.user_count(), 1);

        let admin = Identity::normalize("admin");
        assert!(validator.verify(&admin, "iobroker").await);
        assert!(!validator.verify(&admin, "wrong").await);
        assert!(
            !validator
                .verify(&Identity::normalize("guest"), "iobroker")
                .await
        );
    }

    #[tokio::test]
    async fn test_successful_login_returns_identity() {
        let validator = Arc::new(CountingValidator::new("pw"));
        let (_clock, gate) = gate_with(validator.clone());

        let identity = gate.authenticate("Alice.Doe", "pw").await.unwrap();
        assert_eq!(identity.as_str(), "alice_doe");
        assert_eq!(validator.calls(), 1);
        assert_eq!(gate.pending_identities(), 0);
    }

    #[tokio::test]
    async fn test_variants_share_one_record() {
        let validator = Arc::new(CountingValidator::new("pw"));
        let (_clock, gate) = gate_with(validator);

        assert_eq!(
            gate.authenticate("Alice.Doe", "bad").await,
            Err(AuthError::InvalidCredentials)
        );
        let record = gate.guard().record("alice_doe").unwrap();
        assert_eq!(record.error_count, 1);

        assert_eq!(
            gate.authenticate("alice_doe ", "bad").await,
            Err(AuthError::InvalidCredentials)
        );
        assert_eq!(gate.guard().record("alice_doe").unwrap().error_count, 2);
        assert_eq!(gate.guard().tracked_identities(), 1);
    }

    #[tokio::test]
    async fn test_locked_identity_skips_validator() {
        let validator = Arc::new(CountingValidator::new("pw"));
        let (clock, gate) = gate_with(validator.clone());

        for _ in 0..5 {
            let _ = gate.authenticate("bob", "bad").await;
        }
        assert_eq!(validator.calls(), 5);

        // Even the correct password is refused while locked.
        assert_eq!(
            gate.authenticate("bob", "pw").await,
            Err(AuthError::Locked {
                retry_after_minutes: 1
            })
        );
        assert_eq!(validator.calls(), 5);

        clock.advance(Duration::from_secs(61));
        assert!(gate.authenticate("bob", "pw").await.is_ok());
        assert!(gate.guard().record("bob").is_none());
    }

    #[tokio::test]
    async fn test_concurrent_failures_are_all_counted() {
        let validator = Arc::new(CountingValidator {
            delay: Duration::from_millis(10),
            ..CountingValidator::new("pw")
        });
        let (_clock, gate) = gate_with(validator);
        let gate = Arc::new(gate);

        let attempts: Vec<_> = (0..4)
            .map(|_| {
                let gate = gate.clone();
                tokio::spawn(async move { gate.authenticate("carol", "bad").await })
            })
            .collect();
        for attempt in attempts {
            assert_eq!(attempt.await.unwrap(), Err(AuthError::InvalidCredentials));
        }

        assert_eq!(gate.guard().record("carol").unwrap().error_count, 4);
        assert_eq!(gate.pending_identities(), 0);
    }

    #[tokio::test]
    async fn test_metrics_labels() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let validator = Arc::new(CountingValidator::new("pw"));
        let (_clock, gate) = gate_with(validator);
        let gate = gate.with_metrics(metrics.clone());

        let _ = gate.authenticate("dave", "pw").await;
        let _ = gate.authenticate("dave", "bad").await;

        assert_eq!(
            metrics.auth_attempts_total.with_label_values(&["ok"]).get(),
            1.0
        );
        assert_eq!(
            metrics
                .auth_attempts_total
                .with_label_values(&["invalid"])
                .get(),
            1.0
        );
    }
}
