//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via IORELAY_CONFIG)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Authentication configuration.
    pub auth: AuthConfig,
    /// TLS configuration.
    pub tls: TlsConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("IORELAY_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.auth.apply_env_overrides();
        self.tls.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Loads user hashes from the secrets file if configured.
    pub fn load_secrets(&mut self) -> Result<(), ConfigError> {
        self.auth.load_secrets()
    }

    /// Validates the combined configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.required && self.auth.users.is_empty() {
            return Err(ConfigError::ValidationError(
                "auth.required=true but no users configured".to_string(),
            ));
        }
        self.tls.validate()
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Port to listen on. 0 is rejected at startup.
    pub port: u16,
    /// Address to bind to. Empty or `0.0.0.0` means all interfaces.
    pub bind: String,
    /// Accept the next free port when `port` is taken.
    pub find_next_port: bool,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Ask the transport to skip fallback negotiation.
    pub force_transport: bool,
    /// Idle connection timeout in seconds.
    pub idle_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: iorelay_protocol::DEFAULT_PORT,
            bind: "0.0.0.0".to_string(),
            find_next_port: false,
            max_connections: 1000,
            force_transport: false,
            idle_timeout_secs: 300,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("IORELAY_PORT") {
            if let Ok(parsed) = port.parse() {
                self.port = parsed;
            }
        }

        if let Ok(bind) = std::env::var("IORELAY_BIND") {
            self.bind = bind;
        }

        if let Ok(find) = std::env::var("IORELAY_FIND_NEXT_PORT") {
            self.find_next_port = parse_flag(&find);
        }

        if let Ok(max) = std::env::var("IORELAY_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }

        if let Ok(force) = std::env::var("IORELAY_FORCE_TRANSPORT") {
            self.force_transport = parse_flag(&force);
        }

        if let Ok(timeout) = std::env::var("IORELAY_IDLE_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.idle_timeout_secs = secs;
            }
        }
    }

    /// Returns the idle timeout as a Duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Whether clients must log in before receiving events.
    pub required: bool,
    /// Session token lifetime in seconds.
    pub ttl_secs: u64,
    /// User name -> SHA-256 password hash (hex).
    /// Generate hashes with: `printf '%s' <password> | sha256sum`
    pub users: BTreeMap<String, String>,
    /// Optional path to a secrets file with `user:hash` lines.
    pub secrets_file: Option<PathBuf>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            required: false,
            ttl_secs: 3600,
            users: BTreeMap::new(),
            secrets_file: None,
        }
    }
}

impl AuthConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(auth) = std::env::var("IORELAY_AUTH_REQUIRED") {
            self.required = parse_flag(&auth);
        }

        if let Ok(ttl) = std::env::var("IORELAY_AUTH_TTL") {
            if let Ok(secs) = ttl.parse() {
                self.ttl_secs = secs;
            }
        }

        if let Ok(entry) = std::env::var("IORELAY_AUTH_USER") {
            if let Some((user, hash)) = parse_user_line(&entry) {
                self.users.insert(user, hash);
            }
        }

        if let Ok(path) = std::env::var("IORELAY_AUTH_SECRETS_FILE") {
            self.secrets_file = Some(PathBuf::from(path));
        }
    }

    /// Loads user hashes from the secrets file if configured.
    pub fn load_secrets(&mut self) -> Result<(), ConfigError> {
        if let Some(ref path) = self.secrets_file {
            let content =
                std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(path.clone(), e))?;
            for (lineno, line) in content.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let (user, hash) = parse_user_line(line).ok_or_else(|| {
                    ConfigError::ParseError(
                        path.clone(),
                        format!("line {}: expected <user>:<sha256-hex>", lineno + 1),
                    )
                })?;
                self.users.insert(user, hash);
            }
        }
        Ok(())
    }

    /// Returns the session lifetime. Zero means unset.
    pub fn ttl(&self) -> Duration {
        match self.ttl_secs {
            0 => crate::session::DEFAULT_SESSION_TTL,
            secs => Duration::from_secs(secs),
        }
    }
}

/// TLS configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Serve over TLS.
    pub enabled: bool,
    /// Path to PEM-encoded server certificate chain.
    pub cert_path: Option<PathBuf>,
    /// Path to PEM-encoded private key.
    pub key_path: Option<PathBuf>,
    /// Require client certificate authentication (mTLS).
    pub require_client_cert: bool,
    /// Path to PEM-encoded CA certificate(s) for verifying client certs.
    pub client_ca_path: Option<PathBuf>,
}

impl TlsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("IORELAY_TLS_ENABLED") {
            self.enabled = parse_flag(&enabled);
        }
        if let Ok(path) = std::env::var("IORELAY_TLS_CERT") {
            self.cert_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("IORELAY_TLS_KEY") {
            self.key_path = Some(PathBuf::from(path));
        }
        if let Ok(require) = std::env::var("IORELAY_TLS_REQUIRE_CLIENT_CERT") {
            self.require_client_cert = parse_flag(&require);
        }
        if let Ok(path) = std::env::var("IORELAY_TLS_CLIENT_CA") {
            self.client_ca_path = Some(PathBuf::from(path));
        }
    }

    /// Validates TLS configuration.
    ///
    /// Missing certificate paths are not an error here: the listener refuses
    /// to start in secure mode without certificates.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.require_client_cert && self.client_ca_path.is_none() {
            return Err(ConfigError::ValidationError(
                "mTLS enabled but client_ca_path not set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    pub enabled: bool,
    /// Address to bind the metrics server to.
    pub bind_addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: "127.0.0.1:9094".to_string(),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("IORELAY_METRICS_ENABLED") {
            self.enabled = parse_flag(&enabled);
        }
        if let Ok(addr) = std::env::var("IORELAY_METRICS_BIND") {
            self.bind_addr = addr;
        }
    }
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

fn parse_user_line(line: &str) -> Option<(String, String)> {
    let (user, hash) = line.split_once(':')?;
    let (user, hash) = (user.trim(), hash.trim());
    if user.is_empty() || hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some((user.to_string(), hash.to_lowercase()))
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
