//! iorelay - authenticated event relay
//!
//! Reads store change events as JSON lines on stdin and fans them out to
//! every authenticated socket client.

use iorelay_protocol::RelayEvent;
use iorelay_server::metrics::run_metrics_server;
use iorelay_server::{
    tls, AuthGate, BruteForceGuard, Capabilities, Config, ConnectivityState, Metrics,
    PasswordValidator, ServerLifecycle, ServerSettings, SessionStore, SocketHubFactory,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::EnvFilter;

/// Events buffered between the source and the relay.
const EVENT_QUEUE_CAPACITY: usize = 4096;

/// How often expired session tokens are purged.
const SESSION_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if IORELAY_CONFIG is set, then env overrides)
    let config_path = std::env::var("IORELAY_CONFIG").ok();
    let mut config = match Config::load() {
        Ok(c) => {
            if let Some(ref path) = config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    if let Err(e) = config.load_secrets() {
        tracing::error!("Failed to load auth secrets: {}", e);
        return Err(e.into());
    }
    if let Err(e) = config.validate() {
        tracing::error!("Invalid configuration: {}", e);
        return Err(e.into());
    }

    tracing::info!("Starting iorelay");
    tracing::info!("  Port: {} (bind {})", config.network.port, config.network.bind);
    if config.auth.required {
        tracing::info!(
            "  Authentication: enabled ({} user(s), session ttl {}s)",
            config.auth.users.len(),
            config.auth.ttl_secs
        );
    } else {
        tracing::info!("  Authentication: disabled");
    }

    // A missing certificate is reported by the lifecycle as a fatal start error.
    let (certificates, tls_options) = if config.tls.enabled {
        let certificates = match tls::load_certificates(&config.tls) {
            Ok(certificates) => Some(Arc::new(certificates)),
            Err(e) => {
                tracing::error!("Cannot load certificates: {}", e);
                None
            }
        };
        let options = tls::load_tls_options(&config.tls)?;
        tracing::info!("  TLS: enabled");
        if options.require_client_cert {
            tracing::info!("  mTLS: enabled (client certificate required)");
        }
        (certificates, options)
    } else {
        tracing::info!("  TLS: disabled");
        (None, tls::TlsOptions::default())
    };

    let settings = ServerSettings::from_config(&config, certificates, tls_options)?;

    // Metrics
    let (metrics_shutdown, _) = broadcast::channel::<()>(1);
    let metrics = if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        let addr = config.metrics.bind_addr.parse()?;
        let rx = metrics_shutdown.subscribe();
        let m = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, m, rx).await {
                tracing::error!("Metrics server error: {}", e);
            }
        });
        Some(metrics)
    } else {
        None
    };

    // Authentication
    let validator = Arc::new(PasswordValidator::new(config.auth.users.iter()));
    let mut gate = AuthGate::new(Arc::new(BruteForceGuard::new()), validator);
    if let Some(ref metrics) = metrics {
        gate = gate.with_metrics(metrics.clone());
    }
    let sessions = Arc::new(SessionStore::new(settings.ttl));

    // Transport
    let connectivity = ConnectivityState::new();
    let mut hub_factory = SocketHubFactory::new(
        Arc::new(gate),
        sessions.clone(),
        Arc::new(connectivity.clone()),
    );
    if let Some(ref metrics) = metrics {
        hub_factory = hub_factory.with_metrics(metrics.clone());
    }
    let capabilities = Capabilities::standard(Arc::new(connectivity), Arc::new(hub_factory));
    let lifecycle = ServerLifecycle::new(settings, capabilities);

    // Event source -> relay
    let mut relay = lifecycle.relay();
    if let Some(ref metrics) = metrics {
        relay = relay.with_metrics(metrics.clone());
    }
    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let relay_handle = tokio::spawn(relay.run(event_rx));
    let reader_handle = tokio::spawn(read_events(event_tx));

    let purge_handle = {
        let sessions = sessions.clone();
        let metrics = metrics.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SESSION_PURGE_INTERVAL);
            loop {
                interval.tick().await;
                let purged = sessions.purge_expired();
                if purged > 0 {
                    tracing::debug!("Purged {} expired session(s)", purged);
                }
                if let Some(ref metrics) = metrics {
                    metrics.sessions_active.set(sessions.len() as f64);
                }
            }
        })
    };

    if let Err(e) = lifecycle.start().await {
        tracing::error!("Terminating: {}", e);
        std::process::exit(e.exit_code());
    }

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("Received shutdown signal, stopping relay...");

    lifecycle
        .shutdown(|| {
            sessions.clear();
        })
        .await;

    let _ = metrics_shutdown.send(());
    reader_handle.abort();
    purge_handle.abort();
    relay_handle.abort();

    tracing::info!("iorelay stopped");
    Ok(())
}

/// Forwards JSON-encoded relay events from stdin.
async fn read_events(tx: mpsc::Sender<RelayEvent>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<RelayEvent>(line) {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("Ignoring malformed event: {}", e),
                }
            }
            Ok(None) => {
                tracing::info!("Event source closed");
                break;
            }
            Err(e) => {
                tracing::error!("Failed to read events: {}", e);
                break;
            }
        }
    }
}
