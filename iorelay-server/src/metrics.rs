//! Prometheus metrics for the relay.
//!
//! This module provides:
//! - Metrics registry with connection, auth, and relay counters
//! - HTTP server to expose metrics at `/metrics` endpoint

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Prometheus metrics for the relay server.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Total connections accepted.
    pub connections_total: Counter,
    /// Currently active connections.
    pub connections_active: Gauge,
    /// Connections turned away at the connection limit.
    pub connections_rejected_total: Counter,
    /// Authentication attempts by result (`ok`, `invalid`, `locked`).
    pub auth_attempts_total: CounterVec,
    /// Events handed to the hub, by kind.
    pub events_relayed_total: CounterVec,
    /// Events dropped because no hub was ready, by kind.
    pub events_dropped_total: CounterVec,
    /// Live session tokens.
    pub sessions_active: Gauge,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        // Connections
        let connections_total = Counter::with_opts(Opts::new(
            "iorelay_connections_total",
            "Total number of connections accepted",
        ))?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = Gauge::with_opts(Opts::new(
            "iorelay_connections_active",
            "Number of currently active connections",
        ))?;
        registry.register(Box::new(connections_active.clone()))?;

        let connections_rejected_total = Counter::with_opts(Opts::new(
            "iorelay_connections_rejected_total",
            "Connections rejected at the connection limit",
        ))?;
        registry.register(Box::new(connections_rejected_total.clone()))?;

        // Auth
        let auth_attempts_total = CounterVec::new(
            Opts::new("iorelay_auth_attempts_total", "Authentication attempts by result"),
            &["result"],
        )?;
        registry.register(Box::new(auth_attempts_total.clone()))?;

        // Relay
        let events_relayed_total = CounterVec::new(
            Opts::new("iorelay_events_relayed_total", "Events relayed to clients by kind"),
            &["kind"],
        )?;
        registry.register(Box::new(events_relayed_total.clone()))?;

        let events_dropped_total = CounterVec::new(
            Opts::new(
                "iorelay_events_dropped_total",
                "Events dropped before the hub was ready, by kind",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(events_dropped_total.clone()))?;

        let sessions_active = Gauge::with_opts(Opts::new(
            "iorelay_sessions_active",
            "Number of live session tokens",
        ))?;
        registry.register(Box::new(sessions_active.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            connections_rejected_total,
            auth_attempts_total,
            events_relayed_total,
            events_dropped_total,
            sessions_active,
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
        }
        buffer
    }

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Runs the HTTP metrics server.
///
/// The server listens on the given address and serves metrics at `/metrics`.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { handle_request(req, metrics).await }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Metrics server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }

    Ok(())
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    Ok(route(req.uri().path(), &metrics))
}

fn route(path: &str, metrics: &Metrics) -> Response<Full<Bytes>> {
    match path {
        "/metrics" => respond(
            StatusCode::OK,
            Some("text/plain; version=0.0.4; charset=utf-8"),
            metrics.encode(),
        ),
        "/health" | "/healthz" => respond(StatusCode::OK, None, "OK"),
        _ => respond(StatusCode::NOT_FOUND, None, "Not Found"),
    }
}

fn respond(
    status: StatusCode,
    content_type: Option<&'static str>,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    if let Some(content_type) = content_type {
        response.headers_mut().insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static(content_type),
        );
    }
    response
}
