//! Prometheus metrics for the mock server.
//!
//! This module provides:
//! - Metrics registry with counters and gauges for frames, responses and errors
//! - HTTP server to expose metrics at `/metrics` endpoint

use crate::error::ServerError;
use cqlmock_protocol::{ErrorCode, Opcode};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Prometheus metrics for the mock server.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Total connections accepted.
    pub connections_total: Counter,
    /// Currently active connections.
    pub connections_active: Gauge,
    /// Request frames by opcode.
    pub frames_total: CounterVec,
    /// Response frames by opcode.
    pub responses_total: CounterVec,
    /// ERROR responses by error code.
    pub errors_total: CounterVec,
    /// Frames rejected for an unsupported protocol version.
    pub invalid_protocol_total: Counter,
    /// Requests currently parked behind a wait.
    pub pending_waits: Gauge,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        // Connections
        let connections_total = Counter::with_opts(Opts::new(
            "cqlmock_connections_total",
            "Total number of connections accepted",
        ))?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = Gauge::with_opts(Opts::new(
            "cqlmock_connections_active",
            "Number of currently active connections",
        ))?;
        registry.register(Box::new(connections_active.clone()))?;

        // Frames
        let frames_total = CounterVec::new(
            Opts::new("cqlmock_frames_total", "Total request frames by opcode"),
            &["opcode"],
        )?;
        registry.register(Box::new(frames_total.clone()))?;

        let responses_total = CounterVec::new(
            Opts::new("cqlmock_responses_total", "Total response frames by opcode"),
            &["opcode"],
        )?;
        registry.register(Box::new(responses_total.clone()))?;

        // Errors
        let errors_total = CounterVec::new(
            Opts::new("cqlmock_errors_total", "Total error responses by error code"),
            &["code"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let invalid_protocol_total = Counter::with_opts(Opts::new(
            "cqlmock_invalid_protocol_total",
            "Total frames rejected for an unsupported protocol version",
        ))?;
        registry.register(Box::new(invalid_protocol_total.clone()))?;

        // Waits
        let pending_waits = Gauge::with_opts(Opts::new(
            "cqlmock_pending_waits",
            "Number of requests waiting on a timer",
        ))?;
        registry.register(Box::new(pending_waits.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            frames_total,
            responses_total,
            errors_total,
            invalid_protocol_total,
            pending_waits,
        })
    }

    /// Counts a request frame. Unknown opcodes share one label.
    pub fn record_frame(&self, opcode: u8) {
        let label = Opcode::from_u8(opcode).map_or("UNKNOWN", Opcode::name);
        self.frames_total.with_label_values(&[label]).inc();
    }

    pub fn record_response(&self, opcode: Opcode) {
        self.responses_total
            .with_label_values(&[opcode.name()])
            .inc();
    }

    /// Counts an error response by its code name, or the hex code if unknown.
    pub fn record_error(&self, code: i32) {
        match ErrorCode::from_code(code) {
            Some(known) => self
                .errors_total
                .with_label_values(&[&known.to_string()])
                .inc(),
            None => self
                .errors_total
                .with_label_values(&[&format!("{:#x}", code)])
                .inc(),
        }
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
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
) -> Result<(), ServerError> {
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

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><title>cqlmock Metrics</title></head>
<body>
<h1>cqlmock Metrics</h1>
<p><a href="/metrics">Metrics</a></p>
</body>
</html>"#;

fn response(
    status: StatusCode,
    content_type: Option<&'static str>,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    if let Some(content_type) = content_type {
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    }
    response
}

/// Handles an HTTP request to the metrics server.
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => response(
            StatusCode::OK,
            Some("text/plain; version=0.0.4; charset=utf-8"),
            metrics.encode(),
        ),
        "/health" | "/healthz" => response(StatusCode::OK, None, "OK"),
        "/" => response(StatusCode::OK, Some("text/html"), INDEX_HTML),
        _ => response(StatusCode::NOT_FOUND, None, "Not Found"),
    };

    Ok(response)
}
