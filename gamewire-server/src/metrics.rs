//! Prometheus metrics for the gamewire server.
//!
//! This module provides:
//! - Metrics registry with counters, gauges, and histograms
//! - HTTP server to expose metrics at `/metrics` endpoint

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Handler duration histogram buckets (in seconds).
const DURATION_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 1.0];

/// Prometheus metrics for the gamewire server.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Total connections accepted by transport.
    pub connections_total: IntCounterVec,
    /// Currently open connections by transport.
    pub connections_active: IntGaugeVec,
    /// Decoded inbound messages by transport.
    pub messages_total: IntCounterVec,
    /// Protocol errors by transport.
    pub protocol_errors_total: IntCounterVec,
    /// Dispatch outcomes (replied, void, dropped, failed, rejected).
    pub dispatch_total: IntCounterVec,
    /// Handler duration histogram by command code.
    pub handler_duration: HistogramVec,
    /// Idle heartbeats sent.
    pub heartbeats_total: IntCounter,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        // Connections
        let connections_total = IntCounterVec::new(
            Opts::new(
                "gamewire_connections_total",
                "Total number of connections accepted",
            ),
            &["transport"],
        )?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = IntGaugeVec::new(
            Opts::new(
                "gamewire_connections_active",
                "Number of currently open connections",
            ),
            &["transport"],
        )?;
        registry.register(Box::new(connections_active.clone()))?;

        // Inbound traffic
        let messages_total = IntCounterVec::new(
            Opts::new("gamewire_messages_total", "Decoded inbound messages"),
            &["transport"],
        )?;
        registry.register(Box::new(messages_total.clone()))?;

        let protocol_errors_total = IntCounterVec::new(
            Opts::new(
                "gamewire_protocol_errors_total",
                "Frames rejected by the decoder",
            ),
            &["transport"],
        )?;
        registry.register(Box::new(protocol_errors_total.clone()))?;

        // Dispatch
        let dispatch_total = IntCounterVec::new(
            Opts::new("gamewire_dispatch_total", "Dispatch outcomes"),
            &["outcome"],
        )?;
        registry.register(Box::new(dispatch_total.clone()))?;

        let handler_duration = HistogramVec::new(
            HistogramOpts::new(
                "gamewire_handler_duration_seconds",
                "Handler duration in seconds by command code",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["code"],
        )?;
        registry.register(Box::new(handler_duration.clone()))?;

        let heartbeats_total = IntCounter::with_opts(Opts::new(
            "gamewire_heartbeats_total",
            "Heartbeats sent on idle connections",
        ))?;
        registry.register(Box::new(heartbeats_total.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            messages_total,
            protocol_errors_total,
            dispatch_total,
            handler_duration,
            heartbeats_total,
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
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

fn respond(status: StatusCode, content_type: Option<&str>, body: Vec<u8>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    if let Some(content_type) = content_type {
        if let Ok(value) = hyper::header::HeaderValue::from_str(content_type) {
            response
                .headers_mut()
                .insert(hyper::header::CONTENT_TYPE, value);
        }
    }
    response
}

/// Handles an HTTP request to the metrics server.
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => match metrics.encode() {
            Ok(body) => respond(
                StatusCode::OK,
                Some("text/plain; version=0.0.4; charset=utf-8"),
                body,
            ),
            Err(e) => respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                None,
                e.to_string().into_bytes(),
            ),
        },
        "/health" | "/healthz" => respond(StatusCode::OK, None, b"OK".to_vec()),
        _ => respond(StatusCode::NOT_FOUND, None, b"Not Found".to_vec()),
    };

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();

        metrics.connections_total.with_label_values(&["socket"]).inc();
        metrics
            .connections_active
            .with_label_values(&["event_loop"])
            .inc();
        metrics.messages_total.with_label_values(&["websocket"]).inc();
        metrics.dispatch_total.with_label_values(&["replied"]).inc();
        metrics.heartbeats_total.inc();

        metrics
            .handler_duration
            .with_label_values(&["(1,1)"])
            .observe(0.001);

        let encoded = String::from_utf8(metrics.encode().unwrap()).unwrap();

        assert!(encoded.contains("gamewire_connections_total"));
        assert!(encoded.contains("gamewire_connections_active"));
        assert!(encoded.contains("gamewire_messages_total"));
        assert!(encoded.contains("gamewire_dispatch_total"));
        assert!(encoded.contains("gamewire_handler_duration_seconds"));
        assert!(encoded.contains("gamewire_heartbeats_total 1"));
    }

    #[tokio::test]
    async fn test_metrics_http_endpoint() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let metrics = Arc::new(Metrics::new().unwrap());
        metrics.heartbeats_total.inc();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let server = tokio::spawn(run_metrics_server(addr, metrics, shutdown_rx));

        let mut stream = None;
        for _ in 0..50 {
            if let Ok(s) = tokio::net::TcpStream::connect(addr).await {
                stream = Some(s);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let mut stream = stream.unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("gamewire_heartbeats_total 1"));

        shutdown_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }
}
