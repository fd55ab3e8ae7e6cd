//! Prometheus metrics and the node's HTTP status endpoints.

use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;

/// What the status endpoints report about a running node.
pub trait NodeStatus: Send + Sync + 'static {
    /// Identity announced in HELLO.
    fn identity(&self) -> &str;
    /// Started and not yet stopped.
    fn is_running(&self) -> bool;
    /// Number of live peer connections.
    fn connection_count(&self) -> usize;
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct ReadyResponse {
    identity: String,
    running: bool,
    connections: usize,
}

type SharedStatus = Arc<dyn NodeStatus>;

/// Serves `/metrics`, `/health` and `/ready` until the task is dropped.
///
/// # Errors
///
/// Returns an error if the recorder is already installed or binding fails.
pub async fn start_metrics_server(addr: SocketAddr, node: SharedStatus) -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let app = Router::new()
        .route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .with_state(node);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy" })
}

/// 200 while the engine runs, 503 before start and after stop. The body
/// carries the live connection count either way.
async fn ready_handler(
    State(node): State<SharedStatus>,
) -> (StatusCode, Json<ReadyResponse>) {
    let running = node.is_running();
    let body = ReadyResponse {
        identity: node.identity().to_owned(),
        running,
        connections: node.connection_count(),
    };
    let code = if running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

/// Connection count gauges.
pub mod gauges {
    /// Increment the active connections gauge.
    pub fn inc_connections_active() {
        metrics::gauge!("peerwire_connections_active").increment(1.0);
    }

    /// Decrement the active connections gauge.
    pub fn dec_connections_active() {
        metrics::gauge!("peerwire_connections_active").decrement(1.0);
    }
}

/// Event counters.
pub mod counters {
    /// Record a finished handshake with the given status label.
    pub fn handshakes_total(status: &'static str) {
        metrics::counter!("peerwire_handshakes_total", "status" => status).increment(1);
    }

    /// Count one application message in the given direction.
    pub fn messages_total(direction: &'static str) {
        metrics::counter!("peerwire_messages_total", "direction" => direction).increment(1);
    }

    /// Count a disconnect with the given reason label.
    pub fn disconnects_total(reason: &'static str) {
        metrics::counter!("peerwire_disconnects_total", "reason" => reason).increment(1);
    }

    /// Increment the malformed-frame counter.
    pub fn malformed_frames_total() {
        metrics::counter!("peerwire_malformed_frames_total").increment(1);
    }

    /// Increment the failed-callback counter.
    pub fn callback_failures_total() {
        metrics::counter!("peerwire_callback_failures_total").increment(1);
    }
}

/// Latency histograms.
pub mod histograms {
    /// Record how long establishing a connection took, in seconds.
    pub fn connect_latency_seconds(value: f64) {
        metrics::histogram!("peerwire_connect_latency_seconds").record(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeNode {
        running: AtomicBool,
        connections: AtomicUsize,
    }

    impl NodeStatus for FakeNode {
        fn identity(&self) -> &str {
            "fake"
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::Relaxed)
        }

        fn connection_count(&self) -> usize {
            self.connections.load(Ordering::Relaxed)
        }
    }

    #[tokio::test]
    async fn ready_is_unavailable_until_running() {
        let node = Arc::new(FakeNode::default());
        let (code, Json(body)) = ready_handler(State(node.clone() as SharedStatus)).await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert!(!body.running);

        node.running.store(true, Ordering::Relaxed);
        let (code, Json(body)) = ready_handler(State(node as SharedStatus)).await;
        assert_eq!(code, StatusCode::OK);
        assert!(body.running);
    }

    #[tokio::test]
    async fn ready_reports_connection_count() {
        let node = Arc::new(FakeNode::default());
        node.running.store(true, Ordering::Relaxed);
        node.connections.store(3, Ordering::Relaxed);

        let (_, Json(body)) = ready_handler(State(node as SharedStatus)).await;
        assert_eq!(body.connections, 3);
        assert_eq!(body.identity, "fake");
    }
}
