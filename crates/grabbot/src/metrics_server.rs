//! HTTP server exposing Prometheus metrics and a health check
//!
//! Runs on its own port (`METRICS_PORT`, default 9090):
//! - `/metrics` - Prometheus text format
//! - `/health`  - liveness plus current queue figures

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use prometheus::{Encoder, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::Instant;

use grabcore::core::utils::format_duration;
use grabcore::download::JobQueue;

#[derive(Clone)]
struct AppState {
    start_time: Instant,
    queue: JobQueue,
}

/// Serves `/metrics` and `/health` until the listener fails.
pub async fn start_metrics_server(port: u16, queue: JobQueue) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let state = AppState {
        start_time: Instant::now(),
        queue,
    };

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::new(state));

    log::info!("Starting metrics server on http://{}", addr);
    log::info!("  /metrics - Prometheus metrics");
    log::info!("  /health  - Health check");

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn metrics_handler() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (StatusCode::OK, [(header::CONTENT_TYPE, encoder.format_type().to_string())], buffer).into_response(),
        Err(e) => {
            log::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
                .into_response()
        }
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let uptime = state.start_time.elapsed().as_secs();
    let body = serde_json::json!({
        "status": "healthy",
        "uptime_seconds": uptime,
        "uptime_human": format_duration(uptime),
        "service": "grabbot",
        "version": env!("CARGO_PKG_VERSION"),
        "jobs": {
            "queued": state.queue.queued_len(),
            "active": state.queue.active_len(),
        },
    });
    (StatusCode::OK, axum::Json(body))
}
