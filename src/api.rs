//! HTTP server for health and metrics endpoints

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::header,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use eyre::eyre;
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::info;

/// Batch progress shared between the runner and the HTTP server
#[derive(Debug, Default, Clone)]
pub struct RunStats {
    pub action: String,
    pub wallets_total: usize,
    pub completed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunStats {
    pub fn record(&mut self, success: bool) {
        self.completed += 1;
        if success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
    }
}

pub type SharedStats = Arc<RwLock<RunStats>>;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub action: String,
    pub wallets_total: usize,
    pub completed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Health check endpoint handler
async fn health_check(State(stats): State<SharedStats>) -> Json<HealthResponse> {
    let stats = stats.read().await;
    let status = match (stats.started_at, stats.finished_at) {
        (_, Some(_)) => "finished",
        (Some(_), None) => "running",
        (None, None) => "starting",
    };
    Json(HealthResponse {
        status: status.to_string(),
        action: stats.action.clone(),
        wallets_total: stats.wallets_total,
        completed: stats.completed,
        succeeded: stats.succeeded,
        failed: stats.failed,
        started_at: stats.started_at,
        finished_at: stats.finished_at,
    })
}

/// Liveness probe (always returns OK if server is running)
async fn liveness() -> &'static str {
    "OK"
}

/// Prometheus metrics endpoint
async fn prometheus_metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics",
        )
            .into_response();
    }

    match Response::builder()
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(axum::body::Body::from(buffer))
    {
        Ok(resp) => resp,
        Err(_) => (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to build metrics response",
        )
            .into_response(),
    }
}

pub fn router(stats: SharedStats) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/healthz", get(liveness))
        .route("/metrics", get(prometheus_metrics))
        .with_state(stats)
}

/// Start the HTTP server for health and metrics
pub async fn start_server(bind_address: &str, port: u16, stats: SharedStats) -> eyre::Result<()> {
    let addr: SocketAddr = format!("{}:{}", bind_address, port)
        .parse()
        .map_err(|e| eyre!("Invalid bind address {}:{}: {}", bind_address, port, e))?;
    info!("Health server listening on {}", addr);
    info!("  /health  - Batch progress (JSON)");
    info!("  /metrics - Prometheus metrics");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(stats)).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_reports_progress() {
        let stats: SharedStats = Arc::new(RwLock::new(RunStats {
            action: "DepositBridge".into(),
            wallets_total: 3,
            ..Default::default()
        }));

        let Json(health) = health_check(State(stats.clone())).await;
        assert_eq!(health.status, "starting");

        {
            let mut s = stats.write().await;
            s.started_at = Some(Utc::now());
            s.record(true);
            s.record(false);
        }
        let Json(health) = health_check(State(stats)).await;
        assert_eq!(health.status, "running");
        assert_eq!(health.completed, 2);
        assert_eq!(health.succeeded, 1);
        assert_eq!(health.failed, 1);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_encodes() {
        crate::metrics::UP.set(1.0);
        let resp = prometheus_metrics().await;
        assert_eq!(resp.status(), axum::http::StatusCode::OK);
    }
}
