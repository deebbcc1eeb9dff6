use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use crate::error::LimiterError;
use crate::health::HealthChecker;
use crate::metrics::AdmissionMetrics;
use crate::throttler::Throttler;

/// Shared application state
pub type SharedState = Arc<AppState>;

/// Application state containing the throttler and the health checker
pub struct AppState {
    pub throttler: Throttler,
    pub health: HealthChecker,
    /// Bearer token for the admin routes. `None` locks them.
    pub admin_token: Option<String>,
}

impl AppState {
    pub fn new(throttler: Throttler, health: HealthChecker, admin_token: Option<String>) -> SharedState {
        Arc::new(Self {
            throttler,
            health,
            admin_token,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub status: String,
    pub message: String,
    pub key: String,
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub algorithm: String,
    pub uptime_seconds: u64,
    #[serde(flatten)]
    pub counters: AdmissionMetrics,
}

/// Clear the rate limit state of one client key, e.g. `api_key:abc123`.
pub async fn reset_rate_limit(
    State(state): State<SharedState>,
    Path(client_key): Path<String>,
) -> Result<impl IntoResponse, LimiterError> {
    state.throttler.reset(&client_key).await?;

    tracing::info!(client_key = %client_key, "Rate limit reset via admin endpoint");

    Ok(Json(ResetResponse {
        status: "success".to_string(),
        message: "Rate limit state cleared".to_string(),
        key: client_key,
    }))
}

pub async fn metrics(State(state): State<SharedState>) -> impl IntoResponse {
    Json(MetricsResponse {
        algorithm: state.throttler.algorithm_name().to_string(),
        uptime_seconds: state.health.uptime().as_secs(),
        counters: state.throttler.metrics().snapshot(),
    })
}

/// Health check endpoint
pub async fn health_check(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.health.check_health().await)
}

/// Readiness check endpoint. The service stays ready while the store is
/// down because admission falls back to the failure policy.
pub async fn readiness_check(State(state): State<SharedState>) -> impl IntoResponse {
    let health = state.health.check_health().await;

    if health.is_healthy() {
        (StatusCode::OK, Json(serde_json::json!({
            "status": "ready",
            "store": "connected"
        })))
    } else {
        (StatusCode::OK, Json(serde_json::json!({
            "status": "ready",
            "store": "disconnected",
            "note": "Admission decisions follow the configured failure policy"
        })))
    }
}

/// Stand-in for the protected upstream. Deployments mount their own routes
/// behind the rate limit layer instead.
pub async fn forward() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "forwarded" }))
}
