use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use utoipa::ToSchema;

use crate::api::AppState;

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Whether the service is running
    pub healthy: bool,
    /// Whether every monitored stop has completed its first fetch
    pub ready: bool,
    /// Number of monitored stops
    pub stop_count: usize,
    /// Number of stops with a usable current estimate
    pub available_count: usize,
}

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service health status", body = HealthResponse)
    ),
    tag = "health"
)]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let mut ready = true;
    let mut available_count = 0;
    for handle in state.stops.iter() {
        let view = handle.view().await;
        if !view.initialized {
            ready = false;
        }
        if view.available {
            available_count += 1;
        }
    }

    Json(HealthResponse {
        healthy: true,
        ready,
        stop_count: state.stops.len(),
        available_count,
    })
}

pub fn router(state: AppState) -> Router {
    Router::new().route("/", get(health_check)).with_state(state)
}
