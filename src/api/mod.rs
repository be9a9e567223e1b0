pub mod health;
pub mod stops;
pub mod ws;

use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::providers::ApiRequestSender;
use crate::scheduler::{EstimatorHandle, StopUpdateSender};

/// Shared state for API handlers
#[derive(Clone)]
pub struct AppState {
    pub stops: Arc<Vec<EstimatorHandle>>,
    pub updates_tx: StopUpdateSender,
    pub requests_tx: ApiRequestSender,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

pub fn not_found(message: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/stops", stops::router(state.clone()))
        .nest("/health", health::router(state.clone()))
        .route("/ws/stops", get(ws::ws_stops).with_state(state.clone()))
        .route("/ws/requests", get(ws::ws_requests).with_state(state))
}
