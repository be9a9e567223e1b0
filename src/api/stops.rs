use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use utoipa::ToSchema;

use crate::api::{not_found, AppState, ErrorResponse};
use crate::scheduler::StopView;

#[derive(Debug, Serialize, ToSchema)]
pub struct StopListResponse {
    /// True once every stop has completed its first successful fetch
    pub ready: bool,
    pub stops: Vec<StopView>,
}

/// List current arrival estimates for all monitored stops
#[utoipa::path(
    get,
    path = "/api/stops",
    responses(
        (status = 200, description = "Current estimates for all monitored stops", body = StopListResponse)
    ),
    tag = "stops"
)]
pub async fn list_stops(State(state): State<AppState>) -> Json<StopListResponse> {
    let mut stops = Vec::with_capacity(state.stops.len());
    for handle in state.stops.iter() {
        stops.push(handle.view().await);
    }
    let ready = stops.iter().all(|view| view.initialized);
    Json(StopListResponse { ready, stops })
}

/// Get the current arrival estimate for one monitored stop
#[utoipa::path(
    get,
    path = "/api/stops/{stop_key}",
    params(
        ("stop_key" = String, Path, description = "Stable stop identifier")
    ),
    responses(
        (status = 200, description = "Current estimate for the stop", body = StopView),
        (status = 404, description = "Unknown stop", body = ErrorResponse)
    ),
    tag = "stops"
)]
pub async fn get_stop(
    State(state): State<AppState>,
    Path(stop_key): Path<String>,
) -> Result<Json<StopView>, (StatusCode, Json<ErrorResponse>)> {
    match state.stops.iter().find(|handle| handle.key() == stop_key) {
        Some(handle) => Ok(Json(handle.view().await)),
        None => Err(not_found(format!("unknown stop '{}'", stop_key))),
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(list_stops))
        .route("/{stop_key}", get(get_stop))
        .with_state(state)
}
