//! Service status routes.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Serialize;

use super::error::ApiError;
use crate::hub::view::MapViewState;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct IndexResponse {
    pub message: &'static str,
    pub status: &'static str,
    pub clients: usize,
    pub current_state: MapViewState,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub clients_count: usize,
    pub map_state: MapViewState,
}

/// `GET /`: service banner.
pub async fn index(State(state): State<AppState>) -> Result<Json<IndexResponse>, ApiError> {
    let snapshot = state.hub.snapshot().await?;
    Ok(Json(IndexResponse {
        message: "mapsync websocket server",
        status: "running",
        clients: snapshot.clients(),
        current_state: snapshot.state,
    }))
}

/// `GET /api/status`: live client count and the current map view.
pub async fn status(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let snapshot = state.hub.snapshot().await?;
    Ok(Json(StatusResponse { clients_count: snapshot.clients(), map_state: snapshot.state }))
}

pub async fn healthz() -> StatusCode {
    StatusCode::OK
}
