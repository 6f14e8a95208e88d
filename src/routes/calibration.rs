//! Calibration routes: compute, store, and apply transform matrices.
//!
//! When the calibration document failed to open at startup every route here
//! answers 503; the hub is unaffected.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::info;

use super::error::ApiError;
use crate::calibration::store::{CalibrationKey, CalibrationMode, CalibrationStore, StoredCalibration};
use crate::calibration::{self, CalibrationPoint, TransformMatrix};
use crate::protocol::Command;
use crate::state::AppState;

fn require_store(state: &AppState) -> Result<&Arc<CalibrationStore>, ApiError> {
    state.calibrations.as_ref().ok_or_else(ApiError::store_unavailable)
}

// =============================================================================
// BODIES
// =============================================================================

#[derive(Debug, Serialize, PartialEq)]
pub struct CalibrationResponse {
    pub mode: CalibrationMode,
    pub map_identifier: String,
    pub area: Option<String>,
    pub matrix: TransformMatrix,
    #[serde(with = "time::serde::rfc3339::option")]
    pub saved_at: Option<OffsetDateTime>,
}

impl From<StoredCalibration> for CalibrationResponse {
    fn from(stored: StoredCalibration) -> Self {
        Self {
            mode: stored.key.mode,
            map_identifier: stored.key.map_identifier,
            area: stored.key.area,
            matrix: stored.matrix,
            saved_at: stored.saved_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateCalibrationBody {
    pub mode: CalibrationMode,
    pub map_identifier: String,
    #[serde(default)]
    pub area: Option<String>,
    pub points: Vec<CalibrationPoint>,
}

#[derive(Debug, Deserialize)]
pub struct AreaQuery {
    pub area: Option<String>,
}

/// A raw coordinate to push through a stored calibration.
#[derive(Debug, Deserialize)]
pub struct TransformBody {
    pub mode: CalibrationMode,
    pub map_identifier: String,
    #[serde(default)]
    pub area: Option<String>,
    pub x: f64,
    pub y: f64,
}

impl TransformBody {
    fn key(&self) -> CalibrationKey {
        CalibrationKey::new(self.mode, self.map_identifier.clone(), self.area.clone())
    }
}

#[derive(Debug, Serialize, PartialEq)]
pub struct TransformResponse {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct JumpResponse {
    pub lat: f64,
    pub lon: f64,
    pub version: u64,
}

// =============================================================================
// HANDLERS
// =============================================================================

/// `GET /api/calibrations`: every stored calibration, in key order.
pub async fn list_calibrations(State(state): State<AppState>) -> Result<Json<Vec<CalibrationResponse>>, ApiError> {
    let store = require_store(&state)?;
    Ok(Json(store.entries().into_iter().map(CalibrationResponse::from).collect()))
}

/// `POST /api/calibrations`: fit a matrix to 2 or 3 points and store it.
/// 201 for a new key, 200 when an existing calibration was replaced.
pub async fn create_calibration(
    State(state): State<AppState>,
    Json(body): Json<CreateCalibrationBody>,
) -> Result<(StatusCode, Json<CalibrationResponse>), ApiError> {
    let store = require_store(&state)?;
    let matrix = calibration::calculate_transform_matrix(&body.points)?;
    let key = CalibrationKey::new(body.mode, body.map_identifier, body.area);
    let saved = store.save(key, matrix)?;
    let status = if saved.replaced { StatusCode::OK } else { StatusCode::CREATED };
    Ok((status, Json(saved.entry.into())))
}

/// `GET /api/calibrations/{mode}/{map}?area=`: one stored calibration.
pub async fn get_calibration(
    State(state): State<AppState>,
    Path((mode, map_identifier)): Path<(CalibrationMode, String)>,
    Query(query): Query<AreaQuery>,
) -> Result<Json<CalibrationResponse>, ApiError> {
    let store = require_store(&state)?;
    let key = CalibrationKey::new(mode, map_identifier, query.area);
    Ok(Json(store.entry(&key)?.into()))
}

/// `DELETE /api/calibrations/{mode}/{map}?area=`: idempotent; absent keys
/// also answer 204.
pub async fn delete_calibration(
    State(state): State<AppState>,
    Path((mode, map_identifier)): Path<(CalibrationMode, String)>,
    Query(query): Query<AreaQuery>,
) -> Result<StatusCode, ApiError> {
    let store = require_store(&state)?;
    let key = CalibrationKey::new(mode, map_identifier, query.area);
    store.delete(&key)?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/transform`: raw `(x, y)` to `(lat, lon)`.
pub async fn transform(
    State(state): State<AppState>,
    Json(body): Json<TransformBody>,
) -> Result<Json<TransformResponse>, ApiError> {
    let (lat, lon) = apply_stored(&state, &body)?;
    Ok(Json(TransformResponse { lat, lon }))
}

/// `POST /api/jump`: transform a raw coordinate and move every viewer there.
pub async fn jump(State(state): State<AppState>, Json(body): Json<TransformBody>) -> Result<Json<JumpResponse>, ApiError> {
    let (lat, lon) = apply_stored(&state, &body)?;
    let view = state.hub.submit_external(Command::JumpTo { lat, lng: lon }).await?;
    info!(key = %body.key(), x = body.x, y = body.y, lat, lon, version = view.version, "jump submitted");
    Ok(Json(JumpResponse { lat, lon, version: view.version }))
}

fn apply_stored(state: &AppState, body: &TransformBody) -> Result<(f64, f64), ApiError> {
    let store = require_store(state)?;
    let matrix = store.load(&body.key())?;
    Ok(calibration::transform_checked(body.x, body.y, &matrix)?)
}

#[cfg(test)]
#[path = "calibration_test.rs"]
mod tests;
