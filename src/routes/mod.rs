//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! Binds the hub websocket, the status endpoints, and the calibration API
//! under one Axum router. Every route shares `AppState`; CORS is open so a
//! control panel served from anywhere can reach the API.

pub mod calibration;
pub mod error;
pub mod status;
pub mod ws;

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(status::index))
        .route("/api/status", get(status::status))
        .route("/healthz", get(status::healthz))
        .route("/ws", get(ws::handle_ws))
        .route(
            "/api/calibrations",
            get(calibration::list_calibrations).post(calibration::create_calibration),
        )
        .route(
            "/api/calibrations/{mode}/{map}",
            get(calibration::get_calibration).delete(calibration::delete_calibration),
        )
        .route("/api/transform", post(calibration::transform))
        .route("/api/jump", post(calibration::jump))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
