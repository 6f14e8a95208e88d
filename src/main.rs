mod calibration;
mod config;
mod hub;
mod protocol;
mod routes;
mod state;

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::calibration::store::CalibrationStore;
use crate::hub::SyncHub;
use crate::hub::view::MapViewState;

#[tokio::main]
async fn main() {
    // A missing .env file is fine; the process environment still applies.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = config::Config::from_env().expect("invalid configuration");

    // Non-fatal: the hub runs without calibration if the document is unusable.
    let calibrations = match CalibrationStore::open(&cfg.calibration_file) {
        Ok(store) => {
            tracing::info!(
                path = %store.path().display(),
                entries = store.len(),
                empty = store.is_empty(),
                "calibration store ready"
            );
            Some(Arc::new(store))
        }
        Err(e) => {
            tracing::error!(error = %e, "calibration store unavailable; calibration routes disabled");
            None
        }
    };

    let limits = cfg.view_limits();
    let map_name = config::load_initial_map_name(&cfg.maps_file);
    let (hub, sequencer) = SyncHub::spawn(MapViewState::new(map_name, &limits), limits, cfg.hub_queue_depth);

    let state = state::AppState::new(hub.clone(), calibrations, cfg.session);
    let app = routes::app(state);

    let addr = cfg.listen_addr();
    let listener = tokio::net::TcpListener::bind(addr).await.expect("failed to bind");

    tracing::info!(%addr, min_zoom = limits.min_zoom, max_zoom = limits.max_zoom, "mapsync listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server failed");

    let _ = hub.shutdown().await;
    let _ = sequencer.await;
    tracing::info!("mapsync stopped");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "ctrl-c handler unavailable; running until killed");
        std::future::pending::<()>().await;
    }
}
