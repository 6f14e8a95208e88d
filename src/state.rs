//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor. It
//! holds a handle onto the sync hub sequencer, the calibration store, and
//! the per-session settings used by the websocket handler. The hub owns all
//! live map state; nothing here is mutated after startup.

use std::sync::Arc;

use crate::calibration::store::CalibrationStore;
use crate::config::SessionSettings;
use crate::hub::SyncHub;

/// Clone is required by Axum; every field is a cheap handle.
#[derive(Clone)]
pub struct AppState {
    pub hub: SyncHub,
    /// `None` when the calibration document failed to open. The hub keeps
    /// running; calibration routes answer 503.
    pub calibrations: Option<Arc<CalibrationStore>>,
    pub session: SessionSettings,
}

impl AppState {
    #[must_use]
    pub fn new(hub: SyncHub, calibrations: Option<Arc<CalibrationStore>>, session: SessionSettings) -> Self {
        Self { hub, calibrations, session }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================
