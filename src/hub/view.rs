//! Map view state and the command reducer.
//!
//! Pure logic: `apply` mutates the state for one command and returns the
//! message to broadcast plus who should receive it. The sequencer owns the
//! only live instance and does all delivery.

use serde::{Deserialize, Serialize};

use crate::protocol::{Command, ServerMessage};

/// Zoom bounds and pan scale shared by every command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewLimits {
    pub min_zoom: i32,
    pub max_zoom: i32,
    /// Degrees per screen pixel at zoom 0; halves with each zoom level.
    pub pan_degrees_per_pixel: f64,
}

impl ViewLimits {
    #[must_use]
    pub fn clamp_zoom(&self, zoom: i32) -> i32 {
        zoom.clamp(self.min_zoom, self.max_zoom)
    }

    /// Pixel-to-degree scale at `zoom`.
    #[must_use]
    pub fn degrees_per_pixel(&self, zoom: i32) -> f64 {
        self.pan_degrees_per_pixel / 2f64.powi(zoom)
    }
}

/// The authoritative shared view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapViewState {
    #[serde(rename = "mapName")]
    pub map_name: String,
    pub lat: f64,
    pub lng: f64,
    pub zoom: i32,
    pub version: u64,
}

/// Who receives the message produced by a command.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Every session, including the one that sent the command.
    Broadcast(ServerMessage),
    /// Every session except the sender.
    BroadcastExcludeSender(ServerMessage),
}

impl Outcome {
    #[must_use]
    pub fn message(&self) -> &ServerMessage {
        match self {
            Self::Broadcast(msg) | Self::BroadcastExcludeSender(msg) => msg,
        }
    }
}

impl MapViewState {
    /// Fresh state centred on the origin of `map_name`.
    #[must_use]
    pub fn new(map_name: impl Into<String>, limits: &ViewLimits) -> Self {
        Self { map_name: map_name.into(), lat: 0.0, lng: 0.0, zoom: limits.clamp_zoom(0), version: 0 }
    }

    /// Apply one command. Every command bumps the version, including zoom
    /// steps that were clamped at a bound. Incoming zooms are clamped into
    /// `limits`; a pan that would leave the finite range keeps the position.
    pub fn apply(&mut self, command: Command, limits: &ViewLimits) -> Outcome {
        self.version += 1;

        match command {
            Command::StateUpdate { lat, lng, zoom } => {
                self.lat = lat;
                self.lng = lng;
                self.zoom = limits.clamp_zoom(zoom);
                Outcome::BroadcastExcludeSender(ServerMessage::StateUpdate {
                    lat,
                    lng,
                    zoom: self.zoom,
                    version: self.version,
                })
            }
            Command::MapChange { map_name, lat, lng, zoom } => {
                self.map_name = map_name;
                self.lat = lat;
                self.lng = lng;
                self.zoom = limits.clamp_zoom(zoom);
                Outcome::Broadcast(ServerMessage::map_change(self))
            }
            Command::PanBy { dx, dy } => {
                let dx = dx.unwrap_or(0.0);
                let dy = dy.unwrap_or(0.0);
                let scale = limits.degrees_per_pixel(self.zoom);
                // Screen y grows southward.
                let (lat, lng) = (self.lat - dy * scale, self.lng + dx * scale);
                if lat.is_finite() && lng.is_finite() {
                    self.lat = lat;
                    self.lng = lng;
                }
                Outcome::BroadcastExcludeSender(ServerMessage::PanBy {
                    dx,
                    dy,
                    lat: self.lat,
                    lng: self.lng,
                    zoom: self.zoom,
                    version: self.version,
                })
            }
            Command::ZoomIn => {
                self.zoom = limits.clamp_zoom(self.zoom.saturating_add(1));
                Outcome::BroadcastExcludeSender(ServerMessage::ZoomIn {
                    lat: self.lat,
                    lng: self.lng,
                    zoom: self.zoom,
                    version: self.version,
                })
            }
            Command::ZoomOut => {
                self.zoom = limits.clamp_zoom(self.zoom.saturating_sub(1));
                Outcome::BroadcastExcludeSender(ServerMessage::ZoomOut {
                    lat: self.lat,
                    lng: self.lng,
                    zoom: self.zoom,
                    version: self.version,
                })
            }
            Command::JumpTo { lat, lng } => {
                self.lat = lat;
                self.lng = lng;
                Outcome::Broadcast(ServerMessage::JumpTo { lat, lng, zoom: self.zoom, version: self.version })
            }
        }
    }
}

#[cfg(test)]
#[path = "view_test.rs"]
mod tests;
