//! Protocol: the hub's wire messages.
//!
//! ARCHITECTURE
//! ============
//! Every WebSocket text frame is one flat JSON object with a `type`
//! discriminator. Viewers send `Command`s; the hub pushes `ServerMessage`s.
//! Both directions carry plain decimal numbers: `zoom` is integral,
//! `lat`/`lng` are floating-point.
//!
//! DESIGN
//! ======
//! Parsing is two-step. The `type` tag is checked against the known command
//! names before the fields are decoded, so an unknown tag is reported as
//! such instead of as a generic serde failure. A rejected message never
//! reaches the hub.

use serde::{Deserialize, Serialize};

use crate::hub::view::MapViewState;

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable error code and retryable flag for structured error bodies.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

// =============================================================================
// INBOUND
// =============================================================================

/// Command type tags accepted from viewers.
pub const COMMAND_TYPES: [&str; 6] = ["stateUpdate", "mapChange", "panBy", "zoomIn", "zoomOut", "jumpTo"];

/// A validated inbound command.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Command {
    /// Overwrite position and zoom.
    StateUpdate { lat: f64, lng: f64, zoom: i32 },
    /// Overwrite the whole view, including the active map.
    MapChange {
        #[serde(rename = "mapName")]
        map_name: String,
        lat: f64,
        lng: f64,
        zoom: i32,
    },
    /// Relative pan in screen pixels. Older panels send `x`/`y`.
    PanBy {
        #[serde(default, alias = "x")]
        dx: Option<f64>,
        #[serde(default, alias = "y")]
        dy: Option<f64>,
    },
    ZoomIn,
    ZoomOut,
    /// Overwrite position only.
    JumpTo { lat: f64, lng: f64 },
}

impl Command {
    /// Wire name of this command.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StateUpdate { .. } => "stateUpdate",
            Self::MapChange { .. } => "mapChange",
            Self::PanBy { .. } => "panBy",
            Self::ZoomIn => "zoomIn",
            Self::ZoomOut => "zoomOut",
            Self::JumpTo { .. } => "jumpTo",
        }
    }

    /// Reject NaN and infinite coordinates.
    ///
    /// # Errors
    ///
    /// Returns `MalformedCommand::NonFinite` naming the first offending field.
    pub fn check_finite(&self) -> Result<(), MalformedCommand> {
        let fields: [(&'static str, Option<f64>); 2] = match self {
            Self::StateUpdate { lat, lng, .. } | Self::MapChange { lat, lng, .. } | Self::JumpTo { lat, lng } => {
                [("lat", Some(*lat)), ("lng", Some(*lng))]
            }
            Self::PanBy { dx, dy } => [("dx", *dx), ("dy", *dy)],
            Self::ZoomIn | Self::ZoomOut => return Ok(()),
        };
        for (field, value) in fields {
            if value.is_some_and(|v| !v.is_finite()) {
                return Err(MalformedCommand::NonFinite { kind: self.kind(), field });
            }
        }
        Ok(())
    }
}

/// A protocol violation on one inbound message.
#[derive(Debug, thiserror::Error)]
pub enum MalformedCommand {
    #[error("invalid json: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("message has no string `type` field")]
    MissingType,
    #[error("unknown command type: {0}")]
    UnknownType(String),
    #[error("invalid {kind} fields: {source}")]
    InvalidFields {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{kind}: field {field} is not a finite number")]
    NonFinite { kind: &'static str, field: &'static str },
}

impl ErrorCode for MalformedCommand {
    fn error_code(&self) -> &'static str {
        "E_MALFORMED_COMMAND"
    }
}

/// Parse one inbound text frame into a command.
///
/// # Errors
///
/// Returns `MalformedCommand` for invalid JSON, a missing or unknown `type`,
/// missing or mistyped fields, and non-finite numbers.
pub fn parse_command(text: &str) -> Result<Command, MalformedCommand> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(MalformedCommand::InvalidJson)?;

    let Some(kind) = value.get("type").and_then(serde_json::Value::as_str) else {
        return Err(MalformedCommand::MissingType);
    };
    if !COMMAND_TYPES.contains(&kind) {
        return Err(MalformedCommand::UnknownType(kind.to_owned()));
    }
    let kind = kind.to_owned();

    let command: Command =
        serde_json::from_value(value).map_err(|source| MalformedCommand::InvalidFields { kind, source })?;
    command.check_finite()?;
    Ok(command)
}

// =============================================================================
// OUTBOUND
// =============================================================================

/// A message pushed from the hub to viewers. View-changing variants always
/// carry the resulting authoritative position and `version`, so a viewer can
/// discard anything older than what it already shows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    StateUpdate {
        lat: f64,
        lng: f64,
        zoom: i32,
        version: u64,
    },
    MapChange {
        #[serde(rename = "mapName")]
        map_name: String,
        lat: f64,
        lng: f64,
        zoom: i32,
        version: u64,
    },
    PanBy {
        dx: f64,
        dy: f64,
        lat: f64,
        lng: f64,
        zoom: i32,
        version: u64,
    },
    ZoomIn {
        lat: f64,
        lng: f64,
        zoom: i32,
        version: u64,
    },
    ZoomOut {
        lat: f64,
        lng: f64,
        zoom: i32,
        version: u64,
    },
    JumpTo {
        lat: f64,
        lng: f64,
        zoom: i32,
        version: u64,
    },
    ClientCountUpdate {
        count: usize,
    },
}

impl ServerMessage {
    /// Full-state message sent to a session on join and after `mapChange`.
    #[must_use]
    pub fn map_change(view: &MapViewState) -> Self {
        Self::MapChange {
            map_name: view.map_name.clone(),
            lat: view.lat,
            lng: view.lng,
            zoom: view.zoom,
            version: view.version,
        }
    }

    /// State version carried by this message, if it describes the view.
    #[must_use]
    pub fn version(&self) -> Option<u64> {
        match self {
            Self::StateUpdate { version, .. }
            | Self::MapChange { version, .. }
            | Self::PanBy { version, .. }
            | Self::ZoomIn { version, .. }
            | Self::ZoomOut { version, .. }
            | Self::JumpTo { version, .. } => Some(*version),
            Self::ClientCountUpdate { .. } => None,
        }
    }

    /// Encode as one text frame.
    ///
    /// # Errors
    ///
    /// Returns the serializer error. Non-finite floats do not fail here;
    /// `serde_json` writes them as `null`.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
#[path = "protocol_test.rs"]
mod tests;
