//! Service configuration parsed from environment variables.
//!
//! Every variable is optional. A value that fails to parse falls back to its
//! default; a value that parses but is out of range is a `ConfigError`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::hub::view::ViewLimits;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_CALIBRATION_FILE: &str = "calibration_data.json";
pub const DEFAULT_MAPS_FILE: &str = "maps.json";
pub const DEFAULT_MAP_NAME: &str = "default_map";
pub const DEFAULT_MIN_ZOOM: i32 = -5;
pub const DEFAULT_MAX_ZOOM: i32 = 8;
/// 360 degrees across one 256 px tile at zoom 0.
pub const DEFAULT_PAN_DEGREES_PER_PIXEL: f64 = 360.0 / 256.0;
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_PONG_TIMEOUT_SECS: u64 = 45;
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_SESSION_QUEUE_DEPTH: usize = 256;
pub const DEFAULT_HUB_QUEUE_DEPTH: usize = 1024;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("MIN_ZOOM ({min}) must not exceed MAX_ZOOM ({max})")]
    ZoomRange { min: i32, max: i32 },
    #[error("{var} must be positive")]
    NonPositive { var: &'static str },
}

/// Per-connection timing and buffering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub write_timeout: Duration,
    pub queue_depth: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind_addr: IpAddr,
    pub port: u16,
    pub calibration_file: PathBuf,
    pub maps_file: PathBuf,
    pub min_zoom: i32,
    pub max_zoom: i32,
    pub pan_degrees_per_pixel: f64,
    pub session: SessionSettings,
    pub hub_queue_depth: usize,
}

impl Config {
    /// Build config from the process environment.
    ///
    /// Optional:
    /// - `BIND_ADDR`, `PORT`: listen address, default `0.0.0.0:8080`
    /// - `CALIBRATION_FILE`: calibration document, default `calibration_data.json`
    /// - `MAPS_FILE`: map list naming the initial map, default `maps.json`
    /// - `MIN_ZOOM`, `MAX_ZOOM`: zoom clamp, default -5..=8
    /// - `PAN_DEGREES_PER_PIXEL`: pan scale at zoom 0, default 1.40625
    /// - `PING_INTERVAL_SECS`, `PONG_TIMEOUT_SECS`, `WRITE_TIMEOUT_SECS`: 15 / 45 / 10
    /// - `SESSION_QUEUE_DEPTH`, `HUB_QUEUE_DEPTH`: 256 / 1024
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when a parsed value is out of range.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when a parsed value is out of range.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let lookup: &Lookup<'_> = &lookup;

        let min_zoom = env_parse(lookup, "MIN_ZOOM", DEFAULT_MIN_ZOOM);
        let max_zoom = env_parse(lookup, "MAX_ZOOM", DEFAULT_MAX_ZOOM);
        if min_zoom > max_zoom {
            return Err(ConfigError::ZoomRange { min: min_zoom, max: max_zoom });
        }

        let pan_degrees_per_pixel = env_parse(lookup, "PAN_DEGREES_PER_PIXEL", DEFAULT_PAN_DEGREES_PER_PIXEL);
        if !(pan_degrees_per_pixel.is_finite() && pan_degrees_per_pixel > 0.0) {
            return Err(ConfigError::NonPositive { var: "PAN_DEGREES_PER_PIXEL" });
        }

        let session = SessionSettings {
            ping_interval: Duration::from_secs(env_positive(lookup, "PING_INTERVAL_SECS", DEFAULT_PING_INTERVAL_SECS)?),
            pong_timeout: Duration::from_secs(env_positive(lookup, "PONG_TIMEOUT_SECS", DEFAULT_PONG_TIMEOUT_SECS)?),
            write_timeout: Duration::from_secs(env_positive(lookup, "WRITE_TIMEOUT_SECS", DEFAULT_WRITE_TIMEOUT_SECS)?),
            queue_depth: env_positive(lookup, "SESSION_QUEUE_DEPTH", DEFAULT_SESSION_QUEUE_DEPTH)?,
        };

        Ok(Self {
            bind_addr: env_parse(lookup, "BIND_ADDR", IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            port: env_parse(lookup, "PORT", DEFAULT_PORT),
            calibration_file: lookup("CALIBRATION_FILE").map_or_else(|| PathBuf::from(DEFAULT_CALIBRATION_FILE), PathBuf::from),
            maps_file: lookup("MAPS_FILE").map_or_else(|| PathBuf::from(DEFAULT_MAPS_FILE), PathBuf::from),
            min_zoom,
            max_zoom,
            pan_degrees_per_pixel,
            session,
            hub_queue_depth: env_positive(lookup, "HUB_QUEUE_DEPTH", DEFAULT_HUB_QUEUE_DEPTH)?,
        })
    }

    #[must_use]
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    #[must_use]
    pub fn view_limits(&self) -> ViewLimits {
        ViewLimits {
            min_zoom: self.min_zoom,
            max_zoom: self.max_zoom,
            pan_degrees_per_pixel: self.pan_degrees_per_pixel,
        }
    }
}

type Lookup<'a> = dyn Fn(&str) -> Option<String> + 'a;

fn env_parse<T>(lookup: &Lookup<'_>, key: &'static str, default: T) -> T
where
    T: std::str::FromStr,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    raw.trim().parse::<T>().unwrap_or_else(|_| {
        warn!(key, value = %raw, "config: unparseable value; using default");
        default
    })
}

/// Like `env_parse`, but zero is rejected.
fn env_positive<T>(lookup: &Lookup<'_>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialEq + Default,
{
    let value = env_parse(lookup, key, default);
    if value == T::default() {
        return Err(ConfigError::NonPositive { var: key });
    }
    Ok(value)
}

// =============================================================================
// MAP LIST
// =============================================================================

#[derive(Deserialize)]
struct MapListEntry {
    name: String,
}

/// Name of the first map in the map list at `path`, or `default_map` when
/// the file is missing, empty, or unreadable.
#[must_use]
pub fn load_initial_map_name(path: &Path) -> String {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "config: map list unreadable");
            }
            return DEFAULT_MAP_NAME.to_string();
        }
    };

    match serde_json::from_str::<Vec<MapListEntry>>(&raw) {
        Ok(maps) => maps
            .into_iter()
            .next()
            .map_or_else(|| DEFAULT_MAP_NAME.to_string(), |m| m.name),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "config: map list invalid");
            DEFAULT_MAP_NAME.to_string()
        }
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
