//! Calibration store: keyed, file-backed transform matrices.
//!
//! DESIGN
//! ======
//! The whole store is one JSON document, loaded once at startup and kept in
//! memory behind an `RwLock`. Reads never touch the disk. A save or delete
//! holds the write lock while it serializes the next document, writes it to
//! a temp file beside the target, fsyncs, and renames it into place; only
//! then is the in-memory map replaced. A failed write leaves both copies as
//! they were, and a concurrent load sees either the old or the new map.
//!
//! Entries are validated at the persistence boundary: an unknown mode, a
//! missing or non-numeric coefficient, or two entries for the same key fail
//! the whole load with `StoreError::Corrupt`.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use time::OffsetDateTime;
use tracing::{info, warn};

use super::TransformMatrix;
use crate::protocol::ErrorCode;

// =============================================================================
// KEY
// =============================================================================

/// Where the calibrated map comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalibrationMode {
    Online,
    Local,
}

impl CalibrationMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Local => "local",
        }
    }
}

/// Address of one stored calibration. Case-sensitive; `area: Some("")` and
/// `area: None` are different keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CalibrationKey {
    pub mode: CalibrationMode,
    pub map_identifier: String,
    pub area: Option<String>,
}

impl CalibrationKey {
    #[must_use]
    pub fn new(mode: CalibrationMode, map_identifier: impl Into<String>, area: Option<String>) -> Self {
        Self { mode, map_identifier: map_identifier.into(), area }
    }

    /// Document key: `mode/map[/area]` with `%` and `/` escaped in each part,
    /// so distinct keys never render the same.
    #[must_use]
    pub fn document_key(&self) -> String {
        let mut out = format!("{}/{}", self.mode.as_str(), escape_component(&self.map_identifier));
        if let Some(area) = &self.area {
            out.push('/');
            out.push_str(&escape_component(area));
        }
        out
    }
}

impl fmt::Display for CalibrationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.area {
            Some(area) => write!(f, "{}:{}:{}", self.mode.as_str(), self.map_identifier, area),
            None => write!(f, "{}:{}", self.mode.as_str(), self.map_identifier),
        }
    }
}

fn escape_component(raw: &str) -> String {
    raw.replace('%', "%25").replace('/', "%2F")
}

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no calibration stored for {0}")]
    NotFound(CalibrationKey),
    #[error("calibration store {} is corrupt: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },
    #[error("calibration store write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("calibration store encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ErrorCode for StoreError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "E_CALIBRATION_NOT_FOUND",
            Self::Corrupt { .. } => "E_CALIBRATION_STORE_CORRUPT",
            Self::Io(_) | Self::Encode(_) => "E_CALIBRATION_STORE_IO",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

// =============================================================================
// DOCUMENT
// =============================================================================

/// One entry as written to disk. Older files name the map field
/// `provider_or_map_name` and the area `area_id`, and carry a naive
/// `timestamp` that is ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    mode: CalibrationMode,
    #[serde(alias = "provider_or_map_name")]
    map_identifier: String,
    #[serde(default, alias = "area_id")]
    area: Option<String>,
    matrix: TransformMatrix,
    #[serde(default, with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    saved_at: Option<OffsetDateTime>,
}

/// A stored calibration with its save time, if known.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredCalibration {
    pub key: CalibrationKey,
    pub matrix: TransformMatrix,
    pub saved_at: Option<OffsetDateTime>,
}

/// Result of a save: the entry as written, and whether it overwrote one.
#[derive(Debug, Clone, PartialEq)]
pub struct Saved {
    pub entry: StoredCalibration,
    pub replaced: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Slot {
    matrix: TransformMatrix,
    saved_at: Option<OffsetDateTime>,
}

type Entries = BTreeMap<CalibrationKey, Slot>;

// =============================================================================
// STORE
// =============================================================================

pub struct CalibrationStore {
    path: PathBuf,
    entries: RwLock<Entries>,
}

impl CalibrationStore {
    /// Open the store at `path`. A missing file is an empty store; the file
    /// is created on the first save.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Corrupt` if the file exists but cannot be read
    /// or does not hold a valid calibration document.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(raw) => parse_document(&path, &raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "calibration store not found; starting empty");
                Entries::new()
            }
            Err(e) => return Err(StoreError::Corrupt { path, reason: format!("unreadable: {e}") }),
        };

        info!(path = %path.display(), entries = entries.len(), "calibration store loaded");
        Ok(Self { path, entries: RwLock::new(entries) })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored matrix for `key`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` when nothing is stored under `key`.
    pub fn load(&self, key: &CalibrationKey) -> Result<TransformMatrix, StoreError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)
            .map(|slot| slot.matrix)
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    /// Stored calibration for `key`, with its save time.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` when nothing is stored under `key`.
    pub fn entry(&self, key: &CalibrationKey) -> Result<StoredCalibration, StoreError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)
            .map(|slot| StoredCalibration { key: key.clone(), matrix: slot.matrix, saved_at: slot.saved_at })
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every stored calibration, in key order.
    #[must_use]
    pub fn entries(&self) -> Vec<StoredCalibration> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .map(|(key, slot)| StoredCalibration { key: key.clone(), matrix: slot.matrix, saved_at: slot.saved_at })
            .collect()
    }

    /// Insert or overwrite the calibration for `key` and flush the document.
    /// Returns the entry as stored. `replaced` is decided under the write
    /// lock, so concurrent saves of a new key see exactly one `false`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io`/`Encode` if the document cannot be written;
    /// the store is unchanged in that case.
    pub fn save(&self, key: CalibrationKey, matrix: TransformMatrix) -> Result<Saved, StoreError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);

        let mut next = entries.clone();
        let saved_at = OffsetDateTime::now_utc();
        let replaced = next.insert(key.clone(), Slot { matrix, saved_at: Some(saved_at) }).is_some();
        write_document(&self.path, &next)?;
        *entries = next;

        info!(%key, replaced, entries = entries.len(), "calibration saved");
        Ok(Saved { entry: StoredCalibration { key, matrix, saved_at: Some(saved_at) }, replaced })
    }

    /// Remove the calibration for `key`. Absent keys are a no-op and do not
    /// rewrite the document. Returns whether an entry was removed.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io`/`Encode` if the document cannot be written.
    pub fn delete(&self, key: &CalibrationKey) -> Result<bool, StoreError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if !entries.contains_key(key) {
            return Ok(false);
        }

        let mut next = entries.clone();
        next.remove(key);
        write_document(&self.path, &next)?;
        *entries = next;

        info!(%key, entries = entries.len(), "calibration deleted");
        Ok(true)
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn parse_document(path: &Path, raw: &str) -> Result<Entries, StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt { path: path.to_path_buf(), reason };

    if raw.trim().is_empty() {
        warn!(path = %path.display(), "calibration store file is empty; starting empty");
        return Ok(Entries::new());
    }

    let document: BTreeMap<String, StoredEntry> =
        serde_json::from_str(raw).map_err(|e| corrupt(format!("invalid document: {e}")))?;

    let mut entries = Entries::new();
    for (doc_key, entry) in document {
        let key = CalibrationKey::new(entry.mode, entry.map_identifier, entry.area);
        if doc_key != key.document_key() {
            warn!(%doc_key, %key, "calibration entry key differs from its fields; using fields");
        }
        let slot = Slot { matrix: entry.matrix, saved_at: entry.saved_at };
        if entries.insert(key.clone(), slot).is_some() {
            return Err(corrupt(format!("duplicate entries for {key}")));
        }
    }
    Ok(entries)
}

fn write_document(path: &Path, entries: &Entries) -> Result<(), StoreError> {
    let document: BTreeMap<String, StoredEntry> = entries
        .iter()
        .map(|(key, slot)| {
            let entry = StoredEntry {
                mode: key.mode,
                map_identifier: key.map_identifier.clone(),
                area: key.area.clone(),
                matrix: slot.matrix,
                saved_at: slot.saved_at,
            };
            (key.document_key(), entry)
        })
        .collect();

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let temp = NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(temp.as_file());
        serde_json::to_writer_pretty(&mut writer, &document)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
    }
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| StoreError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
#[path = "store_test.rs"]
mod tests;
