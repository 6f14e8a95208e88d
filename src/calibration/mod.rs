//! Calibration: raw game coordinates to geographic coordinates.
//!
//! DESIGN
//! ======
//! A calibration is a 2D affine map fitted to two or three known point
//! pairs:
//!
//! ```text
//! lat = a*x + b*y + c
//! lon = d*x + e*y + f
//! ```
//!
//! - Three points pin down all six coefficients. Each output axis is an
//!   independent 3x3 system solved with Cramer's rule.
//! - Two points give only four equations, so the fit is restricted to a
//!   similarity (uniform scale, rotation, translation). The raw plane
//!   `x + iy` maps onto the geographic plane `lon + i*lat` (longitude east,
//!   latitude north) as `q = alpha*p + beta`.
//!
//! Every fitted matrix is checked against its own input points before it is
//! returned. A matrix that cannot reproduce them is rejected rather than
//! stored.

pub mod store;

use serde::{Deserialize, Serialize};

use crate::protocol::ErrorCode;

/// Relative determinant threshold below which points count as collinear.
/// Scaled by the squared spread of the points, so it holds at any size.
const COLLINEAR_EPSILON: f64 = 1e-9;

/// Separations within this many ulps of the coordinates' magnitude count as
/// coincident.
const COINCIDENT_ULPS: f64 = 4.0;

/// Absolute tolerance (scaled by target magnitude) for the self-check.
pub const VERIFY_TOLERANCE: f64 = 1e-6;

// =============================================================================
// TYPES
// =============================================================================

/// One known correspondence between a raw and a geographic coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    pub x: f64,
    pub y: f64,
    pub lat: f64,
    pub lon: f64,
}

impl CalibrationPoint {
    #[must_use]
    pub fn new(x: f64, y: f64, lat: f64, lon: f64) -> Self {
        Self { x, y, lat, lon }
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.lat.is_finite() && self.lon.is_finite()
    }
}

/// Which plane a degenerate configuration was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointSpace {
    Raw,
    Geographic,
}

impl std::fmt::Display for PointSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Raw => f.write_str("raw"),
            Self::Geographic => f.write_str("geographic"),
        }
    }
}

/// Calibration input that cannot produce a stable transform.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CalibrationError {
    #[error("calibration needs 2 or 3 points, got {0}")]
    PointCount(usize),
    #[error("{0} calibration points coincide")]
    CoincidentPoints(PointSpace),
    #[error("{space} calibration points are collinear (determinant {determinant:e})")]
    Collinear { space: PointSpace, determinant: f64 },
    #[error("calibration input or coefficient is not a finite number")]
    NonFinite,
    #[error("fitted transform misses a calibration point by {residual:e}")]
    Unstable { residual: f64 },
    #[error("raw coordinate ({x}, {y}) transforms outside the finite range")]
    OutOfRange { x: f64, y: f64 },
}

impl ErrorCode for CalibrationError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::OutOfRange { .. } => "E_TRANSFORM_OUT_OF_RANGE",
            _ => "E_DEGENERATE_INPUT",
        }
    }
}

/// Coefficients of `lat = a*x + b*y + c`, `lon = d*x + e*y + f`.
///
/// Immutable once built; a new calibration produces a new matrix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Coefficients", into = "Coefficients")]
pub struct TransformMatrix {
    a: f64,
    b: f64,
    c: f64,
    d: f64,
    e: f64,
    f: f64,
}

/// Serialized shape of a matrix; validated on the way back in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Coefficients {
    a: f64,
    b: f64,
    c: f64,
    d: f64,
    e: f64,
    f: f64,
}

impl TryFrom<Coefficients> for TransformMatrix {
    type Error = CalibrationError;

    fn try_from(k: Coefficients) -> Result<Self, Self::Error> {
        Self::from_coefficients([k.a, k.b, k.c, k.d, k.e, k.f])
    }
}

impl From<TransformMatrix> for Coefficients {
    fn from(m: TransformMatrix) -> Self {
        let [a, b, c, d, e, f] = m.coefficients();
        Self { a, b, c, d, e, f }
    }
}

impl TransformMatrix {
    /// Build a matrix from `[a, b, c, d, e, f]`.
    ///
    /// # Errors
    ///
    /// Returns `CalibrationError::NonFinite` if any coefficient is NaN or infinite.
    pub fn from_coefficients(k: [f64; 6]) -> Result<Self, CalibrationError> {
        if k.iter().any(|v| !v.is_finite()) {
            return Err(CalibrationError::NonFinite);
        }
        let [a, b, c, d, e, f] = k;
        Ok(Self { a, b, c, d, e, f })
    }

    /// Coefficients as `[a, b, c, d, e, f]`.
    #[must_use]
    pub fn coefficients(&self) -> [f64; 6] {
        [self.a, self.b, self.c, self.d, self.e, self.f]
    }

    /// Determinant of the linear part. Zero means the map collapses the plane.
    #[must_use]
    pub fn determinant(&self) -> f64 {
        self.a * self.e - self.b * self.d
    }

    /// Largest absolute deviation between each point's target and its
    /// transformed raw coordinate.
    #[must_use]
    pub fn max_residual(&self, points: &[CalibrationPoint]) -> f64 {
        points
            .iter()
            .map(|p| {
                let (lat, lon) = transform(p.x, p.y, self);
                (lat - p.lat).abs().max((lon - p.lon).abs())
            })
            .fold(0.0, f64::max)
    }

    /// Self-check: every point must round-trip within `tolerance`, scaled by
    /// the magnitude of the targets.
    ///
    /// # Errors
    ///
    /// Returns `CalibrationError::Unstable` with the worst residual.
    pub fn verify(&self, points: &[CalibrationPoint], tolerance: f64) -> Result<(), CalibrationError> {
        let magnitude = points
            .iter()
            .map(|p| p.lat.abs().max(p.lon.abs()))
            .fold(1.0, f64::max);
        let residual = self.max_residual(points);
        if residual.is_finite() && residual <= tolerance * magnitude {
            Ok(())
        } else {
            Err(CalibrationError::Unstable { residual })
        }
    }
}

// =============================================================================
// SOLVE
// =============================================================================

/// Fit a transform to 2 (similarity) or 3 (full affine) calibration points.
///
/// # Errors
///
/// Returns `CalibrationError` when the point count is not 2 or 3, when any
/// value is non-finite, when points coincide or are collinear, or when the
/// fitted matrix fails its own round-trip check.
pub fn calculate_transform_matrix(points: &[CalibrationPoint]) -> Result<TransformMatrix, CalibrationError> {
    if points.iter().any(|p| !p.is_finite()) {
        return Err(CalibrationError::NonFinite);
    }

    let matrix = match points {
        [p1, p2] => solve_similarity(p1, p2)?,
        [p1, p2, p3] => solve_affine(p1, p2, p3)?,
        _ => return Err(CalibrationError::PointCount(points.len())),
    };

    matrix.verify(points, VERIFY_TOLERANCE)?;
    Ok(matrix)
}

/// Apply a transform to a raw coordinate. Returns `(lat, lon)`.
#[must_use]
pub fn transform(x: f64, y: f64, matrix: &TransformMatrix) -> (f64, f64) {
    let lat = matrix.a * x + matrix.b * y + matrix.c;
    let lon = matrix.d * x + matrix.e * y + matrix.f;
    (lat, lon)
}

/// `transform`, rejecting results that overflowed to infinity or NaN.
///
/// # Errors
///
/// Returns `CalibrationError::OutOfRange` when either output is non-finite.
pub fn transform_checked(x: f64, y: f64, matrix: &TransformMatrix) -> Result<(f64, f64), CalibrationError> {
    let (lat, lon) = transform(x, y, matrix);
    if lat.is_finite() && lon.is_finite() {
        Ok((lat, lon))
    } else {
        Err(CalibrationError::OutOfRange { x, y })
    }
}

fn solve_similarity(p1: &CalibrationPoint, p2: &CalibrationPoint) -> Result<TransformMatrix, CalibrationError> {
    let (dx, dy) = (p2.x - p1.x, p2.y - p1.y);
    let (dlon, dlat) = (p2.lon - p1.lon, p2.lat - p1.lat);

    let raw_norm = dx * dx + dy * dy;
    if raw_norm.sqrt() <= COINCIDENT_ULPS * f64::EPSILON * magnitude(&[p1.x, p1.y, p2.x, p2.y]) {
        return Err(CalibrationError::CoincidentPoints(PointSpace::Raw));
    }
    let geo_norm = dlon * dlon + dlat * dlat;
    if geo_norm.sqrt() <= COINCIDENT_ULPS * f64::EPSILON * magnitude(&[p1.lat, p1.lon, p2.lat, p2.lon]) {
        return Err(CalibrationError::CoincidentPoints(PointSpace::Geographic));
    }

    // alpha = (dlon + i*dlat) / (dx + i*dy)
    let u = (dlon * dx + dlat * dy) / raw_norm;
    let v = (dlat * dx - dlon * dy) / raw_norm;

    // beta = q1 - alpha * p1
    let beta_lon = p1.lon - (u * p1.x - v * p1.y);
    let beta_lat = p1.lat - (v * p1.x + u * p1.y);

    TransformMatrix::from_coefficients([v, u, beta_lat, u, -v, beta_lon])
}

fn solve_affine(
    p1: &CalibrationPoint,
    p2: &CalibrationPoint,
    p3: &CalibrationPoint,
) -> Result<TransformMatrix, CalibrationError> {
    let m = [[p1.x, p1.y, 1.0], [p2.x, p2.y, 1.0], [p3.x, p3.y, 1.0]];
    let det = det3(&m);

    let raw_scale = spread_sq(&[p1.x, p2.x, p3.x]).max(spread_sq(&[p1.y, p2.y, p3.y]));
    if det.abs() <= COLLINEAR_EPSILON * raw_scale {
        return Err(CalibrationError::Collinear { space: PointSpace::Raw, determinant: det });
    }

    let [a, b, c] = cramer(&m, det, [p1.lat, p2.lat, p3.lat]);
    let [d, e, f] = cramer(&m, det, [p1.lon, p2.lon, p3.lon]);
    let matrix = TransformMatrix::from_coefficients([a, b, c, d, e, f])?;

    // Collinear targets give a matrix with no inverse.
    let geo_scale = spread_sq(&[p1.lat, p2.lat, p3.lat]).max(spread_sq(&[p1.lon, p2.lon, p3.lon]));
    let geo_det = matrix.determinant() * det;
    if geo_det.abs() <= COLLINEAR_EPSILON * geo_scale {
        return Err(CalibrationError::Collinear { space: PointSpace::Geographic, determinant: geo_det });
    }

    Ok(matrix)
}

/// Solve `m * [u, v, w] = rhs` for one output axis.
fn cramer(m: &[[f64; 3]; 3], det: f64, rhs: [f64; 3]) -> [f64; 3] {
    let mut out = [0.0; 3];
    for (col, slot) in out.iter_mut().enumerate() {
        let mut replaced = *m;
        for (row, value) in rhs.iter().enumerate() {
            replaced[row][col] = *value;
        }
        *slot = det3(&replaced) / det;
    }
    out
}

fn det3(m: &[[f64; 3]; 3]) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1]) - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

/// Squared extent of a set of values. Zero when they are all equal.
fn spread_sq(values: &[f64]) -> f64 {
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let spread = max - min;
    spread * spread
}

/// Largest absolute value; the scale at which rounding hides a difference.
fn magnitude(values: &[f64]) -> f64 {
    values.iter().fold(0.0, |acc: f64, v| acc.max(v.abs()))
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
