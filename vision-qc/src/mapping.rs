//! Pixel → robot-plane mapping through the calibrated homography.
//!
//! The matrix is persisted as a small bincode container holding a named
//! 3×3 float64 tensor under the key `H`, next to a JSON sidecar with the
//! calibration diagnostics. Loading fails loudly on a wrong key or a
//! singular matrix.

use std::fs;
use std::path::Path;

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MATRIX_KEY: &str = "H";

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("cannot access homography file {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("malformed homography container: {0}")]
    Decode(#[from] bincode::Error),
    #[error("homography container holds key {0:?}, expected {MATRIX_KEY:?}")]
    WrongKey(String),
    #[error("homography matrix is singular (|det| = {0:.3e})")]
    Singular(f64),
    #[error("sidecar serialization failed: {0}")]
    Sidecar(#[from] serde_json::Error),
}

// ── Persistence ───────────────────────────────────────────────────────────────

/// On-disk container: one named 3×3 float64 tensor.
#[derive(Debug, Serialize, Deserialize)]
struct MatrixRecord {
    key: String,
    rows: [[f64; 3]; 3],
}

/// HSV gate snapshot recorded with a calibration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HsvRange {
    pub lower: [u8; 3],
    pub upper: [u8; 3],
}

/// Diagnostic sidecar stored as `<matrix path>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationSidecar {
    pub timestamp: String,
    pub num_points: usize,
    pub avg_error_mm: f64,
    pub max_error_mm: f64,
    pub rms_error_mm: f64,
    pub hsv: HsvRange,
}

pub fn sidecar_path(matrix_path: &Path) -> std::path::PathBuf {
    let mut name = matrix_path.as_os_str().to_os_string();
    name.push(".json");
    std::path::PathBuf::from(name)
}

// ── Mapper ────────────────────────────────────────────────────────────────────

/// Projective map from pixel coordinates to robot millimeters:
/// `[X·w, Y·w, w]ᵀ = H · [x, y, 1]ᵀ`.
#[derive(Debug, Clone)]
pub struct Homography {
    m: Matrix3<f64>,
}

impl Homography {
    pub fn from_matrix(m: Matrix3<f64>) -> Result<Self, MappingError> {
        let det = m.determinant();
        if det.abs() < 1e-12 {
            return Err(MappingError::Singular(det.abs()));
        }
        Ok(Self { m })
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.m
    }

    /// Forward transform of one pixel.
    pub fn map(&self, x: f64, y: f64) -> (f64, f64) {
        let v = self.m * Vector3::new(x, y, 1.0);
        (v[0] / v[2], v[1] / v[2])
    }

    /// Vectorized forward transform.
    pub fn map_many(&self, points: &[(f64, f64)]) -> Vec<(f64, f64)> {
        points.iter().map(|&(x, y)| self.map(x, y)).collect()
    }

    /// Local linear scale (mm per pixel) at a point, from the lengths of
    /// one-pixel steps through the projective map. Logged as a cross-check
    /// against the independently stored `mm_per_pixel` setting.
    pub fn scale_at(&self, x: f64, y: f64) -> f64 {
        let o = self.map(x, y);
        let dx = self.map(x + 1.0, y);
        let dy = self.map(x, y + 1.0);
        let ax = (dx.0 - o.0, dx.1 - o.1);
        let ay = (dy.0 - o.0, dy.1 - o.1);
        (ax.0 * ay.1 - ax.1 * ay.0).abs().sqrt()
    }

    /// Write the matrix container and its JSON sidecar.
    pub fn save(&self, path: &Path, sidecar: &CalibrationSidecar) -> Result<(), MappingError> {
        let mut rows = [[0.0f64; 3]; 3];
        for r in 0..3 {
            for c in 0..3 {
                rows[r][c] = self.m[(r, c)];
            }
        }
        let record = MatrixRecord { key: MATRIX_KEY.to_string(), rows };
        let bytes = bincode::serialize(&record)?;
        fs::write(path, bytes).map_err(|source| MappingError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let json = serde_json::to_string_pretty(sidecar)?;
        let spath = sidecar_path(path);
        fs::write(&spath, json).map_err(|source| MappingError::Io {
            path: spath.display().to_string(),
            source,
        })?;
        Ok(())
    }

    /// Load and validate the matrix container.
    pub fn load(path: &Path) -> Result<Self, MappingError> {
        let bytes = fs::read(path).map_err(|source| MappingError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let record: MatrixRecord = bincode::deserialize(&bytes)?;
        if record.key != MATRIX_KEY {
            return Err(MappingError::WrongKey(record.key));
        }
        let m = Matrix3::from_fn(|r, c| record.rows[r][c]);
        Self::from_matrix(m)
    }
}
