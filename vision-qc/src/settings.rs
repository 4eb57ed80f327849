//! Settings store.
//!
//! Loads and saves the JSON blob produced by the interactive tuning tool.
//! Key names match the tuning tool's output; unknown keys are ignored and
//! missing keys fall back to the commissioned defaults. `normalize` enforces
//! the structural invariants (odd kernels, ordered Canny bounds, clamped
//! scale) and never fails; `validate` reports violations for settings built
//! by hand.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::raster::Roi;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("cannot read settings file {path}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("cannot write settings file {path}: {source}")]
    Write { path: String, source: std::io::Error },
    #[error("malformed settings JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid settings: {0}")]
    Invalid(&'static str),
}

// ── Threshold mode ────────────────────────────────────────────────────────────

/// Threshold selection, stored as the tuning tool's integer enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum ThreshMode {
    Global,
    AdaptiveMean,
    AdaptiveGaussian,
}

impl From<u8> for ThreshMode {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::Global,
            1 => Self::AdaptiveMean,
            _ => Self::AdaptiveGaussian,
        }
    }
}

impl From<ThreshMode> for u8 {
    fn from(m: ThreshMode) -> u8 {
        match m {
            ThreshMode::Global => 0,
            ThreshMode::AdaptiveMean => 1,
            ThreshMode::AdaptiveGaussian => 2,
        }
    }
}

// ── ROI ───────────────────────────────────────────────────────────────────────

/// Work-area crop applied during calibration (and compensated afterwards).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RoiConfig {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl From<RoiConfig> for Roi {
    fn from(r: RoiConfig) -> Roi {
        Roi { x: r.x, y: r.y, width: r.width, height: r.height }
    }
}

// ── Settings ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // HSV gate (key casing matches the tuning tool's output)
    #[serde(rename = "H_low")]
    pub h_low: u8,
    #[serde(rename = "H_high")]
    pub h_high: u8,
    #[serde(rename = "S_low")]
    pub s_low: u8,
    #[serde(rename = "S_high")]
    pub s_high: u8,
    #[serde(rename = "V_low")]
    pub v_low: u8,
    #[serde(rename = "V_high")]
    pub v_high: u8,

    // Morphology / thresholding
    pub blur_k: u32,
    pub thresh_mode: ThreshMode,
    pub global_thresh: u8,
    pub block_size: u32,
    #[serde(rename = "C")]
    pub c: f64,

    // Edges
    pub canny_low: u8,
    pub canny_high: u8,

    // Filters
    pub min_area: f64,
    pub scale: f64,

    // Calibration
    pub min_dot_area: f64,
    pub roi: Option<RoiConfig>,

    // QC: form
    pub min_aspect: f64,
    pub max_aspect: f64,
    pub min_solidity: f64,
    pub min_extent: f64,

    // QC: size
    pub mm_per_pixel: f64,
    pub expected_width_mm: f64,
    pub expected_height_mm: f64,
    pub tolerance_width_mm: f64,
    pub tolerance_height_mm: f64,

    // QC: color
    pub reference_lab: [f64; 3],
    pub tolerance_delta_e: f64,

    // QC: special (screw holes)
    pub expected_hole_count: u32,
    pub min_hole_area: f64,
    pub max_hole_area: f64,

    // Pose / dispatch
    /// Commissioning-time rotation between camera and robot axes, applied
    /// after the PCA angle is folded into [0, 180).
    pub pose_offset_deg: f64,
    /// Fixed tool approach height on the wire.
    pub z_mm: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            h_low: 0,
            h_high: 15,
            s_low: 80,
            s_high: 255,
            v_low: 60,
            v_high: 255,

            blur_k: 5,
            thresh_mode: ThreshMode::Global,
            global_thresh: 120,
            block_size: 21,
            c: 2.0,

            canny_low: 50,
            canny_high: 150,

            min_area: 1000.0,
            scale: 1.0,

            min_dot_area: 23.0,
            roi: None,

            min_aspect: 2.0,
            max_aspect: 7.0,
            min_solidity: 0.88,
            min_extent: 0.90,

            mm_per_pixel: 0.383,
            expected_width_mm: 96.7,
            expected_height_mm: 25.7,
            tolerance_width_mm: 3.0,
            tolerance_height_mm: 2.0,

            reference_lab: [107.30393, 187.07338, 160.88551],
            tolerance_delta_e: 25.0,

            expected_hole_count: 2,
            min_hole_area: 50.0,
            max_hole_area: 150.0,

            pose_offset_deg: 151.55,
            z_mm: 55.0,
        }
    }
}

impl Settings {
    /// Load, parse and normalize. Unknown keys in the file are ignored.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let text = fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut settings: Settings = serde_json::from_str(&text)?;
        settings.normalize();
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text).map_err(|source| SettingsError::Write {
            path: path.display().to_string(),
            source,
        })
    }

    /// Force the structural invariants. Idempotent, never fails.
    pub fn normalize(&mut self) {
        if self.blur_k < 1 {
            self.blur_k = 1;
        }
        if self.blur_k % 2 == 0 {
            self.blur_k += 1;
        }
        if self.block_size < 3 {
            self.block_size = 3;
        }
        if self.block_size % 2 == 0 {
            self.block_size += 1;
        }
        if self.canny_high <= self.canny_low {
            self.canny_high = self.canny_low.saturating_add(1);
        }
        if !(self.scale > 0.0) || self.scale > 1.0 {
            self.scale = 1.0;
        }
    }

    /// Check the invariants `normalize` enforces. The preprocessor refuses
    /// settings that were built by hand and skipped normalization.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.blur_k < 1 || self.blur_k % 2 == 0 {
            return Err(SettingsError::Invalid("blur_k must be odd and >= 1"));
        }
        if self.block_size < 3 || self.block_size % 2 == 0 {
            return Err(SettingsError::Invalid("block_size must be odd and >= 3"));
        }
        if self.canny_high <= self.canny_low {
            return Err(SettingsError::Invalid("canny_high must exceed canny_low"));
        }
        if !(self.scale > 0.0 && self.scale <= 1.0) {
            return Err(SettingsError::Invalid("scale must be in (0, 1]"));
        }
        Ok(())
    }

    pub fn hsv_lower(&self) -> [u8; 3] {
        [self.h_low, self.s_low, self.v_low]
    }

    pub fn hsv_upper(&self) -> [u8; 3] {
        [self.h_high, self.s_high, self.v_high]
    }
}
