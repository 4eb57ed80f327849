//! Offline calibration: 20-dot grid → pixel/robot homography.
//!
//! The dot layout and its robot-frame coordinates are a compile-time
//! constant: 4 rows × 5 columns, 112.5 mm column step, 140 mm row step,
//! origin at a corner, top image row pairing with the far robot row. The
//! solve runs the §preprocess HSV pipeline, refines dot centers to
//! subpixel accuracy on the grayscale frame, orders them row-major and
//! fits the homography with RANSAC over a normalized DLT.

use nalgebra::{DMatrix, Matrix3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

use crate::contour::{centroid, find_external_contours, polygon_area};
use crate::mapping::{CalibrationSidecar, Homography, HsvRange, MappingError};
use crate::preprocess::{self, luminance_plane};
use crate::raster::{Frame, Plane};
use crate::settings::{Settings, SettingsError};

pub const GRID_ROWS: usize = 4;
pub const GRID_COLS: usize = 5;
pub const GRID_DOTS: usize = GRID_ROWS * GRID_COLS;
pub const GRID_STEP_X_MM: f64 = 112.5;
pub const GRID_STEP_Y_MM: f64 = 140.0;

/// RANSAC reprojection gate, in robot millimeters.
const RANSAC_THRESHOLD_MM: f64 = 3.0;
const RANSAC_ITERATIONS: usize = 500;

/// Subpixel refinement: 5×5 window, bounded iteration.
const SUBPIX_HALF_WINDOW: i64 = 2;
const SUBPIX_MAX_ITERATIONS: usize = 40;
const SUBPIX_EPS: f64 = 0.001;

/// Robot-frame coordinates of the grid, row-major, top image row first.
pub fn robot_grid() -> [(f64, f64); GRID_DOTS] {
    let mut out = [(0.0, 0.0); GRID_DOTS];
    for row in 0..GRID_ROWS {
        for col in 0..GRID_COLS {
            out[row * GRID_COLS + col] = (
                col as f64 * GRID_STEP_X_MM,
                (GRID_ROWS - 1 - row) as f64 * GRID_STEP_Y_MM,
            );
        }
    }
    out
}

#[derive(Debug, Error)]
pub enum CalibError {
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("expected {GRID_DOTS} calibration dots, found {found}")]
    WrongDotCount { found: usize },
    #[error("homography solver returned no model")]
    SolverFailed,
    #[error(transparent)]
    Mapping(#[from] MappingError),
}

/// Result of one calibration solve.
#[derive(Debug)]
pub struct CalibrationReport {
    pub homography: Homography,
    pub num_points: usize,
    pub mean_error_mm: f64,
    pub max_error_mm: f64,
    pub rms_error_mm: f64,
    pub per_point_errors_mm: Vec<f64>,
    /// Local linear scale of the solved map at the grid center, mm/px.
    /// Logged next to the independently stored `mm_per_pixel` setting.
    pub derived_scale_mm_per_px: f64,
}

impl CalibrationReport {
    pub fn sidecar(&self, settings: &Settings) -> CalibrationSidecar {
        CalibrationSidecar {
            timestamp: chrono::Utc::now().to_rfc3339(),
            num_points: self.num_points,
            avg_error_mm: self.mean_error_mm,
            max_error_mm: self.max_error_mm,
            rms_error_mm: self.rms_error_mm,
            hsv: HsvRange { lower: settings.hsv_lower(), upper: settings.hsv_upper() },
        }
    }
}

// ── Dot detection ─────────────────────────────────────────────────────────────

/// Detect dot centers in global pixel coordinates: HSV mask (optionally
/// cropped to the configured ROI, origin compensated), moment centroids,
/// subpixel refinement against the grayscale frame.
pub fn detect_dots(frame: &Frame, settings: &Settings) -> Result<Vec<(f64, f64)>, CalibError> {
    let pre = preprocess::run(frame, settings)?;

    let (mask, origin): (Plane, (f64, f64)) = match settings.roi {
        Some(cfg) => {
            let roi: crate::raster::Roi = cfg.into();
            match roi.clamped(pre.mask.width(), pre.mask.height()) {
                Some(clamped) => (pre.mask.crop(clamped), (clamped.x as f64, clamped.y as f64)),
                None => (pre.mask, (0.0, 0.0)),
            }
        }
        None => (pre.mask, (0.0, 0.0)),
    };

    let mut centers = Vec::new();
    for contour in find_external_contours(&mask) {
        if polygon_area(&contour.points) < settings.min_dot_area {
            continue;
        }
        let Some((cx, cy)) = centroid(&contour.points) else {
            continue;
        };
        centers.push((cx + origin.0, cy + origin.1));
    }

    let gray = luminance_plane(frame);
    for c in &mut centers {
        *c = refine_subpix(&gray, *c);
    }
    Ok(centers)
}

/// Gradient-weighted center refinement (5×5 window, 40 iterations, eps
/// 0.001), the corner-refinement scheme applied to blob centers.
pub fn refine_subpix(gray: &Plane, start: (f64, f64)) -> (f64, f64) {
    let mut cur = start;
    for _ in 0..SUBPIX_MAX_ITERATIONS {
        let cx = cur.0.round() as i64;
        let cy = cur.1.round() as i64;

        let mut a00 = 0.0f64;
        let mut a01 = 0.0f64;
        let mut a11 = 0.0f64;
        let mut b0 = 0.0f64;
        let mut b1 = 0.0f64;
        for dy in -SUBPIX_HALF_WINDOW..=SUBPIX_HALF_WINDOW {
            for dx in -SUBPIX_HALF_WINDOW..=SUBPIX_HALF_WINDOW {
                let px = cx + dx;
                let py = cy + dy;
                let gx = (gray.get_clamped(px + 1, py) as f64
                    - gray.get_clamped(px - 1, py) as f64)
                    / 2.0;
                let gy = (gray.get_clamped(px, py + 1) as f64
                    - gray.get_clamped(px, py - 1) as f64)
                    / 2.0;
                let gxx = gx * gx;
                let gyy = gy * gy;
                let gxy = gx * gy;
                a00 += gxx;
                a01 += gxy;
                a11 += gyy;
                b0 += gxx * px as f64 + gxy * py as f64;
                b1 += gxy * px as f64 + gyy * py as f64;
            }
        }

        let det = a00 * a11 - a01 * a01;
        if det.abs() < 1e-9 {
            break;
        }
        let nx = (a11 * b0 - a01 * b1) / det;
        let ny = (a00 * b1 - a01 * b0) / det;
        let shift = ((nx - cur.0).powi(2) + (ny - cur.1).powi(2)).sqrt();
        cur = (nx, ny);
        if shift < SUBPIX_EPS {
            break;
        }
    }
    cur
}

/// Order detected centers row-major: Y ascending, partitioned into
/// `GRID_ROWS` consecutive groups of `GRID_COLS`, each sorted by X.
pub fn order_row_major(mut centers: Vec<(f64, f64)>) -> Result<Vec<(f64, f64)>, CalibError> {
    if centers.len() != GRID_DOTS {
        return Err(CalibError::WrongDotCount { found: centers.len() });
    }
    centers.sort_by(|a, b| a.1.total_cmp(&b.1));
    let mut ordered = Vec::with_capacity(GRID_DOTS);
    for row in centers.chunks(GRID_COLS) {
        let mut row = row.to_vec();
        row.sort_by(|a, b| a.0.total_cmp(&b.0));
        ordered.extend(row);
    }
    Ok(ordered)
}

// ── Homography solve ──────────────────────────────────────────────────────────

fn similarity_normalization(points: &[(f64, f64)]) -> (Matrix3<f64>, Vec<(f64, f64)>) {
    let n = points.len() as f64;
    let (mut mx, mut my) = (0.0, 0.0);
    for p in points {
        mx += p.0;
        my += p.1;
    }
    mx /= n;
    my /= n;
    let mut dist = 0.0;
    for p in points {
        dist += ((p.0 - mx).powi(2) + (p.1 - my).powi(2)).sqrt();
    }
    dist /= n;
    let s = if dist > 1e-12 { std::f64::consts::SQRT_2 / dist } else { 1.0 };
    let t = Matrix3::new(s, 0.0, -s * mx, 0.0, s, -s * my, 0.0, 0.0, 1.0);
    let normed = points.iter().map(|p| (s * (p.0 - mx), s * (p.1 - my))).collect();
    (t, normed)
}

/// Normalized direct linear transform. `None` when the system is
/// degenerate (collinear sample or SVD failure).
fn dlt(pixels: &[(f64, f64)], robots: &[(f64, f64)]) -> Option<Matrix3<f64>> {
    let n = pixels.len();
    if n < 4 || robots.len() != n {
        return None;
    }
    let (t_px, px) = similarity_normalization(pixels);
    let (t_rb, rb) = similarity_normalization(robots);

    let mut rows = Vec::with_capacity(2 * n * 9);
    for i in 0..n {
        let (x, y) = px[i];
        let (u, v) = rb[i];
        rows.extend_from_slice(&[-x, -y, -1.0, 0.0, 0.0, 0.0, u * x, u * y, u]);
        rows.extend_from_slice(&[0.0, 0.0, 0.0, -x, -y, -1.0, v * x, v * y, v]);
    }
    let a = DMatrix::from_row_slice(2 * n, 9, &rows);
    let svd = a.svd(true, true);
    let v_t = svd.v_t.as_ref()?;

    let mut min_idx = 0;
    for (i, sv) in svd.singular_values.iter().enumerate() {
        if *sv < svd.singular_values[min_idx] {
            min_idx = i;
        }
    }
    let h = v_t.row(min_idx);
    let hn = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);

    let t_rb_inv = t_rb.try_inverse()?;
    let mut m = t_rb_inv * hn * t_px;
    let scale = m[(2, 2)];
    if scale.abs() > 1e-12 {
        m /= scale;
    }
    Some(m)
}

fn reprojection_error(m: &Matrix3<f64>, px: (f64, f64), rb: (f64, f64)) -> f64 {
    let v = m * nalgebra::Vector3::new(px.0, px.1, 1.0);
    if v[2].abs() < 1e-12 {
        return f64::INFINITY;
    }
    let x = v[0] / v[2];
    let y = v[1] / v[2];
    ((x - rb.0).powi(2) + (y - rb.1).powi(2)).sqrt()
}

/// RANSAC homography over pixel↔robot correspondences. The sampler is
/// deterministically seeded so a calibration run is reproducible.
pub fn solve_homography(
    pixels: &[(f64, f64)],
    robots: &[(f64, f64)],
) -> Result<Homography, CalibError> {
    let n = pixels.len();
    if n < 4 || robots.len() != n {
        return Err(CalibError::SolverFailed);
    }

    let mut rng = StdRng::seed_from_u64(0x9e37_79b9);
    let mut best_inliers: Vec<usize> = Vec::new();

    for _ in 0..RANSAC_ITERATIONS {
        let mut idx = [0usize; 4];
        for slot in 0..4 {
            loop {
                let cand = rng.gen_range(0..n);
                if !idx[..slot].contains(&cand) {
                    idx[slot] = cand;
                    break;
                }
            }
        }
        let sample_px: Vec<_> = idx.iter().map(|&i| pixels[i]).collect();
        let sample_rb: Vec<_> = idx.iter().map(|&i| robots[i]).collect();
        let Some(model) = dlt(&sample_px, &sample_rb) else {
            continue;
        };

        let inliers: Vec<usize> = (0..n)
            .filter(|&i| reprojection_error(&model, pixels[i], robots[i]) <= RANSAC_THRESHOLD_MM)
            .collect();
        if inliers.len() > best_inliers.len() {
            best_inliers = inliers;
        }
        if best_inliers.len() == n {
            break;
        }
    }

    if best_inliers.len() < 4 {
        return Err(CalibError::SolverFailed);
    }
    let in_px: Vec<_> = best_inliers.iter().map(|&i| pixels[i]).collect();
    let in_rb: Vec<_> = best_inliers.iter().map(|&i| robots[i]).collect();
    let m = dlt(&in_px, &in_rb).ok_or(CalibError::SolverFailed)?;
    Homography::from_matrix(m).map_err(CalibError::from)
}

// ── Full solve ────────────────────────────────────────────────────────────────

/// Run the complete calibration pipeline on one frame.
pub fn calibrate_frame(frame: &Frame, settings: &Settings) -> Result<CalibrationReport, CalibError> {
    let centers = detect_dots(frame, settings)?;
    tracing::info!(found = centers.len(), "calibration dots detected");

    let ordered = order_row_major(centers)?;
    let robots = robot_grid();

    let homography = solve_homography(&ordered, &robots)?;

    let mut errors = Vec::with_capacity(GRID_DOTS);
    for (px, rb) in ordered.iter().zip(robots.iter()) {
        errors.push(reprojection_error(homography.matrix(), *px, *rb));
    }
    let mean = errors.iter().sum::<f64>() / errors.len() as f64;
    let max = errors.iter().fold(0.0f64, |a, &b| a.max(b));
    let rms = (errors.iter().map(|e| e * e).sum::<f64>() / errors.len() as f64).sqrt();

    let (gcx, gcy) = ordered
        .iter()
        .fold((0.0, 0.0), |acc, p| (acc.0 + p.0 / GRID_DOTS as f64, acc.1 + p.1 / GRID_DOTS as f64));
    let derived_scale = homography.scale_at(gcx, gcy);
    tracing::info!(
        mean_mm = mean,
        max_mm = max,
        rms_mm = rms,
        derived_scale_mm_per_px = derived_scale,
        configured_mm_per_pixel = settings.mm_per_pixel,
        "calibration solved"
    );

    Ok(CalibrationReport {
        homography,
        num_points: GRID_DOTS,
        mean_error_mm: mean,
        max_error_mm: max,
        rms_error_mm: rms,
        per_point_errors_mm: errors,
        derived_scale_mm_per_px: derived_scale,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const RED: [u8; 3] = [40, 40, 200];
    const BG: [u8; 3] = [30, 30, 30];

    /// Pixel position of a robot grid point under the synthetic camera:
    /// an affine view with a slight shear.
    fn gt_pixel(rb: (f64, f64)) -> (f64, f64) {
        (70.0 + 1.1 * rb.0 + 0.01 * rb.1, 30.0 + 0.95 * (420.0 - rb.1))
    }

    fn render_dot(frame: &mut Frame, cx: f64, cy: f64, radius: f64) {
        let x0 = (cx - radius - 2.0).floor() as i64;
        let x1 = (cx + radius + 2.0).ceil() as i64;
        let y0 = (cy - radius - 2.0).floor() as i64;
        let y1 = (cy + radius + 2.0).ceil() as i64;
        for y in y0..=y1 {
            for x in x0..=x1 {
                if x < 0 || y < 0 || x >= frame.width() as i64 || y >= frame.height() as i64 {
                    continue;
                }
                // 4x4 supersampled coverage
                let mut hits = 0;
                for sy in 0..4 {
                    for sx in 0..4 {
                        let fx = x as f64 + (sx as f64 + 0.5) / 4.0 - 0.5;
                        let fy = y as f64 + (sy as f64 + 0.5) / 4.0 - 0.5;
                        if (fx - cx).powi(2) + (fy - cy).powi(2) <= radius * radius {
                            hits += 1;
                        }
                    }
                }
                if hits > 0 {
                    let t = hits as f64 / 16.0;
                    let mut bgr = [0u8; 3];
                    for c in 0..3 {
                        bgr[c] = (BG[c] as f64 * (1.0 - t) + RED[c] as f64 * t).round() as u8;
                    }
                    frame.set(x as u32, y as u32, bgr);
                }
            }
        }
    }

    fn grid_frame(skip: usize, extra: usize) -> Frame {
        let mut frame = Frame::new(700, 500).unwrap();
        for y in 0..500 {
            for x in 0..700 {
                frame.set(x, y, BG);
            }
        }
        for (i, rb) in robot_grid().iter().enumerate() {
            if i < skip {
                continue;
            }
            let (px, py) = gt_pixel(*rb);
            render_dot(&mut frame, px, py, 5.0);
        }
        for i in 0..extra {
            render_dot(&mut frame, 600.0 + 20.0 * i as f64, 470.0, 5.0);
        }
        frame
    }

    fn calib_settings() -> Settings {
        let mut s = Settings::default();
        s.min_dot_area = 23.0;
        s.normalize();
        s
    }

    #[test]
    fn full_solve_recovers_the_view() {
        let frame = grid_frame(0, 0);
        let report = calibrate_frame(&frame, &calib_settings()).unwrap();
        assert_eq!(report.num_points, GRID_DOTS);
        assert!(report.mean_error_mm <= 0.5, "mean error {} mm", report.mean_error_mm);
        assert!(report.max_error_mm <= 1.5, "max error {} mm", report.max_error_mm);

        // forward map of a known dot pixel lands on its robot coordinate
        let rb = (2.0 * GRID_STEP_X_MM, GRID_STEP_Y_MM);
        let px = gt_pixel(rb);
        let (x, y) = report.homography.map(px.0, px.1);
        assert!((x - rb.0).abs() < 1.0, "mapped X {x}");
        assert!((y - rb.1).abs() < 1.0, "mapped Y {y}");

        // derived scale sits near the synthetic view's ~0.9 mm/px
        assert!(report.derived_scale_mm_per_px > 0.5 && report.derived_scale_mm_per_px < 1.5);
    }

    #[test]
    fn dot_count_must_be_exact() {
        for (skip, extra, found) in [(1usize, 0usize, 19usize), (0, 1, 21)] {
            let frame = grid_frame(skip, extra);
            match calibrate_frame(&frame, &calib_settings()) {
                Err(CalibError::WrongDotCount { found: f }) => assert_eq!(f, found),
                other => panic!("expected WrongDotCount, got {other:?}"),
            }
        }
    }

    #[test]
    fn subpix_refinement_converges_on_a_dot() {
        let mut frame = Frame::new(60, 60).unwrap();
        for y in 0..60 {
            for x in 0..60 {
                frame.set(x, y, BG);
            }
        }
        // small enough that the rim falls inside the refinement window
        render_dot(&mut frame, 30.37, 29.64, 2.5);
        let gray = luminance_plane(&frame);
        let refined = refine_subpix(&gray, (30.0, 30.0));
        assert!((refined.0 - 30.37).abs() < 0.25, "x was {}", refined.0);
        assert!((refined.1 - 29.64).abs() < 0.25, "y was {}", refined.1);
    }

    #[test]
    fn row_major_ordering() {
        // scrambled grid of synthetic centers
        let mut centers: Vec<(f64, f64)> =
            robot_grid().iter().map(|&rb| gt_pixel(rb)).collect();
        centers.reverse();
        centers.swap(3, 11);
        let ordered = order_row_major(centers).unwrap();
        for (i, rb) in robot_grid().iter().enumerate() {
            let expect = gt_pixel(*rb);
            assert!((ordered[i].0 - expect.0).abs() < 1e-9, "index {i}");
            assert!((ordered[i].1 - expect.1).abs() < 1e-9, "index {i}");
        }
    }

    #[test]
    fn solver_needs_four_points() {
        let px = [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0)];
        let rb = [(0.0, 0.0), (10.0, 0.0), (0.0, 10.0)];
        assert!(matches!(solve_homography(&px, &rb), Err(CalibError::SolverFailed)));
    }

    #[test]
    fn solver_survives_one_outlier() {
        let robots = robot_grid();
        let mut pixels: Vec<(f64, f64)> = robots.iter().map(|&rb| gt_pixel(rb)).collect();
        pixels[7].0 += 40.0; // gross outlier
        let h = solve_homography(&pixels, &robots).unwrap();
        // a clean point still maps tightly
        let (x, y) = h.map(pixels[0].0, pixels[0].1);
        assert!((x - robots[0].0).abs() < 0.5);
        assert!((y - robots[0].1).abs() < 0.5);
    }
}
