//! Preprocessing: frame → segmentation mask plus diagnostic rasters.
//!
//! The mask is the HSV in-range gate and is what the contour pass consumes.
//! The inverse-threshold raster, the Canny raster and the contour overlay
//! are diagnostics, produced per the configured settings. All outputs share
//! the input frame's dimensions; when `scale < 1` the pipeline runs on a
//! nearest-neighbor downscale and the rasters are upscaled back (nearest,
//! so binary planes stay binary).

use crate::colorspace::{bgr_to_gray, bgr_to_hsv};
use crate::contour::{find_external_contours, polygon_area};
use crate::raster::{Frame, Plane};
use crate::settings::{Settings, SettingsError, ThreshMode};

/// Output bundle of one preprocessing pass.
#[derive(Debug)]
pub struct PreprocessOutput {
    /// Binary HSV gate, full frame size. Feeds the contour pass.
    pub mask: Plane,
    /// Blurred luminance of the gated frame.
    pub gray: Plane,
    /// Inverse-threshold raster (mode per settings).
    pub thresh: Plane,
    /// Canny edge raster.
    pub edges: Plane,
    /// Original frame with contours of area ≥ `min_area` drawn.
    pub overlay: Frame,
}

/// Run the full preprocessing chain.
pub fn run(frame: &Frame, settings: &Settings) -> Result<PreprocessOutput, SettingsError> {
    settings.validate()?;

    let full_w = frame.width();
    let full_h = frame.height();

    let scaled;
    let work: &Frame = if settings.scale < 1.0 {
        let w = ((full_w as f64 * settings.scale).round() as u32).max(1);
        let h = ((full_h as f64 * settings.scale).round() as u32).max(1);
        scaled = frame
            .resize_nearest(w, h)
            .map_err(|_| SettingsError::Invalid("scale produced an empty raster"))?;
        &scaled
    } else {
        frame
    };

    let mask_work = hsv_in_range(work, settings.hsv_lower(), settings.hsv_upper());
    let gray_work = gated_luminance(work, &mask_work);
    let blur = gaussian_blur(&gray_work, settings.blur_k);

    let thresh_work = match settings.thresh_mode {
        ThreshMode::Global => threshold_inv(&blur, settings.global_thresh),
        ThreshMode::AdaptiveMean => adaptive_inv(&blur, settings.block_size, settings.c, false),
        ThreshMode::AdaptiveGaussian => adaptive_inv(&blur, settings.block_size, settings.c, true),
    };

    let edges_work = canny(&blur, settings.canny_low, settings.canny_high);

    let upscale = |p: &Plane| -> Result<Plane, SettingsError> {
        if p.width() == full_w && p.height() == full_h {
            Ok(p.clone())
        } else {
            p.resize_nearest(full_w, full_h)
                .map_err(|_| SettingsError::Invalid("upscale produced an empty raster"))
        }
    };

    let mask = upscale(&mask_work)?;
    let gray = upscale(&blur)?;
    let thresh = upscale(&thresh_work)?;
    let edges = upscale(&edges_work)?;

    let mut overlay = frame.clone();
    for contour in find_external_contours(&mask) {
        if polygon_area(&contour.points) < settings.min_area {
            continue;
        }
        for p in &contour.points {
            draw_dot(&mut overlay, p.x, p.y, [0, 255, 0]);
        }
    }

    Ok(PreprocessOutput { mask, gray, thresh, edges, overlay })
}

/// Plain luminance of a frame (used by calibration for subpixel refinement).
pub fn luminance_plane(frame: &Frame) -> Plane {
    let mut out = Plane::new(frame.width(), frame.height());
    for y in 0..frame.height() {
        for x in 0..frame.width() {
            out.set(x, y, bgr_to_gray(frame.get(x, y)));
        }
    }
    out
}

// ── Stages ────────────────────────────────────────────────────────────────────

fn hsv_in_range(frame: &Frame, lower: [u8; 3], upper: [u8; 3]) -> Plane {
    let mut out = Plane::new(frame.width(), frame.height());
    for y in 0..frame.height() {
        for x in 0..frame.width() {
            let hsv = bgr_to_hsv(frame.get(x, y));
            let inside = (0..3).all(|i| hsv[i] >= lower[i] && hsv[i] <= upper[i]);
            if inside {
                out.set(x, y, 255);
            }
        }
    }
    out
}

fn gated_luminance(frame: &Frame, mask: &Plane) -> Plane {
    let mut out = Plane::new(frame.width(), frame.height());
    for y in 0..frame.height() {
        for x in 0..frame.width() {
            if mask.get(x, y) != 0 {
                out.set(x, y, bgr_to_gray(frame.get(x, y)));
            }
        }
    }
    out
}

fn gaussian_kernel(k: u32) -> Vec<f64> {
    let sigma = 0.3 * ((k as f64 - 1.0) * 0.5 - 1.0) + 0.8;
    let c = (k as i64 - 1) / 2;
    let mut kernel: Vec<f64> = (0..k as i64)
        .map(|i| {
            let d = (i - c) as f64;
            (-d * d / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f64 = kernel.iter().sum();
    for v in &mut kernel {
        *v /= sum;
    }
    kernel
}

/// Separable Gaussian blur with replicated borders. `k` must be odd.
pub fn gaussian_blur(src: &Plane, k: u32) -> Plane {
    if k <= 1 {
        return src.clone();
    }
    let kernel = gaussian_kernel(k);
    let r = (k / 2) as i64;
    let w = src.width();
    let h = src.height();

    let mut horiz = vec![0.0f64; w as usize * h as usize];
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0;
            for (i, kv) in kernel.iter().enumerate() {
                let sx = x as i64 + i as i64 - r;
                acc += kv * src.get_clamped(sx, y as i64) as f64;
            }
            horiz[(y * w + x) as usize] = acc;
        }
    }

    let mut out = Plane::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0;
            for (i, kv) in kernel.iter().enumerate() {
                let sy = (y as i64 + i as i64 - r).clamp(0, h as i64 - 1);
                acc += kv * horiz[(sy as u32 * w + x) as usize];
            }
            out.set(x, y, acc.round().clamp(0.0, 255.0) as u8);
        }
    }
    out
}

fn threshold_inv(src: &Plane, thresh: u8) -> Plane {
    let mut out = Plane::new(src.width(), src.height());
    for y in 0..src.height() {
        for x in 0..src.width() {
            if src.get(x, y) <= thresh {
                out.set(x, y, 255);
            }
        }
    }
    out
}

fn adaptive_inv(src: &Plane, block_size: u32, c: f64, gaussian: bool) -> Plane {
    let w = src.width();
    let h = src.height();
    let local_mean: Vec<f64> = if gaussian {
        let blurred = gaussian_blur(src, block_size);
        (0..h).flat_map(|y| (0..w).map(move |x| (x, y))).map(|(x, y)| blurred.get(x, y) as f64).collect()
    } else {
        let r = (block_size / 2) as i64;
        let mut means = Vec::with_capacity(w as usize * h as usize);
        for y in 0..h as i64 {
            for x in 0..w as i64 {
                let mut sum = 0.0;
                let mut n = 0.0;
                for sy in (y - r).max(0)..=(y + r).min(h as i64 - 1) {
                    for sx in (x - r).max(0)..=(x + r).min(w as i64 - 1) {
                        sum += src.get(sx as u32, sy as u32) as f64;
                        n += 1.0;
                    }
                }
                means.push(sum / n);
            }
        }
        means
    };

    let mut out = Plane::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let t = local_mean[(y * w + x) as usize] - c;
            if (src.get(x, y) as f64) <= t {
                out.set(x, y, 255);
            }
        }
    }
    out
}

/// Canny edge detection: Sobel gradients, L1 magnitude, non-maximum
/// suppression and two-threshold hysteresis.
pub fn canny(src: &Plane, low: u8, high: u8) -> Plane {
    let w = src.width() as i64;
    let h = src.height() as i64;
    let idx = |x: i64, y: i64| (y * w + x) as usize;

    let mut gx = vec![0.0f64; (w * h) as usize];
    let mut gy = vec![0.0f64; (w * h) as usize];
    let mut mag = vec![0.0f64; (w * h) as usize];
    for y in 0..h {
        for x in 0..w {
            let p = |dx: i64, dy: i64| src.get_clamped(x + dx, y + dy) as f64;
            let sx = (p(1, -1) + 2.0 * p(1, 0) + p(1, 1)) - (p(-1, -1) + 2.0 * p(-1, 0) + p(-1, 1));
            let sy = (p(-1, 1) + 2.0 * p(0, 1) + p(1, 1)) - (p(-1, -1) + 2.0 * p(0, -1) + p(1, -1));
            gx[idx(x, y)] = sx;
            gy[idx(x, y)] = sy;
            mag[idx(x, y)] = sx.abs() + sy.abs();
        }
    }

    // non-maximum suppression along the quantized gradient direction
    let mut thin = vec![0.0f64; (w * h) as usize];
    for y in 0..h {
        for x in 0..w {
            let m = mag[idx(x, y)];
            if m == 0.0 {
                continue;
            }
            let angle = gy[idx(x, y)].atan2(gx[idx(x, y)]).to_degrees().rem_euclid(180.0);
            let (dx, dy) = if !(22.5..157.5).contains(&angle) {
                (1i64, 0i64)
            } else if angle < 67.5 {
                (1, 1)
            } else if angle < 112.5 {
                (0, 1)
            } else {
                (-1, 1)
            };
            let a = if x + dx >= 0 && x + dx < w && y + dy >= 0 && y + dy < h {
                mag[idx(x + dx, y + dy)]
            } else {
                0.0
            };
            let b = if x - dx >= 0 && x - dx < w && y - dy >= 0 && y - dy < h {
                mag[idx(x - dx, y - dy)]
            } else {
                0.0
            };
            if m >= a && m >= b {
                thin[idx(x, y)] = m;
            }
        }
    }

    // hysteresis
    let low = low as f64;
    let high = high as f64;
    let mut out = Plane::new(w as u32, h as u32);
    let mut stack = Vec::new();
    for y in 0..h {
        for x in 0..w {
            if thin[idx(x, y)] >= high && out.get(x as u32, y as u32) == 0 {
                out.set(x as u32, y as u32, 255);
                stack.push((x, y));
                while let Some((cx, cy)) = stack.pop() {
                    for dy in -1..=1i64 {
                        for dx in -1..=1i64 {
                            let nx = cx + dx;
                            let ny = cy + dy;
                            if nx < 0 || ny < 0 || nx >= w || ny >= h {
                                continue;
                            }
                            if thin[idx(nx, ny)] >= low && out.get(nx as u32, ny as u32) == 0 {
                                out.set(nx as u32, ny as u32, 255);
                                stack.push((nx, ny));
                            }
                        }
                    }
                }
            }
        }
    }
    out
}

fn draw_dot(frame: &mut Frame, x: i32, y: i32, bgr: [u8; 3]) {
    for (dx, dy) in [(0, 0), (1, 0), (-1, 0), (0, 1), (0, -1)] {
        let nx = x + dx;
        let ny = y + dy;
        if nx >= 0 && ny >= 0 && (nx as u32) < frame.width() && (ny as u32) < frame.height() {
            frame.set(nx as u32, ny as u32, bgr);
        }
    }
}
