//! Multi-stage QC evaluation.
//!
//! The form pass turns the segmentation mask into candidate objects with
//! geometric descriptors; size, color and special (screw-hole) checks run
//! per object; the combiner ANDs the sub-verdicts. QC failures are verdicts,
//! not errors: a failing part is still carried through pose estimation and
//! dispatched with a NOK tag.

use std::fmt;

use crate::colorspace::{bgr_to_lab, delta_e};
use crate::contour::{
    bounding_box, centroid, convex_hull, find_external_contours, find_holes, min_area_rect,
    polygon_area, Contour, RotatedRect,
};
use crate::raster::{Frame, Plane};
use crate::settings::Settings;

// ── Failure reasons ───────────────────────────────────────────────────────────

/// Sub-evaluator failure, with the measured value that tripped it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FailReason {
    AspectOutOfRange { aspect: f64 },
    SolidityTooLow { solidity: f64 },
    ExtentTooLow { extent: f64 },
    WidthOutOfTolerance { measured_mm: f64 },
    HeightOutOfTolerance { measured_mm: f64 },
    ColorDrift { delta_e: f64 },
    WrongHoleCount { found: u32 },
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AspectOutOfRange { aspect } => {
                write!(f, "Aspect ratio out of range ({aspect:.2})")
            }
            Self::SolidityTooLow { solidity } => write!(f, "Solidity too low ({solidity:.2})"),
            Self::ExtentTooLow { extent } => write!(f, "Extent too low ({extent:.2})"),
            Self::WidthOutOfTolerance { measured_mm } => {
                write!(f, "Width out of tolerance (measured {measured_mm:.2} mm)")
            }
            Self::HeightOutOfTolerance { measured_mm } => {
                write!(f, "Height out of tolerance (measured {measured_mm:.2} mm)")
            }
            Self::ColorDrift { delta_e } => {
                write!(f, "Color out of tolerance (deltaE {delta_e:.2})")
            }
            Self::WrongHoleCount { found } => write!(f, "Wrong number of holes ({found} found)"),
        }
    }
}

/// Sub-evaluator identity, used to order rendered reasons deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Form,
    Size,
    Color,
    Special,
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Form => "FORM",
            Self::Size => "SIZE",
            Self::Color => "COLOR",
            Self::Special => "SPECIAL",
        })
    }
}

// ── Per-evaluator results ─────────────────────────────────────────────────────

/// Geometry pass output: one candidate object with shape descriptors.
#[derive(Debug, Clone)]
pub struct FormResult {
    pub contour: Contour,
    pub centroid_px: (f64, f64),
    pub rect: RotatedRect,
    pub area: f64,
    pub aspect: f64,
    pub solidity: f64,
    pub extent: f64,
    pub ok: bool,
    pub reason: Option<FailReason>,
}

#[derive(Debug, Clone, Copy)]
pub struct SizeResult {
    pub width_mm: f64,
    pub height_mm: f64,
    pub ok: bool,
    pub reason: Option<FailReason>,
}

#[derive(Debug, Clone, Copy)]
pub struct ColorResult {
    pub mean_lab: [f64; 3],
    pub delta_e: f64,
    pub ok: bool,
    pub reason: Option<FailReason>,
}

#[derive(Debug, Clone)]
pub struct SpecialResult {
    pub hole_count: u32,
    pub hole_areas: Vec<f64>,
    pub ok: bool,
    pub reason: Option<FailReason>,
}

/// Combined per-object QC record.
#[derive(Debug, Clone)]
pub struct QcRecord {
    pub form: FormResult,
    pub size: SizeResult,
    pub color: ColorResult,
    pub special: SpecialResult,
    pub overall_ok: bool,
}

impl QcRecord {
    /// Rendered failure reasons in fixed section order.
    pub fn reasons(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (section, reason) in [
            (Section::Form, self.form.reason.as_ref()),
            (Section::Size, self.size.reason.as_ref()),
            (Section::Color, self.color.reason.as_ref()),
            (Section::Special, self.special.reason.as_ref()),
        ] {
            if let Some(r) = reason {
                out.push(format!("{section}: {r}"));
            }
        }
        out
    }
}

// ── Form ──────────────────────────────────────────────────────────────────────

/// Extract candidates from the mask and judge their shape.
///
/// Contours below `min_area` are not candidates at all (screw holes, noise);
/// degenerate contours (no hull, zero rectangle area) are dropped silently.
pub fn evaluate_form(mask: &Plane, settings: &Settings) -> Vec<FormResult> {
    let mut results = Vec::new();

    for contour in find_external_contours(mask) {
        let area = polygon_area(&contour.points);
        if area < settings.min_area {
            continue;
        }
        let Some(centroid_px) = centroid(&contour.points) else {
            continue;
        };
        let Some(rect) = min_area_rect(&contour.points) else {
            continue;
        };
        let hull_area = polygon_area(&convex_hull(&contour.points));
        let rect_area = rect.width * rect.height;
        if hull_area <= 0.0 || rect_area <= 0.0 {
            continue;
        }

        let aspect = rect.width / rect.height;
        let solidity = area / hull_area;
        let extent = area / rect_area;

        // first failing predicate wins, in this order
        let reason = if !(settings.min_aspect..=settings.max_aspect).contains(&aspect) {
            Some(FailReason::AspectOutOfRange { aspect })
        } else if solidity < settings.min_solidity {
            Some(FailReason::SolidityTooLow { solidity })
        } else if extent < settings.min_extent {
            Some(FailReason::ExtentTooLow { extent })
        } else {
            None
        };

        results.push(FormResult {
            contour,
            centroid_px,
            rect,
            area,
            aspect,
            solidity,
            extent,
            ok: reason.is_none(),
            reason,
        });
    }

    results
}

// ── Size ──────────────────────────────────────────────────────────────────────

pub fn evaluate_size(form: &FormResult, settings: &Settings) -> SizeResult {
    let width_mm = form.rect.width * settings.mm_per_pixel;
    let height_mm = form.rect.height * settings.mm_per_pixel;

    let width_ok = (width_mm - settings.expected_width_mm).abs() <= settings.tolerance_width_mm;
    let height_ok = (height_mm - settings.expected_height_mm).abs() <= settings.tolerance_height_mm;

    let reason = if !width_ok {
        Some(FailReason::WidthOutOfTolerance { measured_mm: width_mm })
    } else if !height_ok {
        Some(FailReason::HeightOutOfTolerance { measured_mm: height_mm })
    } else {
        None
    };

    SizeResult { width_mm, height_mm, ok: reason.is_none(), reason }
}

// ── Color ─────────────────────────────────────────────────────────────────────

/// Mean LAB over the object's oriented rectangle on the original frame,
/// CIE76 distance against the commissioned reference.
pub fn evaluate_color(frame: &Frame, form: &FormResult, settings: &Settings) -> ColorResult {
    let rect = &form.rect;
    let corners = rect.corners();
    let min_x = corners.iter().map(|c| c.0).fold(f64::INFINITY, f64::min).floor().max(0.0) as u32;
    let max_x = corners
        .iter()
        .map(|c| c.0)
        .fold(f64::NEG_INFINITY, f64::max)
        .ceil()
        .min(frame.width() as f64 - 1.0) as u32;
    let min_y = corners.iter().map(|c| c.1).fold(f64::INFINITY, f64::min).floor().max(0.0) as u32;
    let max_y = corners
        .iter()
        .map(|c| c.1)
        .fold(f64::NEG_INFINITY, f64::max)
        .ceil()
        .min(frame.height() as f64 - 1.0) as u32;

    let mut sum = [0.0f64; 3];
    let mut n = 0usize;
    for y in min_y..=max_y {
        for x in min_x..=max_x {
            if rect.contains(x as f64, y as f64) {
                let lab = bgr_to_lab(frame.get(x, y));
                sum[0] += lab[0];
                sum[1] += lab[1];
                sum[2] += lab[2];
                n += 1;
            }
        }
    }
    let mean_lab = if n > 0 {
        [sum[0] / n as f64, sum[1] / n as f64, sum[2] / n as f64]
    } else {
        // degenerate rasterization: sample the centroid pixel
        let cx = (form.centroid_px.0.round().max(0.0) as u32).min(frame.width() - 1);
        let cy = (form.centroid_px.1.round().max(0.0) as u32).min(frame.height() - 1);
        bgr_to_lab(frame.get(cx, cy))
    };

    let de = delta_e(mean_lab, settings.reference_lab);
    let ok = de <= settings.tolerance_delta_e;
    ColorResult {
        mean_lab,
        delta_e: de,
        ok,
        reason: (!ok).then_some(FailReason::ColorDrift { delta_e: de }),
    }
}

// ── Special (screw holes) ─────────────────────────────────────────────────────

/// Count internal contours inside the object's bounding window whose area
/// falls in the configured band.
pub fn evaluate_special(mask: &Plane, form: &FormResult, settings: &Settings) -> SpecialResult {
    let hole_areas: Vec<f64> = bounding_box(&form.contour.points)
        .map(|bbox| find_holes(mask, bbox))
        .unwrap_or_default()
        .into_iter()
        .filter(|&a| a >= settings.min_hole_area && a <= settings.max_hole_area)
        .collect();

    let hole_count = hole_areas.len() as u32;
    let ok = hole_count == settings.expected_hole_count;
    SpecialResult {
        hole_count,
        hole_areas,
        ok,
        reason: (!ok).then_some(FailReason::WrongHoleCount { found: hole_count }),
    }
}

// ── Combiner ──────────────────────────────────────────────────────────────────

/// Run the full QC chain over one frame/mask pair.
pub fn evaluate_all(frame: &Frame, mask: &Plane, settings: &Settings) -> Vec<QcRecord> {
    evaluate_form(mask, settings)
        .into_iter()
        .map(|form| {
            let size = evaluate_size(&form, settings);
            let color = evaluate_color(frame, &form, settings);
            let special = evaluate_special(mask, &form, settings);
            let overall_ok = form.ok && size.ok && color.ok && special.ok;
            QcRecord { form, size, color, special, overall_ok }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::Roi;

    const RED: [u8; 3] = [40, 40, 200];
    const BG: [u8; 3] = [30, 30, 30];

    struct Scene {
        frame: Frame,
        mask: Plane,
    }

    /// Part rectangle at (40, 50), given pixel size, with square holes.
    fn scene(part_w: u32, part_h: u32, holes: &[(u32, u32)], part_bgr: [u8; 3]) -> Scene {
        let w = part_w + 80;
        let h = part_h + 100;
        let mut frame = Frame::new(w, h).unwrap();
        let mut mask = Plane::new(w, h);
        for y in 0..h {
            for x in 0..w {
                frame.set(x, y, BG);
            }
        }
        for y in 50..50 + part_h {
            for x in 40..40 + part_w {
                frame.set(x, y, part_bgr);
                mask.set(x, y, 255);
            }
        }
        for &(hx, hy) in holes {
            for y in hy..hy + 10 {
                for x in hx..hx + 10 {
                    frame.set(x, y, BG);
                    mask.set(x, y, 0);
                }
            }
        }
        Scene { frame, mask }
    }

    fn part_settings() -> Settings {
        let mut s = Settings::default();
        s.min_area = 1500.0;
        s.mm_per_pixel = 0.383;
        s.expected_width_mm = 100.0;
        s.expected_height_mm = 25.0;
        s.tolerance_width_mm = 3.0;
        s.tolerance_height_mm = 2.0;
        s.min_extent = 0.90;
        s.normalize();
        s
    }

    #[test]
    fn clean_part_passes_every_stage() {
        // 261x65 px ≈ 99.6 x 24.5 mm at 0.383 mm/px, two holes in band
        let sc = scene(261, 65, &[(60, 70), (240, 70)], RED);
        let records = evaluate_all(&sc.frame, &sc.mask, &part_settings());
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert!(r.form.ok, "form reason: {:?}", r.form.reason);
        assert!(r.size.ok, "size: {} x {}", r.size.width_mm, r.size.height_mm);
        assert!(r.color.ok, "deltaE was {}", r.color.delta_e);
        assert!(r.special.ok, "holes: {}", r.special.hole_count);
        assert!(r.overall_ok);
        assert!(r.reasons().is_empty());

        assert!(r.form.rect.width >= r.form.rect.height);
        assert!((r.form.aspect - 260.0 / 64.0).abs() < 1e-9);
        assert_eq!(r.special.hole_count, 2);
    }

    #[test]
    fn overall_is_conjunction_of_sub_verdicts() {
        let sc = scene(261, 65, &[(60, 70), (240, 70)], RED);
        for rec in evaluate_all(&sc.frame, &sc.mask, &part_settings()) {
            assert_eq!(rec.overall_ok, rec.form.ok && rec.size.ok && rec.color.ok && rec.special.ok);
        }
    }

    #[test]
    fn color_drift_fails_with_color_reason() {
        let sc = scene(261, 65, &[(60, 70), (240, 70)], [100, 150, 100]);
        let records = evaluate_all(&sc.frame, &sc.mask, &part_settings());
        let r = &records[0];
        assert!(!r.color.ok);
        assert!(!r.overall_ok);
        let reasons = r.reasons();
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].starts_with("COLOR: "), "got {:?}", reasons);
    }

    #[test]
    fn hole_miscount_renders_expected_reason() {
        let sc = scene(261, 65, &[(60, 70), (150, 70), (240, 70)], RED);
        let records = evaluate_all(&sc.frame, &sc.mask, &part_settings());
        let r = &records[0];
        assert!(!r.special.ok);
        assert_eq!(r.special.hole_count, 3);
        assert!(r
            .reasons()
            .iter()
            .any(|m| m == "SPECIAL: Wrong number of holes (3 found)"));
    }

    #[test]
    fn min_area_boundary_is_inclusive() {
        let mut mask = Plane::new(60, 60);
        for y in 10..30 {
            for x in 10..50 {
                mask.set(x, y, 255);
            }
        }
        // traced polygon area of a 40x20 block
        let area = 39.0 * 19.0;

        let mut s = part_settings();
        s.min_aspect = 1.0;
        s.min_area = area;
        assert_eq!(evaluate_form(&mask, &s).len(), 1);

        s.min_area = area + 1.0;
        assert_eq!(evaluate_form(&mask, &s).len(), 0);
    }

    #[test]
    fn aspect_boundary_is_inclusive() {
        // 39x20 px block → rect 38x19 → aspect exactly 2.0
        let mut mask = Plane::new(80, 60);
        for y in 10..30 {
            for x in 10..49 {
                mask.set(x, y, 255);
            }
        }
        let mut s = part_settings();
        s.min_area = 100.0;
        s.min_aspect = 2.0;
        let forms = evaluate_form(&mask, &s);
        assert_eq!(forms.len(), 1);
        assert!((forms[0].aspect - 2.0).abs() < 1e-12);
        assert!(forms[0].ok, "reason: {:?}", forms[0].reason);

        // nudge the bound above the measured aspect and it fails on aspect
        s.min_aspect = 2.0 + 1e-9;
        let forms = evaluate_form(&mask, &s);
        assert!(matches!(forms[0].reason, Some(FailReason::AspectOutOfRange { .. })));
    }

    #[test]
    fn delta_e_boundary_is_inclusive() {
        let sc = scene(261, 65, &[(60, 70), (240, 70)], RED);
        let mut s = part_settings();
        let first = evaluate_all(&sc.frame, &sc.mask, &s);
        let measured = first[0].color.delta_e;
        assert!(measured > 0.0);

        // tolerance set to the exact measured distance: accepted
        s.tolerance_delta_e = measured;
        let again = evaluate_all(&sc.frame, &sc.mask, &s);
        assert!(again[0].color.ok);

        // anything tighter: rejected
        s.tolerance_delta_e = measured * 0.999;
        let again = evaluate_all(&sc.frame, &sc.mask, &s);
        assert!(!again[0].color.ok);
    }

    #[test]
    fn size_failure_reports_width_first() {
        let sc = scene(261, 65, &[(60, 70), (240, 70)], RED);
        let mut s = part_settings();
        s.expected_width_mm = 50.0; // both axes now out of tolerance
        s.expected_height_mm = 10.0;
        let records = evaluate_all(&sc.frame, &sc.mask, &s);
        assert!(matches!(
            records[0].size.reason,
            Some(FailReason::WidthOutOfTolerance { .. })
        ));
    }

    #[test]
    fn hole_band_filters_noise_and_oversize() {
        let mut s = part_settings();
        s.min_hole_area = 50.0;
        s.max_hole_area = 150.0;
        // one in-band hole (10x10 → 81), one tiny (3x3 → 4), one huge (20x20 → 361)
        let mut sc = scene(261, 65, &[(60, 70)], RED);
        for y in 70..73 {
            for x in 150..153 {
                sc.mask.set(x, y, 0);
            }
        }
        for y in 60..80 {
            for x in 200..220 {
                sc.mask.set(x, y, 0);
            }
        }
        let records = evaluate_all(&sc.frame, &sc.mask, &s);
        let r = &records[0];
        assert_eq!(r.special.hole_count, 1);
        assert!(!r.special.ok);
    }
}
