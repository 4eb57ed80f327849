//! Pose estimation: image-moment centroid plus PCA orientation.
//!
//! The principal-axis angle is stable where the oriented-rectangle angle is
//! not: parts are line-symmetric under a half turn, so the direction is
//! folded into [0, 180). The commissioning offset for the camera mounting
//! rotation is applied after the fold, and the result folded once more so
//! the published angle always stays in [0, 180).

use crate::contour::{centroid, Pt};

/// Planar pose of one detected part, in pixel coordinates.
#[derive(Debug, Clone, Copy)]
pub struct Pose {
    pub cx: f64,
    pub cy: f64,
    /// Orientation in degrees, [0, 180), mounting offset applied.
    pub angle_deg: f64,
}

/// Principal-axis direction of a point set, degrees in [0, 180).
/// `None` when the set has no spatial extent.
pub fn pca_angle(points: &[Pt]) -> Option<f64> {
    if points.len() < 2 {
        return None;
    }
    let n = points.len() as f64;
    let mut mx = 0.0;
    let mut my = 0.0;
    for p in points {
        mx += p.x as f64;
        my += p.y as f64;
    }
    mx /= n;
    my /= n;

    let mut sxx = 0.0;
    let mut syy = 0.0;
    let mut sxy = 0.0;
    for p in points {
        let dx = p.x as f64 - mx;
        let dy = p.y as f64 - my;
        sxx += dx * dx;
        syy += dy * dy;
        sxy += dx * dy;
    }

    if sxx < 1e-12 && syy < 1e-12 {
        return None;
    }

    // closed-form eigenvector of the 2x2 covariance, largest eigenvalue
    let angle = 0.5 * (2.0 * sxy).atan2(sxx - syy);
    Some(angle.to_degrees().rem_euclid(180.0))
}

/// Full pose of a contour: moment centroid + offset-compensated PCA angle.
/// `None` for degenerate contours.
pub fn estimate(points: &[Pt], offset_deg: f64) -> Option<Pose> {
    let (cx, cy) = centroid(points)?;
    let raw = pca_angle(points)?;
    Some(Pose { cx, cy, angle_deg: (raw + offset_deg).rem_euclid(180.0) })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect_points(w: i32, h: i32, rot_deg: f64) -> Vec<Pt> {
        let th = rot_deg.to_radians();
        let (s, c) = th.sin_cos();
        let mut pts = Vec::new();
        for y in 0..h {
            for x in 0..w {
                let fx = x as f64 - w as f64 / 2.0;
                let fy = y as f64 - h as f64 / 2.0;
                pts.push(Pt {
                    x: (100.0 + fx * c - fy * s).round() as i32,
                    y: (100.0 + fx * s + fy * c).round() as i32,
                });
            }
        }
        pts
    }

    #[test]
    fn horizontal_part_has_zero_angle() {
        let a = pca_angle(&rect_points(60, 10, 0.0)).unwrap();
        assert!(a < 0.5 || a > 179.5, "angle was {a}");
    }

    #[test]
    fn vertical_part_reads_ninety() {
        let a = pca_angle(&rect_points(60, 10, 90.0)).unwrap();
        assert!((a - 90.0).abs() < 0.5, "angle was {a}");
    }

    #[test]
    fn tilted_part_tracks_rotation() {
        for rot in [20.0, 45.0, 110.0, 160.0] {
            let a = pca_angle(&rect_points(80, 12, rot)).unwrap();
            let expect = rot % 180.0;
            let diff = (a - expect).abs().min(180.0 - (a - expect).abs());
            assert!(diff < 1.0, "rot {rot}: angle was {a}");
        }
    }

    fn rect_polygon(w: f64, h: f64, rot_deg: f64) -> Vec<Pt> {
        let th = rot_deg.to_radians();
        let (s, c) = th.sin_cos();
        [(-w / 2.0, -h / 2.0), (w / 2.0, -h / 2.0), (w / 2.0, h / 2.0), (-w / 2.0, h / 2.0)]
            .iter()
            .map(|(fx, fy)| Pt {
                x: (100.0 + fx * c - fy * s).round() as i32,
                y: (100.0 + fx * s + fy * c).round() as i32,
            })
            .collect()
    }

    #[test]
    fn offset_is_applied_and_folded() {
        let pts = rect_polygon(60.0, 10.0, 40.0);
        let pose = estimate(&pts, 151.55).unwrap();
        assert!(pose.angle_deg >= 0.0 && pose.angle_deg < 180.0);
        let expect = (40.0 + 151.55f64).rem_euclid(180.0);
        let diff = (pose.angle_deg - expect).abs();
        assert!(diff.min(180.0 - diff) < 1.0, "angle was {}", pose.angle_deg);
    }

    #[test]
    fn degenerate_points_have_no_pose() {
        assert!(pca_angle(&[Pt { x: 3, y: 3 }]).is_none());
        assert!(estimate(&[Pt { x: 3, y: 3 }], 0.0).is_none());
    }
}
