//! Contour extraction and planar geometry over binary masks.
//!
//! Components are labeled 8-connected, their outer boundaries traced with a
//! radial-sweep border follower, and all downstream descriptors (area,
//! centroid, convex hull, minimum-area rectangle) are computed from the
//! traced polygon with Green's-theorem / rotating-calipers formulas.
//! Hole detection floods background inside a window; regions that do not
//! reach the window border are internal contours.

use crate::raster::{Plane, Roi};

/// Integer pixel coordinate on a traced boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pt {
    pub x: i32,
    pub y: i32,
}

/// Ordered outer-boundary polygon of one connected component.
#[derive(Debug, Clone)]
pub struct Contour {
    pub points: Vec<Pt>,
}

// Clockwise neighbor ring in image coordinates (y grows downward):
// E, SE, S, SW, W, NW, N, NE.
const RING: [(i32, i32); 8] = [
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
    (-1, 0),
    (-1, -1),
    (0, -1),
    (1, -1),
];

fn ring_dir(dx: i32, dy: i32) -> usize {
    RING.iter().position(|&d| d == (dx, dy)).unwrap_or(0)
}

/// Radial-sweep boundary trace, clockwise, 8-connected.
///
/// `start` must be the topmost-then-leftmost pixel of the region, so its
/// west neighbor is guaranteed outside. `max_steps` bounds runaway traces.
fn trace_boundary(inside: &dyn Fn(i32, i32) -> bool, start: Pt, max_steps: usize) -> Vec<Pt> {
    let mut contour = vec![start];
    let mut cur = start;
    let mut backtrack = 4usize; // direction from cur toward a known outside cell (W)
    let start_state = (start, 4usize);

    for _ in 0..max_steps {
        let mut last_bg = backtrack;
        let mut found: Option<(usize, Pt)> = None;
        for k in 1..=8 {
            let d = (backtrack + k) % 8;
            let nx = cur.x + RING[d].0;
            let ny = cur.y + RING[d].1;
            if inside(nx, ny) {
                found = Some((d, Pt { x: nx, y: ny }));
                break;
            }
            last_bg = d;
        }

        let Some((_, next)) = found else {
            // isolated pixel
            return contour;
        };

        // The outside cell examined just before `next` is ring-adjacent to
        // `next`; it becomes the new backtrack reference.
        let bg = Pt { x: cur.x + RING[last_bg].0, y: cur.y + RING[last_bg].1 };
        let nb = ring_dir(bg.x - next.x, bg.y - next.y);

        if (next, nb) == start_state {
            break;
        }
        contour.push(next);
        cur = next;
        backtrack = nb;
    }

    contour
}

/// External contours of all 8-connected nonzero components, in row-major
/// discovery order of their topmost-leftmost pixel.
pub fn find_external_contours(mask: &Plane) -> Vec<Contour> {
    let w = mask.width() as i32;
    let h = mask.height() as i32;
    let mut label = vec![-1i32; (w * h) as usize];
    let idx = |x: i32, y: i32| (y * w + x) as usize;

    let mut contours = Vec::new();
    let mut next_label = 0i32;

    for y in 0..h {
        for x in 0..w {
            if mask.get(x as u32, y as u32) == 0 || label[idx(x, y)] >= 0 {
                continue;
            }
            let id = next_label;
            next_label += 1;

            // flood the component so later scan hits skip it
            let mut stack = vec![(x, y)];
            label[idx(x, y)] = id;
            let mut size = 0usize;
            while let Some((cx, cy)) = stack.pop() {
                size += 1;
                for &(dx, dy) in &RING {
                    let nx = cx + dx;
                    let ny = cy + dy;
                    if nx < 0 || ny < 0 || nx >= w || ny >= h {
                        continue;
                    }
                    if mask.get(nx as u32, ny as u32) != 0 && label[idx(nx, ny)] < 0 {
                        label[idx(nx, ny)] = id;
                        stack.push((nx, ny));
                    }
                }
            }

            let inside = |px: i32, py: i32| {
                px >= 0 && py >= 0 && px < w && py < h && label[idx(px, py)] == id
            };
            let points = trace_boundary(&inside, Pt { x, y }, size * 4 + 8);
            contours.push(Contour { points });
        }
    }

    contours
}

// ── Polygon measures ──────────────────────────────────────────────────────────

fn signed_area2(points: &[Pt]) -> f64 {
    let n = points.len();
    if n < 3 {
        return 0.0;
    }
    let mut acc = 0.0f64;
    for i in 0..n {
        let p = points[i];
        let q = points[(i + 1) % n];
        acc += p.x as f64 * q.y as f64 - q.x as f64 * p.y as f64;
    }
    acc
}

/// Unsigned polygon area (Green's theorem over the traced boundary).
pub fn polygon_area(points: &[Pt]) -> f64 {
    (signed_area2(points) / 2.0).abs()
}

/// Image-moment centroid of the boundary polygon. `None` for degenerate
/// (near-zero area) contours.
pub fn centroid(points: &[Pt]) -> Option<(f64, f64)> {
    let a2 = signed_area2(points);
    if a2.abs() < 1e-9 {
        return None;
    }
    let n = points.len();
    let mut cx = 0.0f64;
    let mut cy = 0.0f64;
    for i in 0..n {
        let p = points[i];
        let q = points[(i + 1) % n];
        let cross = p.x as f64 * q.y as f64 - q.x as f64 * p.y as f64;
        cx += (p.x + q.x) as f64 * cross;
        cy += (p.y + q.y) as f64 * cross;
    }
    let a6 = 3.0 * a2;
    Some((cx / a6, cy / a6))
}

/// Axis-aligned bounding box of a point set.
pub fn bounding_box(points: &[Pt]) -> Option<Roi> {
    let min_x = points.iter().map(|p| p.x).min()?;
    let max_x = points.iter().map(|p| p.x).max()?;
    let min_y = points.iter().map(|p| p.y).min()?;
    let max_y = points.iter().map(|p| p.y).max()?;
    if min_x < 0 || min_y < 0 {
        return None;
    }
    Some(Roi {
        x: min_x as u32,
        y: min_y as u32,
        width: (max_x - min_x + 1) as u32,
        height: (max_y - min_y + 1) as u32,
    })
}

/// Convex hull (Andrew monotone chain). Returns the hull without the
/// duplicated first point.
pub fn convex_hull(points: &[Pt]) -> Vec<Pt> {
    let mut pts: Vec<Pt> = points.to_vec();
    pts.sort_by_key(|p| (p.x, p.y));
    pts.dedup();
    let n = pts.len();
    if n <= 2 {
        return pts;
    }

    let cross = |o: Pt, a: Pt, b: Pt| -> i64 {
        (a.x as i64 - o.x as i64) * (b.y as i64 - o.y as i64)
            - (a.y as i64 - o.y as i64) * (b.x as i64 - o.x as i64)
    };

    let mut hull: Vec<Pt> = Vec::with_capacity(2 * n);
    for &p in &pts {
        while hull.len() >= 2 && cross(hull[hull.len() - 2], hull[hull.len() - 1], p) <= 0 {
            hull.pop();
        }
        hull.push(p);
    }
    let lower_len = hull.len() + 1;
    for &p in pts.iter().rev() {
        while hull.len() >= lower_len && cross(hull[hull.len() - 2], hull[hull.len() - 1], p) <= 0 {
            hull.pop();
        }
        hull.push(p);
    }
    hull.pop();
    hull
}

// ── Minimum-area rectangle ────────────────────────────────────────────────────

/// Oriented bounding rectangle, normalized so `width >= height`.
/// `angle_deg` is the direction of the long side, folded into [0, 180).
#[derive(Debug, Clone, Copy)]
pub struct RotatedRect {
    pub cx: f64,
    pub cy: f64,
    pub width: f64,
    pub height: f64,
    pub angle_deg: f64,
}

impl RotatedRect {
    /// Corner points, for overlays.
    pub fn corners(&self) -> [(f64, f64); 4] {
        let th = self.angle_deg.to_radians();
        let (s, c) = th.sin_cos();
        let hw = self.width / 2.0;
        let hh = self.height / 2.0;
        let mut out = [(0.0, 0.0); 4];
        for (i, (lx, ly)) in [(-hw, -hh), (hw, -hh), (hw, hh), (-hw, hh)].iter().enumerate() {
            out[i] = (self.cx + lx * c - ly * s, self.cy + lx * s + ly * c);
        }
        out
    }

    /// Point-in-rectangle test (used to rasterize the color-sampling mask).
    pub fn contains(&self, x: f64, y: f64) -> bool {
        let th = self.angle_deg.to_radians();
        let (s, c) = th.sin_cos();
        let dx = x - self.cx;
        let dy = y - self.cy;
        let lx = dx * c + dy * s;
        let ly = -dx * s + dy * c;
        lx.abs() <= self.width / 2.0 + 1e-9 && ly.abs() <= self.height / 2.0 + 1e-9
    }
}

/// Rotating-calipers minimum-area rectangle of a point set.
/// Returns `None` for degenerate sets (fewer than 3 hull points).
pub fn min_area_rect(points: &[Pt]) -> Option<RotatedRect> {
    let hull = convex_hull(points);
    if hull.len() < 3 {
        return None;
    }

    let mut best: Option<(f64, RotatedRect)> = None;
    let n = hull.len();
    for i in 0..n {
        let p = hull[i];
        let q = hull[(i + 1) % n];
        let ex = (q.x - p.x) as f64;
        let ey = (q.y - p.y) as f64;
        let len = (ex * ex + ey * ey).sqrt();
        if len < 1e-12 {
            continue;
        }
        let ux = ex / len;
        let uy = ey / len;
        // normal
        let vx = -uy;
        let vy = ux;

        let mut smin = f64::INFINITY;
        let mut smax = f64::NEG_INFINITY;
        let mut tmin = f64::INFINITY;
        let mut tmax = f64::NEG_INFINITY;
        for &hp in &hull {
            let s = hp.x as f64 * ux + hp.y as f64 * uy;
            let t = hp.x as f64 * vx + hp.y as f64 * vy;
            smin = smin.min(s);
            smax = smax.max(s);
            tmin = tmin.min(t);
            tmax = tmax.max(t);
        }

        let w = smax - smin;
        let h = tmax - tmin;
        let area = w * h;
        if best.as_ref().map_or(true, |(a, _)| area < *a) {
            let cs = (smin + smax) / 2.0;
            let ct = (tmin + tmax) / 2.0;
            let mut rect = RotatedRect {
                cx: ux * cs + vx * ct,
                cy: uy * cs + vy * ct,
                width: w,
                height: h,
                angle_deg: uy.atan2(ux).to_degrees(),
            };
            if rect.width < rect.height {
                std::mem::swap(&mut rect.width, &mut rect.height);
                rect.angle_deg += 90.0;
            }
            rect.angle_deg = rect.angle_deg.rem_euclid(180.0);
            best = Some((area, rect));
        }
    }

    best.map(|(_, r)| r)
}

// ── Internal holes ────────────────────────────────────────────────────────────

/// Areas of internal contours inside `window`: background regions that do
/// not reach the window border. Areas are polygon areas of the traced hole
/// boundaries, in window-extraction order.
pub fn find_holes(mask: &Plane, window: Roi) -> Vec<f64> {
    let Some(window) = window.clamped(mask.width(), mask.height()) else {
        return Vec::new();
    };
    let crop = mask.crop(window);
    let w = crop.width() as i32;
    let h = crop.height() as i32;
    let idx = |x: i32, y: i32| (y * w + x) as usize;

    // 0 = unvisited background, 1 = border-connected background, 2 = foreground
    let mut state = vec![0u8; (w * h) as usize];
    for y in 0..h {
        for x in 0..w {
            if crop.get(x as u32, y as u32) != 0 {
                state[idx(x, y)] = 2;
            }
        }
    }

    let mut stack: Vec<(i32, i32)> = Vec::new();
    for x in 0..w {
        for &y in &[0, h - 1] {
            if state[idx(x, y)] == 0 {
                state[idx(x, y)] = 1;
                stack.push((x, y));
            }
        }
    }
    for y in 0..h {
        for &x in &[0, w - 1] {
            if state[idx(x, y)] == 0 {
                state[idx(x, y)] = 1;
                stack.push((x, y));
            }
        }
    }
    while let Some((cx, cy)) = stack.pop() {
        for (dx, dy) in [(1, 0), (-1, 0), (0, 1), (0, -1)] {
            let nx = cx + dx;
            let ny = cy + dy;
            if nx < 0 || ny < 0 || nx >= w || ny >= h {
                continue;
            }
            if state[idx(nx, ny)] == 0 {
                state[idx(nx, ny)] = 1;
                stack.push((nx, ny));
            }
        }
    }

    // remaining background regions are holes; label 4-connected
    let mut hole_label = vec![-1i32; (w * h) as usize];
    let mut areas = Vec::new();
    let mut next_id = 0i32;
    for y in 0..h {
        for x in 0..w {
            if state[idx(x, y)] != 0 || hole_label[idx(x, y)] >= 0 {
                continue;
            }
            let id = next_id;
            next_id += 1;
            let mut size = 0usize;
            let mut fill = vec![(x, y)];
            hole_label[idx(x, y)] = id;
            while let Some((cx, cy)) = fill.pop() {
                size += 1;
                for (dx, dy) in [(1, 0), (-1, 0), (0, 1), (0, -1)] {
                    let nx = cx + dx;
                    let ny = cy + dy;
                    if nx < 0 || ny < 0 || nx >= w || ny >= h {
                        continue;
                    }
                    if state[idx(nx, ny)] == 0 && hole_label[idx(nx, ny)] < 0 {
                        hole_label[idx(nx, ny)] = id;
                        fill.push((nx, ny));
                    }
                }
            }

            let inside = |px: i32, py: i32| {
                px >= 0 && py >= 0 && px < w && py < h && hole_label[idx(px, py)] == id
            };
            let boundary = trace_boundary(&inside, Pt { x, y }, size * 4 + 8);
            areas.push(polygon_area(&boundary));
        }
    }

    areas
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect_mask(w: u32, h: u32, roi: Roi) -> Plane {
        let mut p = Plane::new(w, h);
        for y in roi.y..roi.y + roi.height {
            for x in roi.x..roi.x + roi.width {
                p.set(x, y, 255);
            }
        }
        p
    }

    #[test]
    fn traces_rectangle_boundary() {
        let mask = rect_mask(40, 30, Roi { x: 5, y: 7, width: 20, height: 10 });
        let contours = find_external_contours(&mask);
        assert_eq!(contours.len(), 1);
        let c = &contours[0];

        // boundary polygon spans pixel centers, so the measured span is
        // (count - 1) per axis
        assert!((polygon_area(&c.points) - 19.0 * 9.0).abs() < 1e-6);
        let (cx, cy) = centroid(&c.points).unwrap();
        assert!((cx - 14.5).abs() < 1e-6);
        assert!((cy - 11.5).abs() < 1e-6);

        let rect = min_area_rect(&c.points).unwrap();
        assert!((rect.width - 19.0).abs() < 1e-6);
        assert!((rect.height - 9.0).abs() < 1e-6);
        assert!(rect.angle_deg < 1e-6 || (rect.angle_deg - 180.0).abs() < 1e-6);
    }

    #[test]
    fn discovery_order_is_row_major() {
        let mut mask = Plane::new(30, 30);
        for (ox, oy) in [(20u32, 2u32), (2, 10), (12, 10)] {
            for y in oy..oy + 4 {
                for x in ox..ox + 4 {
                    mask.set(x, y, 255);
                }
            }
        }
        let contours = find_external_contours(&mask);
        assert_eq!(contours.len(), 3);
        assert_eq!((contours[0].points[0].x, contours[0].points[0].y), (20, 2));
        assert_eq!((contours[1].points[0].x, contours[1].points[0].y), (2, 10));
        assert_eq!((contours[2].points[0].x, contours[2].points[0].y), (12, 10));
    }

    #[test]
    fn single_pixel_is_degenerate() {
        let mut mask = Plane::new(10, 10);
        mask.set(4, 4, 255);
        let contours = find_external_contours(&mask);
        assert_eq!(contours.len(), 1);
        assert_eq!(contours[0].points.len(), 1);
        assert_eq!(polygon_area(&contours[0].points), 0.0);
        assert!(centroid(&contours[0].points).is_none());
        assert!(min_area_rect(&contours[0].points).is_none());
    }

    #[test]
    fn min_area_rect_of_rotated_square() {
        // diamond: a square rotated 45°, diagonal 10
        let pts = vec![
            Pt { x: 10, y: 5 },
            Pt { x: 15, y: 10 },
            Pt { x: 10, y: 15 },
            Pt { x: 5, y: 10 },
        ];
        let rect = min_area_rect(&pts).unwrap();
        let side = (50.0f64).sqrt();
        assert!((rect.width - side).abs() < 1e-6);
        assert!((rect.height - side).abs() < 1e-6);
        assert!((rect.cx - 10.0).abs() < 1e-6 && (rect.cy - 10.0).abs() < 1e-6);
        assert!((rect.angle_deg - 45.0).abs() < 1e-6 || (rect.angle_deg - 135.0).abs() < 1e-6);
        assert!(rect.contains(10.0, 10.0));
        assert!(!rect.contains(14.0, 14.0));
    }

    #[test]
    fn finds_holes_and_ignores_open_regions() {
        let mut mask = rect_mask(40, 40, Roi { x: 5, y: 5, width: 30, height: 30 });
        // a 10x10 hole fully inside
        for y in 12..22 {
            for x in 12..22 {
                mask.set(x, y, 0);
            }
        }
        let bbox = Roi { x: 5, y: 5, width: 30, height: 30 };
        let areas = find_holes(&mask, bbox);
        assert_eq!(areas.len(), 1);
        assert!((areas[0] - 81.0).abs() < 1e-6);

        // background around the object reaches the window border in a larger
        // window, so it is not a hole
        let areas = find_holes(&mask, Roi { x: 0, y: 0, width: 40, height: 40 });
        assert_eq!(areas.len(), 1);
    }

    #[test]
    fn two_holes_two_areas() {
        let mut mask = rect_mask(60, 30, Roi { x: 2, y: 2, width: 56, height: 26 });
        for y in 8..12 {
            for x in 10..14 {
                mask.set(x, y, 0);
            }
        }
        for y in 8..12 {
            for x in 40..44 {
                mask.set(x, y, 0);
            }
        }
        let areas = find_holes(&mask, Roi { x: 2, y: 2, width: 56, height: 26 });
        assert_eq!(areas.len(), 2);
        for a in areas {
            assert!((a - 9.0).abs() < 1e-6);
        }
    }
}
