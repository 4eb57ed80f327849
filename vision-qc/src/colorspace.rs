//! Per-pixel color conversions.
//!
//! Conventions follow the 8-bit OpenCV encodings the tuning UI and the saved
//! settings were produced with: HSV hue in [0, 179], saturation/value in
//! [0, 255]; L\*a\*b\* scaled to L ∈ [0, 255] (L\* × 255/100) with a/b offset
//! by +128. The LAB path decodes sRGB gamma before the XYZ transform.

/// BGR → HSV, hue halved into [0, 179].
pub fn bgr_to_hsv(bgr: [u8; 3]) -> [u8; 3] {
    let b = bgr[0] as i32;
    let g = bgr[1] as i32;
    let r = bgr[2] as i32;

    let v = r.max(g).max(b);
    let min = r.min(g).min(b);
    let diff = v - min;

    let s = if v == 0 { 0 } else { (255 * diff + v / 2) / v };

    let h = if diff == 0 {
        0.0
    } else {
        let d = diff as f64;
        let mut deg = if v == r {
            60.0 * (g - b) as f64 / d
        } else if v == g {
            120.0 + 60.0 * (b - r) as f64 / d
        } else {
            240.0 + 60.0 * (r - g) as f64 / d
        };
        if deg < 0.0 {
            deg += 360.0;
        }
        deg / 2.0
    };

    [h.round().min(179.0) as u8, s as u8, v as u8]
}

/// BGR → luminance with the standard Rec.601 weights.
pub fn bgr_to_gray(bgr: [u8; 3]) -> u8 {
    let y = 0.114 * bgr[0] as f64 + 0.587 * bgr[1] as f64 + 0.299 * bgr[2] as f64;
    y.round().min(255.0) as u8
}

fn srgb_decode(c: u8) -> f64 {
    let c = c as f64 / 255.0;
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

fn lab_f(t: f64) -> f64 {
    const EPS: f64 = 0.008856; // (6/29)^3
    if t > EPS {
        t.cbrt()
    } else {
        7.787 * t + 16.0 / 116.0
    }
}

/// BGR → 8-bit-scaled L\*a\*b\* (D65 white point).
pub fn bgr_to_lab(bgr: [u8; 3]) -> [f64; 3] {
    let b = srgb_decode(bgr[0]);
    let g = srgb_decode(bgr[1]);
    let r = srgb_decode(bgr[2]);

    let x = 0.412453 * r + 0.357580 * g + 0.180423 * b;
    let y = 0.212671 * r + 0.715160 * g + 0.072169 * b;
    let z = 0.019334 * r + 0.119193 * g + 0.950227 * b;

    let fx = lab_f(x / 0.950456);
    let fy = lab_f(y);
    let fz = lab_f(z / 1.088754);

    let l = 116.0 * fy - 16.0;
    let a = 500.0 * (fx - fy);
    let bb = 200.0 * (fy - fz);

    [l * 255.0 / 100.0, a + 128.0, bb + 128.0]
}

/// CIE76 color difference in the 8-bit-scaled LAB space (the space the
/// reference values and tolerance are given in).
pub fn delta_e(a: [f64; 3], b: [f64; 3]) -> f64 {
    let d0 = a[0] - b[0];
    let d1 = a[1] - b[1];
    let d2 = a[2] - b[2];
    (d0 * d0 + d1 * d1 + d2 * d2).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hsv_of_primaries() {
        // pure red (BGR)
        assert_eq!(bgr_to_hsv([0, 0, 255]), [0, 255, 255]);
        // pure green
        assert_eq!(bgr_to_hsv([0, 255, 0]), [60, 255, 255]);
        // pure blue
        assert_eq!(bgr_to_hsv([255, 0, 0]), [120, 255, 255]);
        // gray has no hue or saturation
        assert_eq!(bgr_to_hsv([80, 80, 80]), [0, 0, 80]);
    }

    #[test]
    fn gray_weights() {
        assert_eq!(bgr_to_gray([0, 0, 255]), 76);
        assert_eq!(bgr_to_gray([255, 255, 255]), 255);
        assert_eq!(bgr_to_gray([0, 0, 0]), 0);
    }

    #[test]
    fn lab_of_pure_red() {
        // sRGB red is the standard sanity vector: L* 53.2, a* 80.1, b* 67.2,
        // i.e. roughly (136, 208, 195) in the scaled encoding.
        let lab = bgr_to_lab([0, 0, 255]);
        assert!((lab[0] - 135.8).abs() < 1.5, "L was {}", lab[0]);
        assert!((lab[1] - 208.1).abs() < 1.5, "a was {}", lab[1]);
        assert!((lab[2] - 195.2).abs() < 1.5, "b was {}", lab[2]);
    }

    #[test]
    fn delta_e_is_euclidean() {
        let a = [107.3, 187.07, 160.88];
        let b = [107.3, 130.0, 160.88];
        assert!((delta_e(a, b) - 57.07).abs() < 0.01);
    }
}
