//! Owned raster buffers for the vision pipeline.
//!
//! `Frame` is a color raster in BGR channel order (the order the camera
//! driver delivers), `Plane` a single-channel raster used for masks, gray
//! images and edge maps. The `image` crate is used only at the I/O boundary;
//! all per-pixel work runs over these owned buffers.

use std::path::Path;

use image::{GrayImage, Rgb, RgbImage};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RasterError {
    #[error("raster I/O failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("invalid raster dimensions {width}x{height}")]
    BadDimensions { width: u32, height: u32 },
    #[error("buffer length {len} does not match {width}x{height}x{channels}")]
    BadBuffer { len: usize, width: u32, height: u32, channels: u32 },
}

// ── Color frame (BGR) ─────────────────────────────────────────────────────────

/// Immutable-by-convention color raster, 3 bytes per pixel, BGR order.
#[derive(Debug, Clone)]
pub struct Frame {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Frame {
    pub fn new(width: u32, height: u32) -> Result<Self, RasterError> {
        if width == 0 || height == 0 {
            return Err(RasterError::BadDimensions { width, height });
        }
        Ok(Self { width, height, data: vec![0u8; width as usize * height as usize * 3] })
    }

    pub fn from_bgr(width: u32, height: u32, data: Vec<u8>) -> Result<Self, RasterError> {
        if width == 0 || height == 0 {
            return Err(RasterError::BadDimensions { width, height });
        }
        let expect = width as usize * height as usize * 3;
        if data.len() != expect {
            return Err(RasterError::BadBuffer { len: data.len(), width, height, channels: 3 });
        }
        Ok(Self { width, height, data })
    }

    pub fn width(&self) -> u32 { self.width }
    pub fn height(&self) -> u32 { self.height }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> [u8; 3] {
        let i = (y as usize * self.width as usize + x as usize) * 3;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, bgr: [u8; 3]) {
        let i = (y as usize * self.width as usize + x as usize) * 3;
        self.data[i] = bgr[0];
        self.data[i + 1] = bgr[1];
        self.data[i + 2] = bgr[2];
    }

    /// Load a PNG/JPEG file, converting to BGR.
    pub fn load(path: &Path) -> Result<Self, RasterError> {
        let rgb = image::open(path)?.to_rgb8();
        Ok(Self::from_rgb_image(&rgb))
    }

    pub fn from_rgb_image(rgb: &RgbImage) -> Self {
        let (width, height) = rgb.dimensions();
        let mut data = Vec::with_capacity(width as usize * height as usize * 3);
        for px in rgb.pixels() {
            data.push(px[2]);
            data.push(px[1]);
            data.push(px[0]);
        }
        Self { width, height, data }
    }

    pub fn to_rgb_image(&self) -> RgbImage {
        let mut out = RgbImage::new(self.width, self.height);
        for y in 0..self.height {
            for x in 0..self.width {
                let [b, g, r] = self.get(x, y);
                out.put_pixel(x, y, Rgb([r, g, b]));
            }
        }
        out
    }

    pub fn save(&self, path: &Path) -> Result<(), RasterError> {
        self.to_rgb_image().save(path)?;
        Ok(())
    }

    /// Nearest-neighbor resize to explicit dimensions.
    pub fn resize_nearest(&self, width: u32, height: u32) -> Result<Self, RasterError> {
        if width == 0 || height == 0 {
            return Err(RasterError::BadDimensions { width, height });
        }
        let mut out = Self::new(width, height)?;
        for y in 0..height {
            let sy = (y as u64 * self.height as u64 / height as u64).min(self.height as u64 - 1);
            for x in 0..width {
                let sx = (x as u64 * self.width as u64 / width as u64).min(self.width as u64 - 1);
                out.set(x, y, self.get(sx as u32, sy as u32));
            }
        }
        Ok(out)
    }
}

// ── Single-channel plane ──────────────────────────────────────────────────────

/// Single-channel u8 raster. Binary planes use the values 0 and 255.
#[derive(Debug, Clone)]
pub struct Plane {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Plane {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height, data: vec![0u8; width as usize * height as usize] }
    }

    pub fn from_data(width: u32, height: u32, data: Vec<u8>) -> Result<Self, RasterError> {
        let expect = width as usize * height as usize;
        if data.len() != expect {
            return Err(RasterError::BadBuffer { len: data.len(), width, height, channels: 1 });
        }
        Ok(Self { width, height, data })
    }

    pub fn width(&self) -> u32 { self.width }
    pub fn height(&self) -> u32 { self.height }
    pub fn data(&self) -> &[u8] { &self.data }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> u8 {
        self.data[y as usize * self.width as usize + x as usize]
    }

    /// Clamped read; out-of-bounds coordinates replicate the border.
    #[inline]
    pub fn get_clamped(&self, x: i64, y: i64) -> u8 {
        let cx = x.clamp(0, self.width as i64 - 1) as u32;
        let cy = y.clamp(0, self.height as i64 - 1) as u32;
        self.get(cx, cy)
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, v: u8) {
        self.data[y as usize * self.width as usize + x as usize] = v;
    }

    pub fn count_nonzero(&self) -> usize {
        self.data.iter().filter(|&&v| v != 0).count()
    }

    /// Nearest-neighbor resize. Preserves binariness by construction.
    pub fn resize_nearest(&self, width: u32, height: u32) -> Result<Self, RasterError> {
        if width == 0 || height == 0 {
            return Err(RasterError::BadDimensions { width, height });
        }
        let mut out = Self::new(width, height);
        for y in 0..height {
            let sy = (y as u64 * self.height as u64 / height as u64).min(self.height as u64 - 1);
            for x in 0..width {
                let sx = (x as u64 * self.width as u64 / width as u64).min(self.width as u64 - 1);
                out.set(x, y, self.get(sx as u32, sy as u32));
            }
        }
        Ok(out)
    }

    /// Copy of the sub-rectangle `roi`, which must lie inside the plane.
    pub fn crop(&self, roi: Roi) -> Self {
        let mut out = Self::new(roi.width, roi.height);
        for y in 0..roi.height {
            for x in 0..roi.width {
                out.set(x, y, self.get(roi.x + x, roi.y + y));
            }
        }
        out
    }

    pub fn save(&self, path: &Path) -> Result<(), RasterError> {
        let img = GrayImage::from_raw(self.width, self.height, self.data.clone())
            .ok_or(RasterError::BadDimensions { width: self.width, height: self.height })?;
        img.save(path)?;
        Ok(())
    }
}

// ── Region of interest ────────────────────────────────────────────────────────

/// Axis-aligned pixel rectangle. Used to crop the calibration mask and the
/// per-object hole search window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Roi {
    /// Clamp to the given raster dimensions. Returns `None` when nothing of
    /// the ROI is inside the raster.
    pub fn clamped(&self, width: u32, height: u32) -> Option<Roi> {
        if self.x >= width || self.y >= height {
            return None;
        }
        let w = self.width.min(width - self.x);
        let h = self.height.min(height - self.y);
        if w == 0 || h == 0 {
            return None;
        }
        Some(Roi { x: self.x, y: self.y, width: w, height: h })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_pixel_access() {
        let mut f = Frame::new(4, 3).unwrap();
        f.set(2, 1, [10, 20, 30]);
        assert_eq!(f.get(2, 1), [10, 20, 30]);
        assert_eq!(f.get(0, 0), [0, 0, 0]);
    }

    #[test]
    fn plane_resize_preserves_binariness() {
        let mut p = Plane::new(10, 10);
        for y in 3..7 {
            for x in 2..8 {
                p.set(x, y, 255);
            }
        }
        let down = p.resize_nearest(5, 5).unwrap();
        let up = down.resize_nearest(10, 10).unwrap();
        assert!(up.data().iter().all(|&v| v == 0 || v == 255));
    }

    #[test]
    fn roi_clamps_to_raster() {
        let roi = Roi { x: 5, y: 5, width: 100, height: 100 };
        let c = roi.clamped(10, 8).unwrap();
        assert_eq!((c.width, c.height), (5, 3));
        assert!(Roi { x: 20, y: 0, width: 5, height: 5 }.clamped(10, 10).is_none());
    }

    #[test]
    fn bad_buffer_rejected() {
        assert!(Frame::from_bgr(2, 2, vec![0; 11]).is_err());
        assert!(Plane::from_data(3, 3, vec![0; 8]).is_err());
    }
}
