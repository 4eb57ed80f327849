//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::time::Duration;

use nalgebra::Matrix3;
use vision_qc::link::LinkConfig;
use vision_qc::mapping::Homography;
use vision_qc::raster::Frame;
use vision_qc::settings::Settings;

pub const RED: [u8; 3] = [40, 40, 200];
pub const GREENISH: [u8; 3] = [100, 150, 100];
pub const BG: [u8; 3] = [30, 30, 30];

/// 261×65 px part at (40, 50) with two in-band screw holes, on a dark
/// work surface.
pub fn part_frame(part_bgr: [u8; 3]) -> Frame {
    let mut frame = Frame::new(360, 220).unwrap();
    for y in 0..220 {
        for x in 0..360 {
            frame.set(x, y, BG);
        }
    }
    for y in 50..115 {
        for x in 40..301 {
            frame.set(x, y, part_bgr);
        }
    }
    for &(hx, hy) in &[(60u32, 70u32), (240, 70)] {
        for y in hy..hy + 10 {
            for x in hx..hx + 10 {
                frame.set(x, y, BG);
            }
        }
    }
    frame
}

pub fn part_settings() -> Settings {
    let mut s = Settings::default();
    s.min_area = 1500.0;
    s.expected_width_mm = 100.0;
    s.expected_height_mm = 25.0;
    s.normalize();
    s
}

/// Pure-scale pixel→mm map matching the configured 0.383 mm/px.
pub fn scale_homography() -> Homography {
    Homography::from_matrix(Matrix3::new(0.383, 0.0, 0.0, 0.0, 0.383, 0.0, 0.0, 0.0, 1.0))
        .unwrap()
}

/// Link config with test-friendly backoff.
pub fn fast_link_config(port: u16) -> LinkConfig {
    LinkConfig {
        host: "127.0.0.1".to_string(),
        port,
        greeting: Some("hello vision-qc".to_string()),
        connect_timeout: Duration::from_secs(5),
        backoff_start: Duration::from_millis(20),
        backoff_cap: Duration::from_millis(200),
    }
}
