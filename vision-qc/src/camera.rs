//! Frame acquisition.
//!
//! The depth-sensor SDK wrapper is an external collaborator; the pipeline
//! only needs something that hands out timestamped color frames on demand.
//! `ImageDirSource` serves stored sample frames, which is also what the
//! integration tests and the calibration subcommand run against.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::raster::{Frame, RasterError};

#[derive(Debug, Error)]
pub enum CameraError {
    #[error("cannot read frame directory {path}: {source}")]
    Dir { path: String, source: std::io::Error },
    #[error("no frames found in {0}")]
    Empty(String),
    #[error(transparent)]
    Raster(#[from] RasterError),
}

/// Anything that produces frames once per QC cycle. `Ok(None)` means no
/// frame this tick (the loop skips and retries).
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, CameraError>;
}

/// Serves PNG/JPEG files from a directory in name order.
pub struct ImageDirSource {
    paths: Vec<PathBuf>,
    next: usize,
    cycle: bool,
}

impl ImageDirSource {
    /// `cycle` keeps replaying the directory; otherwise the source runs dry
    /// after the last file.
    pub fn new(dir: &Path, cycle: bool) -> Result<Self, CameraError> {
        let entries = std::fs::read_dir(dir).map_err(|source| CameraError::Dir {
            path: dir.display().to_string(),
            source,
        })?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()),
                    Some(ref ext) if ext == "png" || ext == "jpg" || ext == "jpeg"
                )
            })
            .collect();
        paths.sort();
        if paths.is_empty() {
            return Err(CameraError::Empty(dir.display().to_string()));
        }
        Ok(Self { paths, next: 0, cycle })
    }
}

impl FrameSource for ImageDirSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, CameraError> {
        if self.next >= self.paths.len() {
            if !self.cycle {
                return Ok(None);
            }
            self.next = 0;
        }
        let frame = Frame::load(&self.paths[self.next])?;
        self.next += 1;
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_png(dir: &Path, name: &str) {
        let img = image::RgbImage::from_pixel(8, 8, image::Rgb([10, 20, 30]));
        img.save(dir.join(name)).unwrap();
    }

    #[test]
    fn serves_frames_in_name_order_then_runs_dry() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "b.png");
        write_png(dir.path(), "a.png");
        std::fs::write(dir.path().join("notes.txt"), "skip me").unwrap();

        let mut source = ImageDirSource::new(dir.path(), false).unwrap();
        assert!(source.next_frame().unwrap().is_some());
        assert!(source.next_frame().unwrap().is_some());
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn cycling_source_never_runs_dry() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "only.png");
        let mut source = ImageDirSource::new(dir.path(), true).unwrap();
        for _ in 0..5 {
            assert!(source.next_frame().unwrap().is_some());
        }
    }

    #[test]
    fn empty_directory_is_a_startup_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(ImageDirSource::new(dir.path(), false), Err(CameraError::Empty(_))));
    }
}
