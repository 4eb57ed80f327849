//! One QC cycle: frame → mask → verdicts → poses → robot coordinates →
//! move commands.

use qc_types::{MoveCommand, MoveStatus};

use crate::mapping::Homography;
use crate::pose::{self, Pose};
use crate::preprocess::{self, PreprocessOutput};
use crate::qc::{self, QcRecord};
use crate::raster::Frame;
use crate::settings::{Settings, SettingsError};

/// One fully processed part: QC record, pose, robot position and the
/// command it turns into.
#[derive(Debug, Clone)]
pub struct Detection {
    pub record: QcRecord,
    pub pose: Pose,
    pub robot_mm: (f64, f64),
    pub command: MoveCommand,
}

impl Detection {
    /// Distance of the part from the robot origin, used for the
    /// nearest-first snapshot ordering.
    pub fn distance_mm(&self) -> f64 {
        (self.robot_mm.0.powi(2) + self.robot_mm.1.powi(2)).sqrt()
    }
}

/// All artifacts of one processed frame.
#[derive(Debug)]
pub struct FrameAnalysis {
    pub pre: PreprocessOutput,
    pub detections: Vec<Detection>,
}

impl FrameAnalysis {
    pub fn commands(&self) -> Vec<MoveCommand> {
        self.detections.iter().map(|d| d.command).collect()
    }
}

/// Run the full vision chain on one frame. Objects that lose their pose to
/// degeneracy are dropped (cannot happen for candidates that passed the
/// form pass, which already excluded degenerate contours).
pub fn process_frame(
    frame: &Frame,
    settings: &Settings,
    homography: &Homography,
) -> Result<FrameAnalysis, SettingsError> {
    let pre = preprocess::run(frame, settings)?;
    let records = qc::evaluate_all(frame, &pre.mask, settings);

    let detections = records
        .into_iter()
        .filter_map(|record| {
            let pose = pose::estimate(&record.form.contour.points, settings.pose_offset_deg)?;
            let robot_mm = homography.map(pose.cx, pose.cy);
            let command = MoveCommand {
                x_mm: robot_mm.0,
                y_mm: robot_mm.1,
                z_mm: settings.z_mm,
                angle_deg: pose.angle_deg,
                status: if record.overall_ok { MoveStatus::Ok } else { MoveStatus::Nok },
            };
            Some(Detection { record, pose, robot_mm, command })
        })
        .collect();

    Ok(FrameAnalysis { pre, detections })
}

/// Sort detections nearest-first from the robot origin (the snapshot /
/// dispatch ordering; the command builder preserves whatever order it is
/// handed).
pub fn sort_by_distance(detections: &mut [Detection]) {
    detections.sort_by(|a, b| a.distance_mm().total_cmp(&b.distance_mm()));
}
