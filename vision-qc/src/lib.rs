//! # vision-qc
//!
//! Vision-guided quality control and pick dispatch for a 6-axis robot.
//!
//! A fixed overhead camera watches a planar work area. Each QC cycle
//! segments red parts out of the frame, judges them against the
//! multi-stage specification (shape, dimensions, color, internal holes),
//! estimates their planar pose, maps pixel centroids into robot
//! millimeters through the calibrated homography, and streams the
//! resulting `movel` commands to the controller over a handshake-driven
//! TCP link.
//!
//! ## Task layout
//!
//! Four long-lived tasks run alongside the frame loop:
//! - the frame loop drives vision and builds command batches
//! - the link manager owns the socket and reconnects with backoff
//! - the receiver parses controller replies on its own task
//! - the dispatcher drains batches one command in flight at a time
//!
//! Tasks share edge-triggered [`signal::Signal`] flags and channels; only
//! the link task ever touches the socket.

pub mod calib;
pub mod camera;
pub mod colorspace;
pub mod contour;
pub mod dispatch;
pub mod export;
pub mod link;
pub mod mapping;
pub mod pipeline;
pub mod pose;
pub mod preprocess;
pub mod qc;
pub mod raster;
pub mod settings;
pub mod signal;
