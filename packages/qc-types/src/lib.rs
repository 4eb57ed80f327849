//! # qc-types
//!
//! Shared command and wire types for the vision QC pick-dispatch system.
//!
//! These types are used by:
//! - `vision-qc`: building move commands from QC verdicts and dispatching
//!   them to the robot controller
//! - `packages/controller-sim`: parsing the same commands on the fake
//!   controller side and producing acknowledgments
//!
//! ## Wire conventions
//!
//! - One command per line, UTF-8, terminated by `\n`:
//!   `movel X Y Z A OK` / `movel X Y Z A NOK`
//! - X/Y are robot-plane millimeters, Z the fixed tool approach height,
//!   A the part orientation in degrees. X, Y and A carry two fractional
//!   digits; fields are separated by a single space.
//! - The controller answers free-form text; any line containing `DONE`
//!   (case-insensitive) acknowledges the previous command, any line
//!   containing `IDLE` is an informational heartbeat.

use serde::{Deserialize, Serialize};

// ── Part status ───────────────────────────────────────────────────────────────

/// QC verdict tag carried on the wire with every move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MoveStatus {
    /// Part passed all QC checks; place on the accept side.
    Ok,
    /// Part failed at least one check; place on the reject side.
    Nok,
}

impl MoveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Nok => "NOK",
        }
    }

    pub fn from_token(tok: &str) -> Option<Self> {
        match tok {
            "OK" => Some(Self::Ok),
            "NOK" => Some(Self::Nok),
            _ => None,
        }
    }
}

// ── Move command ──────────────────────────────────────────────────────────────

/// One linear-move request, addressed in the robot plane.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MoveCommand {
    /// Target X in robot millimeters
    pub x_mm: f64,
    /// Target Y in robot millimeters
    pub y_mm: f64,
    /// Tool approach height (constant per deployment)
    pub z_mm: f64,
    /// Part orientation, degrees in [0, 180)
    pub angle_deg: f64,
    /// QC verdict tag
    pub status: MoveStatus,
}

impl MoveCommand {
    /// Render the wire line, without the trailing newline.
    /// Z is rendered with `Display`, so an integral height prints as `55`.
    pub fn to_line(&self) -> String {
        format!(
            "movel {:.2} {:.2} {} {:.2} {}",
            self.x_mm,
            self.y_mm,
            self.z_mm,
            self.angle_deg,
            self.status.as_str()
        )
    }

    /// Parse a wire line. Tolerates surrounding whitespace; the verb is
    /// matched case-insensitively because the original tooling upper-cased
    /// whole lines before sending.
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let verb = parts.next()?;
        if !verb.eq_ignore_ascii_case("movel") {
            return None;
        }
        let x_mm: f64 = parts.next()?.parse().ok()?;
        let y_mm: f64 = parts.next()?.parse().ok()?;
        let z_mm: f64 = parts.next()?.parse().ok()?;
        let angle_deg: f64 = parts.next()?.parse().ok()?;
        let status = MoveStatus::from_token(&parts.next()?.to_ascii_uppercase())?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self { x_mm, y_mm, z_mm, angle_deg, status })
    }
}

// ── Batch payload (vision writer → robot driver bridge file) ──────────────────

/// JSON payload of a command batch file.
///
/// Each entry is a complete command line. Legacy producers prefixed lines
/// with `add `; consumers strip that prefix on ingestion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchPayload {
    #[serde(default)]
    pub objects: Vec<String>,
}

/// Strip the legacy `add ` prefix from a raw batch line.
pub fn strip_legacy_prefix(raw: &str) -> &str {
    let line = raw.trim();
    match line.get(..4) {
        Some(prefix) if prefix.eq_ignore_ascii_case("add ") => line[4..].trim_start(),
        _ => line,
    }
}

// ── Controller replies ────────────────────────────────────────────────────────

/// Classification of one controller-originated text line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerReply {
    /// Acknowledges completion of the previous in-flight command.
    Done,
    /// Informational heartbeat; never advances the dispatch machine.
    Idle,
    /// Anything else; logged and ignored.
    Other,
}

/// Lenient classification: any line containing `DONE` counts as an
/// acknowledgment, any line containing `IDLE` as a heartbeat, matched
/// case-insensitively. `DONE` wins when a line carries both tokens.
pub fn classify_reply(line: &str) -> ControllerReply {
    let up = line.to_ascii_uppercase();
    if up.contains("DONE") {
        ControllerReply::Done
    } else if up.contains("IDLE") {
        ControllerReply::Idle
    } else {
        ControllerReply::Other
    }
}
