//! Batch file bridge between the vision writer and the robot driver.
//!
//! The file is the `{"objects": [...]}` JSON payload; each entry is a
//! complete command line. Writing uses the modern `movel ...` form; reading
//! strips the legacy `add ` prefix. The file's modification time is the
//! batch generation identifier.

use std::fs;
use std::path::Path;
use std::time::UNIX_EPOCH;

use qc_types::{strip_legacy_prefix, BatchPayload, MoveCommand};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("cannot access batch file {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("malformed batch JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Write a command batch. Returns the resulting generation identifier
/// (the file's modification time, in milliseconds).
pub fn write_batch(path: &Path, commands: &[MoveCommand]) -> Result<u64, ExportError> {
    let payload = BatchPayload { objects: commands.iter().map(MoveCommand::to_line).collect() };
    let text = serde_json::to_string_pretty(&payload)?;
    fs::write(path, text).map_err(|source| ExportError::Io {
        path: path.display().to_string(),
        source,
    })?;
    file_generation(path)
}

/// Read a command batch: (generation, command lines). Non-string-safe
/// entries were already excluded by the payload type; blank lines are
/// dropped and the legacy prefix stripped.
pub fn read_batch(path: &Path) -> Result<(u64, Vec<String>), ExportError> {
    let text = fs::read_to_string(path).map_err(|source| ExportError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let payload: BatchPayload = serde_json::from_str(&text)?;
    let commands: Vec<String> = payload
        .objects
        .iter()
        .map(|raw| strip_legacy_prefix(raw).to_string())
        .filter(|line| !line.is_empty())
        .collect();
    Ok((file_generation(path)?, commands))
}

/// Modification time of the batch file in milliseconds since the epoch.
pub fn file_generation(path: &Path) -> Result<u64, ExportError> {
    let meta = fs::metadata(path).map_err(|source| ExportError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let mtime = meta.modified().map_err(|source| ExportError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(mtime.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64)
}
