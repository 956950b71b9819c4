//! Recorded sessions: JSON-lines files of bus payloads.
//!
//! Each non-empty line holds one serialised [`EventPayload`], e.g.
//!
//! ```text
//! {"PointCloud":{"timestamp":"2024-05-01T12:00:00Z","frame_id":"os_lidar"}}
//! ```
//!
//! Lines starting with `#` are comments.

use std::fs;
use std::io::Write;
use std::path::Path;

use armscan_types::{ArmScanError, EventPayload, FilteredPointSet};

/// Parse a whole session document.
///
/// # Errors
///
/// Returns [`ArmScanError::Serialization`] naming the first bad line.
pub fn parse_session(text: &str) -> Result<Vec<EventPayload>, ArmScanError> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(i, line)| {
            serde_json::from_str(line)
                .map_err(|e| ArmScanError::Serialization(format!("line {}: {e}", i + 1)))
        })
        .collect()
}

/// Read and parse the session file at `path`.
pub fn load_session(path: &Path) -> Result<Vec<EventPayload>, String> {
    let text = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read session at {}: {}", path.display(), e))?;
    parse_session(&text).map_err(|e| format!("{}: {}", path.display(), e))
}

/// Write one point set as a single JSON line.
pub fn write_point_set(out: &mut impl Write, set: &FilteredPointSet) -> Result<(), String> {
    serde_json::to_writer(&mut *out, set)
        .map_err(|e| format!("Failed to serialize point set: {}", e))?;
    out.write_all(b"\n")
        .map_err(|e| format!("Failed to write point set: {}", e))
}
