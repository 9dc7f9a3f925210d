use std::fs;
use std::path::Path;

use crate::error::{Result, SyncError};

/// Read the device's identifier (dongle id) from its local file.
///
/// The value becomes a remote directory name, so it must be a single
/// non-empty path component.
pub fn read_device_id(path: &Path) -> Result<String> {
    let unavailable = |reason: &str| SyncError::DeviceIdUnavailable {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    let raw = fs::read_to_string(path).map_err(|e| unavailable(&e.to_string()))?;
    let id = raw.trim();
    if id.is_empty() {
        return Err(unavailable("file is empty"));
    }
    if id.contains(['/', '\\']) || id == "." || id == ".." || id.contains(char::is_whitespace) {
        return Err(unavailable("not a valid directory name"));
    }
    Ok(id.to_string())
}
