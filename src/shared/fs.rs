//! Usage: Small filesystem helpers for the settings file and attachments (optional and bounded reads).

use std::path::Path;

pub(crate) fn read_optional_file(path: &Path) -> Result<Option<Vec<u8>>, String> {
    if !path.exists() {
        return Ok(None);
    }
    std::fs::read(path)
        .map(Some)
        .map_err(|e| format!("failed to read {}: {e}", path.display()))
}

/// Reads a local attachment with an upper bound, so a mistyped path to a huge file fails fast.
pub(crate) fn read_file_limited(path: &Path, max_bytes: u64) -> Result<Vec<u8>, String> {
    let meta = std::fs::metadata(path)
        .map_err(|e| format!("SEC_INVALID_INPUT: cannot stat {}: {e}", path.display()))?;
    if !meta.is_file() {
        return Err(format!(
            "SEC_INVALID_INPUT: {} is not a regular file",
            path.display()
        ));
    }
    if meta.len() > max_bytes {
        return Err(format!(
            "SEC_INVALID_INPUT: {} is too large ({} bytes, max {max_bytes})",
            path.display(),
            meta.len()
        ));
    }
    std::fs::read(path).map_err(|e| format!("failed to read {}: {e}", path.display()))
}
