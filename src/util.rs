//! Small filesystem and time helpers shared across the controller.

use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

use crate::error::ControllerError;

/// Get current Unix timestamp in seconds
pub fn now_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Read a JSON file, failing if it does not exist or does not parse
pub fn read_json(path: &Path) -> Result<Value, ControllerError> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// Read a JSON file, returning `None` if it does not exist.
/// A file that exists but does not parse is still an error.
pub fn try_read_json(path: &Path) -> Result<Option<Value>, ControllerError> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write a JSON value pretty-printed. Keys come out sorted because
/// `serde_json::Map` is a `BTreeMap`.
pub fn write_json(path: &Path, value: &Value) -> Result<(), ControllerError> {
    let mut text = serde_json::to_string_pretty(value)?;
    text.push('\n');
    std::fs::write(path, text)?;
    Ok(())
}

/// Resolve `filename` inside `dir`, rejecting anything that could escape it.
/// Only plain path components are allowed; `..`, leading `/`, and drive
/// prefixes all fail before any filesystem access happens.
pub fn resolve_path(dir: &Path, filename: &str) -> Result<PathBuf, ControllerError> {
    let rel = Path::new(filename);
    if filename.is_empty()
        || !rel
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
    {
        return Err(ControllerError::InvalidFilename(filename.to_string()));
    }
    Ok(dir.join(rel))
}

/// Make a path absolute against the current working directory without
/// requiring it to exist.
pub fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}
