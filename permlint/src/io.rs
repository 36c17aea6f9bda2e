//! Reading configuration files from disk.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use serde_json::Value;
use tracing::{Level, instrument};

use crate::error::{PermlintError, Result};

/// Reads a configuration file and decodes it as JSON.
///
/// The value is returned untyped: shape problems are reported by validation,
/// not here.
#[instrument(level = Level::TRACE)]
pub fn read_config_from_path(path: &Path) -> Result<Value> {
    let content = fs::read_to_string(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => PermlintError::NotFound(path.to_path_buf()),
        _ => PermlintError::ReadError {
            path: path.to_path_buf(),
            source: e,
        },
    })?;

    serde_json::from_str(&content).map_err(|e| PermlintError::ParseError {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Reads a configuration file, returning None if it does not exist.
#[instrument(level = Level::TRACE)]
pub fn read_config_from_path_optional(path: &Path) -> Result<Option<Value>> {
    match read_config_from_path(path) {
        Ok(value) => Ok(Some(value)),
        Err(PermlintError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_read_valid_config() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("settings.json");
        fs::write(&path, r#"{"permissions": {"deny": ["Read(.env)"]}}"#).unwrap();

        let value = read_config_from_path(&path).unwrap();
        assert_eq!(value["permissions"]["deny"], json!(["Read(.env)"]));
    }

    #[test]
    fn test_read_missing_config() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("missing.json");

        assert!(matches!(
            read_config_from_path(&path),
            Err(PermlintError::NotFound(_))
        ));
        assert!(read_config_from_path_optional(&path).unwrap().is_none());
    }

    #[test]
    fn test_read_invalid_json() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("broken.json");
        fs::write(&path, "{ not json").unwrap();

        let err = read_config_from_path(&path).unwrap_err();
        assert!(matches!(err, PermlintError::ParseError { .. }));
        assert!(err.to_string().contains("broken.json"));
    }
}
