//! Error types for the permlint library.
//!
//! Validation findings are never errors: they are reported as data inside
//! [`ValidationResult`](crate::validate::ValidationResult). The types here cover
//! the infrastructure around validation (reading files, loading settings,
//! cache tiers and the file watcher).

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur outside of the validation result itself.
#[derive(Error, Debug)]
pub enum PermlintError {
    /// Failed to read a configuration file.
    #[error("failed to read configuration from {path}: {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration JSON.
    #[error("failed to parse configuration from {path}: {source}")]
    ParseError {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Configuration file not found.
    #[error("configuration file not found at {0}")]
    NotFound(PathBuf),

    /// Failed to serialize a value to JSON.
    #[error("failed to serialize value: {0}")]
    SerializeError(#[from] serde_json::Error),

    /// The watcher could not inspect a path.
    #[error("failed to watch {path}: {source}")]
    WatchError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A background worker could not be started.
    #[error("failed to spawn {name} thread: {source}")]
    SpawnError {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// A custom cache operation name was rejected.
    #[error("invalid cache operation '{name}': {reason}")]
    InvalidOperation { name: String, reason: String },

    /// A cache tier failed.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Figment configuration error.
    #[error("configuration error: {0}")]
    FigmentError(#[source] Box<figment::Error>),
}

/// Errors raised by a cache tier.
///
/// The cache manager never returns these to its callers; they are logged,
/// counted, and the operation degrades to a miss.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The tier could not be reached or refused the operation.
    #[error("cache tier '{tier}' unavailable: {message}")]
    Unavailable { tier: String, message: String },

    /// A stored entry could not be encoded or decoded.
    #[error("cache entry for '{key}' is corrupt: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// The tier is full and cannot accept the entry.
    #[error("cache tier '{tier}' is at capacity ({capacity} entries)")]
    Full { tier: String, capacity: usize },
}

/// Result type alias for permlint operations.
pub type Result<T> = std::result::Result<T, PermlintError>;

impl PermlintError {
    /// Return a help message suggesting how to fix this error, if applicable.
    pub fn help(&self) -> Option<String> {
        match self {
            PermlintError::ParseError { source, .. } => Some(format!(
                "the file must be valid JSON; check line {}, column {}",
                source.line(),
                source.column()
            )),
            PermlintError::NotFound(path) => Some(format!(
                "no file exists at {}; check the path",
                path.display()
            )),
            PermlintError::FigmentError(_) => Some(format!(
                "check the settings file and any {}* environment variables",
                crate::settings::ENV_PREFIX
            )),
            _ => None,
        }
    }
}

impl From<figment::Error> for PermlintError {
    fn from(err: figment::Error) -> Self {
        PermlintError::FigmentError(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_help_points_at_position() {
        let source = serde_json::from_str::<serde_json::Value>("{\n  nope").unwrap_err();
        let err = PermlintError::ParseError {
            path: PathBuf::from("settings.json"),
            source,
        };
        let help = err.help().unwrap();
        assert!(help.contains("line 2"), "{help}");
    }

    #[test]
    fn test_not_found_help() {
        let err = PermlintError::NotFound(PathBuf::from("/missing.json"));
        assert!(err.help().unwrap().contains("/missing.json"));
        assert!(
            PermlintError::Cache(CacheError::Full {
                tier: "l2".into(),
                capacity: 1
            })
            .help()
            .is_none()
        );
    }
}
