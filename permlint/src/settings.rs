//! Validator settings and their layered loading.
//!
//! Settings are merged with [figment](https://docs.rs/figment/) from, in order
//! of increasing precedence:
//!
//! 1. Built-in defaults
//! 2. An optional JSON settings file
//! 3. Environment variables prefixed with `PERMLINT_` (`__` separates nested
//!    keys, e.g. `PERMLINT_CACHE__MAX_ENTRIES=500`)
//!
//! ```rust,no_run
//! use permlint::settings::SettingsLoader;
//!
//! let settings = SettingsLoader::new()
//!     .with_file("permlint.json")
//!     .load()
//!     .unwrap();
//! assert!(settings.performance_target_ms > 0);
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized};
use serde::{Deserialize, Serialize};
use tracing::{Level, instrument};

use crate::error::Result;

/// Environment variable prefix for settings overrides.
pub const ENV_PREFIX: &str = "PERMLINT_";

/// Top-level settings for the validation pipeline and its collaborators.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ValidatorSettings {
    /// Latency target for a single validation, in milliseconds.
    pub performance_target_ms: u64,

    /// Overlap percentage at or above which a partial deny/allow overlap is
    /// reported as `high`.
    pub partial_overlap_threshold: f64,

    /// Report every intersecting deny/allow pair as at least `high`,
    /// regardless of the overlap percentage.
    pub strict_zero_bypass: bool,

    /// Worker threads for batch validation. `None` uses the available cores.
    pub batch_workers: Option<usize>,

    pub cache: CacheSettings,
    pub metrics: MetricsSettings,
    pub invalidation: InvalidationSettings,
}

impl Default for ValidatorSettings {
    fn default() -> Self {
        Self {
            performance_target_ms: 100,
            partial_overlap_threshold: 30.0,
            strict_zero_bypass: true,
            batch_workers: None,
            cache: CacheSettings::default(),
            metrics: MetricsSettings::default(),
            invalidation: InvalidationSettings::default(),
        }
    }
}

impl ValidatorSettings {
    pub fn performance_target(&self) -> Duration {
        Duration::from_millis(self.performance_target_ms)
    }

    /// Number of batch workers, falling back to the available parallelism.
    pub fn effective_batch_workers(&self) -> usize {
        self.batch_workers
            .filter(|&n| n > 0)
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
    }
}

/// Settings for the tiered result cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheSettings {
    /// Whether validation results are cached at all.
    pub enabled: bool,
    /// Maximum number of entries kept in the in-process tier.
    pub max_entries: usize,
    /// Optional byte budget for the in-process tier.
    pub max_memory_bytes: Option<usize>,
    /// Time-to-live applied when `set` is called without one.
    pub default_ttl_secs: u64,
    /// Mirror writes to the secondary tier.
    pub write_through: bool,
    /// Perform secondary-tier writes on a background writer thread.
    pub async_write_through: bool,
    /// Capacity of the built-in secondary tier.
    pub l2_max_entries: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 1000,
            max_memory_bytes: None,
            default_ttl_secs: 300,
            write_through: false,
            async_write_through: true,
            l2_max_entries: 10_000,
        }
    }
}

impl CacheSettings {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

/// Settings for the metrics collector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsSettings {
    /// Number of response-time samples kept for percentiles.
    pub window_size: usize,
    /// Width of the sliding window used for rates, in seconds.
    pub rate_window_secs: u64,
    /// Interval between periodic target checks, in seconds.
    pub check_interval_secs: u64,
    /// Targets checked periodically; no checks run when absent.
    pub targets: Option<PerformanceTargets>,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            window_size: 1000,
            rate_window_secs: 60,
            check_interval_secs: 10,
            targets: None,
        }
    }
}

impl MetricsSettings {
    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

/// Performance targets compared against live metrics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PerformanceTargets {
    /// Maximum acceptable p99 response time, in milliseconds.
    pub max_p99_ms: f64,
    /// Minimum acceptable cache hit rate (0.0 - 1.0).
    pub min_hit_rate: f64,
    /// Maximum memory used by the in-process tier, in bytes.
    pub max_memory_bytes: Option<usize>,
    /// Maximum evictions per second.
    pub max_eviction_rate: f64,
}

impl Default for PerformanceTargets {
    fn default() -> Self {
        Self {
            max_p99_ms: 100.0,
            min_hit_rate: 0.5,
            max_memory_bytes: None,
            max_eviction_rate: 10.0,
        }
    }
}

/// Settings for dependency tracking and file watching.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InvalidationSettings {
    /// Quiet period before a file event is emitted, in milliseconds.
    pub debounce_ms: u64,
    /// Interval of the batch flush timer, in milliseconds.
    pub flush_interval_ms: u64,
    /// Interval between watcher polls, in milliseconds.
    pub poll_interval_ms: u64,
    /// Watch directories recursively.
    pub recursive: bool,
}

impl Default for InvalidationSettings {
    fn default() -> Self {
        Self {
            debounce_ms: 100,
            flush_interval_ms: 1000,
            poll_interval_ms: 500,
            recursive: true,
        }
    }
}

impl InvalidationSettings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Loads [`ValidatorSettings`] by layering defaults, a file and the environment.
#[derive(Debug, Clone)]
pub struct SettingsLoader {
    file: Option<PathBuf>,
    use_env: bool,
}

impl Default for SettingsLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl SettingsLoader {
    /// Creates a loader that reads defaults and environment overrides.
    #[instrument(level = Level::TRACE)]
    pub fn new() -> Self {
        Self {
            file: None,
            use_env: true,
        }
    }

    /// Adds a JSON settings file. Missing files are skipped.
    #[instrument(level = Level::TRACE, skip(path))]
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Self {
        self.file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Disables environment overrides (useful for tests).
    #[instrument(level = Level::TRACE, skip(self))]
    pub fn without_env(mut self) -> Self {
        self.use_env = false;
        self
    }

    /// Returns the underlying figment with all providers configured.
    #[instrument(level = Level::TRACE, skip(self))]
    pub fn figment(&self) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(ValidatorSettings::default()));

        if let Some(path) = &self.file
            && path.exists()
        {
            figment = figment.merge(Json::file(path));
        }

        if self.use_env {
            figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
        }

        figment
    }

    /// Loads the effective settings.
    #[instrument(level = Level::TRACE, skip(self))]
    pub fn load(&self) -> Result<ValidatorSettings> {
        Ok(self.figment().extract()?)
    }

    /// Loads settings with additional runtime overrides merged on top.
    #[instrument(level = Level::TRACE, skip(self, overrides))]
    pub fn load_with_overrides(&self, overrides: ValidatorSettings) -> Result<ValidatorSettings> {
        let figment = self.figment().merge(Serialized::defaults(overrides));
        Ok(figment.extract()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let settings = SettingsLoader::new().without_env().load().unwrap();
        assert_eq!(settings, ValidatorSettings::default());
        assert_eq!(settings.performance_target(), Duration::from_millis(100));
        assert_eq!(settings.partial_overlap_threshold, 30.0);
        assert_eq!(settings.cache.max_entries, 1000);
        assert_eq!(settings.metrics.window_size, 1000);
        assert_eq!(settings.invalidation.debounce(), Duration::from_millis(100));
    }

    #[test]
    fn test_file_overrides_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("permlint.json");
        fs::write(
            &path,
            r#"{"performance_target_ms": 250, "cache": {"max_entries": 16}}"#,
        )
        .unwrap();

        let settings = SettingsLoader::new()
            .without_env()
            .with_file(&path)
            .load()
            .unwrap();

        assert_eq!(settings.performance_target_ms, 250);
        assert_eq!(settings.cache.max_entries, 16);
        // Untouched nested fields keep their defaults.
        assert_eq!(settings.cache.default_ttl_secs, 300);
    }

    #[test]
    fn test_missing_file_is_skipped() {
        let settings = SettingsLoader::new()
            .without_env()
            .with_file("/nonexistent/permlint.json")
            .load()
            .unwrap();
        assert_eq!(settings, ValidatorSettings::default());
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("permlint.json");
        fs::write(&path, r#"{"performance_target_ms": "fast"}"#).unwrap();

        let result = SettingsLoader::new().without_env().with_file(&path).load();
        assert!(result.is_err());
    }

    #[test]
    fn test_load_with_overrides() {
        let overrides = ValidatorSettings {
            strict_zero_bypass: false,
            ..ValidatorSettings::default()
        };
        let settings = SettingsLoader::new()
            .without_env()
            .load_with_overrides(overrides)
            .unwrap();
        assert!(!settings.strict_zero_bypass);
    }

    #[test]
    fn test_effective_batch_workers() {
        let mut settings = ValidatorSettings::default();
        assert!(settings.effective_batch_workers() >= 1);
        settings.batch_workers = Some(3);
        assert_eq!(settings.effective_batch_workers(), 3);
        settings.batch_workers = Some(0);
        assert!(settings.effective_batch_workers() >= 1);
    }
}
