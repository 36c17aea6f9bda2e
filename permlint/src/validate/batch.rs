//! Batch validation on a fixed-size worker pool.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::{Duration, Instant};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{Level, info, instrument, warn};

use super::pipeline::{ValidateOptions, Validator};
use super::result::{ValidationError, ValidationErrorKind, ValidationResult};
use crate::rules::SecurityImpact;

/// Options for [`Validator::validate_batch`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOptions {
    /// Options applied to every configuration.
    pub validate: ValidateOptions,
    /// Deadline for the whole batch. Items not started by then are reported
    /// as timed out; items already running finish.
    pub timeout: Option<Duration>,
    /// Worker count; defaults to the validator's `batch_workers` setting.
    pub workers: Option<usize>,
}

impl BatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(mut self, options: ValidateOptions) -> Self {
        self.validate = options;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }
}

/// Outcome of a batch, in input order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub results: Vec<ValidationResult>,
    /// Configurations that validated as `is_valid`.
    pub success_count: usize,
    pub failure_count: usize,
    /// Wall-clock time of the batch in milliseconds.
    pub total_time: f64,
}

impl BatchResult {
    fn from_results(results: Vec<ValidationResult>, elapsed: Duration) -> Self {
        let success_count = results.iter().filter(|r| r.is_valid).count();
        BatchResult {
            failure_count: results.len() - success_count,
            success_count,
            results,
            total_time: elapsed.as_secs_f64() * 1000.0,
        }
    }

    pub fn total_duration(&self) -> Duration {
        Duration::from_secs_f64(self.total_time.max(0.0) / 1000.0)
    }
}

impl Validator {
    /// Validates every configuration, returning results in input order.
    ///
    /// A configuration that panics during validation yields an `internal`
    /// error for that item only.
    #[instrument(level = Level::TRACE, skip(self, configs, options), fields(count = configs.len()))]
    pub fn validate_batch(&self, configs: &[Value], options: &BatchOptions) -> BatchResult {
        let started = Instant::now();
        let deadline = options.timeout.map(|timeout| started + timeout);
        let workers = options
            .workers
            .filter(|&n| n > 0)
            .unwrap_or_else(|| self.settings().effective_batch_workers());

        let run = |config: &Value| self.validate_item(config, &options.validate, deadline);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("permlint-batch-{i}"))
            .build();
        let results: Vec<ValidationResult> = match pool {
            Ok(pool) => pool.install(|| configs.par_iter().map(run).collect()),
            Err(e) => {
                warn!(error = %e, workers, "could not build batch pool; validating sequentially");
                configs.iter().map(run).collect()
            }
        };

        let batch = BatchResult::from_results(results, started.elapsed());
        info!(
            count = configs.len(),
            workers,
            succeeded = batch.success_count,
            failed = batch.failure_count,
            total_ms = batch.total_time,
            "batch validated"
        );
        batch
    }

    fn validate_item(
        &self,
        config: &Value,
        options: &ValidateOptions,
        deadline: Option<Instant>,
    ) -> ValidationResult {
        let mut options = options.clone();
        if let Some(deadline) = deadline {
            let now = Instant::now();
            if now >= deadline {
                return ValidationResult::failed(ValidationError::new(
                    ValidationErrorKind::PerformanceViolation,
                    SecurityImpact::High,
                    "batch deadline reached before this configuration was validated",
                ));
            }
            let remaining = deadline - now;
            options.timeout = Some(options.timeout.map_or(remaining, |t| t.min(remaining)));
        }

        catch_unwind(AssertUnwindSafe(|| self.validate(config, &options))).unwrap_or_else(|payload| {
            let message = panic_message(payload.as_ref());
            warn!(panic = %message, "validation panicked");
            ValidationResult::failed(ValidationError::new(
                ValidationErrorKind::Internal,
                SecurityImpact::Critical,
                format!("validation failed unexpectedly: {message}"),
            ))
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ValidatorSettings;
    use serde_json::json;

    fn validator() -> Validator {
        Validator::new(ValidatorSettings::default()).unwrap()
    }

    #[test]
    fn test_batch_preserves_order_and_counts() {
        let configs = vec![
            json!({"permissions": {"deny": ["a"]}}),
            json!({"permissions": {"deny": ["x"], "allow": ["x"]}}),
            json!("not an object"),
            json!({"permissions": {"allow": ["Read(src/**)"]}}),
        ];
        let batch = validator().validate_batch(&configs, &BatchOptions::new().workers(2));

        assert_eq!(batch.results.len(), 4);
        assert_eq!(batch.success_count, 2);
        assert_eq!(batch.failure_count, 2);
        assert!(batch.results[0].is_valid);
        assert!(!batch.results[1].is_valid);
        assert!(batch.results[2].has_error(ValidationErrorKind::InvalidShape));
        assert!(batch.results[3].is_valid);
        assert!(batch.total_time >= 0.0);
    }

    #[test]
    fn test_empty_batch() {
        let batch = validator().validate_batch(&[], &BatchOptions::default());
        assert!(batch.results.is_empty());
        assert_eq!(batch.success_count + batch.failure_count, 0);
    }

    #[test]
    fn test_expired_batch_times_out_every_item() {
        let configs = vec![json!({"permissions": {"deny": ["a"]}}); 3];
        let batch = validator().validate_batch(&configs, &BatchOptions::new().timeout(Duration::ZERO));

        assert_eq!(batch.failure_count, 3);
        assert!(
            batch
                .results
                .iter()
                .all(|r| r.has_error(ValidationErrorKind::PerformanceViolation))
        );
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(&"boom"), "boom");
        assert_eq!(panic_message(&String::from("bang")), "bang");
        assert_eq!(panic_message(&42_u8), "unknown panic");
    }
}
