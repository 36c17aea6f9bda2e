//! The validation pipeline.
//!
//! Each call runs through fixed stages:
//!
//! ```text
//! start → structural-check → rule-level-check → conflict-detection
//!       → performance-accounting → done
//! ```
//!
//! A cache lookup happens between `start` and `structural-check`; on a hit
//! the remaining analysis is skipped and only performance accounting runs.
//! Findings are always returned as data: `validate` never fails.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;
use serde_json::{Map, Value, json};
use tracing::{Level, debug, instrument, trace, warn};

use super::order::RuleOrder;
use super::result::{
    ValidationError, ValidationErrorKind, ValidationResult, ValidationWarning,
    ValidationWarningKind,
};
use crate::cache::{CacheKeyGenerator, CacheManager, Operation, SetOptions};
use crate::error::Result;
use crate::invalidation::InvalidationManager;
use crate::io::read_config_from_path;
use crate::metrics::MetricsCollector;
use crate::rules::{ConflictDetector, NormalizeError, RuleSet, SecurityImpact, normalize};
use crate::settings::ValidatorSettings;
use crate::types::{Configuration, KNOWN_PERMISSION_FIELDS, RuleCategory, RuleLocation};

/// Patterns that match every request.
const CATASTROPHIC_PATTERNS: &[&str] = &["*", "**", ".*"];

/// Per-call options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidateOptions {
    /// Neither read from nor write to the cache.
    pub skip_cache: bool,
    /// Only run structural and rule-level checks.
    pub skip_conflict_detection: bool,
    /// Give up on conflict detection after this long.
    pub timeout: Option<Duration>,
    /// File the configuration was read from; cached results are invalidated
    /// when it changes.
    pub source_path: Option<PathBuf>,
}

impl ValidateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skip_cache(mut self) -> Self {
        self.skip_cache = true;
        self
    }

    pub fn syntax_only(mut self) -> Self {
        self.skip_conflict_detection = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn source_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.source_path = Some(path.into());
        self
    }
}

/// Pipeline stages, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationStage {
    Start,
    StructuralCheck,
    RuleLevelCheck,
    ConflictDetection,
    PerformanceAccounting,
    Done,
}

impl fmt::Display for ValidationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ValidationStage::Start => "start",
            ValidationStage::StructuralCheck => "structural-check",
            ValidationStage::RuleLevelCheck => "rule-level-check",
            ValidationStage::ConflictDetection => "conflict-detection",
            ValidationStage::PerformanceAccounting => "performance-accounting",
            ValidationStage::Done => "done",
        })
    }
}

fn enter(stage: ValidationStage) {
    trace!(stage = %stage, "validation stage");
}

/// A raw rule string and where it came from.
struct RawRule<'a> {
    location: RuleLocation,
    text: &'a str,
}

/// Builds a [`Validator`].
pub struct ValidatorBuilder {
    settings: ValidatorSettings,
    cache: Option<Arc<CacheManager<ValidationResult>>>,
    use_cache: bool,
    metrics: Option<Arc<MetricsCollector>>,
    invalidation: Option<Arc<InvalidationManager>>,
    track_files: bool,
}

impl ValidatorBuilder {
    /// Uses an existing cache instead of creating one from the settings.
    pub fn cache(mut self, cache: Arc<CacheManager<ValidationResult>>) -> Self {
        self.cache = Some(cache);
        self.use_cache = true;
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.cache = None;
        self.use_cache = false;
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Uses an existing invalidation manager; it must wrap the same cache.
    pub fn invalidation(mut self, invalidation: Arc<InvalidationManager>) -> Self {
        self.invalidation = Some(invalidation);
        self
    }

    /// Creates an invalidation manager over the validator's cache so
    /// `source_path` files are tracked.
    pub fn track_files(mut self) -> Self {
        self.track_files = true;
        self
    }

    pub fn build(self) -> Result<Validator> {
        let settings = self.settings;
        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(MetricsCollector::new(settings.metrics.clone())));

        let cache = match self.cache {
            Some(cache) => Some(cache),
            None if self.use_cache && settings.cache.enabled => Some(Arc::new(
                CacheManager::builder(settings.cache.clone())
                    .metrics(metrics.clone())
                    .build()?,
            )),
            None => None,
        };

        let invalidation = match (self.invalidation, &cache) {
            (Some(invalidation), _) => Some(invalidation),
            (None, Some(cache)) if self.track_files => Some(Arc::new(InvalidationManager::new(
                cache.clone(),
                settings.invalidation.clone(),
            ))),
            _ => None,
        };

        Ok(Validator {
            detector: ConflictDetector::new(
                settings.partial_overlap_threshold,
                settings.strict_zero_bypass,
            ),
            keys: CacheKeyGenerator::new(),
            settings,
            cache,
            metrics,
            invalidation,
        })
    }
}

/// Validates permission configurations.
pub struct Validator {
    settings: ValidatorSettings,
    detector: ConflictDetector,
    keys: CacheKeyGenerator,
    cache: Option<Arc<CacheManager<ValidationResult>>>,
    metrics: Arc<MetricsCollector>,
    invalidation: Option<Arc<InvalidationManager>>,
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Validator")
            .field("settings", &self.settings)
            .field("cache", &self.cache.is_some())
            .field("invalidation", &self.invalidation.is_some())
            .finish_non_exhaustive()
    }
}

impl Validator {
    pub fn builder(settings: ValidatorSettings) -> ValidatorBuilder {
        ValidatorBuilder {
            settings,
            cache: None,
            use_cache: true,
            metrics: None,
            invalidation: None,
            track_files: false,
        }
    }

    /// A validator with its own cache (if enabled) and metrics.
    pub fn new(settings: ValidatorSettings) -> Result<Self> {
        Self::builder(settings).build()
    }

    pub fn settings(&self) -> &ValidatorSettings {
        &self.settings
    }

    pub fn cache(&self) -> Option<&Arc<CacheManager<ValidationResult>>> {
        self.cache.as_ref()
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn invalidation(&self) -> Option<&Arc<InvalidationManager>> {
        self.invalidation.as_ref()
    }

    /// The cache key used for `config`.
    ///
    /// Analysis settings are part of the key so validators with different
    /// thresholds never share results.
    pub fn cache_key(&self, config: &Value, syntax_only: bool) -> String {
        let operation = if syntax_only {
            Operation::ValidationSyntax
        } else {
            Operation::Validation
        };
        let keyed = json!({
            "config": config,
            "partialOverlapThreshold": self.settings.partial_overlap_threshold,
            "strictZeroBypass": self.settings.strict_zero_bypass,
        });
        self.keys.generate(&operation, &keyed)
    }

    /// Validates a typed configuration with default options.
    pub fn validate_config(&self, config: &Configuration) -> ValidationResult {
        self.validate(&config.to_value(), &ValidateOptions::default())
    }

    /// Reads a configuration file and validates it, tracking the file for
    /// invalidation.
    #[instrument(level = Level::TRACE, skip(self))]
    pub fn validate_file(&self, path: &Path) -> Result<ValidationResult> {
        let config = read_config_from_path(path)?;
        Ok(self.validate(&config, &ValidateOptions::new().source_path(path)))
    }

    /// Validates a decoded configuration.
    #[instrument(level = Level::TRACE, skip(self, config))]
    pub fn validate(&self, config: &Value, options: &ValidateOptions) -> ValidationResult {
        let started = Instant::now();
        enter(ValidationStage::Start);

        let Some(object) = config.as_object() else {
            let mut result = ValidationResult::failed(
                ValidationError::new(
                    ValidationErrorKind::InvalidShape,
                    SecurityImpact::Critical,
                    format!(
                        "configuration must be a JSON object, got {}",
                        json_type(config)
                    ),
                ),
            );
            self.account_performance(&mut result, started, 0, false);
            return self.finish(result, started);
        };

        let use_cache = !options.skip_cache && self.cache.is_some();
        let key = use_cache.then(|| self.cache_key(config, options.skip_conflict_detection));

        let order = key.as_ref().map(|_| RuleOrder::of(&self.keys, object));

        if let (Some(cache), Some(key), Some(order)) = (&self.cache, &key, &order)
            && let Some(mut cached) = cache.get(key)
        {
            debug!(key = %key, "validation served from cache");
            order.to_actual(&mut cached);
            let rules = cached.performance.rules_processed;
            self.account_performance(&mut cached, started, rules, true);
            return self.finish(cached, started);
        }

        let mut result = ValidationResult::new();

        enter(ValidationStage::StructuralCheck);
        let raw_rules = check_structure(object, &mut result);
        let rules_processed = raw_rules.len();

        enter(ValidationStage::RuleLevelCheck);
        let rules = check_rules(&raw_rules, &mut result);

        let mut timed_out = false;
        if !options.skip_conflict_detection {
            enter(ValidationStage::ConflictDetection);
            let deadline = options.timeout.map(|timeout| started + timeout);
            match self.detector.detect_until(&rules, deadline) {
                Ok(conflicts) => result.conflicts = conflicts,
                Err(exceeded) => {
                    timed_out = true;
                    let limit = options.timeout.unwrap_or_default().as_millis();
                    warn!(
                        comparisons = exceeded.pairs_checked,
                        timeout_ms = limit as u64,
                        "conflict detection timed out"
                    );
                    result.conflicts = exceeded.partial;
                    result.errors.push(ValidationError::new(
                        ValidationErrorKind::PerformanceViolation,
                        SecurityImpact::High,
                        format!(
                            "validation exceeded its {limit} ms deadline after {} comparisons; conflict analysis is incomplete",
                            exceeded.pairs_checked
                        ),
                    ));
                    result.warnings.push(ValidationWarning::new(
                        ValidationWarningKind::PerformanceViolation,
                        format!("conflict detection stopped at the {limit} ms deadline"),
                    ));
                }
            }
        }

        result.finalize();
        self.account_performance(&mut result, started, rules_processed, false);

        if !timed_out
            && let (Some(cache), Some(key), Some(order)) = (&self.cache, &key, &order)
        {
            self.store(cache, key, &result, order, options);
        }

        self.finish(result, started)
    }

    fn store(
        &self,
        cache: &CacheManager<ValidationResult>,
        key: &str,
        result: &ValidationResult,
        order: &RuleOrder,
        options: &ValidateOptions,
    ) {
        let mut stored = result.clone();
        // Timing findings belong to the call, not the configuration.
        stored
            .warnings
            .retain(|w| w.kind != ValidationWarningKind::PerformanceViolation);
        stored.performance.from_cache = false;
        order.to_canonical(&mut stored);

        let operation = if options.skip_conflict_detection {
            Operation::ValidationSyntax
        } else {
            Operation::Validation
        };
        let mut set_options = SetOptions::new().tag(operation.name());
        if let Some(path) = &options.source_path {
            set_options = set_options.tag(format!("source:{}", path.display()));
        }
        cache.set(key, stored, set_options);

        if let (Some(invalidation), Some(path)) = (&self.invalidation, &options.source_path)
            && let Err(e) = invalidation.track_latest(key, path)
        {
            warn!(path = %path.display(), error = %e, "could not track configuration file");
        }
    }

    fn account_performance(
        &self,
        result: &mut ValidationResult,
        started: Instant,
        rules_processed: usize,
        from_cache: bool,
    ) {
        enter(ValidationStage::PerformanceAccounting);
        let elapsed = started.elapsed();
        let target = self.settings.performance_target();

        result.performance.validation_time = elapsed.as_secs_f64() * 1000.0;
        result.performance.rules_processed = rules_processed;
        result.performance.performance_target.target = self.settings.performance_target_ms;
        result.performance.performance_target.achieved = elapsed <= target;
        result.performance.from_cache = from_cache;

        if elapsed > target {
            result.warnings.push(ValidationWarning::new(
                ValidationWarningKind::PerformanceViolation,
                format!(
                    "validation took {:.1} ms, target is {} ms",
                    result.performance.validation_time, self.settings.performance_target_ms
                ),
            ));
        }
    }

    fn finish(&self, result: ValidationResult, started: Instant) -> ValidationResult {
        enter(ValidationStage::Done);
        self.metrics.record_validation(started.elapsed(), result.is_valid);
        debug!(
            is_valid = result.is_valid,
            errors = result.errors.len(),
            warnings = result.warnings.len(),
            conflicts = result.conflicts.len(),
            from_cache = result.performance.from_cache,
            elapsed_ms = result.performance.validation_time,
            "validation finished"
        );
        result
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Checks the shape of `permissions` and collects the raw rule strings.
fn check_structure<'a>(config: &'a Map<String, Value>, result: &mut ValidationResult) -> Vec<RawRule<'a>> {
    let Some(permissions) = config.get("permissions") else {
        result.warnings.push(
            ValidationWarning::new(
                ValidationWarningKind::MissingPermissions,
                "configuration has no permissions; nothing is denied",
            )
            .with_suggestion("add a permissions object with deny, allow and ask lists"),
        );
        return Vec::new();
    };

    let Some(permissions) = permissions.as_object() else {
        result.errors.push(ValidationError::new(
            ValidationErrorKind::InvalidShape,
            SecurityImpact::Critical,
            format!("permissions must be an object, got {}", json_type(permissions)),
        ));
        return Vec::new();
    };

    for key in permissions.keys() {
        let known = RuleCategory::ALL.iter().any(|c| c.name() == key)
            || KNOWN_PERMISSION_FIELDS.contains(&key.as_str());
        if !known {
            result.warnings.push(ValidationWarning::new(
                ValidationWarningKind::UnknownField,
                format!("unknown field permissions.{key} is ignored"),
            ));
        }
    }

    let mut rules = Vec::new();
    for category in RuleCategory::ALL {
        let Some(list) = permissions.get(category.name()) else {
            continue;
        };
        let Some(entries) = list.as_array() else {
            result.errors.push(ValidationError::new(
                ValidationErrorKind::InvalidShape,
                SecurityImpact::High,
                format!(
                    "permissions.{category} must be an array of strings, got {}",
                    json_type(list)
                ),
            ));
            continue;
        };

        for (index, entry) in entries.iter().enumerate() {
            let location = RuleLocation::new(category, index);
            match entry.as_str() {
                Some(text) => rules.push(RawRule { location, text }),
                None => result.errors.push(
                    ValidationError::new(
                        ValidationErrorKind::InvalidShape,
                        SecurityImpact::High,
                        format!("rule must be a string, got {}", json_type(entry)),
                    )
                    .at(location),
                ),
            }
        }
    }

    if rules.is_empty() && result.errors.is_empty() {
        result.warnings.push(ValidationWarning::new(
            ValidationWarningKind::EmptyPermissions,
            "permissions declares no rules",
        ));
    }
    rules
}

/// Per-rule checks. Returns the rules that could be normalized.
fn check_rules(raw_rules: &[RawRule<'_>], result: &mut ValidationResult) -> RuleSet {
    let mut rules = RuleSet::new();
    let mut seen: HashSet<(RuleCategory, &str)> = HashSet::new();

    for raw in raw_rules {
        let location = raw.location;
        let rule = match normalize(location.category, location.index, raw.text) {
            Ok(rule) => rule,
            Err(NormalizeError::Empty(_)) => {
                result.errors.push(
                    ValidationError::new(
                        ValidationErrorKind::EmptyRule,
                        SecurityImpact::High,
                        "rule is empty",
                    )
                    .at(location),
                );
                continue;
            }
        };
        let text = raw.text.trim();

        if !seen.insert((location.category, text)) {
            result.warnings.push(
                ValidationWarning::new(
                    ValidationWarningKind::DuplicateRule,
                    format!("'{text}' is listed more than once in {}", location.category),
                )
                .at(location)
                .with_suggestion(format!("remove the duplicate '{text}'")),
            );
        }

        if CATASTROPHIC_PATTERNS.contains(&text) || CATASTROPHIC_PATTERNS.contains(&rule.inner()) {
            let effect = match location.category {
                RuleCategory::Deny => "denies every operation",
                RuleCategory::Ask => "asks before every operation",
                RuleCategory::Allow => "allows every operation",
            };
            result.warnings.push(
                ValidationWarning::new(
                    ValidationWarningKind::CatastrophicPattern,
                    format!("'{text}' {effect}"),
                )
                .at(location)
                .with_suggestion(format!("replace '{text}' with specific patterns")),
            );
        }

        if rule.malformed {
            result.warnings.push(
                ValidationWarning::new(
                    ValidationWarningKind::MalformedRule,
                    format!("'{text}' looks like a tool rule but is not well formed; treated as a plain pattern"),
                )
                .at(location)
                .with_suggestion("use Tool or Tool(pattern)"),
            );
        }

        if rule.is_regex_like()
            && let Err(e) = Regex::new(rule.inner())
        {
            result.errors.push(
                ValidationError::new(
                    ValidationErrorKind::InvalidRegex,
                    SecurityImpact::Medium,
                    format!("pattern does not compile: {e}"),
                )
                .at(location)
                .with_pattern(text),
            );
        }

        rules.push(rule);
    }
    rules
}
