//! The data returned by a validation run.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::rules::{ConflictType, RuleConflict, SecurityImpact};
use crate::types::RuleLocation;

/// Kind of validation error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationErrorKind {
    /// The configuration (or part of it) does not have the expected shape.
    InvalidShape,
    /// A rule is empty or whitespace only.
    EmptyRule,
    /// A regex-looking rule does not compile.
    InvalidRegex,
    /// Validation was cut short by its deadline.
    PerformanceViolation,
    /// Validation panicked or could not run.
    Internal,
}

/// Kind of validation warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationWarningKind {
    /// The configuration has no `permissions` object.
    MissingPermissions,
    /// `permissions` exists but holds no rules.
    EmptyPermissions,
    /// `permissions` holds a key that is neither a rule list nor a known setting.
    UnknownField,
    /// A rule matches everything (`*`, `**`, `.*`).
    CatastrophicPattern,
    /// The same rule appears twice in one category.
    DuplicateRule,
    /// A `Tool(...)` rule is not well formed.
    MalformedRule,
    /// The validation took longer than its target.
    PerformanceViolation,
}

impl ValidationErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            ValidationErrorKind::InvalidShape => "invalid-shape",
            ValidationErrorKind::EmptyRule => "empty-rule",
            ValidationErrorKind::InvalidRegex => "invalid-regex",
            ValidationErrorKind::PerformanceViolation => "performance-violation",
            ValidationErrorKind::Internal => "internal",
        }
    }
}

impl ValidationWarningKind {
    pub fn name(&self) -> &'static str {
        match self {
            ValidationWarningKind::MissingPermissions => "missing-permissions",
            ValidationWarningKind::EmptyPermissions => "empty-permissions",
            ValidationWarningKind::UnknownField => "unknown-field",
            ValidationWarningKind::CatastrophicPattern => "catastrophic-pattern",
            ValidationWarningKind::DuplicateRule => "duplicate-rule",
            ValidationWarningKind::MalformedRule => "malformed-rule",
            ValidationWarningKind::PerformanceViolation => "performance-violation",
        }
    }
}

impl fmt::Display for ValidationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for ValidationWarningKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A problem that makes the configuration invalid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    #[serde(rename = "type")]
    pub kind: ValidationErrorKind,
    pub severity: SecurityImpact,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<RuleLocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl ValidationError {
    pub fn new(kind: ValidationErrorKind, severity: SecurityImpact, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            message: message.into(),
            location: None,
            pattern: None,
        }
    }

    pub fn at(mut self, location: RuleLocation) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{} at {}: {}", self.kind, location, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

/// A finding that does not affect validity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationWarning {
    #[serde(rename = "type")]
    pub kind: ValidationWarningKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<RuleLocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl ValidationWarning {
    pub fn new(kind: ValidationWarningKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            location: None,
            suggestion: None,
        }
    }

    pub fn at(mut self, location: RuleLocation) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{} at {}: {}", self.kind, location, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceTarget {
    /// Target in milliseconds.
    pub target: u64,
    pub achieved: bool,
}

/// Timing of a validation run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Performance {
    /// Wall-clock duration in milliseconds.
    pub validation_time: f64,
    pub rules_processed: usize,
    pub performance_target: PerformanceTarget,
    /// The result was served from the cache.
    pub from_cache: bool,
}

impl Performance {
    pub fn validation_duration(&self) -> Duration {
        Duration::from_secs_f64(self.validation_time.max(0.0) / 1000.0)
    }
}

/// Outcome of validating one configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
    pub conflicts: Vec<RuleConflict>,
    pub suggestions: Vec<String>,
    pub performance: Performance,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// A result holding a single error; used when a configuration cannot be
    /// analysed at all.
    pub fn failed(error: ValidationError) -> Self {
        let mut result = Self::new();
        result.errors.push(error);
        result.finalize();
        result
    }

    /// Conflicts of `high` impact or above.
    pub fn blocking_conflicts(&self) -> impl Iterator<Item = &RuleConflict> {
        self.conflicts
            .iter()
            .filter(|c| c.security_impact.is_blocking())
    }

    pub fn conflicts_of(&self, conflict_type: ConflictType) -> impl Iterator<Item = &RuleConflict> {
        self.conflicts
            .iter()
            .filter(move |c| c.conflict_type == conflict_type)
    }

    pub fn has_error(&self, kind: ValidationErrorKind) -> bool {
        self.errors.iter().any(|e| e.kind == kind)
    }

    pub fn has_warning(&self, kind: ValidationWarningKind) -> bool {
        self.warnings.iter().any(|w| w.kind == kind)
    }

    /// Recomputes `is_valid` and collects suggestions from warnings and
    /// conflicts, without duplicates.
    pub fn finalize(&mut self) {
        self.is_valid = self.errors.is_empty() && self.blocking_conflicts().next().is_none();

        let collected = self
            .warnings
            .iter()
            .filter_map(|w| w.suggestion.clone())
            .chain(self.conflicts.iter().filter_map(|c| c.suggestion.clone()));
        for suggestion in collected {
            if !self.suggestions.contains(&suggestion) {
                self.suggestions.push(suggestion);
            }
        }
    }

    /// Compares two results ignoring timing.
    pub fn same_findings(&self, other: &ValidationResult) -> bool {
        self.is_valid == other.is_valid
            && self.errors == other.errors
            && self.warnings == other.warnings
            && self.conflicts == other.conflicts
            && self.suggestions == other.suggestions
            && self.performance.rules_processed == other.performance.rules_processed
    }
}
