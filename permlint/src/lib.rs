//! # permlint
//!
//! Static analysis for deny/allow/ask permission rules.
//!
//! ## Overview
//!
//! A permission configuration declares three rule lists under `permissions`.
//! When several rules match the same operation, precedence decides:
//! **deny > ask > allow**. Mistakes are easy to make and hard to spot: an
//! allow rule that is broader than a deny rule silently re-grants what the
//! deny meant to forbid.
//!
//! This library provides:
//! - Rule normalization and pairwise overlap classification
//! - Precedence-aware conflict detection with severities and suggestions
//! - A validation pipeline with structural and per-rule checks
//! - A two-tier result cache keyed on configuration content
//! - Dependency-driven cache invalidation when source files change
//! - Rolling latency and hit-rate metrics with threshold alerts
//!
//! ## Quick Start
//!
//! ```rust
//! use permlint::{Configuration, ValidateOptions, Validator, ValidatorSettings};
//! use permlint::rules::ConflictType;
//!
//! let validator = Validator::new(ValidatorSettings::default()).unwrap();
//!
//! let config = Configuration::new()
//!     .deny("Bash(rm:*)")
//!     .allow("Bash");
//!
//! let result = validator.validate(&config.to_value(), &ValidateOptions::default());
//! assert!(!result.is_valid);
//! assert_eq!(result.conflicts[0].conflict_type, ConflictType::AllowOverridesDeny);
//! ```
//!
//! ## Rule Syntax
//!
//! Rules are either plain path-like globs (`secrets/**`, `*.log`) or
//! tool-scoped rules in the form `Tool`, `Tool(pattern)` or
//! `Tool(prefix:*)`:
//!
//! ```rust
//! use permlint::RuleCategory;
//! use permlint::rules::normalize::{normalize, Segment};
//!
//! let rule = normalize(RuleCategory::Deny, 0, "Read(secrets/**)").unwrap();
//! assert_eq!(rule.tool.as_deref(), Some("Read"));
//! assert_eq!(rule.segments, vec![Segment::Literal("secrets".into()), Segment::DoubleStar]);
//! ```
//!
//! A pattern that does not end in `**` also covers everything below it, so
//! `secrets` and `secrets/**` deny the same requests.
//!
//! ## Settings
//!
//! [`ValidatorSettings`] are loaded with [`SettingsLoader`] from defaults, an
//! optional JSON file and `PERMLINT_` environment variables (nested fields
//! separated by `__`, e.g. `PERMLINT_CACHE__MAX_ENTRIES=500`).

pub mod cache;
pub mod error;
pub mod events;
pub mod invalidation;
pub mod io;
pub mod metrics;
pub mod rules;
pub mod settings;
pub mod types;
pub mod validate;

pub use cache::{CacheManager, CacheStats, SetOptions};
pub use error::{CacheError, PermlintError, Result};
pub use invalidation::InvalidationManager;
pub use io::read_config_from_path;
pub use metrics::MetricsCollector;
pub use rules::{RuleConflict, RuleStatistics, SecurityImpact, get_rule_statistics};
pub use settings::{SettingsLoader, ValidatorSettings};
pub use types::{Configuration, Permissions, RuleCategory, RuleLocation};
pub use validate::{
    BatchOptions, BatchResult, ValidateOptions, ValidationError, ValidationResult,
    ValidationWarning, Validator,
};
