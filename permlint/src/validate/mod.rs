//! Configuration validation.
//!
//! - [`result`] holds the findings returned to callers.
//! - [`pipeline`] runs a single configuration through the checks.
//! - [`batch`] validates many configurations on a worker pool.
//! - `order` maps rule locations to and from the order cache keys use.

pub mod batch;
mod order;
pub mod pipeline;
pub mod result;

pub use batch::{BatchOptions, BatchResult};
pub use pipeline::{ValidateOptions, ValidationStage, Validator, ValidatorBuilder};
pub use result::{
    Performance, PerformanceTarget, ValidationError, ValidationErrorKind, ValidationResult,
    ValidationWarning, ValidationWarningKind,
};
