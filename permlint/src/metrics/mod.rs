//! Rolling performance metrics.

pub mod collector;
pub mod rolling;

pub use collector::{
    MetricsCollector, MetricsEvent, MetricsSnapshot, MetricsStats, Rates, TargetMetric,
    ThresholdViolation,
};
pub use rolling::{RateWindow, ResponseTimes, RollingWindow};
