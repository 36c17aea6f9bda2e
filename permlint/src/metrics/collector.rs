//! Live cache and validation metrics.
//!
//! The collector is an explicit instance shared through an `Arc`: the cache
//! manager and the validator record into it, callers read snapshots from it.
//! When performance targets are configured, [`MetricsCollector::start`] runs
//! [`MetricsCollector::check_targets`] periodically on a background thread.

use std::fmt::{self, Write as _};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{Level, debug, info, instrument, warn};

use super::rolling::{RateWindow, ResponseTimes, RollingWindow};
use crate::error::{PermlintError, Result};
use crate::events::Subscribers;
use crate::settings::{MetricsSettings, PerformanceTargets};

/// Per-second rates over the sliding window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rates {
    pub reads: f64,
    pub writes: f64,
    pub evictions: f64,
    pub errors: f64,
}

/// Point-in-time snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// Cache retrieval latency.
    pub response_times: ResponseTimes,
    /// End-to-end validation latency.
    pub validation_times: ResponseTimes,
    pub hit_rate: f64,
    pub rates: Rates,
    pub memory_bytes: usize,
}

/// Cumulative counters since creation or the last reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub evictions: u64,
    pub errors: u64,
    pub validations: u64,
    pub invalid_results: u64,
    pub violations: u64,
    pub uptime_secs: u64,
}

/// Which target a violation concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetMetric {
    P99ResponseTime,
    HitRate,
    MemoryUsage,
    EvictionRate,
}

impl fmt::Display for TargetMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TargetMetric::P99ResponseTime => "p99 response time",
            TargetMetric::HitRate => "hit rate",
            TargetMetric::MemoryUsage => "memory usage",
            TargetMetric::EvictionRate => "eviction rate",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdViolation {
    pub metric: TargetMetric,
    pub actual: f64,
    pub target: f64,
}

impl fmt::Display for ThresholdViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:.2} violates target {:.2}", self.metric, self.actual, self.target)
    }
}

/// Events published to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricsEvent {
    ThresholdViolation {
        violation: ThresholdViolation,
        total_violations: u64,
    },
    Reset,
}

struct State {
    response_times: RollingWindow,
    validation_times: RollingWindow,
    reads: RateWindow,
    writes: RateWindow,
    evictions: RateWindow,
    errors: RateWindow,
    stats: MetricsStats,
    memory_bytes: usize,
    started_at: Instant,
}

impl State {
    fn new(settings: &MetricsSettings) -> Self {
        let window = settings.rate_window();
        Self {
            response_times: RollingWindow::new(settings.window_size),
            validation_times: RollingWindow::new(settings.window_size),
            reads: RateWindow::new(window),
            writes: RateWindow::new(window),
            evictions: RateWindow::new(window),
            errors: RateWindow::new(window),
            stats: MetricsStats::default(),
            memory_bytes: 0,
            started_at: Instant::now(),
        }
    }

    fn hit_rate(&self) -> f64 {
        let total = self.stats.hits + self.stats.misses;
        if total == 0 {
            0.0
        } else {
            self.stats.hits as f64 / total as f64
        }
    }
}

/// Stops and joins the periodic check thread when dropped.
struct MonitorHandle {
    stop: Option<Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.thread.take()
            && handle.thread().id() != thread::current().id()
        {
            let _ = handle.join();
        }
    }
}

pub struct MetricsCollector {
    settings: MetricsSettings,
    state: Mutex<State>,
    subscribers: Subscribers<MetricsEvent>,
    monitor: Mutex<Option<MonitorHandle>>,
}

impl fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(MetricsSettings::default())
    }
}

impl MetricsCollector {
    pub fn new(settings: MetricsSettings) -> Self {
        Self {
            state: Mutex::new(State::new(&settings)),
            settings,
            subscribers: Subscribers::new(),
            monitor: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &MetricsSettings {
        &self.settings
    }

    pub fn record_hit(&self, latency: Duration) {
        let mut state = self.lock();
        state.stats.hits += 1;
        state.reads.record();
        state.response_times.push(millis(latency));
    }

    pub fn record_miss(&self, latency: Duration) {
        let mut state = self.lock();
        state.stats.misses += 1;
        state.reads.record();
        state.response_times.push(millis(latency));
    }

    pub fn record_write(&self) {
        let mut state = self.lock();
        state.stats.writes += 1;
        state.writes.record();
    }

    pub fn record_eviction(&self) {
        let mut state = self.lock();
        state.stats.evictions += 1;
        state.evictions.record();
    }

    pub fn record_error(&self) {
        let mut state = self.lock();
        state.stats.errors += 1;
        state.errors.record();
    }

    /// Records one end-to-end validation.
    pub fn record_validation(&self, duration: Duration, is_valid: bool) {
        let mut state = self.lock();
        state.stats.validations += 1;
        if !is_valid {
            state.stats.invalid_results += 1;
        }
        state.validation_times.push(millis(duration));
    }

    /// Sets the memory currently held by the in-process cache tier.
    pub fn set_memory_usage(&self, bytes: usize) {
        self.lock().memory_bytes = bytes;
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        let mut state = self.lock();
        let now = Instant::now();
        MetricsSnapshot {
            response_times: state.response_times.summary(),
            validation_times: state.validation_times.summary(),
            hit_rate: state.hit_rate(),
            rates: Rates {
                reads: state.reads.rate_at(now),
                writes: state.writes.rate_at(now),
                evictions: state.evictions.rate_at(now),
                errors: state.errors.rate_at(now),
            },
            memory_bytes: state.memory_bytes,
        }
    }

    pub fn get_stats(&self) -> MetricsStats {
        let state = self.lock();
        MetricsStats {
            uptime_secs: state.started_at.elapsed().as_secs(),
            ..state.stats
        }
    }

    /// Number of threshold violations seen so far.
    pub fn violation_count(&self) -> u64 {
        self.lock().stats.violations
    }

    pub fn subscribe(&self) -> Receiver<MetricsEvent> {
        self.subscribers.subscribe()
    }

    /// Clears all samples and counters.
    #[instrument(level = Level::TRACE, skip(self))]
    pub fn reset(&self) {
        *self.lock() = State::new(&self.settings);
        self.subscribers.publish(MetricsEvent::Reset);
        debug!("metrics reset");
    }

    /// Compares live metrics against the configured targets.
    ///
    /// Returns the violations found; each is logged, counted and published.
    /// Without targets this is a no-op.
    #[instrument(level = Level::TRACE, skip(self))]
    pub fn check_targets(&self) -> Vec<ThresholdViolation> {
        let Some(targets) = &self.settings.targets else {
            return Vec::new();
        };
        let violations = self.evaluate(targets);
        if violations.is_empty() {
            return violations;
        }

        let total = {
            let mut state = self.lock();
            state.stats.violations += violations.len() as u64;
            state.stats.violations
        };
        for violation in &violations {
            warn!(
                metric = %violation.metric,
                actual = violation.actual,
                target = violation.target,
                total_violations = total,
                "performance target violated"
            );
            self.subscribers.publish(MetricsEvent::ThresholdViolation {
                violation: *violation,
                total_violations: total,
            });
        }
        violations
    }

    fn evaluate(&self, targets: &PerformanceTargets) -> Vec<ThresholdViolation> {
        let mut state = self.lock();
        let mut violations = Vec::new();

        if !state.validation_times.is_empty() {
            let p99 = state.validation_times.percentile(99.0);
            if p99 > targets.max_p99_ms {
                violations.push(ThresholdViolation {
                    metric: TargetMetric::P99ResponseTime,
                    actual: p99,
                    target: targets.max_p99_ms,
                });
            }
        }

        if state.stats.hits + state.stats.misses > 0 {
            let hit_rate = state.hit_rate();
            if hit_rate < targets.min_hit_rate {
                violations.push(ThresholdViolation {
                    metric: TargetMetric::HitRate,
                    actual: hit_rate,
                    target: targets.min_hit_rate,
                });
            }
        }

        if let Some(max_memory) = targets.max_memory_bytes
            && state.memory_bytes > max_memory
        {
            violations.push(ThresholdViolation {
                metric: TargetMetric::MemoryUsage,
                actual: state.memory_bytes as f64,
                target: max_memory as f64,
            });
        }

        let eviction_rate = state.evictions.rate();
        if eviction_rate > targets.max_eviction_rate {
            violations.push(ThresholdViolation {
                metric: TargetMetric::EvictionRate,
                actual: eviction_rate,
                target: targets.max_eviction_rate,
            });
        }

        violations
    }

    /// Starts the periodic target check. Does nothing without targets or if
    /// already running.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.settings.targets.is_none() {
            return Ok(());
        }
        let mut monitor = self.monitor.lock().unwrap_or_else(|e| e.into_inner());
        if monitor.is_some() {
            return Ok(());
        }

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.settings.check_interval().max(Duration::from_millis(10));

        let thread = thread::Builder::new()
            .name("permlint-metrics".into())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    let Some(collector) = weak.upgrade() else {
                        break;
                    };
                    collector.check_targets();
                }
            })
            .map_err(|source| PermlintError::SpawnError {
                name: "metrics",
                source,
            })?;

        info!(interval_ms = interval.as_millis() as u64, "metrics monitor started");
        *monitor = Some(MonitorHandle {
            stop: Some(stop_tx),
            thread: Some(thread),
        });
        Ok(())
    }

    /// Stops the periodic check and waits for its thread.
    pub fn stop(&self) {
        let handle = self
            .monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if handle.is_some() {
            drop(handle);
            info!("metrics monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Renders a human-readable summary.
    pub fn generate_report(&self) -> String {
        let metrics = self.get_metrics();
        let stats = self.get_stats();
        let mut report = String::new();

        let _ = writeln!(report, "Performance report (uptime {}s)", stats.uptime_secs);
        let _ = writeln!(report);
        let _ = writeln!(report, "Validation latency (ms):");
        write_times(&mut report, &metrics.validation_times);
        let _ = writeln!(report, "Cache latency (ms):");
        write_times(&mut report, &metrics.response_times);
        let _ = writeln!(report, "Cache:");
        let _ = writeln!(
            report,
            "  hits {}  misses {}  hit rate {:.1}%",
            stats.hits,
            stats.misses,
            metrics.hit_rate * 100.0
        );
        let _ = writeln!(
            report,
            "  writes {}  evictions {}  errors {}",
            stats.writes, stats.evictions, stats.errors
        );
        let _ = writeln!(report, "  memory {} bytes", metrics.memory_bytes);
        let _ = writeln!(report, "Rates (per second):");
        let _ = writeln!(
            report,
            "  reads {:.2}  writes {:.2}  evictions {:.2}  errors {:.2}",
            metrics.rates.reads, metrics.rates.writes, metrics.rates.evictions, metrics.rates.errors
        );
        let _ = writeln!(
            report,
            "Validations: {} ({} invalid)",
            stats.validations, stats.invalid_results
        );
        let _ = write!(report, "Threshold violations: {}", stats.violations);
        report
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn write_times(report: &mut String, times: &ResponseTimes) {
    if times.count == 0 {
        let _ = writeln!(report, "  no samples");
        return;
    }
    let _ = writeln!(
        report,
        "  p50 {:.2}  p95 {:.2}  p99 {:.2}  mean {:.2}  min {:.2}  max {:.2}  ({} samples)",
        times.p50, times.p95, times.p99, times.mean, times.min, times.max, times.count
    );
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_targets(targets: PerformanceTargets) -> MetricsCollector {
        MetricsCollector::new(MetricsSettings {
            targets: Some(targets),
            ..MetricsSettings::default()
        })
    }

    #[test]
    fn test_counts_hits_and_misses() {
        let metrics = MetricsCollector::default();
        metrics.record_hit(Duration::from_millis(1));
        metrics.record_hit(Duration::from_millis(1));
        metrics.record_miss(Duration::from_millis(3));

        let stats = metrics.get_stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);

        let snapshot = metrics.get_metrics();
        assert!((snapshot.hit_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(snapshot.response_times.count, 3);
        assert!(snapshot.rates.reads > 0.0);
    }

    #[test]
    fn test_reset_clears_everything() {
        let metrics = MetricsCollector::default();
        let events = metrics.subscribe();
        metrics.record_write();
        metrics.record_validation(Duration::from_millis(5), false);
        metrics.reset();

        assert_eq!(metrics.get_stats().writes, 0);
        assert_eq!(metrics.get_stats().validations, 0);
        assert_eq!(metrics.get_metrics().validation_times.count, 0);
        assert_eq!(events.try_recv().unwrap(), MetricsEvent::Reset);
    }

    #[test]
    fn test_no_targets_no_violations() {
        let metrics = MetricsCollector::default();
        metrics.record_validation(Duration::from_secs(5), true);
        assert!(metrics.check_targets().is_empty());
    }

    #[test]
    fn test_slow_validation_violates_p99() {
        let metrics = with_targets(PerformanceTargets::default());
        let events = metrics.subscribe();
        metrics.record_validation(Duration::from_millis(250), true);

        let violations = metrics.check_targets();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].metric, TargetMetric::P99ResponseTime);
        assert_eq!(metrics.violation_count(), 1);

        match events.try_recv().unwrap() {
            MetricsEvent::ThresholdViolation {
                violation,
                total_violations,
            } => {
                assert_eq!(violation.metric, TargetMetric::P99ResponseTime);
                assert_eq!(total_violations, 1);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_hit_rate_and_memory_targets() {
        let metrics = with_targets(PerformanceTargets {
            min_hit_rate: 0.9,
            max_memory_bytes: Some(100),
            ..PerformanceTargets::default()
        });
        metrics.record_hit(Duration::ZERO);
        metrics.record_miss(Duration::ZERO);
        metrics.set_memory_usage(1024);

        let found: Vec<TargetMetric> = metrics.check_targets().iter().map(|v| v.metric).collect();
        assert!(found.contains(&TargetMetric::HitRate));
        assert!(found.contains(&TargetMetric::MemoryUsage));
        assert_eq!(metrics.violation_count(), 2);
    }

    #[test]
    fn test_start_and_stop() {
        let metrics = Arc::new(with_targets(PerformanceTargets::default()));
        metrics.start().unwrap();
        assert!(metrics.is_running());
        metrics.stop();
        assert!(!metrics.is_running());
    }

    #[test]
    fn test_start_without_targets_is_noop() {
        let metrics = Arc::new(MetricsCollector::default());
        metrics.start().unwrap();
        assert!(!metrics.is_running());
    }

    #[test]
    fn test_report_mentions_counters() {
        let metrics = MetricsCollector::default();
        metrics.record_hit(Duration::from_millis(2));
        metrics.record_validation(Duration::from_millis(10), true);
        let report = metrics.generate_report();
        assert!(report.contains("hits 1"));
        assert!(report.contains("Validations: 1"));
        assert!(report.contains("Threshold violations: 0"));
    }
}
