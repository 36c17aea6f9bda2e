//! Bounded sample windows for percentiles and rates.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Summary of the response-time samples in a [`RollingWindow`], in
/// milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseTimes {
    pub count: usize,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

/// The last `capacity` samples, oldest first.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Nearest-rank percentile (`p` in 0-100). Zero for an empty window.
    pub fn percentile(&self, p: f64) -> f64 {
        percentile_of(&self.sorted(), p)
    }

    pub fn summary(&self) -> ResponseTimes {
        if self.samples.is_empty() {
            return ResponseTimes::default();
        }
        let sorted = self.sorted();
        let sum: f64 = sorted.iter().sum();
        ResponseTimes {
            count: sorted.len(),
            p50: percentile_of(&sorted, 50.0),
            p95: percentile_of(&sorted, 95.0),
            p99: percentile_of(&sorted, 99.0),
            mean: sum / sorted.len() as f64,
            min: sorted[0],
            max: sorted[sorted.len() - 1],
        }
    }

    fn sorted(&self) -> Vec<f64> {
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        sorted
    }
}

fn percentile_of(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((p.clamp(0.0, 100.0) / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Event timestamps inside a sliding time window.
#[derive(Debug, Clone)]
pub struct RateWindow {
    events: VecDeque<Instant>,
    window: Duration,
}

impl RateWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            events: VecDeque::new(),
            window: window.max(Duration::from_millis(1)),
        }
    }

    pub fn record(&mut self) {
        self.record_at(Instant::now());
    }

    pub fn record_at(&mut self, now: Instant) {
        self.prune(now);
        self.events.push_back(now);
    }

    /// Events inside the window ending at `now`.
    pub fn count_at(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.events.len()
    }

    /// Events per second over the window ending at `now`.
    pub fn rate_at(&mut self, now: Instant) -> f64 {
        self.count_at(now) as f64 / self.window.as_secs_f64()
    }

    pub fn rate(&mut self) -> f64 {
        self.rate_at(Instant::now())
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.events.front() {
            if now.saturating_duration_since(oldest) > self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }
}
