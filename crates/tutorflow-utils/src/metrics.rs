//! In-process metrics registry
//!
//! Counters and latency histograms for each pipeline stage. The registry is
//! an explicitly constructed collaborator passed into the worker and its
//! callees; nothing in the workspace reaches for a global.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Histogram bucket upper bounds in milliseconds.
const BUCKET_BOUNDS_MS: [u64; 10] = [5, 10, 25, 50, 100, 250, 500, 1_000, 5_000, 30_000];

/// Latency histogram with fixed millisecond buckets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Histogram {
    /// Observation counts per bucket in [`BUCKET_BOUNDS_MS`] order, plus a
    /// final overflow bucket.
    pub buckets: [u64; 11],
    pub count: u64,
    pub sum_ms: u64,
}

impl Histogram {
    fn observe(&mut self, ms: u64) {
        let idx = BUCKET_BOUNDS_MS
            .iter()
            .position(|&bound| ms <= bound)
            .unwrap_or(BUCKET_BOUNDS_MS.len());
        self.buckets[idx] += 1;
        self.count += 1;
        self.sum_ms += ms;
    }

    /// Mean observed latency in milliseconds, 0 when empty.
    #[must_use]
    pub fn mean_ms(&self) -> u64 {
        if self.count == 0 { 0 } else { self.sum_ms / self.count }
    }
}

#[derive(Debug, Default)]
struct Inner {
    counters: HashMap<String, u64>,
    histograms: HashMap<String, Histogram>,
}

/// Point-in-time copy of all metrics, for tests and periodic log dumps.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub histograms: HashMap<String, Histogram>,
}

impl MetricsSnapshot {
    /// Counter value, 0 when never incremented.
    #[must_use]
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }
}

/// Registry of stage counters and latency histograms.
///
/// Counter names follow `<stage>.<outcome>` (for example `extract.ok`,
/// `upsert.retry`); histogram names are the bare stage name.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    inner: Mutex<Inner>,
}

impl MetricsRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment `<name>` by 1.
    pub fn incr(&self, name: &str) {
        self.incr_by(name, 1);
    }

    /// Increment `<name>` by `delta`.
    pub fn incr_by(&self, name: &str, delta: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        *inner.counters.entry(name.to_string()).or_insert(0) += delta;
    }

    /// Record a duration observation for `stage`.
    pub fn observe(&self, stage: &str, duration: Duration) {
        let ms = duration.as_millis().min(u128::from(u64::MAX)) as u64;
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner
            .histograms
            .entry(stage.to_string())
            .or_default()
            .observe(ms);
    }

    /// Copy out all current values.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        MetricsSnapshot {
            counters: inner.counters.clone(),
            histograms: inner.histograms.clone(),
        }
    }
}

/// Timer that records one stage execution: a latency observation plus a
/// `<stage>.<outcome>` counter, and a structured tracing event.
///
/// ```
/// use tutorflow_utils::metrics::{MetricsRegistry, StageTimer};
///
/// let metrics = MetricsRegistry::new();
/// let timer = StageTimer::start(&metrics, "extract", Some(42));
/// // ... do the work ...
/// timer.finish("ok");
/// assert_eq!(metrics.snapshot().counter("extract.ok"), 1);
/// ```
pub struct StageTimer<'a> {
    registry: &'a MetricsRegistry,
    stage: &'static str,
    job_id: Option<i64>,
    started: Instant,
}

impl<'a> StageTimer<'a> {
    #[must_use]
    pub fn start(registry: &'a MetricsRegistry, stage: &'static str, job_id: Option<i64>) -> Self {
        Self {
            registry,
            stage,
            job_id,
            started: Instant::now(),
        }
    }

    /// Record the stage result and emit the structured event.
    pub fn finish(self, outcome: &str) {
        let elapsed = self.started.elapsed();
        self.registry.observe(self.stage, elapsed);
        self.registry.incr(&format!("{}.{}", self.stage, outcome));
        tracing::info!(
            stage = self.stage,
            job_id = self.job_id,
            duration_ms = elapsed.as_millis() as u64,
            outcome = outcome,
            "stage complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_accumulates() {
        let metrics = MetricsRegistry::new();
        metrics.incr("extract.ok");
        metrics.incr("extract.ok");
        metrics.incr_by("extract.retry", 3);

        let snap = metrics.snapshot();
        assert_eq!(snap.counter("extract.ok"), 2);
        assert_eq!(snap.counter("extract.retry"), 3);
        assert_eq!(snap.counter("never.touched"), 0);
    }

    #[test]
    fn test_histogram_buckets() {
        let mut h = Histogram::default();
        h.observe(3); // bucket 0 (<= 5)
        h.observe(5); // bucket 0
        h.observe(7); // bucket 1 (<= 10)
        h.observe(100_000); // overflow bucket

        assert_eq!(h.buckets[0], 2);
        assert_eq!(h.buckets[1], 1);
        assert_eq!(h.buckets[10], 1);
        assert_eq!(h.count, 4);
        assert_eq!(h.sum_ms, 3 + 5 + 7 + 100_000);
    }

    #[test]
    fn test_stage_timer_records_outcome() {
        let metrics = MetricsRegistry::new();
        let timer = StageTimer::start(&metrics, "upsert", Some(7));
        timer.finish("ok");

        let snap = metrics.snapshot();
        assert_eq!(snap.counter("upsert.ok"), 1);
        assert_eq!(snap.histograms.get("upsert").map(|h| h.count), Some(1));
    }
}
