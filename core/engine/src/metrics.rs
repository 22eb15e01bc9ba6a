//! Rolling performance samples and aggregates.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use polyweave_common::{CrudResult, OperationKind};

/// Outcome class of a sampled operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleOutcome {
    Success,
    Error,
    /// Succeeded, but a conflict was detected.
    Conflict,
}

/// One completed operation.
#[derive(Debug, Clone)]
pub struct PerformanceSample {
    pub recorded_at: Instant,
    pub timestamp: DateTime<Utc>,
    pub kind: OperationKind,
    pub provider: Option<String>,
    pub latency: Duration,
    pub outcome: SampleOutcome,
    pub cache_hit: bool,
    pub dispatches: u32,
}

impl PerformanceSample {
    /// Sample describing a final result.
    pub fn from_result(kind: OperationKind, result: &CrudResult, latency: Duration) -> Self {
        let outcome = if !result.success {
            SampleOutcome::Error
        } else if result.metadata.conflict_detected {
            SampleOutcome::Conflict
        } else {
            SampleOutcome::Success
        };

        Self {
            recorded_at: Instant::now(),
            timestamp: Utc::now(),
            kind,
            provider: result.metadata.provider.clone(),
            latency,
            outcome,
            cache_hit: result.metadata.cache_hit,
            dispatches: result.metadata.dispatches,
        }
    }
}

/// Aggregate of one provider's samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderMetrics {
    pub operations: u64,
    pub average_latency_ms: f64,
    pub error_rate: f64,
    pub dispatches: u64,
}

/// Rolling metrics over the sampling window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// Samples inside the window.
    pub operations: u64,
    pub operations_per_second: f64,
    pub average_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub cache_hit_rate: f64,
    pub conflict_rate: f64,
    pub error_rate: f64,
    pub dispatches: u64,
    /// Samples recorded since start.
    pub total_operations: u64,
    pub per_provider: BTreeMap<String, ProviderMetrics>,
    pub computed_at: Option<DateTime<Utc>>,
}

struct MonitorInner {
    samples: VecDeque<PerformanceSample>,
    total: u64,
    latest: MetricsSnapshot,
}

/// Collects samples from every pipeline and derives rolling metrics.
pub struct PerformanceMonitor {
    window: Duration,
    max_samples: usize,
    inner: RwLock<MonitorInner>,
}

impl PerformanceMonitor {
    pub fn new(window: Duration, max_samples: usize) -> Self {
        Self {
            window,
            max_samples: max_samples.max(1),
            inner: RwLock::new(MonitorInner {
                samples: VecDeque::new(),
                total: 0,
                latest: MetricsSnapshot::default(),
            }),
        }
    }

    pub fn record(&self, sample: PerformanceSample) {
        let mut inner = self.inner.write();
        inner.total += 1;
        inner.samples.push_back(sample);
        while inner.samples.len() > self.max_samples {
            inner.samples.pop_front();
        }
    }

    /// Samples currently held, oldest first.
    pub fn samples(&self) -> Vec<PerformanceSample> {
        self.inner.read().samples.iter().cloned().collect()
    }

    /// Drop samples older than the window and recompute the stored snapshot.
    pub fn aggregate(&self) -> MetricsSnapshot {
        let now = Instant::now();
        let mut inner = self.inner.write();
        while inner
            .samples
            .front()
            .map(|s| now.duration_since(s.recorded_at) > self.window)
            .unwrap_or(false)
        {
            inner.samples.pop_front();
        }

        let snapshot = compute(&inner.samples, inner.total, self.window);
        inner.latest = snapshot.clone();
        snapshot
    }

    /// Snapshot stored by the last aggregation pass.
    pub fn latest(&self) -> MetricsSnapshot {
        self.inner.read().latest.clone()
    }

    pub fn total_operations(&self) -> u64 {
        self.inner.read().total
    }
}

fn compute(samples: &VecDeque<PerformanceSample>, total: u64, window: Duration) -> MetricsSnapshot {
    let count = samples.len();
    if count == 0 {
        return MetricsSnapshot {
            total_operations: total,
            computed_at: Some(Utc::now()),
            ..MetricsSnapshot::default()
        };
    }

    let n = count as f64;

    let mut latencies: Vec<f64> = samples.iter().map(|s| millis(s.latency)).collect();
    latencies.sort_by(|a, b| a.total_cmp(b));
    let p95_index = ((n * 0.95).ceil() as usize).clamp(1, count) - 1;

    let mut per_provider: BTreeMap<String, (u64, f64, u64, u64)> = BTreeMap::new();
    for sample in samples {
        let Some(provider) = &sample.provider else {
            continue;
        };
        let entry = per_provider.entry(provider.clone()).or_default();
        entry.0 += 1;
        entry.1 += millis(sample.latency);
        if sample.outcome == SampleOutcome::Error {
            entry.2 += 1;
        }
        entry.3 += sample.dispatches as u64;
    }

    let window_secs = window.as_secs_f64().max(f64::EPSILON);

    MetricsSnapshot {
        operations: count as u64,
        operations_per_second: n / window_secs,
        average_latency_ms: latencies.iter().sum::<f64>() / n,
        p95_latency_ms: latencies[p95_index],
        cache_hit_rate: share(samples, |s| s.cache_hit),
        conflict_rate: share(samples, |s| s.outcome == SampleOutcome::Conflict),
        error_rate: share(samples, |s| s.outcome == SampleOutcome::Error),
        dispatches: samples.iter().map(|s| s.dispatches as u64).sum(),
        total_operations: total,
        per_provider: per_provider
            .into_iter()
            .map(|(name, (ops, latency, errors, dispatches))| {
                (
                    name,
                    ProviderMetrics {
                        operations: ops,
                        average_latency_ms: latency / ops as f64,
                        error_rate: errors as f64 / ops as f64,
                        dispatches,
                    },
                )
            })
            .collect(),
        computed_at: Some(Utc::now()),
    }
}

fn share(samples: &VecDeque<PerformanceSample>, pred: impl Fn(&PerformanceSample) -> bool) -> f64 {
    samples.iter().filter(|s| pred(*s)).count() as f64 / samples.len() as f64
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(provider: &str, ms: u64, outcome: SampleOutcome, cache_hit: bool) -> PerformanceSample {
        PerformanceSample {
            recorded_at: Instant::now(),
            timestamp: Utc::now(),
            kind: OperationKind::Read,
            provider: Some(provider.to_string()),
            latency: Duration::from_millis(ms),
            outcome,
            cache_hit,
            dispatches: if cache_hit { 0 } else { 1 },
        }
    }

    #[test]
    fn test_aggregate_rates() {
        let monitor = PerformanceMonitor::new(Duration::from_secs(10), 100);
        monitor.record(sample("a", 10, SampleOutcome::Success, true));
        monitor.record(sample("a", 20, SampleOutcome::Error, false));
        monitor.record(sample("b", 30, SampleOutcome::Conflict, false));
        monitor.record(sample("b", 40, SampleOutcome::Success, false));

        let snapshot = monitor.aggregate();
        assert_eq!(snapshot.operations, 4);
        assert_eq!(snapshot.total_operations, 4);
        assert!((snapshot.average_latency_ms - 25.0).abs() < 1e-9);
        assert!((snapshot.p95_latency_ms - 40.0).abs() < 1e-9);
        assert!((snapshot.cache_hit_rate - 0.25).abs() < 1e-9);
        assert!((snapshot.error_rate - 0.25).abs() < 1e-9);
        assert!((snapshot.conflict_rate - 0.25).abs() < 1e-9);
        assert!((snapshot.operations_per_second - 0.4).abs() < 1e-9);
        assert_eq!(snapshot.dispatches, 3);

        let a = &snapshot.per_provider["a"];
        assert_eq!(a.operations, 2);
        assert!((a.error_rate - 0.5).abs() < 1e-9);
        assert_eq!(monitor.latest(), snapshot);
    }

    #[test]
    fn test_sample_cap() {
        let monitor = PerformanceMonitor::new(Duration::from_secs(10), 3);
        for i in 0..5 {
            monitor.record(sample("a", i, SampleOutcome::Success, false));
        }
        assert_eq!(monitor.samples().len(), 3);
        assert_eq!(monitor.total_operations(), 5);
        assert_eq!(monitor.aggregate().operations, 3);
    }

    #[test]
    fn test_window_drops_old_samples() {
        let monitor = PerformanceMonitor::new(Duration::from_millis(10), 100);
        monitor.record(sample("a", 1, SampleOutcome::Success, false));
        std::thread::sleep(Duration::from_millis(30));
        monitor.record(sample("a", 1, SampleOutcome::Success, false));

        let snapshot = monitor.aggregate();
        assert_eq!(snapshot.operations, 1);
        assert_eq!(snapshot.total_operations, 2);
    }

    #[test]
    fn test_empty_snapshot() {
        let monitor = PerformanceMonitor::new(Duration::from_secs(1), 10);
        let snapshot = monitor.aggregate();
        assert_eq!(snapshot.operations, 0);
        assert!(snapshot.computed_at.is_some());
    }
}
