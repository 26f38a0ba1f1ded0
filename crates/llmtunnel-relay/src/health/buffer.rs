//! In-memory per-tunnel request metrics.
//!
//! Each tunnel gets an accumulator of atomics. Recording takes the map's
//! shared lock and draining takes its exclusive lock, so a flush never
//! races with an in-flight increment: every sample lands either in the
//! drained window or in the next one.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::storage::MetricsFlushParams;

/// Outcome of one proxied request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSample {
    pub latency_ms: u64,
    pub success: bool,
    #[serde(default)]
    pub status_code: Option<u16>,
}

#[derive(Debug)]
struct Accumulator {
    request_count: AtomicU64,
    success_count: AtomicU64,
    error_count: AtomicU64,
    total_latency_ms: AtomicU64,
    min_latency_ms: AtomicU64,
    max_latency_ms: AtomicU64,
    window_start: AtomicI64,
}

impl Accumulator {
    const fn new(window_start: i64) -> Self {
        Self {
            request_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            total_latency_ms: AtomicU64::new(0),
            min_latency_ms: AtomicU64::new(u64::MAX),
            max_latency_ms: AtomicU64::new(0),
            window_start: AtomicI64::new(window_start),
        }
    }

    fn add(&self, sample: &RequestSample) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        if sample.success {
            self.success_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.error_count.fetch_add(1, Ordering::Relaxed);
        }
        self.total_latency_ms
            .fetch_add(sample.latency_ms, Ordering::Relaxed);
        self.min_latency_ms
            .fetch_min(sample.latency_ms, Ordering::Relaxed);
        self.max_latency_ms
            .fetch_max(sample.latency_ms, Ordering::Relaxed);
    }

    fn merge(&self, other: &BufferedMetrics) {
        self.request_count
            .fetch_add(other.request_count, Ordering::Relaxed);
        self.success_count
            .fetch_add(other.success_count, Ordering::Relaxed);
        self.error_count
            .fetch_add(other.error_count, Ordering::Relaxed);
        self.total_latency_ms
            .fetch_add(other.total_latency_ms, Ordering::Relaxed);
        if let Some(min) = other.min_latency_ms {
            self.min_latency_ms.fetch_min(min, Ordering::Relaxed);
        }
        if let Some(max) = other.max_latency_ms {
            self.max_latency_ms.fetch_max(max, Ordering::Relaxed);
        }
        self.window_start
            .fetch_min(other.window_start, Ordering::Relaxed);
    }

    fn snapshot(&self) -> BufferedMetrics {
        let request_count = self.request_count.load(Ordering::Relaxed);
        let min = self.min_latency_ms.load(Ordering::Relaxed);
        BufferedMetrics {
            request_count,
            success_count: self.success_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            total_latency_ms: self.total_latency_ms.load(Ordering::Relaxed),
            min_latency_ms: (request_count > 0 && min != u64::MAX).then_some(min),
            max_latency_ms: (request_count > 0)
                .then(|| self.max_latency_ms.load(Ordering::Relaxed)),
            window_start: self.window_start.load(Ordering::Relaxed),
        }
    }
}

/// Raw counters for one tunnel since the last flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferedMetrics {
    pub request_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub total_latency_ms: u64,
    pub min_latency_ms: Option<u64>,
    pub max_latency_ms: Option<u64>,
    pub window_start: i64,
}

impl BufferedMetrics {
    /// Derive rates and averages. Never stored pre-divided.
    #[allow(clippy::cast_precision_loss)]
    pub fn aggregate(&self) -> AggregatedMetrics {
        let (success_rate, average_latency_ms) = if self.request_count == 0 {
            (0.0, 0.0)
        } else {
            let n = self.request_count as f64;
            (
                self.success_count as f64 / n * 100.0,
                self.total_latency_ms as f64 / n,
            )
        };
        AggregatedMetrics {
            request_count: self.request_count,
            success_count: self.success_count,
            error_count: self.error_count,
            success_rate,
            average_latency_ms,
            min_latency_ms: self.min_latency_ms,
            max_latency_ms: self.max_latency_ms,
            window_start: self.window_start,
        }
    }

    #[allow(clippy::cast_possible_wrap)]
    pub fn to_flush_params(&self) -> MetricsFlushParams {
        MetricsFlushParams {
            request_count: self.request_count as i64,
            success_count: self.success_count as i64,
            error_count: self.error_count as i64,
            total_latency_ms: self.total_latency_ms as i64,
            min_latency_ms: self.min_latency_ms.map(|v| v as i64),
            max_latency_ms: self.max_latency_ms.map(|v| v as i64),
            window_start: self.window_start,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedMetrics {
    pub request_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    /// Percentage, 0-100.
    pub success_rate: f64,
    pub average_latency_ms: f64,
    pub min_latency_ms: Option<u64>,
    pub max_latency_ms: Option<u64>,
    pub window_start: i64,
}

/// Process-local metrics accumulators keyed by tunnel ID.
#[derive(Debug, Default)]
pub struct MetricsBuffer {
    tunnels: DashMap<String, Accumulator>,
}

impl MetricsBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, tunnel_id: &str, sample: &RequestSample, now: i64) {
        if let Some(acc) = self.tunnels.get(tunnel_id) {
            acc.add(sample);
            return;
        }
        self.tunnels
            .entry(tunnel_id.to_string())
            .or_insert_with(|| Accumulator::new(now))
            .add(sample);
    }

    /// Current counters; zeros if nothing was recorded since the last flush.
    pub fn snapshot(&self, tunnel_id: &str) -> BufferedMetrics {
        self.tunnels
            .get(tunnel_id)
            .map(|acc| acc.snapshot())
            .unwrap_or_default()
    }

    pub fn aggregated(&self, tunnel_id: &str) -> AggregatedMetrics {
        self.snapshot(tunnel_id).aggregate()
    }

    /// Remove and return a tunnel's counters in one step.
    pub fn drain(&self, tunnel_id: &str) -> Option<BufferedMetrics> {
        self.tunnels
            .remove(tunnel_id)
            .map(|(_, acc)| acc.snapshot())
            .filter(|m| m.request_count > 0)
    }

    /// Put drained counters back after a failed flush.
    pub fn restore(&self, tunnel_id: &str, metrics: &BufferedMetrics) {
        self.tunnels
            .entry(tunnel_id.to_string())
            .or_insert_with(|| Accumulator::new(metrics.window_start))
            .merge(metrics);
    }

    pub fn tunnel_ids(&self) -> Vec<String> {
        self.tunnels.iter().map(|e| e.key().clone()).collect()
    }

    pub fn forget(&self, tunnel_id: &str) {
        self.tunnels.remove(tunnel_id);
    }
}
