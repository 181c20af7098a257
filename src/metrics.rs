//! Per-worker router metrics (C3): counts, consecutive streaks, latency EMA.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Snapshot of a worker's metrics, safe to hand out to callers.
#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    pub total: u64,
    pub success: u64,
    pub fail: u64,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub avg_latency_ms: f64,
}

/// Atomics for the hot counters; a small mutex only for the two fields that
/// must update together (latency EMA needs a read-modify-write that atomics
/// alone can't express cleanly, and last-used/last-transition timestamps
/// are not hot enough to justify atomics).
pub struct WorkerMetrics {
    total: AtomicU64,
    success: AtomicU64,
    fail: AtomicU64,
    consecutive_successes: AtomicU64,
    consecutive_failures: AtomicU64,
    latency: Mutex<LatencyState>,
}

struct LatencyState {
    avg_ms: f64,
    last_transition: Instant,
    last_used: Instant,
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerMetrics {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            total: AtomicU64::new(0),
            success: AtomicU64::new(0),
            fail: AtomicU64::new(0),
            consecutive_successes: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
            latency: Mutex::new(LatencyState {
                avg_ms: 0.0,
                last_transition: now,
                last_used: now,
            }),
        }
    }

    /// Record a successful call: reset the failure streak, bump the
    /// success streak, and fold `latency_ms` into the EMA.
    pub fn record_success(&self, latency_ms: f64) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.success.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.consecutive_successes.fetch_add(1, Ordering::Relaxed);

        let mut state = self.latency.lock().expect("metrics mutex poisoned");
        state.avg_ms = if state.avg_ms == 0.0 {
            latency_ms
        } else {
            (state.avg_ms + latency_ms) / 2.0
        };
        let now = Instant::now();
        state.last_transition = now;
        state.last_used = now;
    }

    /// Record a failed call: reset the success streak, bump the failure
    /// streak. Latency is not touched on failure.
    pub fn record_failure(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.fail.fetch_add(1, Ordering::Relaxed);
        self.consecutive_successes.store(0, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);

        let mut state = self.latency.lock().expect("metrics mutex poisoned");
        let now = Instant::now();
        state.last_transition = now;
        state.last_used = now;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.latency.lock().expect("metrics mutex poisoned");
        MetricsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            success: self.success.load(Ordering::Relaxed),
            fail: self.fail.load(Ordering::Relaxed),
            consecutive_successes: self.consecutive_successes.load(Ordering::Relaxed) as u32,
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed) as u32,
            avg_latency_ms: state.avg_ms,
        }
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.total.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            self.success.load(Ordering::Relaxed) as f64 / total as f64
        }
    }

    pub fn avg_latency_ms(&self) -> f64 {
        self.latency.lock().expect("metrics mutex poisoned").avg_ms
    }

    /// Reset every counter to its zero value (used by `ResetMetrics`).
    pub fn reset(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.success.store(0, Ordering::Relaxed);
        self.fail.store(0, Ordering::Relaxed);
        self.consecutive_successes.store(0, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let mut state = self.latency.lock().expect("metrics mutex poisoned");
        state.avg_ms = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_then_failure_never_both_nonzero() {
        let m = WorkerMetrics::new();
        m.record_success(10.0);
        let s = m.snapshot();
        assert_eq!(s.consecutive_successes, 1);
        assert_eq!(s.consecutive_failures, 0);

        m.record_failure();
        let s = m.snapshot();
        assert_eq!(s.consecutive_successes, 0);
        assert_eq!(s.consecutive_failures, 1);
    }

    #[test]
    fn total_is_at_least_success_plus_fail() {
        let m = WorkerMetrics::new();
        m.record_success(5.0);
        m.record_failure();
        m.record_success(5.0);
        let s = m.snapshot();
        assert_eq!(s.total, s.success + s.fail);
    }

    #[test]
    fn latency_ema_first_observation_sets_directly_then_averages() {
        let m = WorkerMetrics::new();
        m.record_success(100.0);
        assert_eq!(m.avg_latency_ms(), 100.0);
        m.record_success(200.0);
        assert_eq!(m.avg_latency_ms(), 150.0);
    }

    #[test]
    fn latency_unaffected_by_failure() {
        let m = WorkerMetrics::new();
        m.record_success(100.0);
        m.record_failure();
        assert_eq!(m.avg_latency_ms(), 100.0);
    }

    #[test]
    fn reset_zeroes_everything() {
        let m = WorkerMetrics::new();
        m.record_success(10.0);
        m.record_failure();
        m.reset();
        let s = m.snapshot();
        assert_eq!(s.total, 0);
        assert_eq!(s.avg_latency_ms, 0.0);
    }
}
