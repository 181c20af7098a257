//! Selection policies (C5). Pure functions over a snapshot of candidate
//! workers — the router (`mod.rs`) owns the locking and hands these
//! functions an already-consistent view.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::worker::WorkerId;

/// One of the six routing strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingPolicy {
    RoundRobin,
    LeastLoaded,
    Random,
    Performance,
    Affinity,
    Hybrid,
}

/// Everything a policy needs to know about one candidate worker.
#[derive(Debug, Clone)]
pub struct WorkerSummary {
    pub id: WorkerId,
    pub total: u64,
    pub success: u64,
    pub avg_latency_ms: f64,
}

/// Atomic round-robin cursor, shared by the router across calls.
#[derive(Default)]
pub struct RoundRobinCursor(AtomicU64);

impl RoundRobinCursor {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Index into `len` candidates via an atomic fetch-add, establishing a
    /// total order on selection increments (P5 fairness relies on this).
    pub fn next_index(&self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        let n = self.0.fetch_add(1, Ordering::Relaxed);
        (n % len as u64) as usize
    }
}

/// `LeastLoaded`: minimize `total - success` (the spec's own
/// historical-failures-count-as-load definition, preserved verbatim per
/// the open question in the design notes). Ties keep the first encountered.
pub fn least_loaded(candidates: &[WorkerSummary]) -> Option<WorkerId> {
    candidates
        .iter()
        .min_by_key(|w| w.total.saturating_sub(w.success))
        .map(|w| w.id.clone())
}

/// `Performance`: `0.7*successRate + 0.3*(1/(1+avgLatencyMs))`, max wins.
/// Returns `None` when every candidate scores zero so the caller can fall
/// back to round-robin.
pub fn performance_scores(candidates: &[WorkerSummary]) -> HashMap<WorkerId, f64> {
    candidates
        .iter()
        .map(|w| {
            let success_rate = if w.total == 0 {
                0.0
            } else {
                w.success as f64 / w.total as f64
            };
            let latency_term = 1.0 / (1.0 + w.avg_latency_ms);
            (w.id.clone(), 0.7 * success_rate + 0.3 * latency_term)
        })
        .collect()
}

pub fn best_by_score(scores: &HashMap<WorkerId, f64>) -> Option<(WorkerId, f64)> {
    scores
        .iter()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(id, score)| (id.clone(), *score))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(id: &str, total: u64, success: u64, avg_latency_ms: f64) -> WorkerSummary {
        WorkerSummary {
            id: id.to_string(),
            total,
            success,
            avg_latency_ms,
        }
    }

    #[test]
    fn round_robin_cycles_through_indices() {
        let cursor = RoundRobinCursor::new();
        let seen: Vec<usize> = (0..6).map(|_| cursor.next_index(3)).collect();
        assert_eq!(seen, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn least_loaded_prefers_fewest_total_minus_success() {
        let candidates = vec![
            summary("a", 10, 2, 0.0), // load 8
            summary("b", 10, 9, 0.0), // load 1
        ];
        assert_eq!(least_loaded(&candidates), Some("b".to_string()));
    }

    #[test]
    fn performance_prefers_fast_reliable_worker() {
        let candidates = vec![
            summary("fast", 5, 5, 50.0),
            summary("slow", 3, 0, 500.0),
        ];
        let scores = performance_scores(&candidates);
        let (winner, _) = best_by_score(&scores).unwrap();
        assert_eq!(winner, "fast");
    }
}
