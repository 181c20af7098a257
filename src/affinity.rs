//! Per-category, per-worker affinity ledger (C2).
//!
//! `category → worker_id → score`. Scores are clamped at 0; `Unknown`
//! never participates (callers simply never call `increment`/`decrement`
//! with it — enforced by routing code, not by this module, since the
//! ledger itself is category-agnostic storage).

use dashmap::DashMap;
use std::collections::HashMap;

use crate::category::Category;
use crate::worker::WorkerId;

/// Running `(category, worker) -> score` ledger.
pub struct AffinityMap {
    scores: DashMap<Category, DashMap<WorkerId, i64>>,
}

impl Default for AffinityMap {
    fn default() -> Self {
        Self::new()
    }
}

impl AffinityMap {
    pub fn new() -> Self {
        Self {
            scores: DashMap::new(),
        }
    }

    /// Bump `(category, worker)` by `delta`. Negative deltas are ignored
    /// silently (the contract requires non-negative input here; use
    /// [`AffinityMap::decrement`] to lower a score).
    pub fn increment(&self, category: Category, worker: &WorkerId, delta: i64) {
        if delta < 0 {
            return;
        }
        let entry = self.scores.entry(category).or_insert_with(DashMap::new);
        let mut score = entry.entry(worker.clone()).or_insert(0);
        *score += delta;
    }

    /// Lower `(category, worker)` by `delta`, clamped at 0. Negative deltas
    /// are ignored silently.
    pub fn decrement(&self, category: Category, worker: &WorkerId, delta: i64) {
        if delta < 0 {
            return;
        }
        let entry = self.scores.entry(category).or_insert_with(DashMap::new);
        let mut score = entry.entry(worker.clone()).or_insert(0);
        *score = (*score - delta).max(0);
    }

    /// Immutable snapshot of every worker's score for `category`.
    pub fn scores(&self, category: Category) -> HashMap<WorkerId, i64> {
        match self.scores.get(&category) {
            Some(per_worker) => per_worker
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            None => HashMap::new(),
        }
    }

    /// The highest-scoring worker for `category` among `candidates`, if any
    /// has a positive score.
    pub fn best(&self, category: Category, candidates: &[WorkerId]) -> Option<WorkerId> {
        let snapshot = self.scores(category);
        candidates
            .iter()
            .filter_map(|id| snapshot.get(id).map(|score| (id.clone(), *score)))
            .filter(|(_, score)| *score > 0)
            .max_by_key(|(_, score)| *score)
            .map(|(id, _)| id)
    }

    /// Remove `worker` from every category's ledger (used on
    /// `UnregisterWorker`).
    pub fn clear_worker(&self, worker: &WorkerId) {
        for per_worker in self.scores.iter() {
            per_worker.remove(worker);
        }
    }
}
