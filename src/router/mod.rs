//! Task Router (C5): policy-driven worker selection over healthy workers.

mod policy;

pub use policy::{RoutingPolicy, WorkerSummary};

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::affinity::AffinityMap;
use crate::cancellation::Cancellation;
use crate::category::{Category, CategoryDetector, KeywordCategoryDetector};
use crate::circuit::{BreakerConfig, CircuitBreaker};
use crate::error::{FleetError, Result};
use crate::metrics::{MetricsSnapshot, WorkerMetrics};
use crate::worker::{WorkerHandle, WorkerId};
use policy::RoundRobinCursor;

/// How long a `Performance` score snapshot stays valid before recomputing.
const PERFORMANCE_CACHE_TTL: Duration = Duration::from_secs(5);

struct PerfCache {
    computed_at: Option<Instant>,
    scores: HashMap<WorkerId, f64>,
}

/// Policy-driven selector over a set of registered workers, each gated by
/// its own circuit breaker and scored by router metrics / affinity.
pub struct TaskRouter {
    handles: DashMap<WorkerId, Arc<dyn WorkerHandle>>,
    metrics: DashMap<WorkerId, Arc<WorkerMetrics>>,
    breakers: DashMap<WorkerId, Arc<CircuitBreaker>>,
    order: RwLock<Vec<WorkerId>>,
    affinity: AffinityMap,
    category_detector: RwLock<Box<dyn CategoryDetector>>,
    policy: RwLock<RoutingPolicy>,
    breaker_config: BreakerConfig,
    rr: RoundRobinCursor,
    perf_cache: std::sync::Mutex<PerfCache>,
}

impl TaskRouter {
    pub fn new(policy: RoutingPolicy, breaker_config: BreakerConfig) -> Self {
        Self {
            handles: DashMap::new(),
            metrics: DashMap::new(),
            breakers: DashMap::new(),
            order: RwLock::new(Vec::new()),
            affinity: AffinityMap::new(),
            category_detector: RwLock::new(Box::new(KeywordCategoryDetector)),
            policy: RwLock::new(policy),
            breaker_config,
            rr: RoundRobinCursor::new(),
            perf_cache: std::sync::Mutex::new(PerfCache {
                computed_at: None,
                scores: HashMap::new(),
            }),
        }
    }

    // ---- registration -----------------------------------------------

    pub fn register_worker(&self, id: impl Into<String>, handle: Arc<dyn WorkerHandle>) -> Result<()> {
        let id = id.into();
        if id.is_empty() {
            return Err(FleetError::InvalidRequest("worker id must not be empty".into()));
        }
        if self.handles.contains_key(&id) {
            return Err(FleetError::Duplicate(id));
        }
        self.handles.insert(id.clone(), handle);
        self.metrics.insert(id.clone(), Arc::new(WorkerMetrics::new()));
        self.breakers
            .insert(id.clone(), Arc::new(CircuitBreaker::new(self.breaker_config)));
        self.order.write().expect("order lock poisoned").push(id.clone());
        info!(worker = %id, "registered");
        Ok(())
    }

    pub fn unregister_worker(&self, id: &str) -> Result<()> {
        if self.handles.remove(id).is_none() {
            return Err(FleetError::NotFound(id.to_string()));
        }
        self.metrics.remove(id);
        self.breakers.remove(id);
        self.affinity.clear_worker(&id.to_string());
        self.order
            .write()
            .expect("order lock poisoned")
            .retain(|w| w != id);
        info!(worker = %id, "unregistered");
        Ok(())
    }

    fn registration_order(&self) -> Vec<WorkerId> {
        self.order.read().expect("order lock poisoned").clone()
    }

    /// Workers whose breaker is ready (closed, or open with elapsed
    /// timeout) — the selection set for every routing policy.
    fn available_workers(&self) -> Vec<WorkerId> {
        self.registration_order()
            .into_iter()
            .filter(|id| {
                self.breakers
                    .get(id)
                    .map(|b| b.is_ready())
                    .unwrap_or(false)
            })
            .collect()
    }

    // ---- routing ------------------------------------------------------

    pub fn route(
        &self,
        cancellation: &Cancellation,
        prompt: &str,
        previous_worker: Option<&str>,
    ) -> Result<WorkerId> {
        if cancellation.is_cancelled() {
            return Err(FleetError::Cancelled);
        }
        if self.handles.is_empty() {
            return Err(FleetError::NoWorkers);
        }
        let mut candidates = self.available_workers();
        if candidates.is_empty() {
            warn!("no healthy workers available for routing");
            return Err(FleetError::NoHealthyWorkers);
        }

        let category = self
            .category_detector
            .read()
            .expect("detector lock poisoned")
            .detect(prompt);
        let policy = *self.policy.read().expect("policy lock poisoned");

        // `available_workers` is a non-mutating snapshot (breaker Closed, or
        // Open-with-elapsed-timeout). The actual Open -> HalfOpen transition
        // and HalfOpen probe-slot consumption happens in `allow_request`,
        // called here only on the worker the policy actually picked — if it
        // declines (e.g. the HalfOpen probe budget is already spent by a
        // concurrent caller), drop that candidate and let the policy pick
        // again among what's left.
        while !candidates.is_empty() {
            let chosen = match policy {
                RoutingPolicy::RoundRobin => self.select_round_robin(&candidates),
                RoutingPolicy::LeastLoaded => self.select_least_loaded(&candidates),
                RoutingPolicy::Random => self.select_random(&candidates),
                RoutingPolicy::Performance => self.select_performance(&candidates),
                RoutingPolicy::Affinity => self.select_affinity(previous_worker, category, &candidates),
                RoutingPolicy::Hybrid => {
                    let has_affinity = candidates
                        .iter()
                        .any(|id| self.affinity.scores(category).get(id).copied().unwrap_or(0) > 0);
                    if has_affinity {
                        self.select_affinity(previous_worker, category, &candidates)
                    } else {
                        self.select_performance(&candidates)
                    }
                }
            };

            let Some(id) = chosen else {
                break;
            };

            let admitted = self.breakers.get(&id).map(|b| b.allow_request()).unwrap_or(false);
            if admitted {
                debug!(worker = %id, ?category, ?policy, "routed");
                return Ok(id);
            }
            candidates.retain(|c| c != &id);
        }

        warn!(?category, ?policy, "no candidate selected");
        Err(FleetError::NoHealthyWorkers)
    }

    fn select_round_robin(&self, candidates: &[WorkerId]) -> Option<WorkerId> {
        let idx = self.rr.next_index(candidates.len());
        candidates.get(idx).cloned()
    }

    fn select_random(&self, candidates: &[WorkerId]) -> Option<WorkerId> {
        if candidates.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..candidates.len());
        candidates.get(idx).cloned()
    }

    fn summaries(&self, candidates: &[WorkerId]) -> Vec<WorkerSummary> {
        candidates
            .iter()
            .filter_map(|id| {
                self.metrics.get(id).map(|m| {
                    let s = m.snapshot();
                    WorkerSummary {
                        id: id.clone(),
                        total: s.total,
                        success: s.success,
                        avg_latency_ms: s.avg_latency_ms,
                    }
                })
            })
            .collect()
    }

    fn select_least_loaded(&self, candidates: &[WorkerId]) -> Option<WorkerId> {
        policy::least_loaded(&self.summaries(candidates))
    }

    fn performance_scores(&self, candidates: &[WorkerId]) -> HashMap<WorkerId, f64> {
        let mut cache = self.perf_cache.lock().expect("perf cache poisoned");
        let fresh = cache
            .computed_at
            .map(|t| t.elapsed() < PERFORMANCE_CACHE_TTL)
            .unwrap_or(false);
        if !fresh {
            cache.scores = policy::performance_scores(&self.summaries(candidates));
            cache.computed_at = Some(Instant::now());
        }
        cache
            .scores
            .iter()
            .filter(|(id, _)| candidates.contains(id))
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    fn select_performance(&self, candidates: &[WorkerId]) -> Option<WorkerId> {
        let scores = self.performance_scores(candidates);
        match policy::best_by_score(&scores) {
            Some((id, score)) if score > 0.0 => Some(id),
            _ => self.select_round_robin(candidates),
        }
    }

    fn select_affinity(
        &self,
        previous_worker: Option<&str>,
        category: Category,
        candidates: &[WorkerId],
    ) -> Option<WorkerId> {
        if let Some(prev) = previous_worker {
            if candidates.iter().any(|id| id == prev) {
                return Some(prev.to_string());
            }
        }
        self.affinity
            .best(category, candidates)
            .or_else(|| self.select_least_loaded(candidates))
    }

    // ---- outcome recording ---------------------------------------------

    pub fn record_result(
        &self,
        worker_id: &str,
        success: bool,
        latency_ms: f64,
        category: Category,
    ) -> Result<()> {
        let metrics = self
            .metrics
            .get(worker_id)
            .ok_or_else(|| FleetError::NotFound(worker_id.to_string()))?
            .clone();
        let breaker = self
            .breakers
            .get(worker_id)
            .ok_or_else(|| FleetError::NotFound(worker_id.to_string()))?
            .clone();

        if success {
            metrics.record_success(latency_ms);
            breaker.record_success();
            if category != Category::Unknown {
                self.affinity
                    .increment(category, &worker_id.to_string(), 1);
            }
        } else {
            metrics.record_failure();
            breaker.record_failure();
            if category != Category::Unknown {
                self.affinity
                    .decrement(category, &worker_id.to_string(), 2);
            }
        }
        Ok(())
    }

    // ---- administrative --------------------------------------------------

    pub fn health_check(&self) -> HashMap<WorkerId, bool> {
        self.registration_order()
            .into_iter()
            .map(|id| {
                let ready = self.breakers.get(&id).map(|b| b.is_ready()).unwrap_or(false);
                (id, ready)
            })
            .collect()
    }

    pub fn set_strategy(&self, policy: RoutingPolicy) {
        *self.policy.write().expect("policy lock poisoned") = policy;
    }

    pub fn set_category_detector(&self, detector: Box<dyn CategoryDetector>) {
        *self.category_detector.write().expect("detector lock poisoned") = detector;
    }

    pub fn force_recover(&self, worker_id: &str) -> Result<()> {
        let breaker = self
            .breakers
            .get(worker_id)
            .ok_or_else(|| FleetError::NotFound(worker_id.to_string()))?;
        breaker.force_close();
        Ok(())
    }

    pub fn reset_metrics(&self) {
        for entry in self.metrics.iter() {
            entry.value().reset();
        }
    }

    pub fn metrics(&self, worker: Option<&str>) -> Result<HashMap<WorkerId, MetricsSnapshot>> {
        match worker {
            Some(id) => {
                let m = self
                    .metrics
                    .get(id)
                    .ok_or_else(|| FleetError::NotFound(id.to_string()))?;
                Ok(HashMap::from([(id.to_string(), m.snapshot())]))
            }
            None => Ok(self
                .metrics
                .iter()
                .map(|e| (e.key().clone(), e.value().snapshot()))
                .collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::test_support::MockWorker;

    fn router_with(policy: RoutingPolicy) -> TaskRouter {
        TaskRouter::new(policy, BreakerConfig::default())
    }

    fn register(router: &TaskRouter, id: &str) {
        router
            .register_worker(id, Arc::new(MockWorker::new()))
            .unwrap();
    }

    #[test]
    fn register_rejects_empty_id_and_duplicates() {
        let router = router_with(RoutingPolicy::RoundRobin);
        assert!(router.register_worker("", Arc::new(MockWorker::new())).is_err());
        register(&router, "a");
        assert!(router.register_worker("a", Arc::new(MockWorker::new())).is_err());
    }

    #[test]
    fn unregister_unknown_is_not_found() {
        let router = router_with(RoutingPolicy::RoundRobin);
        assert!(router.unregister_worker("ghost").is_err());
    }

    #[test]
    fn route_fails_with_no_workers() {
        let router = router_with(RoutingPolicy::RoundRobin);
        let token = Cancellation::new();
        assert!(matches!(
            router.route(&token, "hi", None),
            Err(FleetError::NoWorkers)
        ));
    }

    #[test]
    fn route_checks_cancellation_first() {
        let router = router_with(RoutingPolicy::RoundRobin);
        register(&router, "a");
        let token = Cancellation::new();
        token.cancel();
        assert!(matches!(
            router.route(&token, "hi", None),
            Err(FleetError::Cancelled)
        ));
    }

    /// Scenario 1: round-robin fairness over 9 calls / 3 workers.
    #[test]
    fn scenario_round_robin_fairness() {
        let router = router_with(RoutingPolicy::RoundRobin);
        for id in ["A", "B", "C"] {
            register(&router, id);
        }
        let token = Cancellation::new();
        let seq: Vec<String> = (0..9)
            .map(|_| router.route(&token, "anything", None).unwrap())
            .collect();
        assert_eq!(
            seq,
            vec!["A", "B", "C", "A", "B", "C", "A", "B", "C"]
                .into_iter()
                .map(String::from)
                .collect::<Vec<_>>()
        );
    }

    /// Scenario 2: breaker open/close lifecycle observed through the router.
    #[test]
    fn scenario_breaker_open_then_half_open_then_closed() {
        let config = BreakerConfig {
            failure_threshold: 5,
            success_threshold: 3,
            timeout: Duration::from_millis(20),
            half_open_probes: 2,
        };
        let router = TaskRouter::new(RoutingPolicy::RoundRobin, config);
        register(&router, "A");

        for _ in 0..5 {
            router
                .record_result("A", false, 0.0, Category::Unknown)
                .unwrap();
        }
        assert_eq!(router.health_check()["A"], false);

        std::thread::sleep(Duration::from_millis(25));
        let token = Cancellation::new();
        assert_eq!(router.route(&token, "anything", None).unwrap(), "A");

        for _ in 0..3 {
            router
                .record_result("A", true, 10.0, Category::Unknown)
                .unwrap();
        }
        assert_eq!(router.health_check()["A"], true);
    }

    /// Scenario 3: affinity-based routing picks the learned specialist.
    #[test]
    fn scenario_affinity_routing() {
        let router = router_with(RoutingPolicy::Affinity);
        register(&router, "coder");
        register(&router, "tester");
        register(&router, "doc");

        for _ in 0..5 {
            router
                .record_result("coder", true, 50.0, Category::Coding)
                .unwrap();
            router
                .record_result("tester", true, 50.0, Category::Testing)
                .unwrap();
        }

        let token = Cancellation::new();
        assert_eq!(
            router.route(&token, "implement new feature", None).unwrap(),
            "coder"
        );
        assert_eq!(
            router.route(&token, "write unit tests", None).unwrap(),
            "tester"
        );
    }

    /// Scenario 4: performance routing prefers the fast, reliable worker.
    #[test]
    fn scenario_performance_routing() {
        let router = router_with(RoutingPolicy::Performance);
        register(&router, "fast");
        register(&router, "slow");

        for _ in 0..5 {
            router
                .record_result("fast", true, 50.0, Category::Unknown)
                .unwrap();
        }
        for _ in 0..3 {
            router
                .record_result("slow", false, 500.0, Category::Unknown)
                .unwrap();
        }

        let token = Cancellation::new();
        assert_eq!(router.route(&token, "anything", None).unwrap(), "fast");
    }

    #[test]
    fn record_result_unknown_worker_is_not_found_and_mutates_nothing() {
        let router = router_with(RoutingPolicy::RoundRobin);
        register(&router, "a");
        let before = router.metrics(None).unwrap();
        assert!(router
            .record_result("ghost", true, 1.0, Category::Unknown)
            .is_err());
        let after = router.metrics(None).unwrap();
        assert_eq!(before.len(), after.len());
    }

    #[test]
    fn force_recover_is_idempotent() {
        let router = router_with(RoutingPolicy::RoundRobin);
        register(&router, "a");
        for _ in 0..5 {
            router.record_result("a", false, 0.0, Category::Unknown).unwrap();
        }
        router.force_recover("a").unwrap();
        router.force_recover("a").unwrap();
        assert_eq!(router.health_check()["a"], true);
    }

    #[test]
    fn unregister_clears_metrics_affinity_and_breaker() {
        let router = router_with(RoutingPolicy::Affinity);
        register(&router, "a");
        router
            .record_result("a", true, 10.0, Category::Coding)
            .unwrap();
        router.unregister_worker("a").unwrap();
        assert!(router.metrics(Some("a")).is_err());
        assert!(router.affinity.scores(Category::Coding).get("a").is_none());
        assert!(router.force_recover("a").is_err());
    }
}
