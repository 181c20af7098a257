//! Model Orchestrator (C8): per-request dispatch to a named or
//! load-balanced worker, backed by a fixed worker pool and an active
//! health loop.

pub mod aux;
mod health;

pub use aux::{CircuitBreaker as AuxCircuitBreaker, RateLimiter};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{FleetError, Result};
use crate::worker::WorkerHandle;

/// Recognized configuration keys: health-check cadence and worker-pool
/// width (`requestQueue` is derived as `worker_count * 2`).
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorConfig {
    pub health_check_interval: Duration,
    pub worker_count: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(10),
            worker_count: 4,
        }
    }
}

struct WorkerEntry {
    handle: Arc<dyn WorkerHandle>,
    base_url: String,
    timeout: Duration,
}

struct WorkerHealthState {
    healthy: AtomicBool,
    failures: AtomicU64,
    successes: AtomicU64,
    consecutive_failures: AtomicU64,
    last_health_at: Mutex<Option<DateTime<Utc>>>,
}

impl Default for WorkerHealthState {
    fn default() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            failures: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
            last_health_at: Mutex::new(None),
        }
    }
}

struct WorkerRecord {
    name: String,
    entry: WorkerEntry,
    health: WorkerHealthState,
}

/// Public view of one worker's health, returned by [`Orchestrator::status`].
#[derive(Debug, Clone)]
pub struct WorkerStatus {
    pub healthy: bool,
    pub failures: u64,
    pub successes: u64,
    pub last_health_at: Option<DateTime<Utc>>,
    pub url: String,
}

/// Aggregate orchestrator-wide counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrchestratorMetrics {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub avg_latency_ms: f64,
    pub healthy: usize,
    pub total_workers: usize,
}

/// One execution outcome, delivered on a single-buffered result channel
/// that is closed after delivery. A `response` is never `Some("")` paired
/// with `error: None`.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub response: Option<String>,
    pub error: Option<String>,
    pub duration: Duration,
    pub worker_name: String,
}

struct PendingRequest {
    worker_name: String,
    prompt: String,
    deadline: Duration,
    respond_to: oneshot::Sender<ExecutionResult>,
}

#[derive(Default)]
struct GlobalMetrics {
    total: AtomicU64,
    success: AtomicU64,
    failed: AtomicU64,
    latency: Mutex<f64>,
}

impl GlobalMetrics {
    fn record(&self, success: bool, latency_ms: f64) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.success.fetch_add(1, Ordering::Relaxed);
            let mut avg = self.latency.lock().expect("metrics mutex poisoned");
            *avg = if *avg == 0.0 {
                latency_ms
            } else {
                (*avg + latency_ms) / 2.0
            };
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// State shared with the spawned worker tasks and health loop; kept
/// separate from `Orchestrator` so those tasks hold an `Arc<Shared>`
/// rather than reaching back into the orchestrator's own lifecycle flags.
struct Shared {
    workers: DashMap<String, Arc<WorkerRecord>>,
    metrics: GlobalMetrics,
}

/// Per-request dispatch to a specific or load-balanced worker, with a
/// fixed-width execution pool and a background health loop.
///
/// `Register` takes both a pluggable [`WorkerHandle`] (used for `execute`,
/// since no wire protocol to the wrapped LM server is mandated) and a
/// concrete `base_url` + `timeout` pair used only by the health loop's
/// HTTP probe against the fixed `/api/version` path.
pub struct Orchestrator {
    config: OrchestratorConfig,
    shared: Arc<Shared>,
    order: RwLock<Vec<String>>,
    request_tx: Mutex<Option<mpsc::Sender<PendingRequest>>>,
    started: AtomicBool,
    shutting_down: AtomicBool,
    worker_tasks: Mutex<Vec<JoinHandle<()>>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
    http: reqwest::Client,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                workers: DashMap::new(),
                metrics: GlobalMetrics::default(),
            }),
            order: RwLock::new(Vec::new()),
            request_tx: Mutex::new(None),
            started: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            worker_tasks: Mutex::new(Vec::new()),
            health_task: Mutex::new(None),
            http: reqwest::Client::new(),
        }
    }

    pub fn register(
        &self,
        name: impl Into<String>,
        handle: Arc<dyn WorkerHandle>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<()> {
        let name = name.into();
        if name.is_empty() {
            return Err(FleetError::InvalidRequest("worker name must not be empty".into()));
        }
        if self.shared.workers.contains_key(&name) {
            return Err(FleetError::Duplicate(name));
        }
        let record = Arc::new(WorkerRecord {
            name: name.clone(),
            entry: WorkerEntry {
                handle,
                base_url: base_url.into(),
                timeout,
            },
            health: WorkerHealthState::default(),
        });
        self.shared.workers.insert(name.clone(), record);
        self.order.write().expect("order lock poisoned").push(name);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<()> {
        if self.shared.workers.remove(name).is_none() {
            return Err(FleetError::NotFound(name.to_string()));
        }
        self.order.write().expect("order lock poisoned").retain(|n| n != name);
        Ok(())
    }

    /// Starts the fixed worker pool and the health loop. Fails on zero
    /// registered workers or a double-start.
    pub fn start(&self) -> Result<()> {
        if self.shared.workers.is_empty() {
            return Err(FleetError::NoWorkers);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(FleetError::Duplicate("orchestrator already started".into()));
        }

        let queue_size = (self.config.worker_count * 2).max(1);
        let (tx, rx) = mpsc::channel::<PendingRequest>(queue_size);
        *self.request_tx.lock().expect("request_tx lock poisoned") = Some(tx);

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut tasks = self.worker_tasks.lock().expect("worker_tasks lock poisoned");
        for _ in 0..self.config.worker_count {
            let rx = rx.clone();
            let shared = self.shared.clone();
            tasks.push(tokio::spawn(worker_task(rx, shared)));
        }
        drop(tasks);

        let client = self.http.clone();
        let shared = self.shared.clone();
        let interval = self.config.health_check_interval;
        *self.health_task.lock().expect("health_task lock poisoned") =
            Some(tokio::spawn(health::run(client, shared, interval)));

        info!(workers = self.shared.workers.len(), "orchestrator started");
        Ok(())
    }

    pub fn submit(
        &self,
        name: &str,
        prompt: impl Into<String>,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<ExecutionResult>> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(FleetError::PoolClosed);
        }
        let record = self
            .shared
            .workers
            .get(name)
            .ok_or_else(|| FleetError::NotFound(name.to_string()))?;
        if !record.health.healthy.load(Ordering::Relaxed) {
            return Err(FleetError::NoHealthyWorkers);
        }
        self.enqueue(name.to_string(), prompt.into(), timeout)
    }

    /// Chooses among healthy workers the one with the fewest consecutive
    /// failures; ties are broken by registration order.
    pub fn submit_balanced(
        &self,
        prompt: impl Into<String>,
        timeout: Duration,
    ) -> Result<(oneshot::Receiver<ExecutionResult>, String)> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(FleetError::PoolClosed);
        }
        let chosen = self
            .order
            .read()
            .expect("order lock poisoned")
            .iter()
            .filter_map(|name| {
                self.shared.workers.get(name).and_then(|record| {
                    if record.health.healthy.load(Ordering::Relaxed) {
                        Some((
                            name.clone(),
                            record.health.consecutive_failures.load(Ordering::Relaxed),
                        ))
                    } else {
                        None
                    }
                })
            })
            .min_by_key(|(_, failures)| *failures)
            .map(|(name, _)| name)
            .ok_or(FleetError::NoHealthyWorkers)?;

        let rx = self.enqueue(chosen.clone(), prompt.into(), timeout)?;
        Ok((rx, chosen))
    }

    fn enqueue(
        &self,
        worker_name: String,
        prompt: String,
        deadline: Duration,
    ) -> Result<oneshot::Receiver<ExecutionResult>> {
        let guard = self.request_tx.lock().expect("request_tx lock poisoned");
        let tx = guard.as_ref().ok_or(FleetError::PoolClosed)?;
        let (respond_to, rx) = oneshot::channel();
        tx.try_send(PendingRequest {
            worker_name,
            prompt,
            deadline,
            respond_to,
        })
        .map_err(|_| FleetError::QueueFull)?;
        Ok(rx)
    }

    /// Idempotent. A second call returns `PoolClosed` as the "already
    /// shutting down" sentinel without blocking.
    pub async fn shutdown(&self, grace_timeout: Duration) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return Err(FleetError::PoolClosed);
        }

        self.request_tx.lock().expect("request_tx lock poisoned").take();
        if let Some(handle) = self.health_task.lock().expect("health_task lock poisoned").take() {
            handle.abort();
        }

        let tasks: Vec<_> = self
            .worker_tasks
            .lock()
            .expect("worker_tasks lock poisoned")
            .drain(..)
            .collect();

        let join_all = async {
            for task in tasks {
                let _ = task.await;
            }
        };
        match tokio::time::timeout(grace_timeout, join_all).await {
            Ok(_) => Ok(()),
            Err(_) => {
                warn!("orchestrator shutdown exceeded grace timeout");
                Err(FleetError::Timeout)
            }
        }
    }

    pub fn status(&self) -> HashMap<String, WorkerStatus> {
        self.shared
            .workers
            .iter()
            .map(|entry| {
                let record = entry.value();
                (
                    record.name.clone(),
                    WorkerStatus {
                        healthy: record.health.healthy.load(Ordering::Relaxed),
                        failures: record.health.failures.load(Ordering::Relaxed),
                        successes: record.health.successes.load(Ordering::Relaxed),
                        last_health_at: *record
                            .health
                            .last_health_at
                            .lock()
                            .expect("health mutex poisoned"),
                        url: record.entry.base_url.clone(),
                    },
                )
            })
            .collect()
    }

    pub fn metrics(&self) -> OrchestratorMetrics {
        let healthy = self
            .shared
            .workers
            .iter()
            .filter(|e| e.value().health.healthy.load(Ordering::Relaxed))
            .count();
        OrchestratorMetrics {
            total: self.shared.metrics.total.load(Ordering::Relaxed),
            success: self.shared.metrics.success.load(Ordering::Relaxed),
            failed: self.shared.metrics.failed.load(Ordering::Relaxed),
            avg_latency_ms: *self.shared.metrics.latency.lock().expect("metrics mutex poisoned"),
            healthy,
            total_workers: self.shared.workers.len(),
        }
    }
}

async fn worker_task(rx: Arc<tokio::sync::Mutex<mpsc::Receiver<PendingRequest>>>, shared: Arc<Shared>) {
    loop {
        let request = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(request) = request else {
            return;
        };

        let start = Instant::now();
        let record = shared.workers.get(&request.worker_name).map(|e| e.value().clone());

        let outcome: std::result::Result<String, String> = match record {
            Some(record) => {
                match tokio::time::timeout(
                    request.deadline,
                    record.entry.handle.execute(&request.prompt, request.deadline),
                )
                .await
                {
                    Ok(Ok(response)) if !response.is_empty() => Ok(response),
                    Ok(Ok(_)) => Err("worker returned an empty response".to_string()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err("request timed out".to_string()),
                }
            }
            None => Err(format!("worker {} no longer registered", request.worker_name)),
        };

        let duration = start.elapsed();
        shared
            .metrics
            .record(outcome.is_ok(), duration.as_secs_f64() * 1000.0);

        let result = ExecutionResult {
            response: outcome.as_ref().ok().cloned(),
            error: outcome.err(),
            duration,
            worker_name: request.worker_name,
        };
        let _ = request.respond_to.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::test_support::MockWorker;

    fn orchestrator(worker_count: usize) -> Orchestrator {
        Orchestrator::new(OrchestratorConfig {
            health_check_interval: Duration::from_secs(3600),
            worker_count,
        })
    }

    #[test]
    fn register_rejects_duplicates_and_empty_names() {
        let orch = orchestrator(1);
        assert!(orch
            .register("", Arc::new(MockWorker::new()), "http://x", Duration::from_secs(1))
            .is_err());
        orch.register("a", Arc::new(MockWorker::new()), "http://a", Duration::from_secs(1))
            .unwrap();
        assert!(orch
            .register("a", Arc::new(MockWorker::new()), "http://a", Duration::from_secs(1))
            .is_err());
    }

    #[test]
    fn start_fails_with_zero_workers() {
        let orch = orchestrator(2);
        assert!(matches!(orch.start(), Err(FleetError::NoWorkers)));
    }

    #[tokio::test]
    async fn start_twice_is_an_error() {
        let orch = orchestrator(1);
        orch.register("a", Arc::new(MockWorker::new()), "http://a", Duration::from_secs(1))
            .unwrap();
        orch.start().unwrap();
        assert!(orch.start().is_err());
        orch.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn submit_executes_and_delivers_result() {
        let orch = orchestrator(1);
        orch.register("a", Arc::new(MockWorker::new()), "http://a", Duration::from_secs(1))
            .unwrap();
        orch.start().unwrap();

        let rx = orch.submit("a", "hello", Duration::from_secs(1)).unwrap();
        let result = rx.await.unwrap();
        assert_eq!(result.response.as_deref(), Some("echo: hello"));
        assert!(result.error.is_none());

        orch.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn submit_unknown_worker_is_not_found() {
        let orch = orchestrator(1);
        orch.register("a", Arc::new(MockWorker::new()), "http://a", Duration::from_secs(1))
            .unwrap();
        orch.start().unwrap();
        assert!(matches!(
            orch.submit("ghost", "hi", Duration::from_secs(1)),
            Err(FleetError::NotFound(_))
        ));
        orch.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn submit_balanced_picks_fewest_consecutive_failures() {
        let orch = orchestrator(2);
        orch.register("a", Arc::new(MockWorker::new()), "http://a", Duration::from_secs(1))
            .unwrap();
        orch.register("b", Arc::new(MockWorker::new()), "http://b", Duration::from_secs(1))
            .unwrap();
        orch.shared
            .workers
            .get("a")
            .unwrap()
            .health
            .consecutive_failures
            .store(2, Ordering::Relaxed);
        orch.start().unwrap();

        let (rx, chosen) = orch
            .submit_balanced("hello", Duration::from_secs(1))
            .unwrap();
        assert_eq!(chosen, "b");
        let result = rx.await.unwrap();
        assert_eq!(result.worker_name, "b");

        orch.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let orch = orchestrator(1);
        orch.register("a", Arc::new(MockWorker::new()), "http://a", Duration::from_secs(1))
            .unwrap();
        orch.start().unwrap();
        orch.shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(
            orch.shutdown(Duration::from_secs(1)).await,
            Err(FleetError::PoolClosed)
        ));
    }
}
