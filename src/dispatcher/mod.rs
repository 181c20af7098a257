//! Task Dispatcher (C9): bounded generic worker pool with priorities,
//! cancellation, progress callbacks, and a bounded error history.

mod task;

pub use task::{Priority, Status, Task, TaskExecutionError};

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::cancellation::Cancellation;
use crate::error::{FleetError, Result};

const ERROR_RING_CAPACITY: usize = 1000;
const MIN_WORKERS: usize = 1;
const MAX_WORKERS: usize = 10;

/// The work function every task is run through. Boxed/pinned since trait
/// objects can't return an opaque `async fn` directly.
pub type AgentFn = Arc<
    dyn Fn(Task, Cancellation) -> Pin<Box<dyn Future<Output = std::result::Result<serde_json::Value, String>> + Send>>
        + Send
        + Sync,
>;

/// Optional progress observer: `(task_id, percent)`, called at 0 (submit),
/// 10 (running), and 100 (terminal).
pub type ProgressCallback = Arc<dyn Fn(&str, u8) + Send + Sync>;

/// `{totalInMap, completed, failed, cancelled, pending, workers}`.
#[derive(Debug, Clone, Copy)]
pub struct DispatcherMetrics {
    pub total_in_map: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub pending: u64,
    pub workers: usize,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

/// One priority tier's queue: an `mpsc` receiver guarded for shared polling,
/// plus a closed flag so [`next_task_id`] can tell "empty for now" apart
/// from "never sending again" once the sender half is dropped at shutdown.
struct Lane {
    rx: tokio::sync::Mutex<mpsc::Receiver<String>>,
    closed: AtomicBool,
}

impl Lane {
    fn new(rx: mpsc::Receiver<String>) -> Self {
        Self {
            rx: tokio::sync::Mutex::new(rx),
            closed: AtomicBool::new(false),
        }
    }

    /// Non-blocking poll: `Some(id)` if a task was queued, `None` if the
    /// lane is empty right now (whether or not it's closed).
    async fn try_take(&self) -> Option<String> {
        match self.rx.lock().await.try_recv() {
            Ok(id) => Some(id),
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => {
                self.closed.store(true, Ordering::Release);
                None
            }
        }
    }

    /// Blocking receive, used only once every lane has been drained by
    /// `try_take` and a worker has nothing better to do.
    async fn recv(&self) -> Option<String> {
        let id = self.rx.lock().await.recv().await;
        if id.is_none() {
            self.closed.store(true, Ordering::Release);
        }
        id
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// The three priority-tiered queues workers pull from, high before normal
/// before low, per task.
struct PriorityReceivers {
    high: Lane,
    normal: Lane,
    low: Lane,
}

/// Pulls the next task id, preferring higher priority lanes. Tries all three
/// non-blockingly first (so a burst of `High` work never waits behind an
/// already-pending `recv` on `Low`), then falls back to a biased `select!`
/// that favors `High` over `Normal` over `Low` when nothing was immediately
/// ready. Returns `None` only once every lane is closed and drained.
async fn next_task_id(rx: &PriorityReceivers) -> Option<String> {
    if let Some(id) = rx.high.try_take().await {
        return Some(id);
    }
    if let Some(id) = rx.normal.try_take().await {
        return Some(id);
    }
    if let Some(id) = rx.low.try_take().await {
        return Some(id);
    }

    loop {
        if rx.high.is_closed() && rx.normal.is_closed() && rx.low.is_closed() {
            return None;
        }
        tokio::select! {
            biased;
            id = rx.high.recv(), if !rx.high.is_closed() => {
                if id.is_some() {
                    return id;
                }
            }
            id = rx.normal.recv(), if !rx.normal.is_closed() => {
                if id.is_some() {
                    return id;
                }
            }
            id = rx.low.recv(), if !rx.low.is_closed() => {
                if id.is_some() {
                    return id;
                }
            }
        }
    }
}

/// Send side mirroring [`PriorityReceivers`]; `submit` picks the channel by
/// the task's own `Priority`.
struct PrioritySenders {
    high: mpsc::Sender<String>,
    normal: mpsc::Sender<String>,
    low: mpsc::Sender<String>,
}

impl PrioritySenders {
    fn sender_for(&self, priority: Priority) -> &mpsc::Sender<String> {
        match priority {
            Priority::High => &self.high,
            Priority::Normal => &self.normal,
            Priority::Low => &self.low,
        }
    }
}

struct Shared {
    tasks: DashMap<String, Arc<Mutex<Task>>>,
    cancellations: DashMap<String, Cancellation>,
    errors: Mutex<VecDeque<TaskExecutionError>>,
    counters: Counters,
    agent_fn: AgentFn,
    progress: Option<ProgressCallback>,
}

impl Shared {
    fn report_progress(&self, id: &str, percent: u8) {
        if let Some(cb) = &self.progress {
            cb(id, percent);
        }
    }

    fn push_error(&self, error: TaskExecutionError) {
        let mut errors = self.errors.lock().expect("error ring poisoned");
        if errors.len() >= ERROR_RING_CAPACITY {
            errors.pop_front();
        }
        errors.push_back(error);
    }
}

/// Bounded worker pool over generic tasks.
pub struct TaskDispatcher {
    shared: Arc<Shared>,
    worker_count: usize,
    queue_tx: Mutex<Option<PrioritySenders>>,
    worker_tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    shutdown_started: AtomicBool,
}

impl TaskDispatcher {
    /// Validates `agent_fn` usage implicitly (it's required, non-Option)
    /// and `1 ≤ workers ≤ 10`.
    pub fn new(agent_fn: AgentFn, workers: usize) -> Result<Arc<Self>> {
        Self::new_with_progress(agent_fn, workers, None)
    }

    /// Same as [`TaskDispatcher::new`] but attaches a progress observer,
    /// invoked at submit (0), running (10), and terminal (100).
    pub fn new_with_progress(
        agent_fn: AgentFn,
        workers: usize,
        progress: Option<ProgressCallback>,
    ) -> Result<Arc<Self>> {
        if !(MIN_WORKERS..=MAX_WORKERS).contains(&workers) {
            return Err(FleetError::InvalidRequest(format!(
                "worker count must be between {MIN_WORKERS} and {MAX_WORKERS}"
            )));
        }
        Ok(Arc::new(Self {
            shared: Arc::new(Shared {
                tasks: DashMap::new(),
                cancellations: DashMap::new(),
                errors: Mutex::new(VecDeque::with_capacity(ERROR_RING_CAPACITY)),
                counters: Counters::default(),
                agent_fn,
                progress,
            }),
            worker_count: workers,
            queue_tx: Mutex::new(None),
            worker_tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            shutdown_started: AtomicBool::new(false),
        }))
    }

    /// Starts the worker pool. Double-start is an error.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(FleetError::Duplicate("dispatcher already started".into()));
        }
        let queue_size = self.worker_count * 100;
        let (high_tx, high_rx) = mpsc::channel::<String>(queue_size);
        let (normal_tx, normal_rx) = mpsc::channel::<String>(queue_size);
        let (low_tx, low_rx) = mpsc::channel::<String>(queue_size);
        *self.queue_tx.lock().expect("queue_tx lock poisoned") = Some(PrioritySenders {
            high: high_tx,
            normal: normal_tx,
            low: low_tx,
        });

        let rx = Arc::new(PriorityReceivers {
            high: Lane::new(high_rx),
            normal: Lane::new(normal_rx),
            low: Lane::new(low_rx),
        });
        let mut tasks = self.worker_tasks.lock().expect("worker_tasks lock poisoned");
        for _ in 0..self.worker_count {
            let rx = rx.clone();
            let shared = self.shared.clone();
            tasks.push(tokio::spawn(worker_loop(rx, shared)));
        }
        Ok(())
    }

    pub fn submit(&self, mut task: Task) -> Result<()> {
        if !self.started.load(Ordering::Acquire) || self.shutdown_started.load(Ordering::Acquire) {
            return Err(FleetError::PoolClosed);
        }
        if task.id.is_empty() {
            return Err(FleetError::InvalidRequest("task id must not be empty".into()));
        }
        if self.shared.tasks.contains_key(&task.id) {
            return Err(FleetError::Duplicate(task.id));
        }

        task.status = Status::Pending;
        task.created_at = Some(Utc::now());
        let id = task.id.clone();
        let priority = task.priority;

        self.shared.tasks.insert(id.clone(), Arc::new(Mutex::new(task)));
        self.shared.cancellations.insert(id.clone(), Cancellation::new());
        self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);

        let guard = self.queue_tx.lock().expect("queue_tx lock poisoned");
        let senders = guard.as_ref().ok_or(FleetError::PoolClosed)?;
        let tx = senders.sender_for(priority);
        if tx.try_send(id.clone()).is_err() {
            self.shared.tasks.remove(&id);
            self.shared.cancellations.remove(&id);
            return Err(FleetError::QueueFull);
        }
        drop(guard);

        self.shared.report_progress(&id, 0);
        Ok(())
    }

    pub fn submit_batch(&self, tasks: Vec<Task>) -> Vec<Result<()>> {
        tasks.into_iter().map(|task| self.submit(task)).collect()
    }

    /// `Pending → Cancelled` immediately; `Running → Cancelled` is
    /// best-effort via the task's cancellation token. Terminal statuses
    /// are rejected. The cancelled counter is bumped exactly once per call.
    pub fn cancel(&self, id: &str) -> Result<()> {
        let entry = self
            .shared
            .tasks
            .get(id)
            .ok_or_else(|| FleetError::NotFound(id.to_string()))?
            .clone();
        let mut task = entry.lock().expect("task mutex poisoned");
        if task.status.is_terminal() {
            return Err(FleetError::InvalidRequest(format!(
                "task {id} is already in a terminal state"
            )));
        }

        if let Some(token) = self.shared.cancellations.get(id) {
            token.cancel();
        }

        let was_pending = task.status == Status::Pending;
        task.status = Status::Cancelled;
        task.completed_at = Some(Utc::now());
        drop(task);

        self.shared.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        self.shared.report_progress(id, 100);

        if was_pending {
            self.shared.tasks.remove(id);
            self.shared.cancellations.remove(id);
        }
        Ok(())
    }

    pub fn status(&self, id: &str) -> Result<Status> {
        self.shared
            .tasks
            .get(id)
            .map(|t| t.lock().expect("task mutex poisoned").status)
            .ok_or_else(|| FleetError::NotFound(id.to_string()))
    }

    pub fn get(&self, id: &str) -> Result<Task> {
        self.shared
            .tasks
            .get(id)
            .map(|t| t.lock().expect("task mutex poisoned").clone())
            .ok_or_else(|| FleetError::NotFound(id.to_string()))
    }

    /// Blocks until every worker task has exited (intended to be called
    /// after `shutdown`).
    pub async fn wait(&self) {
        let tasks: Vec<_> = self
            .worker_tasks
            .lock()
            .expect("worker_tasks lock poisoned")
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Idempotent (once-guard). Stops accepting new submissions, closes the
    /// queue, cancels every in-flight task's token, and joins workers with
    /// `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        if self.shutdown_started.swap(true, Ordering::AcqRel) {
            return Err(FleetError::PoolClosed);
        }
        self.queue_tx.lock().expect("queue_tx lock poisoned").take();
        for entry in self.shared.cancellations.iter() {
            entry.value().cancel();
        }

        let join_all = self.wait();
        match tokio::time::timeout(timeout, join_all).await {
            Ok(_) => Ok(()),
            Err(_) => {
                warn!("dispatcher shutdown exceeded timeout");
                Err(FleetError::Timeout)
            }
        }
    }

    pub fn metrics(&self) -> DispatcherMetrics {
        let submitted = self.shared.counters.submitted.load(Ordering::Relaxed);
        let completed = self.shared.counters.completed.load(Ordering::Relaxed);
        let failed = self.shared.counters.failed.load(Ordering::Relaxed);
        let cancelled = self.shared.counters.cancelled.load(Ordering::Relaxed);
        DispatcherMetrics {
            total_in_map: self.shared.tasks.len(),
            completed,
            failed,
            cancelled,
            pending: submitted.saturating_sub(completed + failed + cancelled),
            workers: self.worker_count,
        }
    }

    pub fn error_history(&self) -> Vec<TaskExecutionError> {
        self.shared.errors.lock().expect("error ring poisoned").iter().cloned().collect()
    }
}

async fn worker_loop(rx: Arc<PriorityReceivers>, shared: Arc<Shared>) {
    loop {
        let Some(id) = next_task_id(&rx).await else {
            return;
        };

        let Some(entry) = shared.tasks.get(&id).map(|e| e.clone()) else {
            continue;
        };

        {
            let task = entry.lock().expect("task mutex poisoned");
            if task.status != Status::Pending {
                continue;
            }
        }

        let cancellation = shared
            .cancellations
            .get(&id)
            .map(|c| c.clone())
            .unwrap_or_default();

        let task_snapshot = {
            let mut task = entry.lock().expect("task mutex poisoned");
            task.status = Status::Running;
            task.started_at = Some(Utc::now());
            task.clone()
        };
        shared.report_progress(&id, 10);

        let outcome = (shared.agent_fn)(task_snapshot, cancellation).await;

        let mut task = entry.lock().expect("task mutex poisoned");
        if task.status == Status::Cancelled {
            // `cancel()` already transitioned this Running task to
            // Cancelled and bumped the cancelled counter while the agent_fn
            // was in flight; it left the task in the map for this worker to
            // clean up. Do not overwrite the status or double-count it as
            // Completed/Failed on top of Cancelled.
            drop(task);
            shared.tasks.remove(&id);
            shared.cancellations.remove(&id);
            continue;
        }
        task.completed_at = Some(Utc::now());
        match outcome {
            Ok(value) => {
                task.status = Status::Completed;
                task.result = Some(value);
                shared.counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(message) => {
                task.status = Status::Failed;
                task.error = Some(message.clone());
                shared.counters.failed.fetch_add(1, Ordering::Relaxed);
                shared.push_error(TaskExecutionError {
                    task_id: id.clone(),
                    message,
                    occurred_at: Utc::now(),
                });
            }
        }
        drop(task);
        shared.report_progress(&id, 100);

        shared.tasks.remove(&id);
        shared.cancellations.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration as StdDuration;

    fn immediate_ok_fn() -> AgentFn {
        Arc::new(
            |task: Task, _cancel: Cancellation| -> Pin<Box<dyn Future<Output = std::result::Result<serde_json::Value, String>> + Send>> {
                Box::pin(async move { Ok(json!({ "echo": task.id })) })
            },
        )
    }

    fn sleeping_fn() -> AgentFn {
        Arc::new(
            |_task: Task, cancel: Cancellation| -> Pin<Box<dyn Future<Output = std::result::Result<serde_json::Value, String>> + Send>> {
                Box::pin(async move {
                    for _ in 0..200 {
                        if cancel.is_cancelled() {
                            return Err("cancelled".to_string());
                        }
                        tokio::time::sleep(StdDuration::from_millis(10)).await;
                    }
                    Ok(json!("done"))
                })
            },
        )
    }

    #[test]
    fn new_rejects_out_of_range_worker_counts() {
        assert!(TaskDispatcher::new(immediate_ok_fn(), 0).is_err());
        assert!(TaskDispatcher::new(immediate_ok_fn(), 11).is_err());
    }

    #[tokio::test]
    async fn submit_rejects_empty_id_and_duplicates() {
        let dispatcher = TaskDispatcher::new(immediate_ok_fn(), 1).unwrap();
        dispatcher.start().unwrap();

        assert!(dispatcher
            .submit(Task::new("", Priority::Normal, json!(null)))
            .is_err());

        dispatcher
            .submit(Task::new("a", Priority::Normal, json!(null)))
            .unwrap();
        assert!(dispatcher
            .submit(Task::new("a", Priority::Normal, json!(null)))
            .is_err());

        dispatcher.shutdown(StdDuration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn submitted_task_completes() {
        let dispatcher = TaskDispatcher::new(immediate_ok_fn(), 1).unwrap();
        dispatcher.start().unwrap();
        dispatcher
            .submit(Task::new("a", Priority::Normal, json!(null)))
            .unwrap();

        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert!(dispatcher.get("a").is_err()); // removed from map on terminal transition
        assert_eq!(dispatcher.metrics().completed, 1);

        dispatcher.shutdown(StdDuration::from_secs(1)).await.unwrap();
    }

    /// High-priority work queued behind pending Normal/Low tasks still runs
    /// first once the single worker frees up.
    #[tokio::test]
    async fn high_priority_tasks_run_before_lower_ones() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let recording_order = order.clone();
        let agent_fn: AgentFn = Arc::new(move |task: Task, _cancel: Cancellation| {
            let order = recording_order.clone();
            Box::pin(async move {
                if task.id == "occupant" {
                    tokio::time::sleep(StdDuration::from_millis(50)).await;
                }
                order.lock().expect("order mutex poisoned").push(task.id.clone());
                Ok(json!(null))
            })
        });

        let dispatcher = TaskDispatcher::new(agent_fn, 1).unwrap();
        dispatcher.start().unwrap();

        // Occupy the lone worker so low/normal/high all queue up behind it
        // before any of them is picked.
        dispatcher
            .submit(Task::new("occupant", Priority::Normal, json!(null)))
            .unwrap();
        tokio::time::sleep(StdDuration::from_millis(10)).await;

        dispatcher
            .submit(Task::new("low", Priority::Low, json!(null)))
            .unwrap();
        dispatcher
            .submit(Task::new("normal", Priority::Normal, json!(null)))
            .unwrap();
        dispatcher
            .submit(Task::new("high", Priority::High, json!(null)))
            .unwrap();

        tokio::time::sleep(StdDuration::from_millis(100)).await;
        dispatcher.shutdown(StdDuration::from_secs(1)).await.unwrap();

        let seen = order.lock().expect("order mutex poisoned").clone();
        assert_eq!(seen, vec!["occupant", "high", "normal", "low"]);
    }

    /// Scenario 6: cancelling a pending task before it runs.
    #[tokio::test]
    async fn scenario_dispatcher_cancellation() {
        let dispatcher = TaskDispatcher::new(sleeping_fn(), 1).unwrap();
        dispatcher.start().unwrap();

        // Occupy the single worker so the next task stays Pending.
        dispatcher
            .submit(Task::new("occupant", Priority::Normal, json!(null)))
            .unwrap();
        tokio::time::sleep(StdDuration::from_millis(20)).await;

        dispatcher
            .submit(Task::new("t", Priority::High, json!(null)))
            .unwrap();
        dispatcher.cancel("t").unwrap();

        assert_eq!(dispatcher.metrics().cancelled, 1);
        assert!(dispatcher.get("t").is_err());

        dispatcher.shutdown(StdDuration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn cancel_unknown_task_is_not_found() {
        let dispatcher = TaskDispatcher::new(immediate_ok_fn(), 1).unwrap();
        dispatcher.start().unwrap();
        assert!(dispatcher.cancel("ghost").is_err());
        dispatcher.shutdown(StdDuration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let dispatcher = TaskDispatcher::new(immediate_ok_fn(), 1).unwrap();
        dispatcher.start().unwrap();
        dispatcher.shutdown(StdDuration::from_secs(1)).await.unwrap();
        assert!(matches!(
            dispatcher.shutdown(StdDuration::from_secs(1)).await,
            Err(FleetError::PoolClosed)
        ));
    }
}
