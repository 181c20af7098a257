//! Agent Pool (C7): bounded lifecycle management over a set of [`Agent`]s.

mod config;

pub use config::{PoolConfig, ResourceQuota};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::agent::{Agent, AgentState};
use crate::error::{FleetError, Result};
use crate::worker::WorkerHandle;

/// Synchronous factory for a new worker handle. Kept sync because spawning
/// an `Agent` is itself synchronous bookkeeping; async worker construction
/// belongs to the caller's own setup before handing a ready handle in.
pub type AgentFactory = Arc<dyn Fn() -> Result<Arc<dyn WorkerHandle>> + Send + Sync>;

/// Point-in-time pool composition, returned by [`AgentPool::status`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStatus {
    pub active: usize,
    pub idle: usize,
    pub recycling: usize,
    pub total: usize,
    pub min: usize,
    pub max: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScaleDirection {
    Up,
    Down,
}

/// Bounded pool of long-lived worker handles with spawn/recycle/reap and
/// utilization-driven auto-scale.
pub struct AgentPool {
    config: PoolConfig,
    factory: AgentFactory,
    registry: dashmap::DashMap<String, Arc<Agent>>,
    free: Mutex<VecDeque<Arc<Agent>>>,
    notify: Notify,
    next_id: AtomicU64,
    closed: AtomicBool,
    last_scale: Mutex<Option<ScaleDirection>>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl AgentPool {
    /// Builds the pool, clamps `config`, and fills it to `min`. On any
    /// spawn failure while warming, the partially-built pool is closed and
    /// the error returned. Starts the maintenance loop if `maintenance_interval`
    /// is non-zero.
    pub fn new(config: PoolConfig, factory: AgentFactory) -> Result<Arc<Self>> {
        let config = config.clamped();
        let pool = Arc::new(Self {
            config,
            factory,
            registry: dashmap::DashMap::new(),
            free: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            last_scale: Mutex::new(None),
            maintenance: Mutex::new(None),
        });

        if let Err(e) = pool.warm_pool() {
            pool.close();
            return Err(e);
        }

        if !pool.config.maintenance_interval.is_zero() {
            pool.clone().start_maintenance();
        }

        Ok(pool)
    }

    fn spawn_one(&self) -> Result<Arc<Agent>> {
        let handle = (self.factory)()?;
        let id = format!("agent-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let agent = Arc::new(Agent::new(id.clone(), handle));
        self.registry.insert(id, agent.clone());
        Ok(agent)
    }

    /// Spawn agents until the registry holds at least `min`, pushing each
    /// newly-spawned (idle) agent onto the free queue.
    pub fn warm_pool(&self) -> Result<()> {
        while self.registry.len() < self.config.min {
            let agent = self.spawn_one()?;
            self.free.lock().expect("free queue poisoned").push_back(agent);
        }
        Ok(())
    }

    /// Terminate idle agents above `min`.
    pub fn drain_pool(&self) {
        loop {
            if self.registry.len() <= self.config.min {
                return;
            }
            let agent = {
                let mut free = self.free.lock().expect("free queue poisoned");
                free.pop_front()
            };
            match agent {
                Some(agent) => {
                    agent.terminate();
                    self.registry.remove(&agent.id);
                }
                None => return,
            }
        }
    }

    fn should_recycle(&self, agent: &Agent) -> bool {
        agent.age() > self.config.quota.max_instance_age
            || agent.recycle_count() >= self.config.quota.max_recycles_per_handle
            || agent.request_count() > self.config.recycle_after_requests
    }

    /// Default-deadline acquire (30s), per the spec's default.
    pub async fn acquire(&self) -> Result<Arc<Agent>> {
        self.acquire_with_deadline(Duration::from_secs(30)).await
    }

    pub async fn acquire_with_deadline(&self, deadline: Duration) -> Result<Arc<Agent>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FleetError::PoolClosed);
        }
        let expires_at = Instant::now() + deadline;

        loop {
            if let Some(agent) = self.free.lock().expect("free queue poisoned").pop_front() {
                if agent.state() == AgentState::Terminated {
                    self.registry.remove(&agent.id);
                    continue;
                }
                if !agent.handle().ping().await.unwrap_or(false) {
                    agent.terminate();
                    self.registry.remove(&agent.id);
                    continue;
                }
                agent.mark_active();
                return Ok(agent);
            }

            if self.registry.len() < self.config.max {
                let agent = self.spawn_one()?;
                agent.mark_active();
                return Ok(agent);
            }

            let now = Instant::now();
            if now >= expires_at {
                return Err(FleetError::Timeout);
            }
            let remaining = expires_at - now;
            tokio::select! {
                _ = self.notify.notified() => continue,
                _ = tokio::time::sleep(remaining) => return Err(FleetError::Timeout),
            }
        }
    }

    /// Return an agent taken via [`AgentPool::acquire`]. Recycles instead of
    /// re-queuing when `should_recycle` trips, the free queue is already at
    /// capacity, or the pool is closed.
    pub fn release(&self, agent: Arc<Agent>) {
        if self.closed.load(Ordering::Acquire) {
            agent.terminate();
            self.registry.remove(&agent.id);
            self.notify.notify_waiters();
            return;
        }

        let free_len = self.free.lock().expect("free queue poisoned").len();
        if self.should_recycle(&agent) || free_len >= self.config.max {
            info!(agent = %agent.id, "recycling");
            agent.mark_recycling();
            agent.terminate();
            self.registry.remove(&agent.id);
            if let Err(e) = self.spawn_one().map(|fresh| {
                self.free.lock().expect("free queue poisoned").push_back(fresh);
            }) {
                warn!(error = %e, "failed to spawn replacement after recycle");
            }
        } else {
            agent.mark_idle();
            self.free.lock().expect("free queue poisoned").push_back(agent);
        }
        self.notify.notify_waiters();
    }

    pub fn status(&self) -> PoolStatus {
        let mut status = PoolStatus {
            min: self.config.min,
            max: self.config.max,
            ..Default::default()
        };
        for entry in self.registry.iter() {
            status.total += 1;
            match entry.value().state() {
                AgentState::Active => status.active += 1,
                AgentState::Idle => status.idle += 1,
                AgentState::Recycling => status.recycling += 1,
                AgentState::Terminated => {}
            }
        }
        status
    }

    /// Idempotent. Stops the maintenance loop, terminates every agent, and
    /// closes the free queue. A second call returns `PoolClosed` as the
    /// "already closed" sentinel without blocking.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(FleetError::PoolClosed);
        }
        if let Some(handle) = self.maintenance.lock().expect("maintenance lock poisoned").take() {
            handle.abort();
        }
        for entry in self.registry.iter() {
            entry.value().terminate();
        }
        self.registry.clear();
        self.free.lock().expect("free queue poisoned").clear();
        self.notify.notify_waiters();
        info!("pool closed");
        Ok(())
    }

    fn start_maintenance(self: Arc<Self>) {
        let interval = self.config.maintenance_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if self.closed.load(Ordering::Acquire) {
                    return;
                }
                self.run_maintenance_pass();
            }
        });
        *self.maintenance.lock().expect("maintenance lock poisoned") = Some(handle);
    }

    fn run_maintenance_pass(&self) {
        self.registry
            .retain(|_, agent| agent.state() != AgentState::Terminated);

        let idle_timeout = self.config.idle_timeout;
        let min = self.config.min;
        {
            let mut free = self.free.lock().expect("free queue poisoned");
            let mut kept = VecDeque::with_capacity(free.len());
            while let Some(agent) = free.pop_front() {
                if agent.idle_time() > idle_timeout && self.registry.len() > min {
                    agent.terminate();
                    self.registry.remove(&agent.id);
                } else {
                    kept.push_back(agent);
                }
            }
            *free = kept;
        }

        let status = self.status();
        let utilization = if status.total == 0 {
            0.0
        } else {
            status.active as f64 / status.total as f64
        };

        if utilization > 0.80 && status.total < self.config.max {
            if let Ok(agent) = self.spawn_one() {
                self.free.lock().expect("free queue poisoned").push_back(agent);
                *self.last_scale.lock().expect("scale lock poisoned") = Some(ScaleDirection::Up);
                info!(utilization, total = status.total, "scaled up");
            }
        } else if utilization < 0.20 && status.total > self.config.min {
            let agent = self.free.lock().expect("free queue poisoned").pop_front();
            if let Some(agent) = agent {
                agent.terminate();
                self.registry.remove(&agent.id);
                *self.last_scale.lock().expect("scale lock poisoned") = Some(ScaleDirection::Down);
                info!(utilization, total = status.total, "scaled down");
            }
        }
        self.notify.notify_waiters();
    }
}
