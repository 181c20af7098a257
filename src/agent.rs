//! A single pool-managed worker wrapper (C6): state + counters.
//!
//! State transitions are atomic (a single `AtomicU8`-backed enum swap);
//! the request/recycle counters are independent atomics. `Terminated` is
//! absorbing — once set, no other transition is accepted.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::worker::WorkerHandle;

/// Agent lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AgentState {
    Idle = 0,
    Active = 1,
    Recycling = 2,
    Terminated = 3,
}

impl AgentState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => AgentState::Idle,
            1 => AgentState::Active,
            2 => AgentState::Recycling,
            _ => AgentState::Terminated,
        }
    }
}

/// One worker handle plus pool-managed bookkeeping.
pub struct Agent {
    pub id: String,
    handle: Arc<dyn WorkerHandle>,
    state: AtomicU8,
    request_count: AtomicU64,
    recycle_count: AtomicU64,
    created_at: Instant,
    last_used: std::sync::Mutex<Instant>,
}

impl Agent {
    pub fn new(id: String, handle: Arc<dyn WorkerHandle>) -> Self {
        let now = Instant::now();
        Self {
            id,
            handle,
            state: AtomicU8::new(AgentState::Idle as u8),
            request_count: AtomicU64::new(0),
            recycle_count: AtomicU64::new(0),
            created_at: now,
            last_used: std::sync::Mutex::new(now),
        }
    }

    pub fn handle(&self) -> Arc<dyn WorkerHandle> {
        Arc::clone(&self.handle)
    }

    pub fn state(&self) -> AgentState {
        AgentState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Attempt a transition. Returns `false` without changing anything if
    /// the agent is already `Terminated` (the absorbing state) or if
    /// another transition raced and won.
    pub fn transition(&self, to: AgentState) -> bool {
        loop {
            let current = self.state.load(Ordering::Acquire);
            if AgentState::from_u8(current) == AgentState::Terminated {
                return false;
            }
            if self
                .state
                .compare_exchange(current, to as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn mark_active(&self) -> bool {
        let ok = self.transition(AgentState::Active);
        if ok {
            self.request_count.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    /// Stamps `last_used` at the moment the agent actually goes idle (i.e.
    /// on release), so `idle_time()` measures time since it stopped working
    /// rather than time since it was last picked up.
    pub fn mark_idle(&self) -> bool {
        let ok = self.transition(AgentState::Idle);
        if ok {
            *self.last_used.lock().expect("agent mutex poisoned") = Instant::now();
        }
        ok
    }

    pub fn mark_recycling(&self) -> bool {
        let ok = self.transition(AgentState::Recycling);
        if ok {
            self.recycle_count.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    pub fn terminate(&self) {
        self.state
            .store(AgentState::Terminated as u8, Ordering::Release);
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn recycle_count(&self) -> u64 {
        self.recycle_count.load(Ordering::Relaxed)
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    pub fn idle_time(&self) -> std::time::Duration {
        self.last_used
            .lock()
            .expect("agent mutex poisoned")
            .elapsed()
    }
}
