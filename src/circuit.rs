//! Per-worker circuit breaker (C1).
//!
//! Tagged variant over boolean flags so transitions stay total: a breaker
//! is always in exactly one of `Closed | Open | HalfOpen`, never a
//! combination of independent booleans.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Breaker configuration. Defaults match the spec: open after 5 consecutive
/// failures, close after 3 consecutive half-open successes, 30s open
/// timeout, 2 concurrent half-open probes.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout: Duration,
    pub half_open_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            timeout: Duration::from_secs(30),
            half_open_probes: 2,
        }
    }
}

/// Publicly observable breaker status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerStatus {
    Closed,
    Open,
    HalfOpen,
}

enum State {
    Closed { consecutive_failures: u32 },
    Open { since: Instant },
    HalfOpen { probes_remaining: u32, consecutive_successes: u32 },
}

struct Inner {
    state: State,
}

/// A single worker's circuit breaker. Safe for concurrent callers: all
/// state lives behind one short-held `Mutex` guard, never held across an
/// external call.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: State::Closed {
                    consecutive_failures: 0,
                },
            }),
        }
    }

    /// Whether a request is currently permitted. Transitions `Open ->
    /// HalfOpen` in place when the timeout has elapsed, returning `true`
    /// for the request that triggers the transition (it becomes a probe).
    ///
    /// This is the only place a `HalfOpen` probe slot is consumed: a grant
    /// decrements `probes_remaining` immediately, so `P` concurrent callers
    /// racing this method see at most `P` grants regardless of how long
    /// their underlying requests take to complete.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        match &mut inner.state {
            State::Closed { .. } => true,
            State::Open { since } => {
                if since.elapsed() >= self.config.timeout {
                    inner.state = State::HalfOpen {
                        probes_remaining: self.config.half_open_probes.saturating_sub(1),
                        consecutive_successes: 0,
                    };
                    true
                } else {
                    false
                }
            }
            State::HalfOpen { probes_remaining, .. } => {
                if *probes_remaining > 0 {
                    *probes_remaining -= 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        match &mut inner.state {
            State::Closed { consecutive_failures } => {
                *consecutive_failures = 0;
            }
            State::Open { .. } => {
                // A success while nominally open only happens if a caller
                // ignored `allow_request`; treat it like a successful probe.
                inner.state = State::HalfOpen {
                    probes_remaining: self.config.half_open_probes.saturating_sub(1),
                    consecutive_successes: 1,
                };
                self.maybe_close(&mut inner.state);
            }
            State::HalfOpen {
                consecutive_successes,
                ..
            } => {
                // Probe admission already decremented `probes_remaining` in
                // `allow_request`; recording the outcome only tracks the
                // consecutive-success streak needed to close.
                *consecutive_successes += 1;
                self.maybe_close(&mut inner.state);
            }
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        match &mut inner.state {
            State::Closed { consecutive_failures } => {
                *consecutive_failures += 1;
                if *consecutive_failures >= self.config.failure_threshold {
                    inner.state = State::Open {
                        since: Instant::now(),
                    };
                }
            }
            State::Open { .. } => {
                inner.state = State::Open {
                    since: Instant::now(),
                };
            }
            State::HalfOpen { .. } => {
                inner.state = State::Open {
                    since: Instant::now(),
                };
            }
        }
    }

    fn maybe_close(&self, state: &mut State) {
        if let State::HalfOpen {
            consecutive_successes,
            ..
        } = state
        {
            if *consecutive_successes >= self.config.success_threshold {
                *state = State::Closed {
                    consecutive_failures: 0,
                };
            }
        }
    }

    pub fn status(&self) -> BreakerStatus {
        let inner = self.inner.lock().expect("breaker mutex poisoned");
        match inner.state {
            State::Closed { .. } => BreakerStatus::Closed,
            State::Open { .. } => BreakerStatus::Open,
            State::HalfOpen { .. } => BreakerStatus::HalfOpen,
        }
    }

    /// Whether this worker is "ready": closed, or open with the timeout
    /// already elapsed (eligible for half-open probing without mutating
    /// state — used for selection-set snapshots that must not have
    /// side effects).
    pub fn is_ready(&self) -> bool {
        let inner = self.inner.lock().expect("breaker mutex poisoned");
        match inner.state {
            State::Closed { .. } | State::HalfOpen { .. } => true,
            State::Open { since } => since.elapsed() >= self.config.timeout,
        }
    }

    /// Clears all counters and forces the breaker back to `Closed`.
    pub fn force_close(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        inner.state = State::Closed {
            consecutive_failures: 0,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 5,
            success_threshold: 3,
            timeout: Duration::from_millis(30),
            half_open_probes: 2,
        }
    }

    #[test]
    fn opens_after_n_consecutive_failures() {
        let breaker = CircuitBreaker::new(test_config());
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert_eq!(breaker.status(), BreakerStatus::Closed);
        breaker.record_failure();
        assert_eq!(breaker.status(), BreakerStatus::Open);
    }

    #[test]
    fn success_resets_consecutive_failures_while_closed() {
        let breaker = CircuitBreaker::new(test_config());
        for _ in 0..4 {
            breaker.record_failure();
        }
        breaker.record_success();
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert_eq!(breaker.status(), BreakerStatus::Closed);
    }

    #[test]
    fn half_opens_after_timeout_then_closes_after_m_successes() {
        let breaker = CircuitBreaker::new(test_config());
        for _ in 0..5 {
            breaker.record_failure();
        }
        assert_eq!(breaker.status(), BreakerStatus::Open);
        assert!(!breaker.allow_request());

        std::thread::sleep(Duration::from_millis(35));
        assert!(breaker.allow_request());
        assert_eq!(breaker.status(), BreakerStatus::HalfOpen);

        breaker.record_success();
        breaker.record_success();
        assert_eq!(breaker.status(), BreakerStatus::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.status(), BreakerStatus::Closed);
    }

    #[test]
    fn any_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(test_config());
        for _ in 0..5 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(35));
        assert!(breaker.allow_request());
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.status(), BreakerStatus::Open);
    }

    #[test]
    fn force_close_is_idempotent() {
        let breaker = CircuitBreaker::new(test_config());
        for _ in 0..5 {
            breaker.record_failure();
        }
        breaker.force_close();
        assert_eq!(breaker.status(), BreakerStatus::Closed);
        breaker.force_close();
        assert_eq!(breaker.status(), BreakerStatus::Closed);
    }

    #[test]
    fn is_ready_true_for_open_with_elapsed_timeout_without_mutating() {
        let breaker = CircuitBreaker::new(test_config());
        for _ in 0..5 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(35));
        assert!(breaker.is_ready());
        // Snapshot check must not have transitioned state.
        assert_eq!(breaker.status(), BreakerStatus::Open);
    }
}
