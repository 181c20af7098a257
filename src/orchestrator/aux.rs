//! Auxiliary traffic-gating primitives exposed by the orchestrator for
//! callers that want them. Neither participates in routing decisions —
//! that's the Task Router's job.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A bare failures-then-cooldown gate, simpler than the tagged-variant
/// breaker in `circuit.rs`: no half-open probing, just closed/open.
pub struct CircuitBreaker {
    max_failures: u32,
    reset_timeout: Duration,
    failures: AtomicU32,
    opened_at: Mutex<Option<Instant>>,
}

impl CircuitBreaker {
    pub fn new(max_failures: u32, reset_timeout: Duration) -> Self {
        Self {
            max_failures,
            reset_timeout,
            failures: AtomicU32::new(0),
            opened_at: Mutex::new(None),
        }
    }

    pub fn allow(&self) -> bool {
        let mut opened_at = self.opened_at.lock().expect("breaker mutex poisoned");
        match *opened_at {
            Some(since) if since.elapsed() < self.reset_timeout => false,
            Some(_) => {
                *opened_at = None;
                self.failures.store(0, Ordering::Relaxed);
                true
            }
            None => true,
        }
    }

    pub fn record_success(&self) {
        self.failures.store(0, Ordering::Relaxed);
        *self.opened_at.lock().expect("breaker mutex poisoned") = None;
    }

    pub fn record_failure(&self) {
        let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.max_failures {
            *self.opened_at.lock().expect("breaker mutex poisoned") = Some(Instant::now());
        }
    }
}

/// Token-bucket rate limiter: `max_tokens` capacity, refilled at
/// `refill_rate` tokens/sec.
pub struct RateLimiter {
    max_tokens: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(max_tokens: f64, refill_rate: f64) -> Self {
        Self {
            max_tokens,
            refill_rate,
            state: Mutex::new(BucketState {
                tokens: max_tokens,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Attempt to take one token. Returns `false` (and takes nothing) if
    /// the bucket is empty.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().expect("rate limiter mutex poisoned");
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        state.last_refill = Instant::now();

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_opens_after_max_failures_then_resets_after_timeout() {
        let breaker = CircuitBreaker::new(3, Duration::from_millis(30));
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert!(!breaker.allow());
        std::thread::sleep(Duration::from_millis(35));
        assert!(breaker.allow());
    }

    #[test]
    fn breaker_success_clears_failures() {
        let breaker = CircuitBreaker::new(3, Duration::from_millis(30));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.allow());
    }

    #[test]
    fn rate_limiter_exhausts_then_refills() {
        let limiter = RateLimiter::new(2.0, 1000.0);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        std::thread::sleep(Duration::from_millis(5));
        assert!(limiter.try_acquire());
    }
}
