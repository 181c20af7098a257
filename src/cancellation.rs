//! Minimal cooperative-cancellation token.
//!
//! The spec calls for "ctx cancelled" checks at the top of every public
//! entry point. Rather than pull in `tokio-util` for a single flag, this
//! crate exposes the same shape with a bare `Arc<AtomicBool>` — the
//! teacher's own style favors small hand-rolled primitives over a
//! dependency when `std`/`tokio` already cover the need (e.g. its
//! hand-rolled exponential backoff in `worker/pool.rs` rather than pulling
//! in a backoff crate).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cheap, cloneable cancellation flag.
#[derive(Clone, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_observed_through_clones() {
        let token = Cancellation::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
