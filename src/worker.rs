//! The one seam where the external LM worker process plugs into this crate.
//!
//! The core never implements [`WorkerHandle`] itself — no wire protocol to
//! the wrapped LM server is mandated. Callers supply an implementation that
//! speaks whatever protocol their worker process exposes (HTTP, a local
//! socket, an in-process mock for tests, ...).

use std::time::Duration;

use crate::error::Result;

/// Capability contract for a single worker endpoint.
///
/// Both methods are side-effecting; the core never caches `execute` results.
#[async_trait::async_trait]
pub trait WorkerHandle: Send + Sync {
    /// Run `prompt` against the worker, bounded by `deadline`.
    async fn execute(&self, prompt: &str, deadline: Duration) -> Result<String>;

    /// Cheap liveness probe.
    async fn ping(&self) -> Result<bool>;
}

/// Opaque worker identifier. A thin newtype over `String` so call sites
/// read as `WorkerId` rather than a bare `String` threaded everywhere.
pub type WorkerId = String;

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// In-process [`WorkerHandle`] for tests: always succeeds unless told
    /// otherwise, and counts calls.
    pub struct MockWorker {
        pub fail: AtomicBool,
        pub calls: AtomicUsize,
    }

    impl MockWorker {
        pub fn new() -> Self {
            Self {
                fail: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn set_fail(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl WorkerHandle for MockWorker {
        async fn execute(&self, prompt: &str, _deadline: Duration) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                Err(crate::error::FleetError::InvalidRequest("mock failure".into()))
            } else {
                Ok(format!("echo: {prompt}"))
            }
        }

        async fn ping(&self) -> Result<bool> {
            Ok(!self.fail.load(Ordering::SeqCst))
        }
    }
}
