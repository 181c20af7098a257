//! Active health probing (C8): periodic HTTP checks against each worker's
//! fixed `/api/version` path.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use super::{Shared, WorkerRecord};

const HEALTH_PATH: &str = "/api/version";
const UNHEALTHY_AFTER: u64 = 3;

pub(super) async fn probe_once(client: &reqwest::Client, record: &Arc<WorkerRecord>) {
    let deadline = record.entry.timeout.min(Duration::from_secs(5));
    let url = format!("{}{HEALTH_PATH}", record.entry.base_url);

    let outcome = client.get(&url).timeout(deadline).send().await;

    match outcome {
        Ok(resp) if resp.status().is_success() => {
            record.health.successes.fetch_add(1, Ordering::Relaxed);
            record.health.consecutive_failures.store(0, Ordering::Relaxed);
            record.health.healthy.store(true, Ordering::Relaxed);
            debug!(worker = %record.name, "health probe ok");
        }
        other => {
            if let Err(e) = &other {
                warn!(worker = %record.name, error = %e, "health probe failed");
            } else {
                warn!(worker = %record.name, "health probe returned non-2xx");
            }
            record.health.failures.fetch_add(1, Ordering::Relaxed);
            let consecutive = record.health.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
            if consecutive >= UNHEALTHY_AFTER {
                record.health.healthy.store(false, Ordering::Relaxed);
            }
        }
    }

    *record
        .health
        .last_health_at
        .lock()
        .expect("health mutex poisoned") = Some(Utc::now());
}

pub(super) async fn run(client: reqwest::Client, shared: Arc<Shared>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let snapshot: Vec<_> = shared.workers.iter().map(|e| e.value().clone()).collect();
        for record in snapshot {
            probe_once(&client, &record).await;
        }
    }
}
