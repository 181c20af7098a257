//! Agent Pool configuration and resource quota (C7 data model).

use std::time::Duration;

const HARD_MAX: usize = 10;

/// Only age, recycle count, and request count are enforced by the core;
/// memory/cpu hints are advisory and carried for callers that want to act
/// on them out-of-band.
#[derive(Debug, Clone, Copy)]
pub struct ResourceQuota {
    pub max_instance_age: Duration,
    pub max_recycles_per_handle: u64,
    pub requests_per_quota: u64,
    pub memory_hint_mb: Option<u64>,
    pub cpu_hint_percent: Option<f64>,
}

impl Default for ResourceQuota {
    fn default() -> Self {
        Self {
            max_instance_age: Duration::from_secs(3600),
            max_recycles_per_handle: 100,
            requests_per_quota: 10_000,
            memory_hint_mb: None,
            cpu_hint_percent: None,
        }
    }
}

/// Pool sizing and recycling configuration.
///
/// `recycle_after_requests` (not `quota.requests_per_quota`) is the field
/// `should_recycle` actually enforces — the quota's `requests_per_quota`
/// ships for config-surface parity with the spec's recognized keys but has
/// no independent enforcement path, mirroring the overlap already present
/// in the data model.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub min: usize,
    pub max: usize,
    pub idle_timeout: Duration,
    pub recycle_after_requests: u64,
    pub maintenance_interval: Duration,
    pub quota: ResourceQuota,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: 1,
            max: 5,
            idle_timeout: Duration::from_secs(300),
            recycle_after_requests: 1000,
            maintenance_interval: Duration::from_secs(30),
            quota: ResourceQuota::default(),
        }
    }
}

impl PoolConfig {
    /// Clamp to the invariants the spec requires at construction: `max`
    /// capped at 10, `1 ≤ min ≤ max`, `idle_timeout > 0`.
    pub fn clamped(mut self) -> Self {
        self.max = self.max.clamp(1, HARD_MAX);
        self.min = self.min.clamp(1, self.max);
        if self.idle_timeout.is_zero() {
            self.idle_timeout = Duration::from_secs(300);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_max_to_hard_cap() {
        let config = PoolConfig {
            max: 999,
            ..PoolConfig::default()
        }
        .clamped();
        assert_eq!(config.max, HARD_MAX);
    }

    #[test]
    fn clamps_min_to_be_at_most_max() {
        let config = PoolConfig {
            min: 50,
            max: 3,
            ..PoolConfig::default()
        }
        .clamped();
        assert_eq!(config.max, 3);
        assert_eq!(config.min, 3);
    }

    #[test]
    fn zero_idle_timeout_falls_back_to_default() {
        let config = PoolConfig {
            idle_timeout: Duration::ZERO,
            ..PoolConfig::default()
        }
        .clamped();
        assert!(config.idle_timeout > Duration::ZERO);
    }
}
