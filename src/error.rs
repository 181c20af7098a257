//! Crate-wide error type and the stable error-code taxonomy boundary
//! callers are expected to branch on.

use std::fmt;

/// Stable error code surfaced at every public boundary, independent of the
/// human-readable message carried by [`FleetError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidRequest,
    NotFound,
    NoWorkers,
    NoHealthyWorkers,
    PoolClosed,
    PoolFull,
    QueueFull,
    Timeout,
    CircuitOpen,
    Cancelled,
    Duplicate,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::NoWorkers => "NO_WORKERS",
            ErrorCode::NoHealthyWorkers => "NO_HEALTHY_WORKERS",
            ErrorCode::PoolClosed => "POOL_CLOSED",
            ErrorCode::PoolFull => "POOL_FULL",
            ErrorCode::QueueFull => "QUEUE_FULL",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::CircuitOpen => "CIRCUIT_OPEN",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::Duplicate => "DUPLICATE",
        };
        f.write_str(s)
    }
}

/// Crate-wide error. Every public operation returns `Result<_, FleetError>`.
///
/// Internal loops (maintenance, health, worker tasks) never propagate these
/// as panics — they log and continue, per the propagation policy in the
/// spec's error handling design.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no workers registered")]
    NoWorkers,

    #[error("no healthy workers available")]
    NoHealthyWorkers,

    #[error("pool is closed")]
    PoolClosed,

    #[error("pool is full")]
    PoolFull,

    #[error("queue is full")]
    QueueFull,

    #[error("operation timed out")]
    Timeout,

    #[error("circuit is open for worker {0}")]
    CircuitOpen(String),

    #[error("operation was cancelled")]
    Cancelled,

    #[error("duplicate: {0}")]
    Duplicate(String),
}

impl FleetError {
    /// The stable error code for this variant.
    pub fn code(&self) -> ErrorCode {
        match self {
            FleetError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            FleetError::NotFound(_) => ErrorCode::NotFound,
            FleetError::NoWorkers => ErrorCode::NoWorkers,
            FleetError::NoHealthyWorkers => ErrorCode::NoHealthyWorkers,
            FleetError::PoolClosed => ErrorCode::PoolClosed,
            FleetError::PoolFull => ErrorCode::PoolFull,
            FleetError::QueueFull => ErrorCode::QueueFull,
            FleetError::Timeout => ErrorCode::Timeout,
            FleetError::CircuitOpen(_) => ErrorCode::CircuitOpen,
            FleetError::Cancelled => ErrorCode::Cancelled,
            FleetError::Duplicate(_) => ErrorCode::Duplicate,
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, FleetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_mapping_is_stable() {
        assert_eq!(FleetError::NoWorkers.code(), ErrorCode::NoWorkers);
        assert_eq!(
            FleetError::CircuitOpen("w1".into()).code(),
            ErrorCode::CircuitOpen
        );
        assert_eq!(format!("{}", ErrorCode::NoHealthyWorkers), "NO_HEALTHY_WORKERS");
    }
}
