//! Error types for circuit breaker operations

use crate::status::BreakerState;
use std::time::Duration;

/// Boxed error carried by failed operations
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Why a call did not produce a real result
///
/// These never escape `fire()`; they are handed to the fallback and returned
/// as the reason of [`crate::Fired::Fallback`].
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// The operation did not settle within the call timeout
    #[error("circuit '{circuit}' call timed out after {timeout:?}")]
    Timeout { circuit: String, timeout: Duration },

    /// The operation returned an error, panicked, or was cancelled
    #[error("circuit '{circuit}' call failed: {source}")]
    Failure {
        circuit: String,
        #[source]
        source: BoxError,
    },

    /// The circuit is open, or a half-open trial is already in flight
    #[error("circuit '{circuit}' rejected the call ({state})")]
    Rejected { circuit: String, state: BreakerState },
}

impl CallError {
    /// Circuit that produced the error
    pub fn circuit(&self) -> &str {
        match self {
            CallError::Timeout { circuit, .. }
            | CallError::Failure { circuit, .. }
            | CallError::Rejected { circuit, .. } => circuit,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CallError::Timeout { .. })
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, CallError::Rejected { .. })
    }
}

/// Invalid breaker configuration, reported at construction
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("error threshold percentage must be within 0..=100, got {0}")]
    InvalidThreshold(f64),

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("rolling bucket count must be greater than zero")]
    ZeroBuckets,

    #[error("rolling window {window:?} is too short for {buckets} buckets")]
    WindowTooShort { window: Duration, buckets: usize },

    #[error("minimum volume must be at least 1")]
    ZeroMinimumVolume,

    #[error("jitter factor must be within 0.0..=1.0, got {0}")]
    InvalidJitter(f64),

    #[error("event capacity must be greater than zero")]
    ZeroEventCapacity,
}
