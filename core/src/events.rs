//! Typed observability events
//!
//! Event names are an integration contract with logging and metrics
//! pipelines and must stay stable.

use crate::status::BreakerState;
use serde::Serialize;
use std::time::Duration;

/// Something that happened to a breaker
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum BreakerEvent {
    /// The breaker stopped admitting calls
    #[serde(rename_all = "camelCase")]
    Open {
        circuit: String,
        failure_percentage: f64,
        total_calls: u64,
        manual: bool,
    },
    /// Cooldown elapsed; the next call is a trial
    HalfOpen { circuit: String },
    /// The breaker admits calls again
    #[serde(rename_all = "camelCase")]
    Close { circuit: String, manual: bool },
    Success {
        circuit: String,
        #[serde(with = "millis")]
        latency: Duration,
    },
    /// Also emitted after `Timeout`
    Failure {
        circuit: String,
        error: String,
        #[serde(with = "millis")]
        latency: Duration,
    },
    Timeout {
        circuit: String,
        #[serde(with = "millis")]
        timeout: Duration,
    },
    Reject { circuit: String, state: BreakerState },
    /// A fallback ran; `recovered` is false when it failed or none was set
    Fallback { circuit: String, recovered: bool },
}

impl BreakerEvent {
    /// Stable event name
    pub fn name(&self) -> &'static str {
        match self {
            BreakerEvent::Open { .. } => "open",
            BreakerEvent::HalfOpen { .. } => "halfOpen",
            BreakerEvent::Close { .. } => "close",
            BreakerEvent::Success { .. } => "success",
            BreakerEvent::Failure { .. } => "failure",
            BreakerEvent::Timeout { .. } => "timeout",
            BreakerEvent::Reject { .. } => "reject",
            BreakerEvent::Fallback { .. } => "fallback",
        }
    }

    pub fn circuit(&self) -> &str {
        match self {
            BreakerEvent::Open { circuit, .. }
            | BreakerEvent::HalfOpen { circuit }
            | BreakerEvent::Close { circuit, .. }
            | BreakerEvent::Success { circuit, .. }
            | BreakerEvent::Failure { circuit, .. }
            | BreakerEvent::Timeout { circuit, .. }
            | BreakerEvent::Reject { circuit, .. }
            | BreakerEvent::Fallback { circuit, .. } => circuit,
        }
    }

    /// Whether this event reports a state transition
    pub fn is_transition(&self) -> bool {
        matches!(
            self,
            BreakerEvent::Open { .. } | BreakerEvent::HalfOpen { .. } | BreakerEvent::Close { .. }
        )
    }
}

mod millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(crate::millis(*value))
    }
}
