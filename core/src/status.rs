//! Read-only breaker status for health checks

use crate::window::StatsSnapshot;
use serde::Serialize;
use std::fmt;

/// Breaker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl BreakerState {
    /// Map a state machine state name onto the public state
    pub(crate) fn from_machine(name: &str) -> Self {
        match name {
            "Closed" => BreakerState::Closed,
            "HalfOpen" => BreakerState::HalfOpen,
            _ => BreakerState::Open,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::Open => "OPEN",
            BreakerState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl From<u8> for BreakerState {
    fn from(value: u8) -> Self {
        match value {
            0 => BreakerState::Closed,
            2 => BreakerState::HalfOpen,
            _ => BreakerState::Open,
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot returned by [`crate::CircuitBreaker::status`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStatus<'a> {
    pub name: &'a str,
    pub state: BreakerState,
    pub stats: StatsSnapshot,
    pub is_open: bool,
    pub is_half_open: bool,
    pub is_closed: bool,
}

impl<'a> BreakerStatus<'a> {
    pub(crate) fn new(name: &'a str, state: BreakerState, stats: StatsSnapshot) -> Self {
        Self {
            name,
            state,
            stats,
            is_open: state == BreakerState::Open,
            is_half_open: state == BreakerState::HalfOpen,
            is_closed: state == BreakerState::Closed,
        }
    }
}
