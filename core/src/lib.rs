//! BreakerGuard - async circuit breaker for unreliable downstream dependencies
//!
//! This crate wraps calls to a flaky dependency (a pub/sub broker, a remote
//! service) in a circuit breaker with:
//! - A state machine for the breaker lifecycle (Closed → Open → HalfOpen)
//! - A bucketed rolling window of call outcomes with failure-rate thresholds
//! - A hard timeout around every admitted call
//! - Fallbacks that absorb every failure, so `fire()` never returns an error
//! - Typed events for logging and metrics pipelines
//!
//! # Example
//!
//! ```rust
//! use breaker_guard::{CallOptions, CircuitBreaker, Fired};
//! use std::time::Duration;
//!
//! # async fn publish() -> Result<(), breaker_guard::ConfigError> {
//! let breaker = CircuitBreaker::builder("broker")
//!     .call_timeout(Duration::from_secs(3))
//!     .error_threshold_percentage(50.0)
//!     .open_cooldown(Duration::from_secs(30))
//!     .minimum_volume(3)
//!     .on_open(|name| eprintln!("circuit {} opened", name))
//!     .build()?;
//!
//! let fired = breaker
//!     .fire_with(
//!         || async { Ok::<_, String>("published") },
//!         CallOptions::new().with_fallback(|_ctx| Ok::<_, String>("fallback-success")),
//!     )
//!     .await;
//!
//! match fired {
//!     Fired::Success(ack) => println!("broker acked: {}", ack),
//!     Fired::Fallback { value, reason } => println!("{:?} because {}", value, reason),
//! }
//!
//! if breaker.is_open() {
//!     println!("broker is unhealthy");
//! }
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod callbacks;
pub mod circuit;
pub mod errors;
pub mod events;
pub mod executor;
pub mod fallback;
pub mod status;
pub mod window;

pub use builder::CircuitBuilder;
pub use circuit::{CircuitBreaker, Config};
pub use errors::{BoxError, CallError, ConfigError};
pub use events::BreakerEvent;
pub use executor::{Completion, Outcome, with_completion};
pub use fallback::{CallOptions, FallbackContext, Fired};
pub use status::{BreakerState, BreakerStatus};
pub use window::{RollingWindow, StatsSnapshot};

/// How a single admitted call settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Success,
    Failure,
    /// Counted as a failure for thresholds, tracked separately for observability
    Timeout,
}

impl OutcomeKind {
    /// Whether this outcome counts against the failure threshold
    pub fn is_failure(self) -> bool {
        !matches!(self, OutcomeKind::Success)
    }
}

/// Whole milliseconds, saturating at `u64::MAX`
pub(crate) fn millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
