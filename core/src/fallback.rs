//! Fallbacks for rejected and failed calls
//!
//! A fallback is best-effort: it is not guarded by the breaker or by the
//! call timeout, and whatever it does wrong is logged and swallowed.

use crate::{BoxError, CallError, status::BreakerState};
use std::panic::{self, AssertUnwindSafe};
use tracing::warn;

/// Context provided to fallback closures
#[derive(Debug)]
pub struct FallbackContext<'a> {
    pub circuit_name: &'a str,
    /// Breaker state when the fallback was chosen
    pub state: BreakerState,
    /// Why the real call produced no result
    pub reason: &'a CallError,
}

/// Type alias for fallback function
pub type FallbackFn<T> = Box<dyn FnOnce(&FallbackContext<'_>) -> Result<T, BoxError> + Send>;

/// Options for a single guarded call
pub struct CallOptions<T> {
    /// Substitute result producer used on rejection or failure
    pub fallback: Option<FallbackFn<T>>,
}

impl<T> Default for CallOptions<T> {
    fn default() -> Self {
        Self { fallback: None }
    }
}

impl<T> CallOptions<T> {
    /// Create new call options with no fallback
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a fallback function
    pub fn with_fallback<F, E>(mut self, f: F) -> Self
    where
        F: FnOnce(&FallbackContext<'_>) -> Result<T, E> + Send + 'static,
        E: Into<BoxError>,
    {
        self.fallback = Some(Box::new(move |ctx: &FallbackContext<'_>| {
            f(ctx).map_err(Into::<BoxError>::into)
        }));
        self
    }
}

impl<T> std::fmt::Debug for CallOptions<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallOptions")
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

/// Result of [`crate::CircuitBreaker::fire`]
///
/// There is no error variant: every rejection, failure and timeout ends up
/// in `Fallback`. A `value` of `None` is the generic sentinel, returned when
/// no fallback was configured or the fallback itself failed.
#[derive(Debug)]
pub enum Fired<T> {
    /// The guarded operation produced this value
    Success(T),
    Fallback {
        value: Option<T>,
        reason: CallError,
    },
}

impl<T> Fired<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Fired::Success(_))
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Fired::Fallback { .. })
    }

    /// Real or substitute value, if any
    pub fn value(self) -> Option<T> {
        match self {
            Fired::Success(value) => Some(value),
            Fired::Fallback { value, .. } => value,
        }
    }

    pub fn reason(&self) -> Option<&CallError> {
        match self {
            Fired::Success(_) => None,
            Fired::Fallback { reason, .. } => Some(reason),
        }
    }

    /// Real or substitute value, or `default` for the sentinel
    pub fn unwrap_or(self, default: T) -> T {
        self.value().unwrap_or(default)
    }
}

/// Run the fallback for `reason`, absorbing its errors and panics
pub(crate) fn recover<T>(
    circuit_name: &str,
    state: BreakerState,
    reason: CallError,
    fallback: Option<FallbackFn<T>>,
) -> Fired<T> {
    let Some(fallback) = fallback else {
        return Fired::Fallback {
            value: None,
            reason,
        };
    };

    let ctx = FallbackContext {
        circuit_name,
        state,
        reason: &reason,
    };

    let value = match panic::catch_unwind(AssertUnwindSafe(|| fallback(&ctx))) {
        Ok(Ok(value)) => Some(value),
        Ok(Err(error)) => {
            warn!(circuit = %circuit_name, error = %error, "Fallback failed, returning sentinel");
            None
        }
        Err(_) => {
            warn!(circuit = %circuit_name, "Fallback panicked, returning sentinel");
            None
        }
    };

    Fired::Fallback { value, reason }
}
