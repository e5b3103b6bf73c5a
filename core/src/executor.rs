//! Timeout-bounded execution of a single guarded operation
//!
//! [`execute`] runs a caller-supplied future under an absolute timeout and
//! always settles with exactly one [`Outcome`]. Panics raised while building
//! or polling the future are reported as failures, so a malformed operation
//! cannot take the caller down with it.

use crate::{BoxError, OutcomeKind};
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;
use tokio::sync::oneshot;

/// Result of one executed operation
#[derive(Debug)]
pub enum Outcome<T> {
    Success(T),
    Failure(BoxError),
    /// The operation did not settle before the timeout
    Timeout(Duration),
}

impl<T> Outcome<T> {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Outcome::Success(_) => OutcomeKind::Success,
            Outcome::Failure(_) => OutcomeKind::Failure,
            Outcome::Timeout(_) => OutcomeKind::Timeout,
        }
    }
}

/// Run `operation` and wait at most `call_timeout` for it to settle
///
/// The future is dropped when the timeout fires, so a late completion is
/// never observed.
pub async fn execute<F, Fut, T, E>(operation: F, call_timeout: Duration) -> Outcome<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<BoxError>,
{
    // Synchronous setup errors are failures like any other
    let future = match panic::catch_unwind(AssertUnwindSafe(operation)) {
        Ok(future) => future,
        Err(payload) => return Outcome::Failure(panic_error(payload)),
    };

    match tokio::time::timeout(call_timeout, AssertUnwindSafe(future).catch_unwind()).await {
        Ok(Ok(Ok(value))) => Outcome::Success(value),
        Ok(Ok(Err(error))) => Outcome::Failure(error.into()),
        Ok(Err(payload)) => Outcome::Failure(panic_error(payload)),
        Err(_elapsed) => Outcome::Timeout(call_timeout),
    }
}

fn panic_error(payload: Box<dyn Any + Send>) -> BoxError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    format!("operation panicked: {}", message).into()
}

/// One-shot handle an operation uses to report its result
///
/// Consumed on use, so an operation can settle at most once. Settling after
/// the executor gave up is silently ignored.
#[derive(Debug)]
pub struct Completion<T> {
    tx: oneshot::Sender<Result<T, BoxError>>,
}

impl<T> Completion<T> {
    /// Report a result
    pub fn complete<E: Into<BoxError>>(self, result: Result<T, E>) {
        let _ = self.tx.send(result.map_err(Into::into));
    }

    pub fn succeed(self, value: T) {
        let _ = self.tx.send(Ok(value));
    }

    pub fn fail<E: Into<BoxError>>(self, error: E) {
        let _ = self.tx.send(Err(error.into()));
    }

    /// Whether the executor is still waiting for this handle
    pub fn is_waiting(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Adapt a callback-style operation into a future
///
/// `setup` receives the [`Completion`] and starts the work. An `Err` from
/// `setup` settles the operation as a failure immediately. A handle that is
/// dropped without being used counts as a missing invocation: the future
/// never resolves and the executor's timeout reports it.
///
/// ```rust
/// use breaker_guard::{CircuitBreaker, with_completion};
///
/// # async fn demo(breaker: &CircuitBreaker) {
/// let fired = breaker
///     .fire(|| {
///         with_completion(|done| {
///             // e.g. client.publish(channel, message, move |res| done.complete(res))
///             done.succeed(1_u32);
///             Ok::<_, std::io::Error>(())
///         })
///     })
///     .await;
/// # let _ = fired;
/// # }
/// ```
pub fn with_completion<T, F, E>(setup: F) -> impl Future<Output = Result<T, BoxError>>
where
    F: FnOnce(Completion<T>) -> Result<(), E>,
    E: Into<BoxError>,
{
    let (tx, rx) = oneshot::channel();
    let started = setup(Completion { tx });

    async move {
        if let Err(error) = started {
            return Err(error.into());
        }
        match rx.await {
            Ok(result) => result,
            Err(_dropped) => std::future::pending().await,
        }
    }
}
