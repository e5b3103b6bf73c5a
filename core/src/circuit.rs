//! Circuit breaker implementation using state machines
//!
//! The lifecycle (Closed → Open → HalfOpen) lives in a dynamic state machine
//! guarded by a single mutex, so every check-and-transition is atomic with
//! respect to concurrent callers. Cooldown expiry and window rotation are
//! evaluated lazily on access; the breaker owns no timers or threads.

use crate::{
    BoxError, OutcomeKind, millis,
    callbacks::Callbacks,
    errors::{CallError, ConfigError},
    events::BreakerEvent,
    executor::{self, Outcome},
    fallback::{self, CallOptions, Fired},
    status::{BreakerState, BreakerStatus},
    window::{RollingWindow, StatsSnapshot},
};
use parking_lot::Mutex;
use state_machines::state_machine;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{info, warn};

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Upper bound on how long an admitted call may run
    pub call_timeout: Duration,

    /// Failure percentage (0-100) at or above which the circuit opens
    pub error_threshold_percentage: f64,

    /// Time the circuit stays open before admitting a trial call
    pub open_cooldown: Duration,

    /// Trailing span over which call outcomes are counted
    pub rolling_window: Duration,

    /// Number of buckets the rolling window is divided into
    pub rolling_buckets: usize,

    /// Calls required in the window before the failure percentage is trusted
    pub minimum_volume: u64,

    /// Jitter factor for open_cooldown (0.0 = no jitter, 1.0 = full jitter)
    /// Uses chrono-machines formula: cooldown * (1 - jitter + rand * jitter)
    pub jitter_factor: f64,

    /// Buffer size of the event broadcast channel
    pub event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(3),
            error_threshold_percentage: 50.0,
            open_cooldown: Duration::from_secs(30),
            rolling_window: Duration::from_secs(10),
            rolling_buckets: 10,
            minimum_volume: 3,
            jitter_factor: 0.0,
            event_capacity: 64,
        }
    }
}

impl Config {
    /// Reject configurations the breaker cannot honour
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=100.0).contains(&self.error_threshold_percentage) {
            return Err(ConfigError::InvalidThreshold(
                self.error_threshold_percentage,
            ));
        }
        if self.call_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("call timeout"));
        }
        if self.open_cooldown.is_zero() {
            return Err(ConfigError::ZeroDuration("open cooldown"));
        }
        if self.rolling_window.is_zero() {
            return Err(ConfigError::ZeroDuration("rolling window"));
        }
        if self.rolling_buckets == 0 {
            return Err(ConfigError::ZeroBuckets);
        }
        if self.rolling_window.as_nanos() < self.rolling_buckets as u128
            || u32::try_from(self.rolling_buckets).is_err()
        {
            return Err(ConfigError::WindowTooShort {
                window: self.rolling_window,
                buckets: self.rolling_buckets,
            });
        }
        if self.minimum_volume == 0 {
            return Err(ConfigError::ZeroMinimumVolume);
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::InvalidJitter(self.jitter_factor));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::ZeroEventCapacity);
        }
        Ok(())
    }
}

/// Circuit breaker context - shared data across all states
#[derive(Debug, Clone)]
pub struct CircuitContext {
    pub name: String,
    pub config: Config,
    pub window: Arc<RollingWindow>,
}

impl CircuitContext {
    pub(crate) fn new(name: String, config: Config) -> Self {
        let window = Arc::new(RollingWindow::new(
            config.rolling_window,
            config.rolling_buckets,
        ));
        Self {
            name,
            config,
            window,
        }
    }
}

impl Default for CircuitContext {
    fn default() -> Self {
        Self::new(String::new(), Config::default())
    }
}

/// Data specific to the Open state
#[derive(Debug, Clone, Default)]
pub struct OpenData {
    pub opened_at: Option<Instant>,
    /// Cooldown for this opening, jitter already applied
    pub cooldown: Duration,
}

/// Data specific to the HalfOpen state
#[derive(Debug, Clone, Default)]
pub struct HalfOpenData {
    /// Single-admission gate for the trial call
    pub trial_in_flight: bool,
}

state_machine! {
    name: Circuit,
    context: CircuitContext,
    dynamic: true,

    initial: Closed,
    states: [
        Closed,
        Open(OpenData),
        HalfOpen(HalfOpenData),
    ],
    events {
        trip {
            guards: [should_open],
            transition: { from: Closed, to: Open }
        }
        attempt_reset {
            guards: [cooldown_elapsed],
            transition: { from: Open, to: HalfOpen }
        }
        trial_succeeded {
            transition: { from: HalfOpen, to: Closed }
        }
        trial_failed {
            transition: { from: HalfOpen, to: Open }
        }
        force_open {
            transition: { from: [Closed, HalfOpen], to: Open }
        }
    }
}

impl Circuit<Closed> {
    /// Volume and failure percentage in the rolling window both reached
    fn should_open(&self, ctx: &CircuitContext) -> bool {
        let stats = ctx.window.snapshot();
        stats.total_calls >= ctx.config.minimum_volume
            && stats.failure_percentage >= ctx.config.error_threshold_percentage
    }
}

impl Circuit<Open> {
    /// Check if the cooldown has elapsed for Open -> HalfOpen
    fn cooldown_elapsed(&self, _ctx: &CircuitContext) -> bool {
        let data = self.state_data_open().expect("Open state must have data");
        match data.opened_at {
            Some(opened_at) => opened_at.elapsed() >= data.cooldown,
            None => true,
        }
    }
}

/// Nominal base handed to the jitter policy
const JITTER_SCALE: u64 = 1_000_000;

struct Slot {
    machine: DynamicCircuit,
    /// Bumped on every transition; stale trial outcomes are ignored
    generation: u64,
}

#[derive(Debug, Clone, Copy)]
struct Admission {
    generation: u64,
    trial: bool,
}

/// Circuit breaker public API
///
/// One instance per guarded dependency, shared by reference (or `Arc`)
/// between all call sites.
pub struct CircuitBreaker {
    context: CircuitContext,
    machine: Mutex<Slot>,
    /// Mirror of the machine state for lock-free reads
    state: AtomicU8,
    callbacks: Callbacks,
}

impl CircuitBreaker {
    /// Create a new circuit breaker (use builder() for callbacks)
    pub fn new(name: impl Into<String>, config: Config) -> Result<Self, ConfigError> {
        config.validate()?;
        let callbacks = Callbacks::new(config.event_capacity);
        Ok(Self::with_context_and_callbacks(
            CircuitContext::new(name.into(), config),
            callbacks,
        ))
    }

    /// Create a circuit breaker from validated parts (used by builder)
    pub(crate) fn with_context_and_callbacks(context: CircuitContext, callbacks: Callbacks) -> Self {
        info!(
            circuit = %context.name,
            call_timeout_ms = millis(context.config.call_timeout),
            error_threshold_percentage = context.config.error_threshold_percentage,
            open_cooldown_ms = millis(context.config.open_cooldown),
            minimum_volume = context.config.minimum_volume,
            "🛡️ Circuit breaker initialized"
        );

        let machine = DynamicCircuit::new(context.clone());

        Self {
            context,
            machine: Mutex::new(Slot {
                machine,
                generation: 0,
            }),
            state: AtomicU8::new(BreakerState::Closed as u8),
            callbacks,
        }
    }

    /// Create a new circuit breaker builder
    pub fn builder(name: impl Into<String>) -> crate::builder::CircuitBuilder {
        crate::builder::CircuitBuilder::new(name)
    }

    /// Run `operation` under the breaker with no fallback
    ///
    /// Never fails: rejections, errors and timeouts come back as
    /// `Fired::Fallback` carrying the generic sentinel.
    pub async fn fire<F, Fut, T, E>(&self, operation: F) -> Fired<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        self.fire_with(operation, CallOptions::default()).await
    }

    /// Run `operation` under the breaker, falling back per `options`
    pub async fn fire_with<F, Fut, T, E>(&self, operation: F, options: CallOptions<T>) -> Fired<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let admission = match self.admit() {
            Ok(admission) => admission,
            Err(reason) => return self.fall_back(reason, options),
        };

        let pending = PendingCall::new(self, admission);
        let outcome = executor::execute(operation, self.context.config.call_timeout).await;

        match pending.settle(outcome) {
            Ok(value) => Fired::Success(value),
            Err(reason) => self.fall_back(reason, options),
        }
    }

    /// Force the circuit open, (re)starting the cooldown now
    pub fn open(&self) {
        let mut slot = self.machine.lock();

        if slot.machine.current_state() == "Open" {
            self.mark_open(&mut slot);
            warn!(circuit = %self.context.name, "Circuit breaker forced open, cooldown restarted");
            return;
        }

        if slot.machine.handle(CircuitEvent::ForceOpen).is_ok() {
            self.mark_open(&mut slot);
            let event = self.open_event(true);
            self.transitioned(&mut slot, event);
        }
    }

    /// Force the circuit closed and clear the rolling window
    pub fn close(&self) {
        let mut slot = self.machine.lock();
        self.context.window.reset();

        if slot.machine.current_state() != "Closed" {
            // Recreate machine in Closed state
            slot.machine = DynamicCircuit::new(self.context.clone());
            let event = BreakerEvent::Close {
                circuit: self.context.name.clone(),
                manual: true,
            };
            self.transitioned(&mut slot, event);
        }
    }

    /// Current state, without evaluating the cooldown
    pub fn state(&self) -> BreakerState {
        BreakerState::from(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == BreakerState::Open
    }

    pub fn is_half_open(&self) -> bool {
        self.state() == BreakerState::HalfOpen
    }

    pub fn is_closed(&self) -> bool {
        self.state() == BreakerState::Closed
    }

    /// Current rolling window totals
    pub fn stats(&self) -> StatsSnapshot {
        self.context.window.snapshot()
    }

    /// Read-only snapshot for health checks; never changes state
    pub fn status(&self) -> BreakerStatus<'_> {
        BreakerStatus::new(&self.context.name, self.state(), self.stats())
    }

    /// Receive every event emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerEvent> {
        self.callbacks.subscribe()
    }

    pub fn name(&self) -> &str {
        &self.context.name
    }

    pub fn config(&self) -> &Config {
        &self.context.config
    }

    /// Decide whether a call may reach the operation
    fn admit(&self) -> Result<Admission, CallError> {
        let mut slot = self.machine.lock();

        // Check for cooldown-based Open -> HalfOpen transition
        if slot.machine.current_state() == "Open"
            && slot.machine.handle(CircuitEvent::AttemptReset).is_ok()
        {
            let event = BreakerEvent::HalfOpen {
                circuit: self.context.name.clone(),
            };
            self.transitioned(&mut slot, event);
        }

        let generation = slot.generation;
        let admitted = match slot.machine.current_state() {
            "Closed" => Some(Admission {
                generation,
                trial: false,
            }),
            "HalfOpen" => match slot.machine.half_open_data_mut() {
                Some(data) if !data.trial_in_flight => {
                    data.trial_in_flight = true;
                    Some(Admission {
                        generation,
                        trial: true,
                    })
                }
                _ => None,
            },
            _ => None,
        };

        admitted.ok_or_else(|| {
            let state = BreakerState::from_machine(slot.machine.current_state());
            self.context.window.record_rejection();
            self.callbacks.emit(BreakerEvent::Reject {
                circuit: self.context.name.clone(),
                state,
            });
            CallError::Rejected {
                circuit: self.context.name.clone(),
                state,
            }
        })
    }

    /// Record a settled call and apply any resulting transition
    fn record_outcome<I>(&self, admission: Admission, kind: OutcomeKind, events: I)
    where
        I: IntoIterator<Item = BreakerEvent>,
    {
        let mut slot = self.machine.lock();

        self.context.window.record(kind);
        for event in events {
            self.callbacks.emit(event);
        }

        let current = slot.machine.current_state();
        if admission.trial {
            // A manual override since admission makes this trial stale
            if admission.generation != slot.generation || current != "HalfOpen" {
                return;
            }

            if kind == OutcomeKind::Success {
                if slot.machine.handle(CircuitEvent::TrialSucceeded).is_ok() {
                    self.context.window.reset();
                    let event = BreakerEvent::Close {
                        circuit: self.context.name.clone(),
                        manual: false,
                    };
                    self.transitioned(&mut slot, event);
                }
            } else if slot.machine.handle(CircuitEvent::TrialFailed).is_ok() {
                self.mark_open(&mut slot);
                let event = self.open_event(false);
                self.transitioned(&mut slot, event);
            }
        } else if current == "Closed" && slot.machine.handle(CircuitEvent::Trip).is_ok() {
            self.mark_open(&mut slot);
            let event = self.open_event(false);
            self.transitioned(&mut slot, event);
        }
    }

    fn fall_back<T>(&self, reason: CallError, options: CallOptions<T>) -> Fired<T> {
        let fired = fallback::recover(&self.context.name, self.state(), reason, options.fallback);

        let recovered = match &fired {
            Fired::Fallback { value, .. } => value.is_some(),
            Fired::Success(_) => true,
        };
        // Keep fallback events in the same total order as transitions
        let _slot = self.machine.lock();
        self.callbacks.emit(BreakerEvent::Fallback {
            circuit: self.context.name.clone(),
            recovered,
        });

        fired
    }

    /// Publish a state change that has already been applied to the machine
    fn transitioned(&self, slot: &mut Slot, event: BreakerEvent) {
        slot.generation += 1;
        let state = BreakerState::from_machine(slot.machine.current_state());
        self.state.store(state as u8, Ordering::Release);
        self.callbacks.emit(event);
    }

    /// Apply Open-state bookkeeping (timestamp + cooldown)
    fn mark_open(&self, slot: &mut Slot) {
        let cooldown = self.cooldown();
        if let Some(data) = slot.machine.open_data_mut() {
            data.opened_at = Some(Instant::now());
            data.cooldown = cooldown;
        }
    }

    fn cooldown(&self) -> Duration {
        let config = &self.context.config;
        if config.jitter_factor > 0.0 {
            // Jitter a fixed nominal delay, then scale the real cooldown by
            // the same ratio so sub-millisecond cooldowns keep their bounds
            let policy = chrono_machines::Policy {
                max_attempts: 1,
                base_delay_ms: JITTER_SCALE,
                multiplier: 1.0,
                max_delay_ms: JITTER_SCALE,
            };
            let ratio = policy.calculate_delay(1, config.jitter_factor) as f64 / JITTER_SCALE as f64;
            config.open_cooldown.mul_f64(ratio.clamp(0.0, 1.0))
        } else {
            config.open_cooldown
        }
    }

    fn open_event(&self, manual: bool) -> BreakerEvent {
        let stats = self.context.window.snapshot();
        BreakerEvent::Open {
            circuit: self.context.name.clone(),
            failure_percentage: stats.failure_percentage,
            total_calls: stats.total_calls,
            manual,
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.context.name)
            .field("state", &self.state())
            .field("config", &self.context.config)
            .field("callbacks", &self.callbacks)
            .finish()
    }
}

/// An admitted call that has not settled yet
///
/// Settling consumes it. Dropping it unsettled (the caller cancelled the
/// `fire` future) records a failure so the window stays consistent.
struct PendingCall<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    started: Instant,
    settled: bool,
}

impl<'a> PendingCall<'a> {
    fn new(breaker: &'a CircuitBreaker, admission: Admission) -> Self {
        Self {
            breaker,
            admission,
            started: Instant::now(),
            settled: false,
        }
    }

    fn settle<T>(mut self, outcome: Outcome<T>) -> Result<T, CallError> {
        self.settled = true;

        let circuit = self.breaker.context.name.clone();
        let latency = self.started.elapsed();
        let kind = outcome.kind();

        match outcome {
            Outcome::Success(value) => {
                let event = BreakerEvent::Success { circuit, latency };
                self.breaker.record_outcome(self.admission, kind, [event]);
                Ok(value)
            }
            Outcome::Failure(source) => {
                let event = BreakerEvent::Failure {
                    circuit: circuit.clone(),
                    error: source.to_string(),
                    latency,
                };
                self.breaker.record_outcome(self.admission, kind, [event]);
                Err(CallError::Failure { circuit, source })
            }
            Outcome::Timeout(timeout) => {
                let events = [
                    BreakerEvent::Timeout {
                        circuit: circuit.clone(),
                        timeout,
                    },
                    BreakerEvent::Failure {
                        circuit: circuit.clone(),
                        error: format!("timed out after {:?}", timeout),
                        latency,
                    },
                ];
                self.breaker.record_outcome(self.admission, kind, events);
                Err(CallError::Timeout { circuit, timeout })
            }
        }
    }
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        let event = BreakerEvent::Failure {
            circuit: self.breaker.context.name.clone(),
            error: "call cancelled before settling".to_string(),
            latency: self.started.elapsed(),
        };
        self.breaker
            .record_outcome(self.admission, OutcomeKind::Failure, [event]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::CircuitBuilder;
    use crate::executor::{Completion, with_completion};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::oneshot;

    const COOLDOWN: Duration = Duration::from_secs(5);
    const CALL_TIMEOUT: Duration = Duration::from_secs(1);

    fn builder() -> CircuitBuilder {
        CircuitBreaker::builder("broker")
            .call_timeout(CALL_TIMEOUT)
            .error_threshold_percentage(50.0)
            .open_cooldown(COOLDOWN)
            .rolling_window(Duration::from_secs(60))
            .rolling_buckets(6)
            .minimum_volume(3)
    }

    async fn succeed(breaker: &CircuitBreaker) -> Fired<&'static str> {
        breaker.fire(|| async { Ok::<_, String>("ack") }).await
    }

    async fn fail(breaker: &CircuitBreaker) -> Fired<&'static str> {
        breaker
            .fire(|| async { Err::<&'static str, _>("broker down") })
            .await
    }

    async fn trip(breaker: &CircuitBreaker) {
        for _ in 0..breaker.config().minimum_volume {
            let _ = fail(breaker).await;
        }
        assert!(breaker.is_open());
    }

    fn drain(rx: &mut broadcast::Receiver<BreakerEvent>) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name());
        }
        names
    }

    #[test]
    fn test_circuit_breaker_creation() {
        let circuit = CircuitBreaker::new("test", Config::default()).unwrap();

        assert!(circuit.is_closed());
        assert!(!circuit.is_open());
        assert!(!circuit.is_half_open());
        assert_eq!(circuit.name(), "test");
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = Config {
            error_threshold_percentage: 150.0,
            ..Default::default()
        };

        assert_eq!(
            CircuitBreaker::new("test", config).unwrap_err(),
            ConfigError::InvalidThreshold(150.0)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_returns_real_value() {
        let breaker = builder().build().unwrap();

        let fired = succeed(&breaker).await;

        assert!(fired.is_success());
        assert_eq!(fired.value(), Some("ack"));
        assert_eq!(breaker.stats().successes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_when_threshold_reached_with_volume() {
        let breaker = builder().minimum_volume(4).build().unwrap();

        let _ = succeed(&breaker).await;
        let _ = succeed(&breaker).await;
        let _ = fail(&breaker).await;
        assert!(breaker.is_closed(), "3 calls is below minimum volume");

        // 4 calls, 50% failures
        let _ = fail(&breaker).await;
        assert!(breaker.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_minimum_volume_prevents_premature_trip() {
        let breaker = builder().minimum_volume(20).build().unwrap();

        for _ in 0..10 {
            let _ = fail(&breaker).await;
        }

        assert!(breaker.is_closed());
        assert_eq!(breaker.stats().failure_percentage, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_below_threshold_stays_closed() {
        let breaker = builder().error_threshold_percentage(60.0).build().unwrap();

        for _ in 0..5 {
            let _ = succeed(&breaker).await;
            let _ = fail(&breaker).await;
        }

        assert!(breaker.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_rejects_without_calling_operation() {
        let breaker = builder().build().unwrap();
        trip(&breaker).await;

        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let calls = calls.clone();
            let fired = breaker
                .fire(move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(())
                })
                .await;

            match fired.reason() {
                Some(CallError::Rejected { state, .. }) => assert_eq!(*state, BreakerState::Open),
                other => panic!("expected rejection, got {:?}", other),
            }
        }

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(breaker.stats().rejections, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_trial() {
        let breaker = builder().build().unwrap();
        trip(&breaker).await;
        tokio::time::sleep(COOLDOWN).await;

        let (started_tx, started_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let trial = breaker.fire(move || async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
            Ok::<_, String>("trial")
        });
        let probe = async {
            let _ = started_rx.await;
            let fired = succeed(&breaker).await;
            let _ = release_tx.send(());
            fired
        };

        let (trial, probe) = tokio::join!(trial, probe);

        assert_eq!(trial.value(), Some("trial"));
        match probe.reason() {
            Some(CallError::Rejected { state, .. }) => {
                assert_eq!(*state, BreakerState::HalfOpen)
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        assert!(breaker.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_trial_closes_and_resets_stats() {
        let breaker = builder().build().unwrap();
        trip(&breaker).await;
        assert_eq!(breaker.stats().total_failures, 3);

        tokio::time::sleep(COOLDOWN).await;
        assert!(succeed(&breaker).await.is_success());

        assert!(breaker.is_closed());
        let stats = breaker.stats();
        assert_eq!(stats.total_calls, 0);
        assert_eq!(stats.rejections, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens_and_restarts_cooldown() {
        let breaker = builder().build().unwrap();
        trip(&breaker).await;

        tokio::time::sleep(COOLDOWN).await;
        assert!(fail(&breaker).await.is_fallback());
        assert!(breaker.is_open());

        // Cooldown counts from the trial failure
        tokio::time::sleep(COOLDOWN - Duration::from_millis(1)).await;
        assert!(succeed(&breaker).await.reason().unwrap().is_rejected());

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(succeed(&breaker).await.is_success());
        assert!(breaker.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_trial_reopens() {
        let breaker = builder().build().unwrap();
        trip(&breaker).await;
        tokio::time::sleep(COOLDOWN).await;

        let fired = breaker
            .fire(|| std::future::pending::<Result<(), String>>())
            .await;

        assert!(fired.reason().unwrap().is_timeout());
        assert!(breaker.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_operation_times_out_once() {
        let breaker = builder().build().unwrap();
        let start = Instant::now();

        let fired = breaker
            .fire(|| with_completion(|_done: Completion<()>| Ok::<_, String>(())))
            .await;

        assert!(fired.reason().unwrap().is_timeout());
        let elapsed = start.elapsed();
        assert!(elapsed >= CALL_TIMEOUT);
        assert!(elapsed < CALL_TIMEOUT + Duration::from_millis(10));

        let stats = breaker.stats();
        assert_eq!(stats.total_calls, 1);
        assert_eq!(stats.total_failures, 1);
        assert_eq!(stats.timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tardy_completion_not_counted() {
        let breaker = builder().build().unwrap();

        let fired = breaker
            .fire(|| {
                with_completion(|done: Completion<u32>| {
                    tokio::spawn(async move {
                        tokio::time::sleep(CALL_TIMEOUT * 2).await;
                        done.succeed(1);
                    });
                    Ok::<_, String>(())
                })
            })
            .await;
        assert!(fired.reason().unwrap().is_timeout());

        tokio::time::sleep(CALL_TIMEOUT * 5).await;

        let stats = breaker.stats();
        assert_eq!(stats.total_calls, 1);
        assert_eq!(stats.successes, 0);
        assert_eq!(stats.timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_throwing_operation_never_escapes() {
        let breaker = builder().minimum_volume(5).build().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let calls = calls.clone();
            let fired = breaker
                .fire_with(
                    move || {
                        with_completion(move |_done: Completion<&'static str>| {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Err::<(), _>("ECONNREFUSED")
                        })
                    },
                    CallOptions::new().with_fallback(|_ctx| Ok::<_, String>("fallback-success")),
                )
                .await;

            assert_eq!(fired.value(), Some("fallback-success"));
        }

        assert!(breaker.is_open());
        assert!(calls.load(Ordering::SeqCst) <= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_operation_becomes_fallback() {
        let breaker = builder().build().unwrap();

        let fired = breaker
            .fire(|| -> std::future::Ready<Result<(), String>> { panic!("no broker client") })
            .await;

        match fired.reason() {
            Some(CallError::Failure { source, .. }) => {
                assert!(source.to_string().contains("no broker client"))
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(breaker.stats().total_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_failure_returns_sentinel() {
        let breaker = builder().build().unwrap();

        let fired = breaker
            .fire_with(
                || async { Err::<String, _>("broker down") },
                CallOptions::new().with_fallback(|_ctx| Err::<String, _>("stdout closed")),
            )
            .await;

        match fired {
            Fired::Fallback { value, reason } => {
                assert!(value.is_none());
                // The operation's failure is reported, not the fallback's
                assert!(reason.to_string().contains("broker down"));
            }
            Fired::Success(_) => panic!("expected fallback"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_open_blocks_healthy_circuit() {
        let breaker = builder().build().unwrap();
        for _ in 0..5 {
            let _ = succeed(&breaker).await;
        }
        assert_eq!(breaker.stats().failure_percentage, 0.0);

        breaker.open();

        assert!(breaker.is_open());
        assert!(succeed(&breaker).await.reason().unwrap().is_rejected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_open_restarts_cooldown() {
        let breaker = builder().build().unwrap();
        breaker.open();

        tokio::time::sleep(COOLDOWN - Duration::from_secs(1)).await;
        breaker.open();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(succeed(&breaker).await.reason().unwrap().is_rejected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_close_admits_saturated_circuit() {
        let breaker = builder().build().unwrap();
        trip(&breaker).await;
        assert_eq!(breaker.stats().failure_percentage, 100.0);

        breaker.close();

        assert!(breaker.is_closed());
        assert_eq!(breaker.stats().total_calls, 0);
        assert!(succeed(&breaker).await.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_call_records_failure() {
        let breaker = builder().build().unwrap();

        let cancelled = tokio::time::timeout(
            Duration::from_millis(100),
            breaker.fire(|| std::future::pending::<Result<(), String>>()),
        )
        .await;
        assert!(cancelled.is_err());

        let stats = breaker.stats();
        assert_eq!(stats.total_calls, 1);
        assert_eq!(stats.total_failures, 1);
        assert_eq!(stats.timeouts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_trial_reopens() {
        let breaker = builder().build().unwrap();
        breaker.open();
        tokio::time::sleep(COOLDOWN).await;

        let _ = tokio::time::timeout(
            Duration::from_millis(100),
            breaker.fire(|| std::future::pending::<Result<(), String>>()),
        )
        .await;

        assert!(breaker.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_trial_after_manual_close_is_ignored() {
        let breaker = builder().build().unwrap();
        breaker.open();
        tokio::time::sleep(COOLDOWN).await;

        let (release_tx, release_rx) = oneshot::channel::<()>();
        let trial = breaker.fire(move || async move {
            let _ = release_rx.await;
            Err::<(), _>("late failure")
        });
        let operator = async {
            tokio::task::yield_now().await;
            breaker.close();
            let _ = release_tx.send(());
        };

        let (trial, _) = tokio::join!(trial, operator);

        assert!(trial.is_fallback());
        assert!(breaker.is_closed(), "stale trial must not reopen");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_trial_after_manual_open_is_ignored() {
        let breaker = builder()
            .call_timeout(Duration::from_secs(30))
            .build()
            .unwrap();
        breaker.open();
        tokio::time::sleep(COOLDOWN).await;

        let (first_tx, first_rx) = oneshot::channel::<()>();
        let (second_tx, second_rx) = oneshot::channel::<()>();

        let first = breaker.fire(move || async move {
            let _ = first_rx.await;
            Ok::<_, String>("stale")
        });
        let second = async {
            tokio::task::yield_now().await;
            breaker.open();
            tokio::time::sleep(COOLDOWN).await;
            breaker
                .fire(move || async move {
                    let _ = second_rx.await;
                    Ok::<_, String>("fresh")
                })
                .await
        };
        let operator = async {
            tokio::time::sleep(COOLDOWN + Duration::from_millis(10)).await;
            let _ = first_tx.send(());
            tokio::time::sleep(Duration::from_millis(10)).await;
            let state = breaker.state();
            let _ = second_tx.send(());
            state
        };

        let (first, second, state_after_stale) = tokio::join!(first, second, operator);

        assert_eq!(first.value(), Some("stale"));
        assert_eq!(state_after_stale, BreakerState::HalfOpen, "stale trial must not close");
        assert_eq!(second.value(), Some("fresh"));
        assert!(breaker.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_does_not_advance_state() {
        let breaker = builder().build().unwrap();
        breaker.open();
        tokio::time::sleep(COOLDOWN * 2).await;

        for _ in 0..3 {
            let status = breaker.status();
            assert_eq!(status.state, BreakerState::Open);
            assert!(status.is_open);
            assert!(!status.is_half_open);
            assert!(!status.is_closed);
        }

        let json = serde_json::to_value(breaker.status()).unwrap();
        assert_eq!(json["name"], "broker");
        assert_eq!(json["state"], "OPEN");
        assert_eq!(json["isOpen"], true);
        assert_eq!(json["isHalfOpen"], false);
        assert_eq!(json["stats"]["totalCalls"], 0);

        // The next call performs the lazy transition
        assert!(succeed(&breaker).await.is_success());
        assert!(breaker.status().is_closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_follow_transition_order() {
        let breaker = builder().minimum_volume(2).build().unwrap();
        let mut rx = breaker.subscribe();

        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        let _ = succeed(&breaker).await;
        tokio::time::sleep(COOLDOWN).await;
        let _ = succeed(&breaker).await;

        assert_eq!(
            drain(&mut rx),
            [
                "failure", "fallback", "failure", "open", "fallback", "reject", "fallback",
                "halfOpen", "success", "close"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_emits_timeout_then_failure() {
        let breaker = builder().build().unwrap();
        let mut rx = breaker.subscribe();

        let _ = breaker
            .fire(|| std::future::pending::<Result<(), String>>())
            .await;

        assert_eq!(drain(&mut rx), ["timeout", "failure", "fallback"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_transitions_are_flagged() {
        let breaker = builder().build().unwrap();
        let mut rx = breaker.subscribe();

        breaker.open();
        breaker.close();
        // Closing a closed circuit only clears stats
        breaker.close();

        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], BreakerEvent::Open { manual: true, .. }));
        assert!(matches!(events[1], BreakerEvent::Close { manual: true, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_jittered_cooldown_within_bounds() {
        let breaker = builder()
            .open_cooldown(Duration::from_secs(10))
            .jitter_factor(0.5)
            .build()
            .unwrap();

        for _ in 0..20 {
            breaker.open();
            let cooldown = breaker
                .machine
                .lock()
                .machine
                .open_data()
                .expect("Open data should be present")
                .cooldown;

            assert!(cooldown >= Duration::from_secs(5) - Duration::from_millis(1));
            assert!(cooldown <= Duration::from_secs(10));
            breaker.close();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sub_millisecond_jittered_cooldown_still_blocks() {
        let cooldown = Duration::from_micros(800);
        let breaker = builder()
            .open_cooldown(cooldown)
            .jitter_factor(0.5)
            .build()
            .unwrap();

        breaker.open();
        let jittered = breaker
            .machine
            .lock()
            .machine
            .open_data()
            .expect("Open data should be present")
            .cooldown;
        assert!(jittered >= cooldown / 2 - Duration::from_nanos(1));
        assert!(jittered <= cooldown);

        assert!(succeed(&breaker).await.reason().unwrap().is_rejected());

        tokio::time::sleep(cooldown).await;
        assert!(succeed(&breaker).await.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_jitter_keeps_exact_cooldown() {
        let breaker = builder().build().unwrap();
        breaker.open();

        let slot = breaker.machine.lock();
        let data = slot.machine.open_data().expect("Open data should be present");
        assert_eq!(data.cooldown, COOLDOWN);
        assert!(data.opened_at.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_failures_open_once() {
        let opens = Arc::new(AtomicUsize::new(0));
        let counter = opens.clone();
        let breaker = Arc::new(
            builder()
                .minimum_volume(10)
                .on_open(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .build()
                .unwrap(),
        );

        let mut handles = Vec::new();
        for _ in 0..50 {
            let breaker = breaker.clone();
            handles.push(tokio::spawn(async move {
                breaker
                    .fire(|| async { Err::<(), _>("broker down") })
                    .await
                    .is_fallback()
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap());
        }

        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert!(breaker.is_open());
        let stats = breaker.stats();
        assert!(stats.total_calls >= 10);
        assert_eq!(stats.total_calls + stats.rejections, 50);
    }
}
