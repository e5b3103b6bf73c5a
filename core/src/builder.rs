//! Builder API for ergonomic circuit breaker configuration

use crate::{
    callbacks::Callbacks,
    circuit::{CircuitBreaker, CircuitContext, Config},
    errors::ConfigError,
    events::BreakerEvent,
};
use std::sync::Arc;
use std::time::Duration;

/// Builder for creating circuit breakers with fluent API
pub struct CircuitBuilder {
    name: String,
    config: Config,
    callbacks: Callbacks,
}

impl CircuitBuilder {
    /// Create a new builder for a circuit with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: Config::default(),
            callbacks: Callbacks::default(),
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set the hard upper bound on a single call
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = timeout;
        self
    }

    /// Set the failure percentage (0-100) that opens the circuit
    pub fn error_threshold_percentage(mut self, percentage: f64) -> Self {
        self.config.error_threshold_percentage = percentage;
        self
    }

    /// Set how long the circuit stays open before a trial call
    pub fn open_cooldown(mut self, cooldown: Duration) -> Self {
        self.config.open_cooldown = cooldown;
        self
    }

    /// Set the span of the rolling stats window
    pub fn rolling_window(mut self, window: Duration) -> Self {
        self.config.rolling_window = window;
        self
    }

    /// Set the number of buckets in the rolling window
    pub fn rolling_buckets(mut self, buckets: usize) -> Self {
        self.config.rolling_buckets = buckets;
        self
    }

    /// Set minimum number of calls before the failure percentage is evaluated
    pub fn minimum_volume(mut self, calls: u64) -> Self {
        self.config.minimum_volume = calls;
        self
    }

    /// Set the jitter factor (0.0 = no jitter, 1.0 = full jitter)
    /// Uses chrono-machines formula: cooldown * (1 - jitter + rand * jitter)
    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.config.jitter_factor = factor;
        self
    }

    /// Set the buffer size of the event channel returned by `subscribe()`
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    /// Set callback for when circuit opens
    pub fn on_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_open = Some(Arc::new(f));
        self
    }

    /// Set callback for when circuit closes
    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_close = Some(Arc::new(f));
        self
    }

    /// Set callback for when circuit enters half-open
    pub fn on_half_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_half_open = Some(Arc::new(f));
        self
    }

    /// Add a listener for every event (transitions and call outcomes)
    ///
    /// Listeners run synchronously while the breaker lock is held and must
    /// not call back into the same breaker.
    pub fn on_event<F>(mut self, f: F) -> Self
    where
        F: Fn(&BreakerEvent) + Send + Sync + 'static,
    {
        self.callbacks.listeners.push(Arc::new(f));
        self
    }

    /// Build the circuit breaker
    pub fn build(self) -> Result<CircuitBreaker, ConfigError> {
        self.config.validate()?;

        let callbacks = self.callbacks.with_capacity(self.config.event_capacity);
        let context = CircuitContext::new(self.name, self.config);

        Ok(CircuitBreaker::with_context_and_callbacks(context, callbacks))
    }
}
