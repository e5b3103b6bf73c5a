//! Event fan-out for circuit breaker transitions and call outcomes
//!
//! Every event goes to `tracing`, then to the matching transition callback,
//! then to generic listeners, then to the broadcast channel.

use crate::{events::BreakerEvent, millis};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

type NameCallback = Arc<dyn Fn(&str) + Send + Sync>;
type EventCallback = Arc<dyn Fn(&BreakerEvent) + Send + Sync>;

/// Callbacks for circuit breaker events
#[derive(Clone)]
pub struct Callbacks {
    pub on_open: Option<NameCallback>,
    pub on_close: Option<NameCallback>,
    pub on_half_open: Option<NameCallback>,
    pub listeners: Vec<EventCallback>,
    channel: broadcast::Sender<BreakerEvent>,
}

impl Callbacks {
    pub fn new(capacity: usize) -> Self {
        let (channel, _) = broadcast::channel(capacity.max(1));
        Self {
            on_open: None,
            on_close: None,
            on_half_open: None,
            listeners: Vec::new(),
            channel,
        }
    }

    /// Swap the broadcast channel for one with a different buffer size
    pub(crate) fn with_capacity(mut self, capacity: usize) -> Self {
        self.channel = broadcast::channel(capacity.max(1)).0;
        self
    }

    /// Subscribe to every event emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerEvent> {
        self.channel.subscribe()
    }

    pub fn emit(&self, event: BreakerEvent) {
        log_event(&event);

        match &event {
            BreakerEvent::Open { circuit, .. } => trigger(&self.on_open, circuit),
            BreakerEvent::Close { circuit, .. } => trigger(&self.on_close, circuit),
            BreakerEvent::HalfOpen { circuit } => trigger(&self.on_half_open, circuit),
            _ => {}
        }

        for listener in &self.listeners {
            listener(&event);
        }

        // No subscribers is fine
        let _ = self.channel.send(event);
    }
}

fn trigger(callback: &Option<NameCallback>, circuit: &str) {
    if let Some(callback) = callback {
        callback(circuit);
    }
}

fn log_event(event: &BreakerEvent) {
    match event {
        BreakerEvent::Open {
            circuit,
            failure_percentage,
            total_calls,
            manual,
        } => warn!(
            circuit = %circuit,
            failure_percentage,
            total_calls,
            manual,
            "🔴 Circuit breaker opened"
        ),
        BreakerEvent::HalfOpen { circuit } => {
            info!(circuit = %circuit, "🟡 Circuit breaker half-open, admitting trial call")
        }
        BreakerEvent::Close { circuit, manual } => {
            info!(circuit = %circuit, manual, "🟢 Circuit breaker closed")
        }
        BreakerEvent::Success { circuit, latency } => debug!(
            circuit = %circuit,
            latency_ms = millis(*latency),
            "Guarded call succeeded"
        ),
        BreakerEvent::Failure {
            circuit,
            error,
            latency,
        } => debug!(
            circuit = %circuit,
            error = %error,
            latency_ms = millis(*latency),
            "Guarded call failed"
        ),
        BreakerEvent::Timeout { circuit, timeout } => debug!(
            circuit = %circuit,
            timeout_ms = millis(*timeout),
            "Guarded call timed out"
        ),
        BreakerEvent::Reject { circuit, state } => {
            debug!(circuit = %circuit, state = %state, "Guarded call rejected")
        }
        BreakerEvent::Fallback { circuit, recovered } => {
            debug!(circuit = %circuit, recovered, "Fallback executed")
        }
    }
}

impl Default for Callbacks {
    fn default() -> Self {
        Self::new(64)
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_half_open", &self.on_half_open.is_some())
            .field("listeners", &self.listeners.len())
            .field("subscribers", &self.channel.receiver_count())
            .finish()
    }
}
