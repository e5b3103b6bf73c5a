//! Guarding a flaky pub/sub broker
//!
//! Run with `RUST_LOG=debug cargo run --example publisher` to see every event.

use breaker_guard::{CallOptions, CircuitBreaker, Fired, with_completion};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Stand-in for a callback-style broker client
struct FlakyBroker {
    healthy: AtomicBool,
    published: AtomicU64,
}

impl FlakyBroker {
    fn publish<F>(self: &Arc<Self>, channel: &str, message: String, callback: F)
    where
        F: FnOnce(Result<u64, String>) + Send + 'static,
    {
        let broker = Arc::clone(self);
        let channel = channel.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if broker.healthy.load(Ordering::SeqCst) {
                info!(channel = %channel, message = %message, "📨 Broker accepted message");
                callback(Ok(broker.published.fetch_add(1, Ordering::SeqCst) + 1));
            } else {
                callback(Err("ECONNREFUSED".to_string()));
            }
        });
    }
}

async fn publish(breaker: &CircuitBreaker, broker: &Arc<FlakyBroker>, n: u32) -> Fired<String> {
    let broker = Arc::clone(broker);
    breaker
        .fire_with(
            move || {
                with_completion(move |done| {
                    broker.publish("orders", format!("order #{}", n), move |res| {
                        done.complete(res.map(|receivers| format!("delivered to {}", receivers)))
                    });
                    Ok::<_, String>(())
                })
            },
            CallOptions::new().with_fallback(move |ctx| {
                warn!(circuit = ctx.circuit_name, reason = %ctx.reason, "Publishing to console instead");
                Ok::<_, String>("fallback-success".to_string())
            }),
        )
        .await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let broker = Arc::new(FlakyBroker {
        healthy: AtomicBool::new(true),
        published: AtomicU64::new(0),
    });

    let breaker = CircuitBreaker::builder("broker")
        .call_timeout(Duration::from_secs(1))
        .error_threshold_percentage(50.0)
        .open_cooldown(Duration::from_secs(2))
        .minimum_volume(3)
        .on_open(|name| println!("🔴 Circuit '{}' opened!", name))
        .on_close(|name| println!("🟢 Circuit '{}' closed!", name))
        .on_half_open(|name| println!("🟡 Circuit '{}' half-open, testing...", name))
        .build()?;

    println!("--- Healthy broker ---");
    for n in 1..=3 {
        println!("{:?}", publish(&breaker, &broker, n).await.value());
    }

    println!("--- Broker goes down ---");
    broker.healthy.store(false, Ordering::SeqCst);
    for n in 4..=10 {
        let fired = publish(&breaker, &broker, n).await;
        println!("{:?} ({})", fired.reason().map(ToString::to_string), breaker.state());
    }
    println!("{}", serde_json::to_string_pretty(&breaker.status())?);

    println!("--- Broker recovers ---");
    broker.healthy.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(2)).await;
    println!("{:?}", publish(&breaker, &broker, 11).await.value());
    println!("State: {}", breaker.state());

    Ok(())
}
