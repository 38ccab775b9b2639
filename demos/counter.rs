//! Self-contained demo of entities, optimistic concurrency and a persistent
//! subscription consumer, backed by the in-memory log.
//!
//! Run with: `cargo run --example counter`
//!
//! Set `RUST_LOG=eventlog_es=debug` to see per-record consumer logs.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use eventlog_es::{
    ConsumerConfig, ConsumerState, DecideError, DomainEvent, Entity, Envelope, EventStoreBuilder,
    HandlerError, MemoryLog,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Counter entity
// ---------------------------------------------------------------------------

/// A counter that can be incremented, decremented, or reset.
#[derive(Debug, Clone, Default)]
struct Counter {
    value: i64,
}

#[derive(Debug)]
enum CounterCommand {
    Increment,
    Decrement,
    Reset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
enum CounterEvent {
    Incremented,
    Decremented,
    WasReset { previous: i64 },
}

impl DomainEvent for CounterEvent {
    const NAMESPACE: &'static str = "demo.counter";
    const KINDS: &'static [&'static str] = &["Incremented", "Decremented", "WasReset"];
}

#[derive(Debug, thiserror::Error)]
enum CounterError {
    #[error("counter is already zero, cannot decrement")]
    AlreadyZero,
}

impl Entity for Counter {
    const ENTITY_TYPE: &'static str = "Counter";
    type Command = CounterCommand;
    type Event = CounterEvent;
    type Error = CounterError;

    fn apply(mut self, event: &CounterEvent) -> Self {
        match event {
            CounterEvent::Incremented => self.value += 1,
            CounterEvent::Decremented => self.value -= 1,
            CounterEvent::WasReset { .. } => self.value = 0,
        }
        self
    }

    fn decide(&self, command: CounterCommand) -> Result<Vec<CounterEvent>, DecideError<CounterError>> {
        match command {
            CounterCommand::Increment => Ok(vec![CounterEvent::Incremented]),
            CounterCommand::Decrement if self.value <= 0 => {
                Err(DecideError::Rejected(CounterError::AlreadyZero))
            }
            CounterCommand::Decrement => Ok(vec![CounterEvent::Decremented]),
            // Resetting zero is accepted and changes nothing.
            CounterCommand::Reset if self.value == 0 => Ok(vec![]),
            CounterCommand::Reset => Ok(vec![CounterEvent::WasReset {
                previous: self.value,
            }]),
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let log = MemoryLog::new();
    let store = EventStoreBuilder::new()
        .consumer_config(ConsumerConfig {
            reattach_base_delay: Duration::from_millis(50),
            ..ConsumerConfig::default()
        })
        .with_service(Arc::new(log.clone()));

    // Totals maintained by the consumer.
    let increments = Arc::new(Mutex::new(0u64));
    let resets = Arc::new(Mutex::new(0u64));
    let inc = Arc::clone(&increments);
    let rst = Arc::clone(&resets);

    let consumer = store
        .subscriber::<Counter>("totals")
        .on(
            "Incremented",
            move |_: &Envelope<CounterEvent>| -> Result<(), HandlerError> {
                *inc.lock().map_err(|e| e.to_string())? += 1;
                Ok(())
            },
        )
        .on(
            "WasReset",
            move |envelope: &Envelope<CounterEvent>| -> Result<(), HandlerError> {
                println!("counter {} was reset", envelope.entity_id);
                *rst.lock().map_err(|e| e.to_string())? += 1;
                Ok(())
            },
        )
        .build()
        .spawn();

    let counters = store.repository::<Counter>();
    let alpha = counters.create(CounterCommand::Increment).await?;
    let alpha = counters.update(alpha.id, CounterCommand::Increment).await?;
    let alpha = counters.update(alpha.id, CounterCommand::Increment).await?;

    let beta = counters.create(CounterCommand::Increment).await?;
    counters.update(beta.id, CounterCommand::Decrement).await?;
    let beta = counters.update(beta.id, CounterCommand::Increment).await?;

    let alpha = counters.update(alpha.id, CounterCommand::Reset).await?;
    println!("alpha = {} (version {})", alpha.entity.value, alpha.version);
    println!("beta  = {} (version {})", beta.entity.value, beta.version);

    // The connection drops; the consumer re-attaches and resumes.
    let mut state = consumer.state_changes();
    state.wait_for(|s| *s == ConsumerState::Attached).await?;
    log.drop_subscription(
        "$ce-Counter",
        "totals",
        eventlog_es::DropReason::ConnectionClosed,
        None,
    );

    let total = log.records("$ce-Counter").len();
    while log.acked_count("$ce-Counter", "totals") < total {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    consumer.shutdown().await?;

    let increments = *increments.lock().map_err(|e| e.to_string())?;
    let resets = *resets.lock().map_err(|e| e.to_string())?;
    println!("totals: increments={increments}, resets={resets}");

    assert_eq!(alpha.entity.value, 0, "alpha should be reset to 0");
    assert_eq!(beta.entity.value, 1, "beta should be 1 (inc, dec, inc)");
    assert!(increments >= 5, "at-least-once delivery");
    println!("all assertions passed");

    Ok(())
}
