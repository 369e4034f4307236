//! Self-contained example demonstrating a counter store: direct dispatch,
//! attached action sources, middleware, an override reducer, and both
//! kinds of state subscription.
//!
//! Run with: `RUST_LOG=statefold=debug cargo run --example counter`

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use statefold::{CompositeReducer, Middleware, StoreBuilder, TracingMiddleware};
use tokio_stream::{Stream, StreamExt};
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Counter state and actions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
struct Counter {
    value: i64,
    changes: u32,
}

#[derive(Debug, Clone)]
enum CounterAction {
    Increment(i64),
    Decrement(i64),
    Reset,
}

fn apply(state: Counter, action: &CounterAction) -> Counter {
    let value = match action {
        CounterAction::Increment(by) => state.value + by,
        CounterAction::Decrement(by) => state.value - by,
        CounterAction::Reset => 0,
    };
    Counter { value, ..state }
}

fn track_changes(state: Counter, _action: &CounterAction) -> Counter {
    Counter {
        changes: state.changes + 1,
        ..state
    }
}

type ActionSource = Pin<Box<dyn Stream<Item = CounterAction> + Send>>;

// ---------------------------------------------------------------------------
// Audit middleware
// ---------------------------------------------------------------------------

/// Prints every transition once it has been reduced.
struct Audit;

impl Middleware<Counter, CounterAction> for Audit {
    fn after_reduce(&self, action: &CounterAction, next_state: &Counter) {
        println!("  audit: {action:?} -> {}", next_state.value);
    }

    fn name(&self) -> &str {
        "audit"
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let reducer: CompositeReducer<Counter, CounterAction> =
        CompositeReducer::new().with(apply).with(track_changes);

    let store = StoreBuilder::new(Counter::default(), reducer)
        .thread_name("counter-store")
        .middleware(Arc::new(TracingMiddleware::<Counter, CounterAction>::new()))
        .build()?;

    let audit: Arc<dyn Middleware<Counter, CounterAction>> = Arc::new(Audit);
    store.add_middleware(audit.clone())?;

    // Watch the distinct value stream in the background.
    let mut states = store.states();
    let watcher = tokio::spawn(async move {
        while let Some(Ok(state)) = states.recv().await {
            println!("state: value={} changes={}", state.value, state.changes);
        }
        println!("state stream ended");
    });

    println!("--- direct dispatch ---");
    store.dispatch(CounterAction::Increment(2))?;
    store.dispatch(CounterAction::Increment(10))?;
    store.dispatch(CounterAction::Decrement(5))?;
    println!("current: {:?}", store.state().await?);

    println!("--- attached sources ---");
    let ticks = tokio_stream::iter(1..=3)
        .throttle(Duration::from_millis(20))
        .map(CounterAction::Increment);
    let sources: [ActionSource; 2] = [
        Box::pin(ticks),
        Box::pin(tokio_stream::iter(vec![CounterAction::Decrement(1); 4])),
    ];
    let handles = store.dispatch_streams(sources);
    while handles.iter().any(|h| !h.is_finished()) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    for (i, handle) in handles.iter().enumerate() {
        println!("source {i} forwarded {} actions", handle.forwarded());
    }
    println!("current: {:?}", store.state().await?);

    println!("--- override reducer caps the value at 10 ---");
    store.set_override_reducer(|state: Counter, _: &CounterAction| Counter {
        value: state.value.min(10),
        ..state
    })?;
    store.dispatch(CounterAction::Increment(100))?;
    store.clear_override_reducer()?;

    println!("--- audit removed ---");
    store.remove_middleware(&audit).await?;
    store.dispatch(CounterAction::Reset)?;
    println!("current: {:?}", store.state().await?);

    store.shutdown();
    watcher.await?;
    Ok(())
}
