//! Counter example binary
//!
//! Simulates a UI mounting a counter view, clicking increment a few times,
//! another client writing to the same document, and the view unmounting.

use composable_epics_core::ResourceKey;
use composable_epics_runtime::Store;
use composable_epics_runtime::metrics::MetricsServer;
use composable_epics_testing::InMemoryWatchService;
use counter::{CounterAction, CounterConfig, CounterReducer, CounterState, root_epic};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "counter=debug,composable_epics_runtime=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = CounterConfig::from_env()?;
    let mut metrics = MetricsServer::new("127.0.0.1:9000".parse()?);
    metrics.start()?;

    println!("=== Counter Example: Epic Middleware ===\n");
    println!("Document: {}", config.resource_key);

    let service = Arc::new(InMemoryWatchService::new());
    let store = Store::new(
        CounterState::default(),
        CounterReducer,
        root_epic(service.clone(), &config),
    );
    let key = config.resource_key.clone();

    // Mount: start watching
    println!("\n>>> Sending: StartWatch({key})");
    store.send(CounterAction::StartWatch(key.clone()))?;
    wait_for_subscriptions(&service, &key, 1).await?;

    // Each click writes value + 1; the watch brings the new value back
    for _ in 0..3 {
        println!("\n>>> Sending: Increment");
        store
            .send_and_wait_for(
                CounterAction::Increment,
                |a| matches!(a, CounterAction::ResourceUpdated(..) | CounterAction::WriteFailed(_)),
                Duration::from_secs(1),
            )
            .await?;
        println!("Value after Increment: {}", store.state(|s| s.value));
    }

    // Another client writes directly
    println!("\n>>> Another client writes 42");
    let mut updates = store.subscribe_actions();
    service.push(&key, serde_json::json!({ "value": 42 }));
    while let Ok(action) = updates.recv().await {
        if matches!(action, CounterAction::ResourceUpdated(..)) {
            break;
        }
    }
    println!("Value after remote write: {}", store.state(|s| s.value));

    // Unmount: stop watching; later writes are not observed
    println!("\n>>> Sending: StopWatch({key})");
    store.send(CounterAction::StopWatch(key.clone()))?;
    wait_for_subscriptions(&service, &key, 0).await?;
    service.push(&key, serde_json::json!({ "value": 100 }));

    let state = store.state(Clone::clone);
    println!("Value after StopWatch: {} (document holds 100)", state.value);
    println!(
        "Writes: {} succeeded, {} failed",
        state.writes_succeeded, state.writes_failed
    );
    println!("Live subscriptions: {}", service.active_subscriptions(&key));

    store.shutdown(config.shutdown_timeout).await?;

    if let Some(rendered) = metrics.render() {
        println!("\n=== Metrics ({}) ===\n{rendered}", metrics.addr());
    }

    Ok(())
}

/// Wait until the service reports `expected` live subscriptions on `key`.
async fn wait_for_subscriptions(
    service: &InMemoryWatchService,
    key: &ResourceKey,
    expected: usize,
) -> anyhow::Result<()> {
    tokio::time::timeout(Duration::from_secs(1), async {
        while service.active_subscriptions(key) != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .map_err(|_| anyhow::anyhow!("watch on '{key}' did not reach {expected} subscriptions"))
}
