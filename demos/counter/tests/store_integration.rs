//! The counter running inside a real `Store`

#![allow(clippy::unwrap_used, clippy::panic)] // Test code can use unwrap/panic

use composable_epics_core::{ActionStream, Epic, ResourceKey, StateAccessor, WatchService, combine_epics};
use composable_epics_runtime::{Store, StoreError};
use composable_epics_testing::InMemoryWatchService;
use counter::{
    CounterAction, CounterConfig, CounterReducer, CounterState, IncrementEpic, WatchEpic, root_epic,
};
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

fn ctr() -> ResourceKey {
    ResourceKey::new("ctr")
}

fn counter_store(service: &InMemoryWatchService) -> Store<CounterState, CounterAction> {
    let config = CounterConfig::default().with_resource_key(ctr());
    Store::new(
        CounterState::default(),
        CounterReducer,
        root_epic(Arc::new(service.clone()), &config),
    )
}

async fn wait_until<F>(condition: F)
where
    F: Fn() -> bool,
{
    tokio::time::timeout(Duration::from_secs(1), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap();
}

async fn wait_for_subscriptions(service: &InMemoryWatchService, expected: usize) {
    wait_until(|| service.active_subscriptions(&ctr()) == expected).await;
}

async fn wait_for_action<F>(rx: &mut broadcast::Receiver<CounterAction>, predicate: F) -> CounterAction
where
    F: Fn(&CounterAction) -> bool,
{
    tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            let action = rx.recv().await.unwrap();
            if predicate(&action) {
                return action;
            }
        }
    })
    .await
    .unwrap()
}

/// Every action broadcast within `window`.
async fn collect_for(rx: &mut broadcast::Receiver<CounterAction>, window: Duration) -> Vec<CounterAction> {
    let mut seen = Vec::new();
    let _ = tokio::time::timeout(window, async {
        while let Ok(action) = rx.recv().await {
            seen.push(action);
        }
    })
    .await;
    seen
}

#[tokio::test]
async fn test_increment_round_trip() {
    let service = InMemoryWatchService::new();
    let store = counter_store(&service);
    let mut rx = store.subscribe_actions();

    store.send(CounterAction::StartWatch(ctr())).unwrap();
    wait_for_subscriptions(&service, 1).await;
    service.push(&ctr(), json!({ "value": 4 }));
    wait_for_action(&mut rx, |a| *a == CounterAction::ResourceUpdated(ctr(), 4)).await;

    store
        .send_and_wait_for(
            CounterAction::Increment,
            |a| *a == CounterAction::ResourceUpdated(ctr(), 5),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

    assert_eq!(service.writes(), vec![(ctr(), json!({ "value": 5 }))]);
    let later = collect_for(&mut rx, Duration::from_millis(50)).await;
    assert_eq!(
        later
            .iter()
            .filter(|a| **a == CounterAction::WriteSucceeded)
            .count(),
        1
    );
    assert_eq!(store.state(|s| (s.value, s.writes_succeeded)), (5, 1));
}

#[tokio::test]
async fn test_failed_write_reports_once() {
    let service = InMemoryWatchService::new();
    service.fail_next_write("quota exceeded");
    let store = counter_store(&service);
    let mut rx = store.subscribe_actions();

    store.send(CounterAction::Increment).unwrap();
    let seen = collect_for(&mut rx, Duration::from_millis(100)).await;

    let failed = seen
        .iter()
        .filter(|a| matches!(a, CounterAction::WriteFailed(_)))
        .count();
    assert_eq!(failed, 1);
    assert!(!seen.contains(&CounterAction::WriteSucceeded));

    let (writes_failed, last_error) = store.state(|s| (s.writes_failed, s.last_error.clone()));
    assert_eq!(writes_failed, 1);
    assert!(last_error.unwrap().message().contains("quota exceeded"));
}

#[tokio::test]
async fn test_value_is_not_observed_after_stop() {
    let service = InMemoryWatchService::new();
    let store = counter_store(&service);
    let mut rx = store.subscribe_actions();

    store.send(CounterAction::StartWatch(ctr())).unwrap();
    wait_for_subscriptions(&service, 1).await;

    // The replacement opens only once the first watch is gone.
    store.send(CounterAction::StartWatch(ctr())).unwrap();
    wait_until(|| service.subscriptions_opened(&ctr()) == 2).await;
    assert_eq!(service.active_subscriptions(&ctr()), 1);

    service.push(&ctr(), json!({ "value": 9 }));
    wait_for_action(&mut rx, |a| *a == CounterAction::ResourceUpdated(ctr(), 9)).await;

    store.send(CounterAction::StopWatch(ctr())).unwrap();
    wait_for_subscriptions(&service, 0).await;
    assert_eq!(service.push(&ctr(), json!({ "value": 11 })), 0);

    let later = collect_for(&mut rx, Duration::from_millis(50)).await;
    assert!(
        !later
            .iter()
            .any(|a| matches!(a, CounterAction::ResourceUpdated(..)))
    );
    assert_eq!(store.state(|s| (s.value, s.watching.clone())), (9, None));
}

#[tokio::test]
async fn test_stop_wins_over_values_already_pushed() {
    let service = InMemoryWatchService::new();
    let store = counter_store(&service);
    let mut rx = store.subscribe_actions();

    store.send(CounterAction::StartWatch(ctr())).unwrap();
    wait_for_subscriptions(&service, 1).await;

    // Queued on the subscription before the event loop sees the stop.
    service.push(&ctr(), json!({ "value": 1 }));
    service.push(&ctr(), json!({ "value": 2 }));
    store.send(CounterAction::StopWatch(ctr())).unwrap();

    wait_for_subscriptions(&service, 0).await;
    let seen = collect_for(&mut rx, Duration::from_millis(50)).await;

    assert!(
        !seen
            .iter()
            .any(|a| matches!(a, CounterAction::ResourceUpdated(..)))
    );
    assert_eq!(store.state(|s| (s.value, s.watching.clone())), (0, None));
}

#[tokio::test]
async fn test_restart_wins_over_values_already_pushed() {
    let service = InMemoryWatchService::new();
    let store = counter_store(&service);
    let mut rx = store.subscribe_actions();

    store.send(CounterAction::StartWatch(ctr())).unwrap();
    wait_for_subscriptions(&service, 1).await;

    service.push(&ctr(), json!({ "value": 7 }));
    store.send(CounterAction::StartWatch(ctr())).unwrap();

    wait_until(|| service.subscriptions_opened(&ctr()) == 2).await;
    let seen = collect_for(&mut rx, Duration::from_millis(50)).await;

    assert!(!seen.contains(&CounterAction::ResourceUpdated(ctr(), 7)));
    assert_eq!(store.state(|s| s.value), 0);
}

#[tokio::test]
async fn test_stop_while_idle_is_a_no_op() {
    let service = InMemoryWatchService::new();
    let store = counter_store(&service);
    let mut rx = store.subscribe_actions();

    let state_before = store.state(Clone::clone);
    let ids_before = service.subscription_ids(&ctr());

    store.send(CounterAction::StopWatch(ctr())).unwrap();
    wait_for_action(&mut rx, |a| matches!(a, CounterAction::StopWatch(_))).await;
    let later = collect_for(&mut rx, Duration::from_millis(30)).await;

    assert!(later.is_empty());
    assert_eq!(store.state(Clone::clone), state_before);
    assert_eq!(service.subscription_ids(&ctr()), ids_before);
    assert_eq!(store.dispatched_count(), 1);
}

#[tokio::test]
async fn test_counter_epics_settle() {
    let service = InMemoryWatchService::new();
    let store = counter_store(&service);

    store.send(CounterAction::Increment).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Increment, then its WriteSucceeded, then nothing.
    assert_eq!(store.dispatched_count(), 2);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(store.dispatched_count(), 2);
}

/// Returns its input unchanged.
struct EchoEpic;

impl Epic<CounterState, CounterAction> for EchoEpic {
    fn name(&self) -> &str {
        "echo"
    }

    fn run(
        &self,
        actions: ActionStream<CounterAction>,
        _state: StateAccessor<CounterState>,
    ) -> ActionStream<CounterAction> {
        actions
    }
}

#[tokio::test]
async fn test_echo_epic_loops_but_store_still_stops() {
    let store = Store::new(CounterState::default(), CounterReducer, EchoEpic);

    store.send(CounterAction::Increment).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(store.dispatched_count() > 100);

    store.shutdown(Duration::from_secs(1)).await.unwrap();
    let stopped_at = store.dispatched_count();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(store.dispatched_count(), stopped_at);
}

#[tokio::test]
async fn test_shutdown_closes_subscriptions() {
    let service = InMemoryWatchService::new();
    let store = counter_store(&service);

    store.send(CounterAction::StartWatch(ctr())).unwrap();
    wait_for_subscriptions(&service, 1).await;

    store.shutdown(Duration::from_secs(1)).await.unwrap();

    assert_eq!(service.active_subscriptions(&ctr()), 0);
    assert!(!store.is_running());
    assert!(matches!(
        store.send(CounterAction::Increment),
        Err(StoreError::ShutdownInProgress)
    ));
}

/// Panics whenever it sees an `Increment`.
struct FragileEpic;

impl Epic<CounterState, CounterAction> for FragileEpic {
    fn name(&self) -> &str {
        "fragile"
    }

    fn run(
        &self,
        actions: ActionStream<CounterAction>,
        _state: StateAccessor<CounterState>,
    ) -> ActionStream<CounterAction> {
        actions
            .filter_map(|action| async move {
                match action {
                    CounterAction::Increment => panic!("fragile epic cannot handle Increment"),
                    _ => None,
                }
            })
            .boxed()
    }
}

#[tokio::test]
async fn test_panicking_epic_leaves_store_running() {
    let service = InMemoryWatchService::new();
    let shared: Arc<dyn WatchService> = Arc::new(service.clone());
    let root = combine_epics::<CounterState, CounterAction>(vec![
        Box::new(FragileEpic),
        Box::new(IncrementEpic::new(Arc::clone(&shared), ctr())),
        Box::new(WatchEpic::new(shared)),
    ]);
    let store = Store::new(CounterState::default(), CounterReducer, root);

    store.send(CounterAction::StartWatch(ctr())).unwrap();
    wait_for_subscriptions(&service, 1).await;

    for expected in 1..=2 {
        store
            .send_and_wait_for(
                CounterAction::Increment,
                |a| *a == CounterAction::ResourceUpdated(ctr(), expected),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
    }

    assert!(store.is_running());
    assert_eq!(store.state(|s| (s.value, s.writes_succeeded)), (2, 2));
}
