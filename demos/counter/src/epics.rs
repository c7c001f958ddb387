//! Counter Epics
//!
//! - [`IncrementEpic`]: `Increment` → write `value + 1` → `WriteSucceeded` / `WriteFailed`
//! - [`WatchEpic`]: `StartWatch` / `StopWatch` → one live watch → `ResourceUpdated`

use crate::{CounterAction, CounterConfig, CounterDocument, CounterState, ErrorInfo};
use composable_epics_core::{
    ActionStream, CombinedEpic, Epic, ResourceKey, ResourceWatcher, StateAccessor, Switch,
    WatchService, combine_epics, merge_map, switch_latest,
};
use futures::{StreamExt, stream};
use std::sync::Arc;

/// Build the application's root Epic
#[must_use]
pub fn root_epic(
    service: Arc<dyn WatchService>,
    config: &CounterConfig,
) -> CombinedEpic<CounterState, CounterAction> {
    combine_epics(vec![
        Box::new(IncrementEpic::new(Arc::clone(&service), config.resource_key.clone())),
        Box::new(WatchEpic::new(service)),
    ])
    .with_name("counter")
}

/// Writes `value + 1` for every `Increment`.
///
/// The value is read from state when the `Increment` arrives. Writes are
/// independent: overlapping increments race and the last write wins. Every
/// write yields exactly one `WriteSucceeded` or `WriteFailed`.
pub struct IncrementEpic {
    service: Arc<dyn WatchService>,
    key: ResourceKey,
}

impl IncrementEpic {
    /// Create an Epic writing to `key`
    #[must_use]
    pub fn new(service: Arc<dyn WatchService>, key: ResourceKey) -> Self {
        Self { service, key }
    }
}

impl Epic<CounterState, CounterAction> for IncrementEpic {
    fn name(&self) -> &str {
        "increment"
    }

    fn run(
        &self,
        actions: ActionStream<CounterAction>,
        state: StateAccessor<CounterState>,
    ) -> ActionStream<CounterAction> {
        let service = Arc::clone(&self.service);
        let key = self.key.clone();

        merge_map(actions, move |action| match action {
            CounterAction::Increment => {
                let current = state.with(|s| s.value);
                Some(write_next(Arc::clone(&service), key.clone(), current))
            },
            _ => None,
        })
    }
}

#[tracing::instrument(skip(service, key), fields(key = %key))]
async fn write_next(service: Arc<dyn WatchService>, key: ResourceKey, current: i64) -> CounterAction {
    let Some(value) = current.checked_add(1) else {
        metrics::counter!("epic_writes_total", "outcome" => "failed").increment(1);
        return CounterAction::WriteFailed(ErrorInfo::new("counter overflow"));
    };

    let document = match serde_json::to_value(CounterDocument { value }) {
        Ok(document) => document,
        Err(e) => {
            metrics::counter!("epic_writes_total", "outcome" => "failed").increment(1);
            return CounterAction::WriteFailed(ErrorInfo::new(e.to_string()));
        },
    };

    match service.write(&key, document).await {
        Ok(()) => {
            tracing::debug!(value, "Write succeeded");
            metrics::counter!("epic_writes_total", "outcome" => "succeeded").increment(1);
            CounterAction::WriteSucceeded
        },
        Err(error) => {
            tracing::warn!(error = %error, "Write failed");
            metrics::counter!("epic_writes_total", "outcome" => "failed").increment(1);
            CounterAction::WriteFailed(ErrorInfo::from(&error))
        },
    }
}

/// Keeps at most one live watch and reports every value it pushes.
///
/// - `StartWatch(key)` closes the current watch (if any) and opens one on `key`
/// - `StopWatch(key)` closes the current watch if it is on `key`, otherwise
///   does nothing
/// - a failing watch ends with `WatchFailed`
pub struct WatchEpic {
    service: Arc<dyn WatchService>,
}

impl WatchEpic {
    /// Create an Epic watching through `service`
    #[must_use]
    pub fn new(service: Arc<dyn WatchService>) -> Self {
        Self { service }
    }
}

impl Epic<CounterState, CounterAction> for WatchEpic {
    fn name(&self) -> &str {
        "watch"
    }

    fn run(
        &self,
        actions: ActionStream<CounterAction>,
        _state: StateAccessor<CounterState>,
    ) -> ActionStream<CounterAction> {
        let service = Arc::clone(&self.service);

        switch_latest(actions, move |action| match action {
            CounterAction::StartWatch(key) => {
                Switch::Start(key.clone(), watch_updates(Arc::clone(&service), key))
            },
            CounterAction::StopWatch(key) => Switch::Stop(key),
            _ => Switch::Ignore,
        })
    }
}

/// Updates from one watch on `key`.
///
/// The subscription is opened on first poll, after `switch_latest` has
/// dropped the watch it replaces.
fn watch_updates(service: Arc<dyn WatchService>, key: ResourceKey) -> ActionStream<CounterAction> {
    stream::once(async move { ResourceWatcher::<CounterDocument>::open(service.as_ref(), key) })
        .flat_map(|watcher| {
            let key = watcher.key().clone();
            watcher.map(move |update| match update {
                Ok(document) => CounterAction::ResourceUpdated(key.clone(), document.value),
                Err(error) => CounterAction::WatchFailed(key.clone(), ErrorInfo::from(&error)),
            })
        })
        .boxed()
}
