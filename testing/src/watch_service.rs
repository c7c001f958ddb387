//! In-memory watch service for fast, deterministic testing
//!
//! [`InMemoryWatchService`] is a push-driven fake of the external resource:
//! - tests push values with [`InMemoryWatchService::push`]
//! - every live subscription to that key receives them
//! - writes are recorded and echoed to live subscriptions, like a real
//!   document store notifying its watchers
//!
//! Subscriptions are registered as soon as `watch` is called, so a test can
//! push values before the subscriber first polls. A watch delivers changes
//! only; it does not replay the current document.

#![allow(clippy::missing_panics_doc)] // Locks recover from poisoning, nothing panics

use composable_epics_core::{
    RawValue, RawWatchStream, ResourceKey, WatchError, WatchService, WriteError,
};
use futures::StreamExt;
use futures::channel::mpsc;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// In-memory watch service for fast, deterministic testing.
///
/// Cloning is cheap; clones share the same documents and subscriptions.
///
/// # Example
///
/// ```
/// use composable_epics_core::{ResourceKey, SubscriptionHandle};
/// use composable_epics_testing::InMemoryWatchService;
/// use futures::StreamExt;
///
/// # tokio_test::block_on(async {
/// let service = InMemoryWatchService::new();
/// let key = ResourceKey::new("counters/a");
/// let mut handle = SubscriptionHandle::open(&service, key.clone());
///
/// assert_eq!(service.push(&key, serde_json::json!({ "value": 3 })), 1);
/// assert_eq!(handle.next().await, Some(Ok(serde_json::json!({ "value": 3 }))));
///
/// handle.close();
/// assert_eq!(service.active_subscriptions(&key), 0);
/// # });
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryWatchService {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    documents: HashMap<ResourceKey, RawValue>,
    subscribers: HashMap<ResourceKey, Vec<Subscriber>>,
    opened: HashMap<ResourceKey, usize>,
    next_id: u64,
    writes: Vec<(ResourceKey, RawValue)>,
    write_failures: VecDeque<String>,
    write_latency: Option<Duration>,
}

#[derive(Debug)]
struct Subscriber {
    id: u64,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<Result<RawValue, WatchError>>,
}

impl Subscriber {
    fn is_live(&self) -> bool {
        !self.cancel.is_cancelled() && !self.tx.is_closed()
    }
}

impl Inner {
    fn live(&mut self, key: &ResourceKey) -> &mut Vec<Subscriber> {
        let subscribers = self.subscribers.entry(key.clone()).or_default();
        subscribers.retain(Subscriber::is_live);
        subscribers
    }
}

impl InMemoryWatchService {
    /// Create an empty service
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every write by `latency` before it is applied
    #[must_use]
    pub fn with_write_latency(self, latency: Duration) -> Self {
        self.lock().write_latency = Some(latency);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `value` under `key` and deliver it to every live subscription.
    ///
    /// Returns the number of subscriptions the value was delivered to.
    pub fn push(&self, key: &ResourceKey, value: RawValue) -> usize {
        let mut inner = self.lock();
        inner.documents.insert(key.clone(), value.clone());

        let delivered = inner
            .live(key)
            .iter()
            .filter(|s| s.tx.unbounded_send(Ok(value.clone())).is_ok())
            .count();

        tracing::trace!(key = %key, delivered, "Pushed value");
        delivered
    }

    /// Fail every live subscription to `key`.
    ///
    /// Each receives one [`WatchError::SubscriptionFailed`] and is then
    /// forgotten by the service. Returns the number of failed subscriptions.
    pub fn fail_subscriptions(&self, key: &ResourceKey, reason: &str) -> usize {
        let mut inner = self.lock();
        let failed: Vec<Subscriber> = inner.live(key).drain(..).collect();

        for subscriber in &failed {
            let _ = subscriber.tx.unbounded_send(Err(WatchError::SubscriptionFailed {
                key: key.clone(),
                reason: reason.to_string(),
            }));
        }
        failed.len()
    }

    /// Make the next write fail with `reason`.
    ///
    /// Failures queue up: calling this twice fails the next two writes.
    pub fn fail_next_write(&self, reason: impl Into<String>) {
        self.lock().write_failures.push_back(reason.into());
    }

    /// Number of subscriptions to `key` that are still live
    #[must_use]
    pub fn active_subscriptions(&self, key: &ResourceKey) -> usize {
        self.lock().live(key).len()
    }

    /// Ids of the live subscriptions to `key`, oldest first
    ///
    /// Ids are unique for the lifetime of the service, so a re-opened watch
    /// shows up with a new id.
    #[must_use]
    pub fn subscription_ids(&self, key: &ResourceKey) -> Vec<u64> {
        self.lock().live(key).iter().map(|s| s.id).collect()
    }

    /// Total number of subscriptions ever opened on `key`
    #[must_use]
    pub fn subscriptions_opened(&self, key: &ResourceKey) -> usize {
        self.lock().opened.get(key).copied().unwrap_or(0)
    }

    /// Current document stored under `key`
    #[must_use]
    pub fn document(&self, key: &ResourceKey) -> Option<RawValue> {
        self.lock().documents.get(key).cloned()
    }

    /// Every successful write, in the order it was applied
    #[must_use]
    pub fn writes(&self) -> Vec<(ResourceKey, RawValue)> {
        self.lock().writes.clone()
    }
}

impl WatchService for InMemoryWatchService {
    fn watch(&self, key: &ResourceKey, cancel: CancellationToken) -> RawWatchStream {
        let (tx, rx) = mpsc::unbounded();

        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        *inner.opened.entry(key.clone()).or_default() += 1;
        inner.live(key).push(Subscriber {
            id,
            cancel: cancel.clone(),
            tx,
        });
        drop(inner);

        tracing::trace!(key = %key, id, "Registered subscription");
        rx.take_until(cancel.cancelled_owned()).boxed()
    }

    fn write(
        &self,
        key: &ResourceKey,
        value: RawValue,
    ) -> Pin<Box<dyn Future<Output = Result<(), WriteError>> + Send + '_>> {
        let key = key.clone();
        Box::pin(async move {
            let latency = self.lock().write_latency;
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }

            let failure = self.lock().write_failures.pop_front();
            if let Some(reason) = failure {
                tracing::debug!(key = %key, reason = %reason, "Injected write failure");
                return Err(WriteError::new(key, reason));
            }

            self.lock().writes.push((key.clone(), value.clone()));
            self.push(&key, value);
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_push_reaches_only_live_subscriptions() {
        let service = InMemoryWatchService::new();
        let key = ResourceKey::new("doc");

        let first = CancellationToken::new();
        let mut a = service.watch(&key, first.clone());
        let mut b = service.watch(&key, CancellationToken::new());
        assert_eq!(service.subscription_ids(&key), vec![0, 1]);

        first.cancel();
        assert_eq!(service.push(&key, json!(1)), 1);

        assert_eq!(a.next().await, None);
        assert_eq!(b.next().await, Some(Ok(json!(1))));
        assert_eq!(service.subscriptions_opened(&key), 2);
        assert_eq!(service.active_subscriptions(&key), 1);
    }

    #[tokio::test]
    async fn test_dropped_stream_is_pruned() {
        let service = InMemoryWatchService::new();
        let key = ResourceKey::new("doc");

        drop(service.watch(&key, CancellationToken::new()));

        assert_eq!(service.active_subscriptions(&key), 0);
        assert_eq!(service.push(&key, json!(2)), 0);
        assert_eq!(service.document(&key), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_write_records_and_notifies() {
        let service = InMemoryWatchService::new();
        let key = ResourceKey::new("doc");
        let mut watch = service.watch(&key, CancellationToken::new());

        service.write(&key, json!({ "value": 5 })).await.unwrap();

        assert_eq!(watch.next().await, Some(Ok(json!({ "value": 5 }))));
        assert_eq!(service.writes(), vec![(key.clone(), json!({ "value": 5 }))]);
    }

    #[tokio::test]
    async fn test_injected_write_failure() {
        let service = InMemoryWatchService::new();
        let key = ResourceKey::new("doc");
        service.fail_next_write("quota exceeded");

        let result = service.write(&key, json!(1)).await;

        assert_eq!(result, Err(WriteError::new(key.clone(), "quota exceeded")));
        assert!(service.writes().is_empty());
        assert!(service.write(&key, json!(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_fail_subscriptions_delivers_error() {
        let service = InMemoryWatchService::new();
        let key = ResourceKey::new("doc");
        let mut watch = service.watch(&key, CancellationToken::new());

        assert_eq!(service.fail_subscriptions(&key, "reset"), 1);

        assert!(matches!(
            watch.next().await,
            Some(Err(WatchError::SubscriptionFailed { .. }))
        ));
        assert_eq!(service.active_subscriptions(&key), 0);
    }
}
