//! Subscription handles and typed resource watchers.
//!
//! A [`SubscriptionHandle`] owns exactly one live subscription. Its
//! lifecycle is open → emitting zero or more values → closed, where closing
//! happens explicitly ([`SubscriptionHandle::close`]), on drop, when the
//! service ends the stream, or after the first error.
//!
//! Closing is total: once closed, `poll_next` returns `Ready(None)` without
//! touching the service stream again, so no value can be delivered after a
//! stop, even if the service had more queued.
//!
//! [`ResourceWatcher`] wraps a handle and decodes raw values into a domain
//! type.

use crate::resource::ResourceKey;
use crate::service::{RawWatchStream, WatchError, WatchService};
use futures::Stream;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio_util::sync::CancellationToken;

/// Owner of one live subscription to the watch service.
pub struct SubscriptionHandle {
    key: ResourceKey,
    cancel: CancellationToken,
    values: Option<RawWatchStream>,
}

impl SubscriptionHandle {
    /// Open a subscription to `key`.
    ///
    /// The service stream is lazy; nothing is received until the handle is
    /// polled.
    #[must_use]
    pub fn open(service: &dyn WatchService, key: ResourceKey) -> Self {
        let cancel = CancellationToken::new();
        let values = service.watch(&key, cancel.clone());

        metrics::counter!("watch_subscriptions_opened_total").increment(1);
        tracing::debug!(key = %key, "Subscription opened");

        Self {
            key,
            cancel,
            values: Some(values),
        }
    }

    /// The watched key
    #[must_use]
    pub const fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// Whether the subscription has been closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.values.is_none() || self.cancel.is_cancelled()
    }

    /// Close the subscription.
    ///
    /// Signals the service to release its side and drops the value stream.
    /// Idempotent.
    pub fn close(&mut self) {
        if self.values.take().is_some() {
            self.cancel.cancel();
            metrics::counter!("watch_subscriptions_closed_total").increment(1);
            tracing::debug!(key = %self.key, "Subscription closed");
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("key", &self.key)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Stream for SubscriptionHandle {
    type Item = Result<serde_json::Value, WatchError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if this.cancel.is_cancelled() {
            this.close();
            return Poll::Ready(None);
        }
        let Some(values) = this.values.as_mut() else {
            return Poll::Ready(None);
        };

        match values.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(value))) => Poll::Ready(Some(Ok(value))),
            Poll::Ready(Some(Err(error))) => {
                tracing::warn!(key = %this.key, error = %error, "Subscription failed");
                this.close();
                Poll::Ready(Some(Err(error)))
            },
            Poll::Ready(None) => {
                tracing::debug!(key = %this.key, "Service ended subscription");
                this.close();
                Poll::Ready(None)
            },
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Typed watch over one resource key.
///
/// Decodes each raw value into `T`. A value that does not decode ends the
/// watch with [`WatchError::Decode`].
pub struct ResourceWatcher<T> {
    handle: SubscriptionHandle,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> ResourceWatcher<T> {
    /// Open a typed watch on `key`.
    #[must_use]
    pub fn open(service: &dyn WatchService, key: ResourceKey) -> Self {
        Self {
            handle: SubscriptionHandle::open(service, key),
            _marker: PhantomData,
        }
    }

    /// The watched key
    #[must_use]
    pub const fn key(&self) -> &ResourceKey {
        self.handle.key()
    }

    /// Whether the underlying subscription has been closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Close the underlying subscription
    pub fn close(&mut self) {
        self.handle.close();
    }
}

impl<T> std::fmt::Debug for ResourceWatcher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceWatcher")
            .field("handle", &self.handle)
            .finish()
    }
}

impl<T: DeserializeOwned> Stream for ResourceWatcher<T> {
    type Item = Result<T, WatchError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        match Pin::new(&mut this.handle).poll_next(cx) {
            Poll::Ready(Some(Ok(raw))) => match serde_json::from_value::<T>(raw) {
                Ok(value) => {
                    metrics::counter!("watch_values_decoded_total").increment(1);
                    Poll::Ready(Some(Ok(value)))
                },
                Err(e) => {
                    let error = WatchError::Decode {
                        key: this.handle.key().clone(),
                        reason: e.to_string(),
                    };
                    tracing::warn!(error = %error, "Dropping watch after undecodable value");
                    this.handle.close();
                    Poll::Ready(Some(Err(error)))
                },
            },
            Poll::Ready(Some(Err(error))) => Poll::Ready(Some(Err(error))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::service::{RawValue, WriteError};
    use futures::StreamExt;
    use futures::channel::mpsc;
    use serde::Deserialize;
    use std::future::Future;
    use std::sync::Mutex;

    /// Hands out one pre-built stream per `watch` call and records tokens.
    struct ScriptedService {
        streams: Mutex<Vec<RawWatchStream>>,
        tokens: Mutex<Vec<CancellationToken>>,
    }

    impl ScriptedService {
        fn new(streams: Vec<RawWatchStream>) -> Self {
            Self {
                streams: Mutex::new(streams),
                tokens: Mutex::new(Vec::new()),
            }
        }
    }

    impl WatchService for ScriptedService {
        #[allow(clippy::unwrap_used)]
        fn watch(&self, _key: &ResourceKey, cancel: CancellationToken) -> RawWatchStream {
            self.tokens.lock().unwrap().push(cancel);
            self.streams
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| futures::stream::empty().boxed())
        }

        fn write(
            &self,
            _key: &ResourceKey,
            _value: RawValue,
        ) -> Pin<Box<dyn Future<Output = Result<(), WriteError>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Doc {
        value: i64,
    }

    #[tokio::test]
    async fn close_cancels_token_and_stops_delivery() {
        let (tx, rx) = mpsc::unbounded();
        let service = ScriptedService::new(vec![rx.boxed()]);
        let mut handle = SubscriptionHandle::open(&service, ResourceKey::new("ctr"));

        tx.unbounded_send(Ok(serde_json::json!({ "value": 1 }))).ok();
        assert_eq!(
            handle.next().await,
            Some(Ok(serde_json::json!({ "value": 1 })))
        );

        tx.unbounded_send(Ok(serde_json::json!({ "value": 2 }))).ok();
        handle.close();
        handle.close();

        assert!(handle.is_closed());
        assert!(service.tokens.lock().map(|t| t[0].is_cancelled()).unwrap_or(false));
        assert_eq!(handle.next().await, None);
    }

    #[tokio::test]
    async fn drop_closes_subscription() {
        let service = ScriptedService::new(vec![futures::stream::pending().boxed()]);
        let handle = SubscriptionHandle::open(&service, ResourceKey::new("ctr"));
        drop(handle);
        assert!(service.tokens.lock().map(|t| t[0].is_cancelled()).unwrap_or(false));
    }

    #[tokio::test]
    async fn error_terminates_the_watch() {
        let key = ResourceKey::new("ctr");
        let failure = WatchError::SubscriptionFailed {
            key: key.clone(),
            reason: "reset".to_string(),
        };
        let items = vec![Err(failure.clone()), Ok(serde_json::json!({ "value": 3 }))];
        let service = ScriptedService::new(vec![futures::stream::iter(items).boxed()]);
        let mut handle = SubscriptionHandle::open(&service, key);

        assert_eq!(handle.next().await, Some(Err(failure)));
        assert_eq!(handle.next().await, None);
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn watcher_decodes_values() {
        let items = vec![
            Ok(serde_json::json!({ "value": 7 })),
            Ok(serde_json::json!({ "value": 9 })),
        ];
        let service = ScriptedService::new(vec![futures::stream::iter(items).boxed()]);
        let watcher = ResourceWatcher::<Doc>::open(&service, ResourceKey::new("ctr"));

        let values: Vec<_> = watcher.collect().await;
        assert_eq!(values, vec![Ok(Doc { value: 7 }), Ok(Doc { value: 9 })]);
    }

    #[tokio::test]
    async fn watcher_ends_on_undecodable_value() {
        let items = vec![
            Ok(serde_json::json!({ "value": "seven" })),
            Ok(serde_json::json!({ "value": 9 })),
        ];
        let service = ScriptedService::new(vec![futures::stream::iter(items).boxed()]);
        let mut watcher = ResourceWatcher::<Doc>::open(&service, ResourceKey::new("ctr"));

        assert!(matches!(
            watcher.next().await,
            Some(Err(WatchError::Decode { .. }))
        ));
        assert_eq!(watcher.next().await, None);
        assert!(watcher.is_closed());
    }
}
