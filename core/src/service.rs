//! Watchable resource service abstraction.
//!
//! The middleware talks to the outside world through the [`WatchService`]
//! trait: an opaque, push-based key/value store offering live watches and
//! one-shot writes. How the service is reached (network, SDK, in-memory)
//! and its consistency model are up to the implementation.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  watch(key, cancel)   ┌──────────────────┐
//! │  Watch Epic  │──────────────────────▶│                  │
//! │              │◀──── raw values ──────│   WatchService   │
//! └──────────────┘                       │                  │
//! ┌──────────────┐  write(key, value)    │                  │
//! │Increment Epic│──────────────────────▶│                  │
//! │              │◀── Ok / WriteError ───│                  │
//! └──────────────┘                       └──────────────────┘
//! ```
//!
//! # Implementations
//!
//! - `InMemoryWatchService` in the testing crate (push-driven fake)

use crate::resource::ResourceKey;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Opaque document payload exchanged with the service.
pub type RawValue = serde_json::Value;

/// Errors that end a watch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WatchError {
    /// The service refused or lost the subscription
    #[error("Subscription to '{key}' failed: {reason}")]
    SubscriptionFailed {
        /// The watched key
        key: ResourceKey,
        /// Service-provided detail
        reason: String,
    },

    /// A pushed value could not be decoded into the domain type
    #[error("Could not decode value of '{key}': {reason}")]
    Decode {
        /// The watched key
        key: ResourceKey,
        /// Decoder detail
        reason: String,
    },
}

/// Failure of a single write; the detail is opaque to the middleware.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Write to '{key}' failed: {reason}")]
pub struct WriteError {
    /// The key that was written
    pub key: ResourceKey,
    /// Service-provided detail
    pub reason: String,
}

impl WriteError {
    /// Create a write error for `key`
    #[must_use]
    pub fn new(key: ResourceKey, reason: impl Into<String>) -> Self {
        Self {
            key,
            reason: reason.into(),
        }
    }
}

/// Stream of raw values pushed by one subscription.
///
/// Values arrive in the order the service produced them. An `Err` item ends
/// the watch.
pub type RawWatchStream = Pin<Box<dyn Stream<Item = Result<RawValue, WatchError>> + Send>>;

/// Trait for watchable resource services.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; Epics hold them in an `Arc` and
/// call them from the store's event loop.
///
/// # Dyn Compatibility
///
/// `write` returns an explicit `Pin<Box<dyn Future>>` instead of using
/// `async fn` so the trait can be used as `Arc<dyn WatchService>`.
pub trait WatchService: Send + Sync {
    /// Open a live subscription to `key`.
    ///
    /// The returned stream is lazy: no value is delivered until it is
    /// polled. Each call opens an independent subscription, so a closed
    /// watch is restarted by calling `watch` again.
    ///
    /// Once `cancel` fires the implementation must release its side of the
    /// subscription promptly and must not deliver further values.
    fn watch(&self, key: &ResourceKey, cancel: CancellationToken) -> RawWatchStream;

    /// Write `value` to `key`.
    ///
    /// Resolves exactly once. There is no compare-and-swap: concurrent
    /// writers race and the last write wins.
    ///
    /// # Errors
    ///
    /// Returns [`WriteError`] if the service did not accept the write.
    fn write(
        &self,
        key: &ResourceKey,
        value: RawValue,
    ) -> Pin<Box<dyn Future<Output = Result<(), WriteError>> + Send + '_>>;
}
