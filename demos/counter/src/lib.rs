//! # Counter Example
//!
//! A shared counter stored in an external watchable document.
//!
//! This example showcases:
//! - A pure reducer that never talks to the outside world
//! - An Epic that turns `Increment` into a write of `value + 1`
//! - An Epic that keeps one live watch on the document and turns each
//!   pushed value into `ResourceUpdated`
//! - The Store wiring both together
//!
//! ## Architecture
//!
//! The counter value in state only changes when the watch reports it.
//! `Increment` writes to the document; the write comes back through the
//! watch like any other update, so every client converges on the stored
//! value (last write wins).
//!
//! ## Example
//!
//! ```no_run
//! use composable_epics_core::ResourceKey;
//! use composable_epics_runtime::Store;
//! use composable_epics_testing::InMemoryWatchService;
//! use counter::{CounterAction, CounterConfig, CounterReducer, CounterState, root_epic};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CounterConfig::default();
//! let service = Arc::new(InMemoryWatchService::new());
//! let store = Store::new(CounterState::default(), CounterReducer, root_epic(service, &config));
//!
//! store.send(CounterAction::StartWatch(config.resource_key.clone()))?;
//! store.send(CounterAction::Increment)?;
//! let value = store.state(|s| s.value);
//! # Ok(())
//! # }
//! ```

use composable_epics_core::{Reducer, ResourceKey, WatchError, WriteError};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod config;
pub mod epics;

pub use config::{ConfigError, CounterConfig};
pub use epics::{IncrementEpic, WatchEpic, root_epic};

/// Opaque failure detail carried by failure actions
///
/// The middleware does not classify failures; the message is for the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    message: String,
}

impl ErrorInfo {
    /// Create failure detail from a message
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The failure message
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<&WriteError> for ErrorInfo {
    fn from(error: &WriteError) -> Self {
        Self::new(error.to_string())
    }
}

impl From<&WatchError> for ErrorInfo {
    fn from(error: &WatchError) -> Self {
        Self::new(error.to_string())
    }
}

/// Counter actions
///
/// `StartWatch`, `StopWatch` and `Increment` are dispatched by the UI; the
/// rest are produced by the Epics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CounterAction {
    /// Open (or replace) the watch on a document
    StartWatch(ResourceKey),
    /// Close the watch on a document, if it is the active one
    StopWatch(ResourceKey),
    /// Write `value + 1` to the document
    Increment,
    /// The watched document changed
    ResourceUpdated(ResourceKey, i64),
    /// A write issued for `Increment` completed
    WriteSucceeded,
    /// A write issued for `Increment` failed
    WriteFailed(ErrorInfo),
    /// The watch on a document failed and was closed
    WatchFailed(ResourceKey, ErrorInfo),
}

/// Counter state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterState {
    /// Last value reported by the watch
    pub value: i64,
    /// Document currently watched, if any
    pub watching: Option<ResourceKey>,
    /// Most recent write or watch failure
    pub last_error: Option<ErrorInfo>,
    /// Writes that completed
    pub writes_succeeded: u64,
    /// Writes that failed
    pub writes_failed: u64,
}

/// Shape of the stored document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterDocument {
    /// The shared counter value
    pub value: i64,
}

/// Counter reducer
///
/// Pure bookkeeping; all I/O lives in the Epics.
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterReducer;

impl Reducer for CounterReducer {
    type State = CounterState;
    type Action = CounterAction;

    fn reduce(&self, state: &mut Self::State, action: &Self::Action) {
        match action {
            CounterAction::StartWatch(key) => {
                state.watching = Some(key.clone());
            },
            CounterAction::StopWatch(key) => {
                if state.watching.as_ref() == Some(key) {
                    state.watching = None;
                }
            },
            CounterAction::WatchFailed(key, error) => {
                if state.watching.as_ref() == Some(key) {
                    state.watching = None;
                }
                state.last_error = Some(error.clone());
            },
            CounterAction::ResourceUpdated(_, value) => {
                state.value = *value;
            },
            CounterAction::WriteSucceeded => {
                state.writes_succeeded += 1;
            },
            CounterAction::WriteFailed(error) => {
                state.writes_failed += 1;
                state.last_error = Some(error.clone());
            },
            // The value moves when the watch reports the write
            CounterAction::Increment => {},
        }
    }
}
