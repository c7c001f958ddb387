//! # Composable Epics Core
//!
//! Core traits and types for Epic-based action-stream middleware.
//!
//! A synchronous, action-dispatching state container is bridged to
//! asynchronous, push-based resources through **Epics**: functions from the
//! stream of dispatched actions to a stream of new actions.
//!
//! ## Core Concepts
//!
//! - **State**: Immutable snapshot owned by the state container
//! - **Action**: Closed tagged union of intents and events
//! - **Reducer**: Pure function `(State, Action) → State`
//! - **Epic**: `(ActionStream, StateAccessor) → ActionStream`, where side effects live
//! - **Watch Service**: Injected push-based key/value resource (watch + write)
//!
//! ## Architecture Principles
//!
//! - Reducers stay pure; Epics own every side effect
//! - Side-effect failures become actions, never panics or dropped errors
//! - At most one live subscription per logical watch (latest request wins)
//! - Closing a subscription is total: nothing is delivered afterwards
//!
//! ## Example
//!
//! ```ignore
//! use composable_epics_core::*;
//!
//! #[derive(Clone, Debug)]
//! enum AppAction {
//!     Ping,
//!     Pong,
//! }
//!
//! struct PingEpic;
//!
//! impl Epic<AppState, AppAction> for PingEpic {
//!     fn name(&self) -> &str {
//!         "ping"
//!     }
//!
//!     fn run(
//!         &self,
//!         actions: ActionStream<AppAction>,
//!         _state: StateAccessor<AppState>,
//!     ) -> ActionStream<AppAction> {
//!         // Never return `actions` unfiltered: every output is dispatched again.
//!         actions
//!             .filter_map(|action| async move {
//!                 matches!(action, AppAction::Ping).then_some(AppAction::Pong)
//!             })
//!             .boxed()
//!     }
//! }
//! ```

pub use serde::{Deserialize, Serialize};

/// Epic trait, action streams and lazy state access
pub mod epic;

/// Stream operators Epics are built from (`merge_map`, `switch_latest`)
pub mod operators;

/// Epic combinator (fan-out input, merged output, failure isolation)
pub mod combinator;

/// Resource key newtype
pub mod resource;

/// Watchable resource service abstraction
pub mod service;

/// Subscription handles and typed resource watchers
pub mod subscription;

/// Reducer module - The pure state transition function
///
/// Reducers fold dispatched actions into state. They are synchronous,
/// deterministic and perform no I/O; anything asynchronous belongs in an
/// [`Epic`](crate::epic::Epic).
pub mod reducer {
    /// The Reducer trait - pure state transitions
    ///
    /// # Type Parameters
    ///
    /// - `State`: The state this reducer folds actions into
    /// - `Action`: The action type this reducer processes
    ///
    /// # Example
    ///
    /// ```
    /// use composable_epics_core::reducer::Reducer;
    ///
    /// #[derive(Default)]
    /// struct Count(i64);
    ///
    /// enum CountAction {
    ///     Add(i64),
    /// }
    ///
    /// struct CountReducer;
    ///
    /// impl Reducer for CountReducer {
    ///     type State = Count;
    ///     type Action = CountAction;
    ///
    ///     fn reduce(&self, state: &mut Count, action: &CountAction) {
    ///         match action {
    ///             CountAction::Add(n) => state.0 += n,
    ///         }
    ///     }
    /// }
    ///
    /// let mut state = Count::default();
    /// CountReducer.reduce(&mut state, &CountAction::Add(2));
    /// assert_eq!(state.0, 2);
    /// ```
    pub trait Reducer {
        /// The state type this reducer operates on
        type State;

        /// The action type this reducer processes
        type Action;

        /// Fold one action into the state
        ///
        /// Must not block, perform I/O, or panic. The action is borrowed
        /// because the middleware forwards the same action to the Epics
        /// after reduction.
        fn reduce(&self, state: &mut Self::State, action: &Self::Action);
    }
}

pub use combinator::{CombinedEpic, combine_epics};
pub use epic::{ActionStream, Epic, StateAccessor};
pub use operators::{Switch, merge_map, switch_latest};
pub use reducer::Reducer;
pub use resource::{ParseResourceKeyError, ResourceKey};
pub use service::{RawValue, RawWatchStream, WatchError, WatchService, WriteError};
pub use subscription::{ResourceWatcher, SubscriptionHandle};
