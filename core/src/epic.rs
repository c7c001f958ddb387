//! Epics: action-stream transformers.
//!
//! An Epic receives the stream of every action dispatched to the store and
//! returns a stream of new actions that the middleware dispatches back.
//!
//! # Contract
//!
//! An Epic must never return its input unfiltered. Every output action is
//! dispatched again and fed back into the same input, so an echoing Epic
//! grows without bound. This is not detected at runtime; see
//! `EpicHarness::run_to_quiescence` in the testing crate for the check.
//!
//! State is read through a [`StateAccessor`] at the moment a side effect is
//! triggered, never captured when the Epic is started.

use futures::Stream;
use std::pin::Pin;
use tokio::sync::watch;

/// Stream of actions flowing into or out of an Epic.
pub type ActionStream<A> = Pin<Box<dyn Stream<Item = A> + Send>>;

/// Read-only, lazy access to the state container's current snapshot.
///
/// Cloning is cheap; every clone observes the same live state.
///
/// # Examples
///
/// ```
/// use composable_epics_core::StateAccessor;
///
/// let state = StateAccessor::constant(41_i64);
/// assert_eq!(state.get() + 1, 42);
/// assert_eq!(state.with(|s| *s), 41);
/// ```
#[derive(Debug)]
pub struct StateAccessor<S> {
    rx: watch::Receiver<S>,
}

impl<S> StateAccessor<S> {
    /// Wrap the receiving side of the store's state channel.
    #[must_use]
    pub const fn new(rx: watch::Receiver<S>) -> Self {
        Self { rx }
    }

    /// An accessor over a fixed snapshot (useful in tests).
    #[must_use]
    pub fn constant(state: S) -> Self {
        let (_tx, rx) = watch::channel(state);
        Self { rx }
    }

    /// Borrow the current snapshot for the duration of `f`.
    ///
    /// Keep `f` short: the store cannot publish a new snapshot while the
    /// borrow is held.
    pub fn with<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&S) -> T,
    {
        f(&self.rx.borrow())
    }

    /// Clone the current snapshot.
    #[must_use]
    pub fn get(&self) -> S
    where
        S: Clone,
    {
        self.rx.borrow().clone()
    }
}

impl<S> Clone for StateAccessor<S> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

/// The Epic trait - where side effects live
///
/// # Type Parameters
///
/// - `S`: The state type Epics may read
/// - `A`: The action type flowing in and out
///
/// # Dyn Compatibility
///
/// The trait is object safe so Epics can be boxed and combined with
/// [`combine_epics`](crate::combinator::combine_epics).
pub trait Epic<S, A>: Send + Sync {
    /// Name used in logs and metrics
    fn name(&self) -> &str;

    /// Transform the stream of dispatched actions into new actions.
    ///
    /// Called once per store (and again by the combinator if the previous
    /// output stream panicked). The returned stream is polled by the store's
    /// event loop for as long as the store runs.
    fn run(&self, actions: ActionStream<A>, state: StateAccessor<S>) -> ActionStream<A>;
}

impl<S, A, E> Epic<S, A> for Box<E>
where
    E: Epic<S, A> + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    fn run(&self, actions: ActionStream<A>, state: StateAccessor<S>) -> ActionStream<A> {
        (**self).run(actions, state)
    }
}

impl<S, A, E> Epic<S, A> for std::sync::Arc<E>
where
    E: Epic<S, A> + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    fn run(&self, actions: ActionStream<A>, state: StateAccessor<S>) -> ActionStream<A> {
        (**self).run(actions, state)
    }
}
