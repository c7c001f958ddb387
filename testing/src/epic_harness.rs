//! Drive a single Epic without a store
//!
//! The harness owns the Epic's input and a state container the test controls
//! directly, so tests decide exactly when actions arrive, when the state
//! changes and when the Epic's output is polled.

#![allow(clippy::module_name_repetitions)] // EpicHarness is the natural name

use composable_epics_core::{ActionStream, Epic, StateAccessor};
use futures::StreamExt;
use futures::channel::mpsc;
use futures::task::ArcWake;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// An Epic kept emitting while its output was fed back as input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Epic still emitting after {rounds} feedback rounds ({emitted} actions emitted)")]
pub struct EpicDiverged {
    /// Feedback rounds run before giving up
    pub rounds: usize,
    /// Total actions emitted
    pub emitted: usize,
}

#[derive(Default)]
struct WakeFlag {
    woken: AtomicBool,
}

impl ArcWake for WakeFlag {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.woken.store(true, Ordering::Release);
    }
}

/// Test harness around one running Epic.
///
/// # Example
///
/// ```ignore
/// let service = InMemoryWatchService::new();
/// let mut harness = EpicHarness::new(&WatchEpic::new(service.clone()), CounterState::default());
///
/// harness.send(CounterAction::StartWatch(key.clone()));
/// assert!(harness.drain_ready().await.is_empty());
///
/// service.push(&key, json!({ "value": 7 }));
/// assert_eq!(harness.drain_ready().await, vec![CounterAction::ResourceUpdated(key, 7)]);
/// ```
pub struct EpicHarness<S, A> {
    input: Option<mpsc::UnboundedSender<A>>,
    state: watch::Sender<S>,
    output: ActionStream<A>,
}

impl<S, A> EpicHarness<S, A>
where
    S: Send + Sync + 'static,
    A: Send + 'static,
{
    /// Start `epic` against a fresh input stream and `initial_state`
    pub fn new<E>(epic: &E, initial_state: S) -> Self
    where
        E: Epic<S, A> + ?Sized,
    {
        let (input, rx) = mpsc::unbounded();
        let (state, state_rx) = watch::channel(initial_state);
        let output = epic.run(rx.boxed(), StateAccessor::new(state_rx));

        Self {
            input: Some(input),
            state,
            output,
        }
    }

    /// Deliver an action to the Epic's input.
    ///
    /// Ignored once the input was closed.
    pub fn send(&self, action: A) {
        if let Some(input) = &self.input {
            let _ = input.unbounded_send(action);
        }
    }

    /// End the Epic's input stream
    pub fn close_input(&mut self) {
        self.input = None;
    }

    /// Replace the state the Epic reads
    pub fn set_state(&self, state: S) {
        self.state.send_replace(state);
    }

    /// Modify the state the Epic reads in place
    pub fn update_state<F>(&self, f: F)
    where
        F: FnOnce(&mut S),
    {
        self.state.send_modify(f);
    }

    /// Current state snapshot
    #[must_use]
    pub fn state(&self) -> S
    where
        S: Clone,
    {
        self.state.borrow().clone()
    }

    /// Poll the Epic until it has nothing ready, returning what it emitted.
    ///
    /// Keeps polling while the Epic wakes itself (a merged child that became
    /// ready, a yield), so everything reachable without waiting on a timer
    /// or another task is collected. Yields to the runtime between such
    /// re-polls.
    pub async fn drain_ready(&mut self) -> Vec<A> {
        let mut emitted = Vec::new();
        loop {
            let flag = Arc::new(WakeFlag::default());
            let waker = futures::task::waker(Arc::clone(&flag));
            let polled = self.output.poll_next_unpin(&mut Context::from_waker(&waker));

            match polled {
                Poll::Ready(Some(action)) => emitted.push(action),
                Poll::Ready(None) => break,
                Poll::Pending if flag.woken.load(Ordering::Acquire) => {
                    tokio::task::yield_now().await;
                },
                Poll::Pending => break,
            }
        }
        emitted
    }

    /// Wait for the next emitted action, or `None` on timeout or end of output
    pub async fn next_with_timeout(&mut self, timeout: Duration) -> Option<A> {
        tokio::time::timeout(timeout, self.output.next())
            .await
            .ok()
            .flatten()
    }

    /// Collect everything emitted within `window`
    pub async fn collect_for(&mut self, window: Duration) -> Vec<A> {
        let mut emitted = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(Some(action)) = tokio::time::timeout_at(deadline, self.output.next()).await {
            emitted.push(action);
        }
        emitted
    }

    /// Feed `seed` to the Epic, then keep feeding its output back to it, the
    /// way a store would, until it stops emitting.
    ///
    /// Returns every action emitted, in order.
    ///
    /// # Errors
    ///
    /// Returns [`EpicDiverged`] if the Epic is still emitting after
    /// `max_rounds` feedback rounds, which means it amplifies its own output.
    pub async fn run_to_quiescence(
        &mut self,
        seed: Vec<A>,
        max_rounds: usize,
    ) -> Result<Vec<A>, EpicDiverged>
    where
        A: Clone,
    {
        let mut all = Vec::new();
        let mut pending = seed;

        for _ in 0..max_rounds {
            for action in pending.drain(..) {
                self.send(action);
            }
            let emitted = self.drain_ready().await;
            if emitted.is_empty() {
                return Ok(all);
            }
            all.extend(emitted.iter().cloned());
            pending = emitted;
        }

        tracing::warn!(rounds = max_rounds, emitted = all.len(), "Epic did not quiesce");
        Err(EpicDiverged {
            rounds: max_rounds,
            emitted: all.len(),
        })
    }
}
