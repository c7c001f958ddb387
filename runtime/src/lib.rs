//! # Composable Epics Runtime
//!
//! The Store: middleware that connects a pure reducer to a root Epic.
//!
//! ## Core Components
//!
//! - **Store**: owns the state container and the action queue
//! - **Event Loop**: a single task that reduces queued actions, feeds them to
//!   the root Epic and queues whatever the Epic emits
//! - **Action Broadcast**: every dispatched action, for observers
//!
//! ## Dispatch Order
//!
//! ```text
//!   send(action) ──▶ queue ──▶ reducer ──▶ broadcast ──▶ root Epic
//!                      ▲                                    │
//!                      └──────────── emitted actions ───────┘
//! ```
//!
//! Actions emitted by the Epic go to the back of the queue. They are never
//! reduced inline, so the reducer always sees one action at a time in queue
//! order.
//!
//! ## Example
//!
//! ```ignore
//! use composable_epics_runtime::Store;
//!
//! let store = Store::new(CounterState::default(), CounterReducer, root_epic(service, &config));
//!
//! store.send(CounterAction::StartWatch(key))?;
//! let value = store.state(|s| s.value);
//!
//! store.shutdown(Duration::from_secs(5)).await?;
//! ```

use std::time::Duration;

/// Prometheus metrics for observability
pub mod metrics;

/// Error types for the Store runtime
pub mod error {
    use std::time::Duration;
    use thiserror::Error;

    /// Errors that can occur during Store operations
    #[derive(Error, Debug)]
    pub enum StoreError {
        /// Store is shutting down and not accepting new actions
        ///
        /// This error is returned when `send()` is called after shutdown initiated.
        #[error("Store is shutting down")]
        ShutdownInProgress,

        /// The event loop did not stop within the shutdown timeout
        ///
        /// The loop is aborted when this is returned.
        #[error("Shutdown timed out after {0:?}")]
        ShutdownTimeout(Duration),

        /// Timeout waiting for an action in `send_and_wait_for`
        #[error("Timeout waiting for action")]
        Timeout,

        /// The event loop is gone, so the action queue or broadcast is closed
        #[error("Action channel closed")]
        ChannelClosed,

        /// The event loop task failed
        ///
        /// This typically means the reducer panicked.
        #[error("Event loop task failed: {0}")]
        TaskJoinError(#[from] tokio::task::JoinError),
    }
}

pub use error::StoreError;
pub use store::Store;

/// Store configuration
///
/// # Example
///
/// ```
/// use composable_epics_runtime::StoreConfig;
/// use std::time::Duration;
///
/// let config = StoreConfig::default()
///     .with_broadcast_capacity(256)
///     .with_shutdown_timeout(Duration::from_secs(2));
///
/// assert_eq!(config.action_broadcast_capacity, 256);
/// ```
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Capacity of the action broadcast channel
    ///
    /// Observers that fall further behind than this skip actions.
    pub action_broadcast_capacity: usize,
    /// Default timeout for graceful shutdown
    pub default_shutdown_timeout: Duration,
}

impl StoreConfig {
    /// Create a new configuration with custom values
    #[must_use]
    pub const fn new(action_broadcast_capacity: usize, default_shutdown_timeout: Duration) -> Self {
        Self {
            action_broadcast_capacity,
            default_shutdown_timeout,
        }
    }

    /// Set the action broadcast capacity
    #[must_use]
    pub const fn with_broadcast_capacity(mut self, capacity: usize) -> Self {
        self.action_broadcast_capacity = capacity;
        self
    }

    /// Set the default shutdown timeout
    #[must_use]
    pub const fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.default_shutdown_timeout = timeout;
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            action_broadcast_capacity: 64,
            default_shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Store module - the middleware runtime
pub mod store {
    use super::{Duration, StoreConfig, StoreError};
    use crate::metrics::StoreMetrics;
    use composable_epics_core::{ActionStream, Epic, Reducer, StateAccessor};
    use futures::StreamExt;
    use futures::stream::Fuse;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use tokio::sync::{Mutex, broadcast, mpsc, watch};
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;

    /// The Store - runtime coordinator for a reducer and its root Epic
    ///
    /// The Store manages:
    /// 1. State (a `watch` channel; the event loop is the only writer)
    /// 2. The action queue (UI commands and Epic output, in arrival order)
    /// 3. The root Epic's input and output streams
    /// 4. Shutdown
    ///
    /// Cloning is cheap; clones share one event loop.
    ///
    /// # Type Parameters
    ///
    /// - `S`: State type
    /// - `A`: Action type
    pub struct Store<S, A> {
        inner: Arc<Inner<S, A>>,
    }

    struct Inner<S, A> {
        queue: mpsc::UnboundedSender<A>,
        state: watch::Receiver<S>,
        action_broadcast: broadcast::Sender<A>,
        shutdown: CancellationToken,
        accepting: AtomicBool,
        dispatched: Arc<AtomicU64>,
        event_loop: Mutex<Option<JoinHandle<()>>>,
        config: StoreConfig,
    }

    impl<S, A> Drop for Inner<S, A> {
        fn drop(&mut self) {
            // Last handle gone: nobody can stop the loop any more.
            self.shutdown.cancel();
        }
    }

    impl<S, A> Clone for Store<S, A> {
        fn clone(&self) -> Self {
            Self {
                inner: Arc::clone(&self.inner),
            }
        }
    }

    impl<S, A> Store<S, A>
    where
        S: Send + Sync + 'static,
        A: Clone + Send + 'static,
    {
        /// Create a store with default configuration and start its event loop
        ///
        /// The root Epic is run once, here, against the store's action
        /// stream and state accessor.
        ///
        /// # Panics
        ///
        /// Panics if called outside a tokio runtime.
        #[must_use]
        pub fn new<R, E>(initial_state: S, reducer: R, root_epic: E) -> Self
        where
            R: Reducer<State = S, Action = A> + Send + 'static,
            E: Epic<S, A>,
        {
            Self::with_config(initial_state, reducer, root_epic, StoreConfig::default())
        }

        /// Create a store with custom configuration
        ///
        /// # Panics
        ///
        /// Panics if called outside a tokio runtime.
        #[must_use]
        pub fn with_config<R, E>(initial_state: S, reducer: R, root_epic: E, config: StoreConfig) -> Self
        where
            R: Reducer<State = S, Action = A> + Send + 'static,
            E: Epic<S, A>,
        {
            let (queue_tx, queue_rx) = mpsc::unbounded_channel();
            let (state_tx, state_rx) = watch::channel(initial_state);
            let (action_broadcast, _) = broadcast::channel(config.action_broadcast_capacity.max(1));
            let (epic_input_tx, epic_input_rx) = futures::channel::mpsc::unbounded();

            let epic_output = root_epic.run(epic_input_rx.boxed(), StateAccessor::new(state_rx.clone()));
            tracing::info!(epic = root_epic.name(), "Starting store event loop");

            let shutdown = CancellationToken::new();
            let dispatched = Arc::new(AtomicU64::new(0));

            let event_loop = EventLoop {
                reducer,
                state: state_tx,
                queue: queue_rx,
                emit: queue_tx.clone(),
                epic_input: epic_input_tx,
                epic_output: epic_output.fuse(),
                action_broadcast: action_broadcast.clone(),
                dispatched: Arc::clone(&dispatched),
                shutdown: shutdown.clone(),
            };
            let handle = tokio::spawn(event_loop.run());

            Self {
                inner: Arc::new(Inner {
                    queue: queue_tx,
                    state: state_rx,
                    action_broadcast,
                    shutdown,
                    accepting: AtomicBool::new(true),
                    dispatched,
                    event_loop: Mutex::new(Some(handle)),
                    config,
                }),
            }
        }

        /// Send an action to the store
        ///
        /// The action is queued behind everything already waiting; it is
        /// reduced and handed to the root Epic by the event loop. `send`
        /// never waits for that to happen.
        ///
        /// # Errors
        ///
        /// - [`StoreError::ShutdownInProgress`] once shutdown has started
        /// - [`StoreError::ChannelClosed`] if the event loop has exited
        #[tracing::instrument(skip(self, action), name = "store_send")]
        pub fn send(&self, action: A) -> Result<(), StoreError> {
            if !self.inner.accepting.load(Ordering::Acquire) {
                tracing::warn!("Rejecting action: store is shutting down");
                StoreMetrics::record_rejection();
                return Err(StoreError::ShutdownInProgress);
            }

            self.inner
                .queue
                .send(action)
                .map_err(|_| StoreError::ChannelClosed)
        }

        /// Send an action and wait for a matching action
        ///
        /// Subscribes to the action broadcast before sending, then returns the
        /// first dispatched action matching `predicate`. The sent action is
        /// itself broadcast, so the predicate should only match results.
        ///
        /// # Errors
        ///
        /// - [`StoreError::Timeout`]: no matching action before `timeout`
        /// - [`StoreError::ChannelClosed`]: the store stopped while waiting
        /// - [`StoreError::ShutdownInProgress`]: the store is shutting down
        pub async fn send_and_wait_for<F>(
            &self,
            action: A,
            predicate: F,
            timeout: Duration,
        ) -> Result<A, StoreError>
        where
            F: Fn(&A) -> bool,
        {
            // Subscribe BEFORE sending to avoid race condition
            let mut rx = self.inner.action_broadcast.subscribe();

            self.send(action)?;

            tokio::time::timeout(timeout, async {
                loop {
                    match rx.recv().await {
                        Ok(action) if predicate(&action) => return Ok(action),
                        Ok(_) => {},
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            // If the match was dropped, the timeout catches it
                            tracing::warn!(skipped, "Action observer lagged, {} actions skipped", skipped);
                        },
                        Err(broadcast::error::RecvError::Closed) => {
                            return Err(StoreError::ChannelClosed);
                        },
                    }
                }
            })
            .await
            .map_err(|_| StoreError::Timeout)?
        }

        /// Subscribe to every action the store dispatches
        ///
        /// Includes UI commands and Epic output, in dispatch order, each
        /// published after it was reduced. A receiver that lags more than
        /// [`StoreConfig::action_broadcast_capacity`] skips actions.
        #[must_use]
        pub fn subscribe_actions(&self) -> broadcast::Receiver<A> {
            self.inner.action_broadcast.subscribe()
        }

        /// Read current state via a closure
        ///
        /// Keep `f` short: the event loop cannot publish new state while the
        /// snapshot is borrowed.
        pub fn state<F, T>(&self, f: F) -> T
        where
            F: FnOnce(&S) -> T,
        {
            f(&self.inner.state.borrow())
        }

        /// Read-only accessor over the live state, as handed to Epics
        #[must_use]
        pub fn state_accessor(&self) -> StateAccessor<S> {
            StateAccessor::new(self.inner.state.clone())
        }

        /// Receiver notified every time an action has been reduced
        #[must_use]
        pub fn watch_state(&self) -> watch::Receiver<S> {
            self.inner.state.clone()
        }

        /// Total number of actions reduced so far
        #[must_use]
        pub fn dispatched_count(&self) -> u64 {
            self.inner.dispatched.load(Ordering::Acquire)
        }

        /// Whether the store still accepts actions
        #[must_use]
        pub fn is_running(&self) -> bool {
            self.inner.accepting.load(Ordering::Acquire) && !self.inner.shutdown.is_cancelled()
        }

        /// Stop the store
        ///
        /// Rejects further `send`s, stops the event loop and drops the root
        /// Epic's output stream, which closes every subscription the Epics
        /// hold. Actions still queued are discarded. Calling it again after
        /// it returned is a no-op.
        ///
        /// # Errors
        ///
        /// - [`StoreError::ShutdownTimeout`] if the loop did not stop in time
        ///   (it is aborted)
        /// - [`StoreError::TaskJoinError`] if the loop had panicked
        pub async fn shutdown(&self, timeout: Duration) -> Result<(), StoreError> {
            tracing::info!("Initiating graceful shutdown");

            self.inner.accepting.store(false, Ordering::Release);
            self.inner.shutdown.cancel();

            let Some(mut handle) = self.inner.event_loop.lock().await.take() else {
                tracing::debug!("Store already shut down");
                return Ok(());
            };

            match tokio::time::timeout(timeout, &mut handle).await {
                Ok(Ok(())) => {
                    tracing::info!(
                        dispatched = self.dispatched_count(),
                        "Event loop stopped, shutdown successful"
                    );
                    Ok(())
                },
                Ok(Err(join_error)) => {
                    tracing::error!(error = %join_error, "Event loop failed before shutdown");
                    Err(StoreError::TaskJoinError(join_error))
                },
                Err(_) => {
                    tracing::error!(?timeout, "Shutdown timeout: aborting event loop");
                    handle.abort();
                    Err(StoreError::ShutdownTimeout(timeout))
                },
            }
        }

        /// Stop the store using [`StoreConfig::default_shutdown_timeout`]
        ///
        /// # Errors
        ///
        /// Same as [`Store::shutdown`].
        pub async fn stop(&self) -> Result<(), StoreError> {
            self.shutdown(self.inner.config.default_shutdown_timeout).await
        }
    }

    /// State owned by the event loop task.
    struct EventLoop<S, A, R> {
        reducer: R,
        state: watch::Sender<S>,
        queue: mpsc::UnboundedReceiver<A>,
        emit: mpsc::UnboundedSender<A>,
        epic_input: futures::channel::mpsc::UnboundedSender<A>,
        epic_output: Fuse<ActionStream<A>>,
        action_broadcast: broadcast::Sender<A>,
        dispatched: Arc<AtomicU64>,
        shutdown: CancellationToken,
    }

    impl<S, A, R> EventLoop<S, A, R>
    where
        R: Reducer<State = S, Action = A>,
        A: Clone,
    {
        async fn run(mut self) {
            StoreMetrics::record_running(true);

            loop {
                tokio::select! {
                    biased;

                    () = self.shutdown.cancelled() => break,

                    Some(action) = self.queue.recv() => self.dispatch(action),

                    Some(action) = self.epic_output.next(), if !self.epic_output.is_done() => {
                        StoreMetrics::record_epic_emission();
                        if self.emit.send(action).is_err() {
                            break;
                        }
                    },
                }
            }

            // Dropping the Epic output here closes every live subscription.
            drop(self.epic_output);
            StoreMetrics::record_running(false);
            tracing::debug!("Store event loop exited");
        }

        fn dispatch(&mut self, action: A) {
            let started = std::time::Instant::now();
            let reducer = &self.reducer;
            self.state.send_modify(|state| reducer.reduce(state, &action));

            self.dispatched.fetch_add(1, Ordering::AcqRel);
            StoreMetrics::record_dispatch(started.elapsed());

            // No observers is fine
            let _ = self.action_broadcast.send(action.clone());

            if self.epic_input.unbounded_send(action).is_err() {
                tracing::trace!("Root epic stopped reading input");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use composable_epics_core::{ActionStream, Epic, Reducer, StateAccessor};
    use futures::StreamExt;

    #[derive(Debug, Clone, PartialEq)]
    enum Msg {
        Ping,
        Pong,
        Add(i64),
    }

    #[derive(Debug, Clone, Default)]
    struct Tally {
        pings: u32,
        pongs: u32,
        total: i64,
    }

    struct TallyReducer;

    impl Reducer for TallyReducer {
        type State = Tally;
        type Action = Msg;

        fn reduce(&self, state: &mut Tally, action: &Msg) {
            match action {
                Msg::Ping => state.pings += 1,
                Msg::Pong => state.pongs += 1,
                Msg::Add(n) => state.total += n,
            }
        }
    }

    /// Answers every Ping with a Pong.
    struct PongEpic;

    impl Epic<Tally, Msg> for PongEpic {
        fn name(&self) -> &str {
            "pong"
        }

        fn run(&self, actions: ActionStream<Msg>, _state: StateAccessor<Tally>) -> ActionStream<Msg> {
            actions
                .filter_map(|msg| async move { (msg == Msg::Ping).then_some(Msg::Pong) })
                .boxed()
        }
    }

    /// Emits the state's ping count, read when each Add arrives.
    struct ReadsStateEpic;

    impl Epic<Tally, Msg> for ReadsStateEpic {
        fn name(&self) -> &str {
            "reads_state"
        }

        fn run(&self, actions: ActionStream<Msg>, state: StateAccessor<Tally>) -> ActionStream<Msg> {
            actions
                .filter_map(move |msg| {
                    let pings = state.with(|s| s.pings);
                    async move {
                        match msg {
                            Msg::Add(0) => Some(Msg::Add(i64::from(pings) * 100)),
                            _ => None,
                        }
                    }
                })
                .boxed()
        }
    }

    fn store() -> Store<Tally, Msg> {
        Store::new(Tally::default(), TallyReducer, PongEpic)
    }

    #[tokio::test]
    async fn test_epic_output_is_dispatched() {
        let store = store();

        let result = store
            .send_and_wait_for(Msg::Ping, |a| *a == Msg::Pong, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(result, Msg::Pong);
        assert_eq!(store.state(|s| (s.pings, s.pongs)), (1, 1));
        assert_eq!(store.dispatched_count(), 2);
    }

    #[tokio::test]
    async fn test_broadcast_carries_every_dispatched_action() {
        let store = store();
        let mut rx = store.subscribe_actions();

        store.send(Msg::Add(2)).unwrap();
        store.send(Msg::Ping).unwrap();

        assert_eq!(rx.recv().await.unwrap(), Msg::Add(2));
        assert_eq!(rx.recv().await.unwrap(), Msg::Ping);
        assert_eq!(rx.recv().await.unwrap(), Msg::Pong);
    }

    #[tokio::test]
    async fn test_epic_reads_state_after_reduction() {
        let store = Store::new(Tally::default(), TallyReducer, ReadsStateEpic);

        store.send(Msg::Ping).unwrap();
        store.send(Msg::Ping).unwrap();
        let reply = store
            .send_and_wait_for(Msg::Add(0), |a| *a == Msg::Add(200), Duration::from_secs(1))
            .await;

        assert_eq!(reply.unwrap(), Msg::Add(200));
        assert_eq!(store.state(|s| s.total), 200);
    }

    #[tokio::test]
    async fn test_send_and_wait_for_times_out() {
        let store = store();

        let result = store
            .send_and_wait_for(Msg::Add(1), |a| *a == Msg::Pong, Duration::from_millis(50))
            .await;

        assert!(matches!(result, Err(StoreError::Timeout)));
    }

    #[tokio::test]
    async fn test_send_after_shutdown_is_rejected() {
        let store = store();
        store.shutdown(Duration::from_secs(1)).await.unwrap();

        assert!(!store.is_running());
        assert!(matches!(store.send(Msg::Ping), Err(StoreError::ShutdownInProgress)));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let store = store();
        let clone = store.clone();

        store.shutdown(Duration::from_secs(1)).await.unwrap();
        clone.shutdown(Duration::from_secs(1)).await.unwrap();
        store.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_state_accessor_tracks_store() {
        let store = store();
        let accessor = store.state_accessor();
        let mut changes = store.watch_state();

        store.send(Msg::Add(5)).unwrap();
        changes.changed().await.unwrap();

        assert_eq!(accessor.with(|s| s.total), 5);
    }

    #[test]
    fn test_config_builder() {
        let config = StoreConfig::default()
            .with_broadcast_capacity(8)
            .with_shutdown_timeout(Duration::from_millis(250));

        assert_eq!(config.action_broadcast_capacity, 8);
        assert_eq!(config.default_shutdown_timeout, Duration::from_millis(250));
    }
}
