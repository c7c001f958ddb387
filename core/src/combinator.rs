//! Epic composition
//!
//! [`combine_epics`] merges several Epics into one:
//! - every Epic receives every input action, in the same order, and all
//!   ready input is queued to every Epic before any Epic is polled
//! - outputs are merged in emission order
//! - an Epic whose output stream panics is restarted on the same input
//!   queue; the other Epics never notice
//!
//! # Examples
//!
//! ```
//! use composable_epics_core::{combine_epics, ActionStream, Epic, StateAccessor};
//! use futures::StreamExt;
//!
//! #[derive(Clone, Debug, PartialEq)]
//! enum Msg {
//!     Ping,
//!     Pong,
//! }
//!
//! struct Responder;
//!
//! impl Epic<(), Msg> for Responder {
//!     fn name(&self) -> &str {
//!         "responder"
//!     }
//!
//!     fn run(&self, actions: ActionStream<Msg>, _state: StateAccessor<()>) -> ActionStream<Msg> {
//!         actions
//!             .filter_map(|m| async move { (m == Msg::Ping).then_some(Msg::Pong) })
//!             .boxed()
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let root = combine_epics(vec![Box::new(Responder), Box::new(Responder)]);
//! let input = futures::stream::iter(vec![Msg::Ping]).boxed();
//! let out: Vec<Msg> = root.run(input, StateAccessor::constant(())).collect().await;
//! assert_eq!(out, vec![Msg::Pong, Msg::Pong]);
//! # });
//! ```

use crate::epic::{ActionStream, Epic, StateAccessor};
use futures::channel::mpsc;
use futures::stream::{self, SelectAll, Stream, StreamExt};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

/// Combines multiple Epics that share the same state and action types.
///
/// Each Epic gets its own unbounded input queue fed from the shared input,
/// so a slow Epic never causes another to miss an action.
#[must_use]
pub fn combine_epics<S, A>(epics: Vec<Box<dyn Epic<S, A>>>) -> CombinedEpic<S, A>
where
    S: Send + Sync + 'static,
    A: Clone + Send + 'static,
{
    CombinedEpic {
        name: String::from("combined"),
        epics: epics.into_iter().map(Arc::from).collect(),
    }
}

/// An Epic that runs several Epics over the same input.
///
/// Created by [`combine_epics`].
pub struct CombinedEpic<S, A> {
    name: String,
    epics: Vec<Arc<dyn Epic<S, A>>>,
}

impl<S, A> CombinedEpic<S, A> {
    /// Rename the combined Epic (shown in logs)
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Number of child Epics
    #[must_use]
    pub fn len(&self) -> usize {
        self.epics.len()
    }

    /// Whether no Epics were combined
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.epics.is_empty()
    }
}

impl<S, A> Epic<S, A> for CombinedEpic<S, A>
where
    S: Send + Sync + 'static,
    A: Clone + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, actions: ActionStream<A>, state: StateAccessor<S>) -> ActionStream<A> {
        let mut senders = Vec::with_capacity(self.epics.len());
        let mut children = Vec::with_capacity(self.epics.len());

        for epic in &self.epics {
            let (tx, rx) = mpsc::unbounded();
            senders.push(tx);
            children.push(Isolated::start(
                Arc::clone(epic),
                Arc::new(Mutex::new(rx)),
                state.clone(),
            ));
        }

        tracing::debug!(epic = %self.name, children = senders.len(), "Starting combined epic");

        Box::pin(Combined {
            actions: Some(actions),
            senders,
            children: stream::select_all(children),
        })
    }
}

/// Output of a [`CombinedEpic`].
///
/// Every poll first moves all ready input into every child queue, then polls
/// the children. A child woken by its own source therefore always sees a
/// control action that arrived in the same round before it emits.
struct Combined<S, A> {
    actions: Option<ActionStream<A>>,
    senders: Vec<mpsc::UnboundedSender<A>>,
    children: SelectAll<Isolated<S, A>>,
}

impl<S, A> Stream for Combined<S, A>
where
    S: Send + Sync + 'static,
    A: Clone + Send + 'static,
{
    type Item = A;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        while let Some(actions) = this.actions.as_mut() {
            match actions.as_mut().poll_next(cx) {
                Poll::Ready(Some(action)) => {
                    for tx in &this.senders {
                        let _ = tx.unbounded_send(action.clone());
                    }
                },
                Poll::Ready(None) => {
                    // Closing the queues lets every child finish.
                    this.actions = None;
                    this.senders.clear();
                },
                Poll::Pending => break,
            }
        }

        match this.children.poll_next_unpin(cx) {
            Poll::Ready(Some(action)) => Poll::Ready(Some(action)),
            Poll::Ready(None) if this.actions.is_none() => Poll::Ready(None),
            Poll::Ready(None) | Poll::Pending => Poll::Pending,
        }
    }
}

type SharedInput<A> = Arc<Mutex<mpsc::UnboundedReceiver<A>>>;

fn shared_input<A: Send + 'static>(rx: &SharedInput<A>) -> ActionStream<A> {
    let rx = Arc::clone(rx);
    Box::pin(stream::poll_fn(move |cx| {
        rx.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .poll_next_unpin(cx)
    }))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| String::from("<non-string panic payload>"))
}

/// One child Epic's output, restarted in place if polling it panics.
struct Isolated<S, A> {
    epic: Arc<dyn Epic<S, A>>,
    input: SharedInput<A>,
    state: StateAccessor<S>,
    output: ActionStream<A>,
}

impl<S, A> Isolated<S, A>
where
    S: Send + Sync + 'static,
    A: Send + 'static,
{
    fn start(epic: Arc<dyn Epic<S, A>>, input: SharedInput<A>, state: StateAccessor<S>) -> Self {
        let output = Self::run_epic(&epic, &input, &state);
        Self {
            epic,
            input,
            state,
            output,
        }
    }

    fn run_epic(
        epic: &Arc<dyn Epic<S, A>>,
        input: &SharedInput<A>,
        state: &StateAccessor<S>,
    ) -> ActionStream<A> {
        let started =
            std::panic::catch_unwind(AssertUnwindSafe(|| epic.run(shared_input(input), state.clone())));

        started.unwrap_or_else(|payload| {
            tracing::error!(
                epic = epic.name(),
                panic = %panic_message(payload.as_ref()),
                "Epic panicked while starting; its input will be drained and ignored"
            );
            metrics::counter!("epic_panics_total", "epic" => epic.name().to_string()).increment(1);
            shared_input(input)
                .filter_map(|_| futures::future::ready(None))
                .boxed()
        })
    }
}

impl<S, A> Stream for Isolated<S, A>
where
    S: Send + Sync + 'static,
    A: Send + 'static,
{
    type Item = A;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled =
            std::panic::catch_unwind(AssertUnwindSafe(|| this.output.as_mut().poll_next(cx)));

        match polled {
            Ok(poll) => poll,
            Err(payload) => {
                tracing::error!(
                    epic = this.epic.name(),
                    panic = %panic_message(payload.as_ref()),
                    "Epic panicked while processing an action, restarting"
                );
                metrics::counter!("epic_panics_total", "epic" => this.epic.name().to_string())
                    .increment(1);

                this.output = Self::run_epic(&this.epic, &this.input, &this.state);
                cx.waker().wake_by_ref();
                Poll::Pending
            },
        }
    }
}
