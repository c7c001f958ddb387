//! Stream operators used to build Epics.
//!
//! Only the combinators the middleware relies on are provided:
//!
//! - [`merge_map`]: start a one-shot future per selected action, emit results
//!   as they resolve (no coalescing, no cancellation)
//! - [`switch_latest`]: keep at most one inner stream alive; a newer start
//!   request supersedes the active one, a stop request ends it
//!
//! Filtering by action tag is done with plain `match` inside the selector
//! closures, so the compiler checks exhaustiveness.

use crate::epic::ActionStream;
use futures::stream::{FuturesUnordered, Stream, StreamExt};
use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Classification of an input action for [`switch_latest`].
pub enum Switch<K, S> {
    /// Start a new inner stream for `K`, superseding any active one
    Start(K, S),
    /// Stop the active inner stream if it belongs to `K`
    Stop(K),
    /// Not a control action
    Ignore,
}

impl<K: Debug, S> Debug for Switch<K, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start(key, _) => f.debug_tuple("Switch::Start").field(key).finish(),
            Self::Stop(key) => f.debug_tuple("Switch::Stop").field(key).finish(),
            Self::Ignore => write!(f, "Switch::Ignore"),
        }
    }
}

/// Map selected actions to futures and merge their results.
///
/// Every action for which `f` returns `Some` starts its future immediately;
/// futures run concurrently and their outputs are emitted in completion
/// order. Later actions never cancel earlier futures, so each started future
/// yields exactly one output. The stream ends once the input has ended and
/// every started future has resolved.
///
/// # Examples
///
/// ```
/// use composable_epics_core::{merge_map, ActionStream};
/// use futures::StreamExt;
///
/// # tokio_test::block_on(async {
/// let input: ActionStream<u32> = futures::stream::iter(vec![1, 2, 3]).boxed();
/// let doubled: Vec<u32> = merge_map(input, |n| (n != 2).then(|| async move { n * 2 }))
///     .collect()
///     .await;
/// assert_eq!(doubled, vec![2, 6]);
/// # });
/// ```
pub fn merge_map<A, B, F, Fut>(actions: ActionStream<A>, f: F) -> ActionStream<B>
where
    A: Send + 'static,
    B: Send + 'static,
    F: FnMut(A) -> Option<Fut> + Send + Unpin + 'static,
    Fut: Future<Output = B> + Send + 'static,
{
    Box::pin(MergeMap {
        input: Some(actions),
        pending: FuturesUnordered::new(),
        f,
    })
}

struct MergeMap<A, Fut, F> {
    input: Option<ActionStream<A>>,
    pending: FuturesUnordered<Fut>,
    f: F,
}

impl<A, Fut, F> Stream for MergeMap<A, Fut, F>
where
    F: FnMut(A) -> Option<Fut> + Unpin,
    Fut: Future,
{
    type Item = Fut::Output;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        let mut input_done = false;
        if let Some(input) = this.input.as_mut() {
            loop {
                match input.as_mut().poll_next(cx) {
                    Poll::Ready(Some(action)) => {
                        if let Some(fut) = (this.f)(action) {
                            this.pending.push(fut);
                        }
                    },
                    Poll::Ready(None) => {
                        input_done = true;
                        break;
                    },
                    Poll::Pending => break,
                }
            }
        }
        if input_done {
            this.input = None;
        }

        if let Poll::Ready(Some(output)) = this.pending.poll_next_unpin(cx) {
            return Poll::Ready(Some(output));
        }

        if this.input.is_none() && this.pending.is_empty() {
            Poll::Ready(None)
        } else {
            Poll::Pending
        }
    }
}

/// Keep at most one inner stream alive, switching to the latest request.
///
/// `select` classifies each input action:
///
/// - [`Switch::Start`]: the active inner stream (if any) is dropped first,
///   then the new one becomes active. Dropping is how inner streams release
///   their resources, so the superseded stream never yields again.
/// - [`Switch::Stop`]: drops the active inner stream when its key matches.
///   Stopping while idle, or for another key, is a no-op.
/// - [`Switch::Ignore`]: nothing happens.
///
/// Pending input is always drained before the active inner stream is
/// polled: a control action that is already queued takes effect before any
/// value the inner stream has buffered. An inner stream that ends on its own
/// returns the operator to idle. The output ends once the input has ended
/// and no inner stream is active.
///
/// # Examples
///
/// ```
/// use composable_epics_core::{switch_latest, ActionStream, Switch};
/// use futures::StreamExt;
///
/// # tokio_test::block_on(async {
/// let input: ActionStream<&str> = futures::stream::iter(vec!["start", "stop"]).boxed();
/// let out: Vec<u8> = switch_latest(input, |cmd| match cmd {
///     "start" => Switch::Start("k", futures::stream::pending::<u8>().boxed()),
///     "stop" => Switch::Stop("k"),
///     _ => Switch::Ignore,
/// })
/// .collect()
/// .await;
/// assert!(out.is_empty());
/// # });
/// ```
pub fn switch_latest<A, B, K, F>(actions: ActionStream<A>, select: F) -> ActionStream<B>
where
    A: Send + 'static,
    B: Send + 'static,
    K: PartialEq + Debug + Send + Unpin + 'static,
    F: FnMut(A) -> Switch<K, ActionStream<B>> + Send + Unpin + 'static,
{
    Box::pin(SwitchLatest {
        input: Some(actions),
        active: None,
        select,
    })
}

struct SwitchLatest<A, B, K, F> {
    input: Option<ActionStream<A>>,
    active: Option<(K, ActionStream<B>)>,
    select: F,
}

impl<A, B, K, F> SwitchLatest<A, B, K, F>
where
    K: PartialEq + Debug,
    F: FnMut(A) -> Switch<K, ActionStream<B>>,
{
    fn apply(&mut self, action: A) {
        match (self.select)(action) {
            Switch::Start(key, inner) => {
                if let Some((previous, _)) = self.active.take() {
                    tracing::debug!(previous = ?previous, next = ?key, "Superseding active inner stream");
                } else {
                    tracing::debug!(key = ?key, "Starting inner stream");
                }
                self.active = Some((key, inner));
            },
            Switch::Stop(key) => match &self.active {
                Some((active, _)) if *active == key => {
                    tracing::debug!(key = ?key, "Stopping inner stream");
                    self.active = None;
                },
                Some((active, _)) => {
                    tracing::trace!(key = ?key, active = ?active, "Stop for inactive key ignored");
                },
                None => tracing::trace!(key = ?key, "Stop while idle ignored"),
            },
            Switch::Ignore => {},
        }
    }
}

impl<A, B, K, F> Stream for SwitchLatest<A, B, K, F>
where
    K: PartialEq + Debug + Unpin,
    F: FnMut(A) -> Switch<K, ActionStream<B>> + Unpin,
{
    type Item = B;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        while let Some(input) = this.input.as_mut() {
            match input.as_mut().poll_next(cx) {
                Poll::Ready(Some(action)) => this.apply(action),
                Poll::Ready(None) => this.input = None,
                Poll::Pending => break,
            }
        }

        let mut inner_done = false;
        if let Some((key, inner)) = this.active.as_mut() {
            match inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(item)) => return Poll::Ready(Some(item)),
                Poll::Ready(None) => {
                    tracing::debug!(key = ?key, "Inner stream completed");
                    inner_done = true;
                },
                Poll::Pending => {},
            }
        }
        if inner_done {
            this.active = None;
        }

        if this.input.is_none() && this.active.is_none() {
            Poll::Ready(None)
        } else {
            Poll::Pending
        }
    }
}
