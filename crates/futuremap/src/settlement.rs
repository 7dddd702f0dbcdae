//! The settlement side of the registry: the outcome type carried by every
//! registered future, and the shared future handle returned to callers.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::FutureExt as _;
use futures::channel::oneshot;
use futures::future::Shared;

/// What a registered future eventually settles to.
pub type Outcome<V, E> = Result<V, Rejection<E>>;

/// The failure channel of a registered future.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection<E> {
    /// The entry was explicitly rejected with this reason, or the value it
    /// was adopting failed with it.
    #[error("rejected: {0}")]
    Reason(E),
    /// The entry was deleted (or evicted) while the future was still pending.
    #[error("entry was deleted before it settled")]
    Deleted,
}

/// An error returned by `resolve`/`reject` when the target key exists but is
/// not an awaitable placeholder: it is either already settled, or was created
/// by supplying a value/failure directly and owns no external settlement
/// handle.
#[derive(Debug, Clone, thiserror::Error)]
#[error("entry is already settled or cannot be settled externally")]
pub struct AlreadySettledError;

// We want a shared future here so that any number of callers can hold and
// await the same entry's outcome independently.
type SharedOutcome<V, E> = Shared<oneshot::Receiver<Outcome<V, E>>>;

/// A clonable handle to an entry's eventual outcome.
///
/// Returned by [`FutureRegistry::get`](crate::FutureRegistry::get). Awaiting
/// it yields the entry's [`Outcome`] once it settles; every clone observes
/// the same settlement. The handle stays valid after its entry is deleted
/// from the registry.
pub struct SettlementFuture<V, E> {
    inner: SharedOutcome<V, E>,
}

impl<V: Clone, E: Clone> SettlementFuture<V, E> {
    pub(crate) fn new(receiver: oneshot::Receiver<Outcome<V, E>>) -> Self {
        Self {
            inner: receiver.shared(),
        }
    }
}

impl<V, E> Clone for SettlementFuture<V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V, E> fmt::Debug for SettlementFuture<V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettlementFuture").finish_non_exhaustive()
    }
}

impl<V: Clone, E: Clone> Future for SettlementFuture<V, E> {
    type Output = Outcome<V, E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match futures::ready!(self.inner.poll_unpin(cx)) {
            Ok(outcome) => Poll::Ready(outcome),
            // The producing side vanished without settling. The only way this
            // happens in practice is an adoption task being torn down with
            // its runtime, which callers cannot distinguish from deletion.
            Err(oneshot::Canceled) => Poll::Ready(Err(Rejection::Deleted)),
        }
    }
}
