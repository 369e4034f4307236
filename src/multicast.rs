//! Hot, replay-latest broadcast of pipeline output.
//!
//! [`ReplayCast`] holds the most recently emitted state and the list of
//! live subscriber queues behind one lock. Subscribing and emitting both
//! take that lock, so a new subscriber is handed the latest value and then
//! joined to the live list atomically: it can never miss a state or see one
//! out of order.
//!
//! Public API: [`StateStream`], the receiving end returned by
//! [`Store::states`](crate::Store::states) and
//! [`Store::indistinct_states`](crate::Store::indistinct_states).

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, ready};

use tokio::sync::mpsc;

use crate::error::StoreError;

type Item<S> = Result<S, StoreError>;

struct Inner<S> {
    latest: S,
    subscribers: Vec<mpsc::UnboundedSender<Item<S>>>,
    /// Set once the pipeline stops. `Closed` for a clean stop, any other
    /// variant when the pipeline was poisoned.
    terminal: Option<StoreError>,
}

/// Shared broadcast cell between the pipeline worker and subscribers.
pub(crate) struct ReplayCast<S> {
    inner: Mutex<Inner<S>>,
    /// Mirrors `inner.terminal.is_some()` so ingestion can reject actions
    /// without taking the lock.
    terminated: AtomicBool,
}

impl<S> ReplayCast<S> {
    fn lock(&self) -> MutexGuard<'_, Inner<S>> {
        // Nothing user-supplied runs under this lock, so a poisoned mutex
        // still guards consistent data.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// End every subscription cleanly. No-op if already terminated.
    pub(crate) fn close(&self) {
        let mut inner = self.lock();
        if inner.terminal.is_some() {
            return;
        }
        inner.subscribers.clear();
        inner.terminal = Some(StoreError::Closed);
        self.terminated.store(true, Ordering::Release);
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }
}

impl<S: Clone> ReplayCast<S> {
    /// Create a cell primed with the seed state.
    pub(crate) fn new(seed: S) -> Self {
        Self {
            inner: Mutex::new(Inner {
                latest: seed,
                subscribers: Vec::new(),
                terminal: None,
            }),
            terminated: AtomicBool::new(false),
        }
    }

    /// Attach a new subscriber. The latest state is queued before any
    /// subsequent emission.
    pub(crate) fn subscribe(&self, distinct: bool) -> StateStream<S> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        // The receiver is alive, so these sends cannot fail.
        let _ = tx.send(Ok(inner.latest.clone()));
        match &inner.terminal {
            // Dropping `tx` here ends the stream after the replayed value.
            Some(StoreError::Closed) => {}
            Some(err) => {
                let _ = tx.send(Err(err.clone()));
            }
            None => inner.subscribers.push(tx),
        }
        StateStream {
            rx,
            distinct,
            last: None,
        }
    }

    /// Record `state` as the latest value and deliver it to every live
    /// subscriber. Subscribers whose streams were dropped are pruned.
    pub(crate) fn emit(&self, state: S) {
        let mut inner = self.lock();
        inner
            .subscribers
            .retain(|tx| tx.send(Ok(state.clone())).is_ok());
        inner.latest = state;
    }

    /// Terminate every current and future subscription with `err`.
    pub(crate) fn fail(&self, err: StoreError) {
        let mut inner = self.lock();
        if inner.terminal.is_some() {
            return;
        }
        for tx in inner.subscribers.drain(..) {
            let _ = tx.send(Err(err.clone()));
        }
        inner.terminal = Some(err);
        self.terminated.store(true, Ordering::Release);
    }

    pub(crate) fn latest(&self) -> S {
        self.lock().latest.clone()
    }

    pub(crate) fn terminal_error(&self) -> Option<StoreError> {
        self.lock().terminal.clone()
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

/// A subscription to a store's state history.
///
/// The first item is always the state that was current at the moment of
/// subscription. After that, items arrive live as actions are reduced.
/// A poisoned store yields one `Err` and then ends; a store that shuts
/// down cleanly simply ends.
///
/// A distinct stream (from [`Store::states`](crate::Store::states)) skips
/// any state equal to the one it yielded immediately before. Suppression is
/// consecutive only: `[1, 1, 2, 1]` is observed as `[1, 2, 1]`.
///
/// Dropping the stream detaches it without affecting other subscribers.
pub struct StateStream<S> {
    rx: mpsc::UnboundedReceiver<Item<S>>,
    distinct: bool,
    last: Option<S>,
}

// `last` is never pinned structurally.
impl<S> Unpin for StateStream<S> {}

impl<S: Clone + PartialEq> StateStream<S> {
    /// Wait for the next state.
    ///
    /// Returns `None` once the store has stopped and every queued item has
    /// been consumed.
    pub async fn recv(&mut self) -> Option<Result<S, StoreError>> {
        loop {
            let item = self.rx.recv().await?;
            if let Some(item) = self.admit(item) {
                return Some(item);
            }
        }
    }

    /// Take the next already-delivered state without waiting.
    ///
    /// Returns `None` if nothing is queued right now or the stream ended.
    pub fn try_recv(&mut self) -> Option<Result<S, StoreError>> {
        loop {
            let item = self.rx.try_recv().ok()?;
            if let Some(item) = self.admit(item) {
                return Some(item);
            }
        }
    }

    /// Returns `true` for streams that suppress consecutive duplicates.
    pub fn is_distinct(&self) -> bool {
        self.distinct
    }

    fn admit(&mut self, item: Item<S>) -> Option<Item<S>> {
        if let Ok(state) = &item
            && self.distinct
        {
            if self.last.as_ref() == Some(state) {
                return None;
            }
            self.last = Some(state.clone());
        }
        Some(item)
    }
}

impl<S: Clone + PartialEq> tokio_stream::Stream for StateStream<S> {
    type Item = Result<S, StoreError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match ready!(this.rx.poll_recv(cx)) {
                None => return Poll::Ready(None),
                Some(item) => {
                    if let Some(item) = this.admit(item) {
                        return Poll::Ready(Some(item));
                    }
                }
            }
        }
    }
}

impl<S> std::fmt::Debug for StateStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStream")
            .field("distinct", &self.distinct)
            .finish_non_exhaustive()
    }
}
