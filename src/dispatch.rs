//! Action ingestion: the single path by which actions reach the pipeline.
//!
//! Every action, whether dispatched directly or forwarded from an attached
//! source, is admitted through [`Ingress::admit`], which stamps it with an
//! admission ticket and enqueues it for the pipeline worker.
//!
//! With serialization on, ticket assignment and enqueueing happen under one
//! lock, so ticket order is exactly pipeline order no matter how many
//! threads dispatch at once. With serialization off, tickets come from an
//! atomic counter and the enqueue happens outside any lock; the queue keeps
//! every action, but two racing producers may enqueue in the opposite order
//! of their tickets.
//!
//! Admissions hold the read side of the `stopping` lock while enqueueing and
//! shutdown takes the write side, so nothing is ever queued behind the
//! shutdown message.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard};

use tokio::sync::{mpsc, watch};
use tokio_stream::{Stream, StreamExt};

use crate::actor::PipelineMessage;
use crate::error::StoreError;
use crate::multicast::ReplayCast;

/// Sending half of the pipeline queue plus the admission discipline.
pub(crate) struct Ingress<S, A> {
    sender: mpsc::UnboundedSender<PipelineMessage<S, A>>,
    /// Last issued ticket, behind the serialization gate. `None` when
    /// serialization is off.
    gate: Option<Mutex<u64>>,
    /// Ticket source when serialization is off.
    next_ticket: AtomicU64,
    /// Set once shutdown has been requested.
    stopping: RwLock<bool>,
    cast: Arc<ReplayCast<S>>,
}

impl<S: Clone, A> Ingress<S, A> {
    pub(crate) fn new(
        sender: mpsc::UnboundedSender<PipelineMessage<S, A>>,
        serialize_actions: bool,
        cast: Arc<ReplayCast<S>>,
    ) -> Self {
        Self {
            sender,
            gate: serialize_actions.then(|| Mutex::new(0)),
            next_ticket: AtomicU64::new(0),
            stopping: RwLock::new(false),
            cast,
        }
    }

    /// Admit one action into the pipeline.
    ///
    /// # Errors
    ///
    /// Returns the store's terminal error if it was poisoned, or
    /// [`StoreError::Closed`] once shutdown was requested.
    pub(crate) fn admit(&self, action: A) -> Result<(), StoreError> {
        let stopping = self.read_stopping();
        if *stopping || self.cast.is_terminated() {
            return Err(self.terminal());
        }
        let sent = match &self.gate {
            Some(gate) => {
                let mut last = gate.lock().unwrap_or_else(PoisonError::into_inner);
                *last += 1;
                self.sender.send(PipelineMessage::Dispatch {
                    ticket: *last,
                    action,
                })
            }
            None => {
                let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed) + 1;
                self.sender
                    .send(PipelineMessage::Dispatch { ticket, action })
            }
        };
        sent.map_err(|_| self.terminal())
    }

    /// Enqueue a control message behind every action admitted so far.
    pub(crate) fn send(&self, msg: PipelineMessage<S, A>) -> Result<(), StoreError> {
        let stopping = self.read_stopping();
        if *stopping {
            return Err(self.terminal());
        }
        self.sender.send(msg).map_err(|_| self.terminal())
    }

    /// The error to report once the pipeline no longer accepts messages.
    pub(crate) fn terminal(&self) -> StoreError {
        self.cast.terminal_error().unwrap_or(StoreError::Closed)
    }
}

impl<S, A> Ingress<S, A> {
    pub(crate) fn is_serialized(&self) -> bool {
        self.gate.is_some()
    }

    /// Returns `true` once shutdown was requested or the worker is gone.
    pub(crate) fn is_closed(&self) -> bool {
        *self.read_stopping() || self.sender.is_closed()
    }

    /// Ask the worker to stop once it drains what is already queued.
    ///
    /// Every later admission is rejected.
    pub(crate) fn request_shutdown(&self) {
        let mut stopping = self
            .stopping
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if !*stopping {
            *stopping = true;
            // Already stopped if the send fails.
            let _ = self.sender.send(PipelineMessage::Shutdown);
        }
    }

    fn read_stopping(&self) -> RwLockReadGuard<'_, bool> {
        self.stopping.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cancellation token for an action source attached with
/// [`Store::dispatch_stream`](crate::Store::dispatch_stream).
///
/// The handle owns the forwarding task for exactly one source. Calling
/// [`cancel`](DispatchHandle::cancel) detaches that source: no further
/// items are forwarded, actions already forwarded stay applied, and the
/// source is never restarted. Cancelling never fails and never affects
/// other sources.
///
/// Dropping the handle does **not** detach the source; it keeps forwarding
/// until it is exhausted or the store stops.
#[must_use = "dropping a DispatchHandle leaves its source attached; keep it to cancel later"]
#[derive(Debug)]
pub struct DispatchHandle {
    /// Sends `true` to signal the forwarder to stop.
    cancel_tx: watch::Sender<bool>,
    /// Number of actions admitted from this source so far.
    forwarded: Arc<AtomicU64>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl DispatchHandle {
    /// Stop forwarding from this source.
    ///
    /// Takes effect before the forwarder admits its next item. An item that
    /// was already being admitted when `cancel` was called may still land.
    /// Calling `cancel` more than once is harmless.
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    /// Returns `true` once [`cancel`](DispatchHandle::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Returns `true` once the forwarder has stopped, because the source
    /// ended, the handle was cancelled, or the store stopped accepting
    /// actions.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|task| task.is_finished())
    }

    /// Number of actions this source has forwarded into the store.
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Acquire)
    }

    /// A handle for a source that could not be attached because the store
    /// had already stopped.
    pub(crate) fn detached() -> Self {
        let (cancel_tx, _) = watch::channel(true);
        Self {
            cancel_tx,
            forwarded: Arc::new(AtomicU64::new(0)),
            task: None,
        }
    }
}

/// Spawn a forwarder for `source` on `runtime` and return its handle.
pub(crate) fn attach<S, A, St>(
    ingress: Arc<Ingress<S, A>>,
    source: St,
    runtime: &tokio::runtime::Handle,
) -> DispatchHandle
where
    S: Clone + Send + 'static,
    A: Send + 'static,
    St: Stream<Item = A> + Send + 'static,
{
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let forwarded = Arc::new(AtomicU64::new(0));
    let task = runtime.spawn(forward(ingress, source, cancel_rx, forwarded.clone()));
    tracing::debug!("action source attached");

    DispatchHandle {
        cancel_tx,
        forwarded,
        task: Some(task),
    }
}

/// Forward every item of `source` into the pipeline until the source ends,
/// cancellation is signalled, or the store stops.
async fn forward<S, A, St>(
    ingress: Arc<Ingress<S, A>>,
    source: St,
    mut cancel_rx: watch::Receiver<bool>,
    forwarded: Arc<AtomicU64>,
) where
    S: Clone,
    St: Stream<Item = A>,
{
    tokio::pin!(source);

    loop {
        // Cancellation wins over a ready item.
        tokio::select! {
            biased;
            // A dropped handle makes `changed` fail; that disables this
            // branch instead of cancelling.
            Ok(()) = cancel_rx.changed() => {
                tracing::debug!(forwarded = forwarded.load(Ordering::Acquire), "action source cancelled");
                return;
            }
            next = source.next() => match next {
                Some(action) => {
                    if *cancel_rx.borrow() {
                        return;
                    }
                    if let Err(err) = ingress.admit(action) {
                        tracing::debug!(error = %err, "store stopped, detaching action source");
                        return;
                    }
                    forwarded.fetch_add(1, Ordering::AcqRel);
                }
                None => {
                    tracing::debug!(forwarded = forwarded.load(Ordering::Acquire), "action source exhausted");
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_stream::wrappers::UnboundedReceiverStream;

    use super::*;

    type Message = PipelineMessage<i32, i32>;

    fn ingress(serialize: bool) -> (Arc<Ingress<i32, i32>>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cast = Arc::new(ReplayCast::new(0));
        (Arc::new(Ingress::new(tx, serialize, cast)), rx)
    }

    fn dispatched(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<(u64, i32)> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let PipelineMessage::Dispatch { ticket, action } = msg {
                out.push((ticket, action));
            }
        }
        out
    }

    async fn wait_finished(handle: &DispatchHandle) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !handle.is_finished() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("forwarder should finish");
    }

    #[test]
    fn serialized_admission_issues_sequential_tickets() {
        let (ingress, mut rx) = ingress(true);
        assert!(ingress.is_serialized());
        for action in [10, 20, 30] {
            ingress.admit(action).unwrap();
        }
        assert_eq!(dispatched(&mut rx), vec![(1, 10), (2, 20), (3, 30)]);
    }

    #[test]
    fn serialized_admission_across_threads_keeps_ticket_order() {
        let (ingress, mut rx) = ingress(true);
        std::thread::scope(|scope| {
            for t in 0..4 {
                let ingress = &ingress;
                scope.spawn(move || {
                    for i in 0..250 {
                        ingress.admit(t * 1000 + i).unwrap();
                    }
                });
            }
        });

        let tickets: Vec<u64> = dispatched(&mut rx).into_iter().map(|(t, _)| t).collect();
        assert_eq!(tickets, (1..=1000).collect::<Vec<_>>());
    }

    #[test]
    fn unserialized_admission_keeps_every_action() {
        let (ingress, mut rx) = ingress(false);
        assert!(!ingress.is_serialized());
        std::thread::scope(|scope| {
            for t in 0..4 {
                let ingress = &ingress;
                scope.spawn(move || {
                    for i in 0..250 {
                        ingress.admit(t * 1000 + i).unwrap();
                    }
                });
            }
        });

        let mut tickets: Vec<u64> = dispatched(&mut rx).into_iter().map(|(t, _)| t).collect();
        tickets.sort_unstable();
        assert_eq!(tickets, (1..=1000).collect::<Vec<_>>());
    }

    #[test]
    fn admit_after_close_reports_closed() {
        let (ingress, rx) = ingress(true);
        drop(rx);
        assert!(ingress.is_closed());
        assert_eq!(ingress.admit(1), Err(StoreError::Closed));
    }

    #[test]
    fn shutdown_rejects_later_admissions_in_both_modes() {
        for serialize in [true, false] {
            let (ingress, mut rx) = ingress(serialize);
            ingress.admit(1).unwrap();
            ingress.request_shutdown();
            ingress.request_shutdown();

            assert!(ingress.is_closed());
            assert_eq!(ingress.admit(2), Err(StoreError::Closed));
            assert_eq!(
                ingress.send(PipelineMessage::Shutdown),
                Err(StoreError::Closed)
            );

            let mut queued = Vec::new();
            while let Ok(msg) = rx.try_recv() {
                queued.push(match msg {
                    PipelineMessage::Dispatch { ticket, .. } => format!("dispatch:{ticket}"),
                    PipelineMessage::Shutdown => "shutdown".to_owned(),
                    _ => "other".to_owned(),
                });
            }
            assert_eq!(queued, vec!["dispatch:1", "shutdown"], "serialize={serialize}");
        }
    }

    #[test]
    fn shutdown_racing_producers_never_queues_behind_shutdown() {
        let (ingress, mut rx) = ingress(true);
        std::thread::scope(|scope| {
            for t in 0..4 {
                let ingress = &ingress;
                scope.spawn(move || {
                    for i in 0..500 {
                        let _ = ingress.admit(t * 1000 + i);
                    }
                });
            }
            ingress.request_shutdown();
        });

        let mut after_shutdown = 0;
        let mut seen_shutdown = false;
        while let Ok(msg) = rx.try_recv() {
            match msg {
                PipelineMessage::Shutdown => seen_shutdown = true,
                _ if seen_shutdown => after_shutdown += 1,
                _ => {}
            }
        }
        assert!(seen_shutdown);
        assert_eq!(after_shutdown, 0);
    }

    #[tokio::test]
    async fn forwarder_after_shutdown_counts_nothing() {
        let (ingress, mut rx) = ingress(true);
        ingress.request_shutdown();
        let handle = attach(
            ingress,
            tokio_stream::iter(vec![1, 2]),
            &tokio::runtime::Handle::current(),
        );
        wait_finished(&handle).await;

        assert_eq!(handle.forwarded(), 0);
        assert!(dispatched(&mut rx).is_empty());
    }

    #[test]
    fn admit_after_poison_reports_terminal_error() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let cast = Arc::new(ReplayCast::new(0));
        let ingress: Ingress<i32, i32> = Ingress::new(tx, true, cast.clone());
        let err = StoreError::ReducerPanicked {
            ticket: 9,
            message: "boom".into(),
        };
        cast.fail(err.clone());
        assert_eq!(ingress.admit(1), Err(err));
    }

    #[tokio::test]
    async fn forwards_finite_source_then_finishes() {
        let (ingress, mut rx) = ingress(true);
        let handle = attach(
            ingress,
            tokio_stream::iter(vec![1, 2, 3]),
            &tokio::runtime::Handle::current(),
        );
        wait_finished(&handle).await;

        assert_eq!(handle.forwarded(), 3);
        assert!(!handle.is_cancelled());
        assert_eq!(dispatched(&mut rx), vec![(1, 1), (2, 2), (3, 3)]);
    }

    #[tokio::test]
    async fn cancel_stops_forwarding() {
        let (ingress, mut rx) = ingress(true);
        let (feed, source) = mpsc::unbounded_channel();
        let handle = attach(
            ingress,
            UnboundedReceiverStream::new(source),
            &tokio::runtime::Handle::current(),
        );

        feed.send(1).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.forwarded() < 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("first item should be forwarded");

        handle.cancel();
        handle.cancel();
        feed.send(2).unwrap();
        wait_finished(&handle).await;

        assert!(handle.is_cancelled());
        assert_eq!(handle.forwarded(), 1);
        assert_eq!(dispatched(&mut rx), vec![(1, 1)]);
    }

    #[tokio::test]
    async fn dropping_handle_keeps_source_attached() {
        let (ingress, mut rx) = ingress(true);
        let (feed, source) = mpsc::unbounded_channel();
        let handle = attach(
            ingress,
            UnboundedReceiverStream::new(source),
            &tokio::runtime::Handle::current(),
        );
        let forwarded = handle.forwarded.clone();
        drop(handle);

        feed.send(5).unwrap();
        feed.send(6).unwrap();
        drop(feed);
        tokio::time::timeout(Duration::from_secs(5), async {
            while forwarded.load(Ordering::Acquire) < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("source should keep forwarding");

        assert_eq!(dispatched(&mut rx), vec![(1, 5), (2, 6)]);
    }

    #[tokio::test]
    async fn forwarder_stops_when_store_closes() {
        let (ingress, rx) = ingress(true);
        drop(rx);
        let (feed, source) = mpsc::unbounded_channel();
        let handle = attach(
            ingress,
            UnboundedReceiverStream::new(source),
            &tokio::runtime::Handle::current(),
        );

        feed.send(1).unwrap();
        wait_finished(&handle).await;
        assert_eq!(handle.forwarded(), 0);
    }

    #[test]
    fn detached_handle_is_finished_and_cancelled() {
        let handle = DispatchHandle::detached();
        assert!(handle.is_finished());
        assert!(handle.is_cancelled());
        assert_eq!(handle.forwarded(), 0);
        handle.cancel();
    }
}
