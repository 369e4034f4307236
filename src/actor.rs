//! Pipeline worker that owns the current state and reduces actions.
//!
//! The worker runs as a single loop, either on a dedicated thread with its
//! own current-thread runtime or as one task on a caller-supplied runtime,
//! and sequentially processes messages from an unbounded `mpsc` channel.
//! It exclusively owns the current state, the reducer, the override
//! reducer, and the middleware registry. Nothing else ever touches them,
//! so at most one reduction is in flight per store.
//!
//! Each admitted action is folded as: before-hooks, reducer, override,
//! after-hooks, emit. A panic anywhere in that sequence aborts the step
//! and poisons the store.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::error::{StoreError, panic_message};
use crate::middleware::{Middleware, MiddlewareRegistry};
use crate::multicast::ReplayCast;
use crate::reducer::Reducer;

/// Messages sent from [`Store`](crate::Store) and attached action sources
/// to the pipeline worker.
pub(crate) enum PipelineMessage<S, A> {
    /// Reduce one admitted action.
    Dispatch {
        /// Admission ticket, strictly increasing per store.
        ticket: u64,
        action: A,
    },

    /// Append a middleware to the registry.
    AddMiddleware(Arc<dyn Middleware<S, A>>),

    /// Remove a middleware by identity.
    RemoveMiddleware {
        middleware: Arc<dyn Middleware<S, A>>,
        /// Whether an entry was actually removed.
        reply: oneshot::Sender<bool>,
    },

    /// Replace the override reducer. `None` restores the identity.
    SetOverride(Option<Box<dyn Reducer<S, A>>>),

    /// Retrieve the current state.
    GetState { reply: oneshot::Sender<S> },

    /// Stop the worker.
    Shutdown,
}

/// The fold the worker runs over admitted actions.
pub(crate) struct Pipeline<S, A> {
    current: S,
    reducer: Box<dyn Reducer<S, A>>,
    override_reducer: Option<Box<dyn Reducer<S, A>>>,
    middlewares: MiddlewareRegistry<S, A>,
    cast: Arc<ReplayCast<S>>,
    /// Highest ticket processed so far. Zero before the first action.
    last_ticket: u64,
}

impl<S, A> Pipeline<S, A>
where
    S: Clone + 'static,
    A: 'static,
{
    /// Create a pipeline seeded with `initial`.
    ///
    /// The seed is already held by `cast`; it is never passed to any
    /// after-hook.
    pub(crate) fn new(
        initial: S,
        reducer: Box<dyn Reducer<S, A>>,
        override_reducer: Option<Box<dyn Reducer<S, A>>>,
        middlewares: MiddlewareRegistry<S, A>,
        cast: Arc<ReplayCast<S>>,
    ) -> Self {
        Self {
            current: initial,
            reducer,
            override_reducer,
            middlewares,
            cast,
            last_ticket: 0,
        }
    }

    /// Reduce a single action and publish the resulting state.
    fn process(&mut self, ticket: u64, action: A) -> Result<(), StoreError> {
        let _span = tracing::info_span!("reduce", ticket).entered();

        if ticket <= self.last_ticket {
            // Only reachable with `serialize_actions` off: two producers
            // raced between taking a ticket and enqueueing the action.
            tracing::warn!(
                ticket,
                last_ticket = self.last_ticket,
                "action admitted out of ticket order; enable serialize_actions for a total order"
            );
        }
        self.last_ticket = self.last_ticket.max(ticket);

        // 1. Before-hooks observe the pre-reduction state.
        self.middlewares
            .before_reduce(&self.current, &action, ticket)?;

        // 2. Reduce. The reducer consumes a copy so that a panic leaves
        //    `current` intact for the replay cell.
        let reduced = guard_reducer(ticket, || {
            self.reducer.reduce(self.current.clone(), &action)
        })?;

        // 3. Override, identity when unset.
        let next = match &self.override_reducer {
            Some(hook) => guard_reducer(ticket, || hook.reduce(reduced, &action))?,
            None => reduced,
        };

        // 4. After-hooks observe the post-override state.
        self.middlewares.after_reduce(&action, &next, ticket)?;

        // 5. Commit and publish.
        self.current = next.clone();
        self.cast.emit(next);
        tracing::trace!("state emitted");
        Ok(())
    }
}

// Subscribers must see end-of-stream however the worker stops, including
// when its task is dropped unpolled or mid-flight by a runtime shutdown.
impl<S, A> Drop for Pipeline<S, A> {
    fn drop(&mut self) {
        self.cast.close();
    }
}

fn guard_reducer<S>(ticket: u64, f: impl FnOnce() -> S) -> Result<S, StoreError> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| StoreError::ReducerPanicked {
        ticket,
        message: panic_message(payload.as_ref()),
    })
}

/// Runs the pipeline loop until shutdown, channel close, or poisoning.
///
/// On a fault the terminal error is published to every subscriber and the
/// loop exits, dropping the receiver so further dispatches fail fast. On a
/// clean exit subscribers see end-of-stream.
pub(crate) async fn run_pipeline<S, A>(
    mut pipeline: Pipeline<S, A>,
    mut rx: mpsc::UnboundedReceiver<PipelineMessage<S, A>>,
) where
    S: Clone + 'static,
    A: 'static,
{
    tracing::info!("store pipeline started");

    while let Some(msg) = rx.recv().await {
        match msg {
            PipelineMessage::Dispatch { ticket, action } => {
                if let Err(err) = pipeline.process(ticket, action) {
                    tracing::error!(error = %err, "store pipeline poisoned");
                    pipeline.cast.fail(err);
                    break;
                }
            }

            PipelineMessage::AddMiddleware(middleware) => pipeline.middlewares.add(middleware),

            PipelineMessage::RemoveMiddleware { middleware, reply } => {
                let removed = pipeline.middlewares.remove(&middleware);
                // If the receiver was dropped, the caller no longer cares.
                let _ = reply.send(removed);
            }

            PipelineMessage::SetOverride(hook) => {
                tracing::debug!(installed = hook.is_some(), "override reducer replaced");
                pipeline.override_reducer = hook;
            }

            PipelineMessage::GetState { reply } => {
                let _ = reply.send(pipeline.current.clone());
            }

            PipelineMessage::Shutdown => break,
        }
    }

    // Dropping `pipeline` closes the cast; a no-op after a fault.
    tracing::info!(
        actions = pipeline.last_ticket,
        "store pipeline stopped"
    );
}
