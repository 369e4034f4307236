//! Middleware trait, the ordered registry the pipeline consults, and a
//! ready-made tracing middleware.

use std::fmt::Debug;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::Level;

use crate::error::{Hook, StoreError, panic_message};

/// Side-effect hooks run around every reduction step.
///
/// Both hooks default to no-ops, so implementors override only what they
/// need. Hooks never change the state; use
/// [`Store::set_override_reducer`](crate::Store::set_override_reducer) for
/// that.
///
/// # Contract
///
/// - Hooks run on the store's pipeline worker, one action at a time, in
///   registration order. They never run concurrently with each other or
///   with the reducer for the same store.
/// - A panicking hook poisons the store. Middlewares registered after it
///   are skipped for that action.
/// - Hooks take `&self`; keep mutable bookkeeping behind a `Mutex` or
///   atomics.
pub trait Middleware<S, A>: Send + Sync + 'static {
    /// Called with the pre-reduction state before the reducer runs.
    fn before_reduce(&self, state: &S, action: &A) {
        let _ = (state, action);
    }

    /// Called with the post-override state once the reduction is complete.
    ///
    /// Never called for the seed state the store starts with.
    fn after_reduce(&self, action: &A, next_state: &S) {
        let _ = (action, next_state);
    }

    /// Name reported in logs and in
    /// [`StoreError::MiddlewarePanicked`](crate::StoreError::MiddlewarePanicked).
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Insertion-ordered middleware list owned by the pipeline worker.
pub(crate) struct MiddlewareRegistry<S, A> {
    entries: Vec<Arc<dyn Middleware<S, A>>>,
}

impl<S: 'static, A: 'static> MiddlewareRegistry<S, A> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub(crate) fn add(&mut self, middleware: Arc<dyn Middleware<S, A>>) {
        tracing::debug!(middleware = middleware.name(), "middleware added");
        self.entries.push(middleware);
    }

    /// Remove the first entry that is the same allocation as `middleware`.
    pub(crate) fn remove(&mut self, middleware: &Arc<dyn Middleware<S, A>>) -> bool {
        match self
            .entries
            .iter()
            .position(|entry| Arc::ptr_eq(entry, middleware))
        {
            Some(index) => {
                let removed = self.entries.remove(index);
                tracing::debug!(middleware = removed.name(), "middleware removed");
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Run every before-hook in order, stopping at the first panic.
    pub(crate) fn before_reduce(&self, state: &S, action: &A, ticket: u64) -> Result<(), StoreError> {
        for entry in &self.entries {
            guard_hook(entry.as_ref(), Hook::BeforeReduce, ticket, || {
                entry.before_reduce(state, action);
            })?;
        }
        Ok(())
    }

    /// Run every after-hook in order, stopping at the first panic.
    pub(crate) fn after_reduce(&self, action: &A, next_state: &S, ticket: u64) -> Result<(), StoreError> {
        for entry in &self.entries {
            guard_hook(entry.as_ref(), Hook::AfterReduce, ticket, || {
                entry.after_reduce(action, next_state);
            })?;
        }
        Ok(())
    }
}

fn guard_hook<S: 'static, A: 'static>(
    middleware: &dyn Middleware<S, A>,
    hook: Hook,
    ticket: u64,
    f: impl FnOnce(),
) -> Result<(), StoreError> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| StoreError::MiddlewarePanicked {
        ticket,
        middleware: middleware.name().to_owned(),
        hook,
        message: panic_message(payload.as_ref()),
    })
}

/// Middleware that logs every action and resulting state via `tracing`.
///
/// Actions are logged before reduction, states after, both at the
/// configured level (default [`Level::DEBUG`]) with target `statefold`.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use statefold::{Middleware, TracingMiddleware};
///
/// let logger: Arc<dyn Middleware<u32, &'static str>> = Arc::new(
///     TracingMiddleware::<u32, &'static str>::new().with_level(tracing::Level::INFO),
/// );
/// assert_eq!(logger.name(), "tracing");
/// ```
pub struct TracingMiddleware<S, A> {
    level: Level,
    _marker: PhantomData<fn(&S, &A)>,
}

impl<S, A> TracingMiddleware<S, A> {
    pub fn new() -> Self {
        Self {
            level: Level::DEBUG,
            _marker: PhantomData,
        }
    }

    /// Set the level both hooks log at.
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn level(&self) -> Level {
        self.level
    }
}

impl<S, A> Default for TracingMiddleware<S, A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, A> Debug for TracingMiddleware<S, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TracingMiddleware")
            .field("level", &self.level)
            .finish()
    }
}

// `tracing` macros need the level as a constant, hence the dispatch.
macro_rules! log_at {
    ($level:expr, $($args:tt)+) => {
        match $level {
            Level::TRACE => tracing::trace!(target: "statefold", $($args)+),
            Level::DEBUG => tracing::debug!(target: "statefold", $($args)+),
            Level::INFO => tracing::info!(target: "statefold", $($args)+),
            Level::WARN => tracing::warn!(target: "statefold", $($args)+),
            _ => tracing::error!(target: "statefold", $($args)+),
        }
    };
}

impl<S, A> Middleware<S, A> for TracingMiddleware<S, A>
where
    S: Debug + 'static,
    A: Debug + 'static,
{
    fn before_reduce(&self, _state: &S, action: &A) {
        log_at!(self.level, ?action, "reducing action");
    }

    fn after_reduce(&self, action: &A, next_state: &S) {
        log_at!(self.level, ?action, state = ?next_state, "state reduced");
    }

    fn name(&self) -> &str {
        "tracing"
    }
}
