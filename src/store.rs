//! Top-level entry point that composes ingestion, the pipeline worker, and
//! the state multicaster into a single [`Store`] type.
//!
//! A store is built via [`StoreBuilder`], which takes the initial state and
//! the reducer plus optional configuration: the executor the pipeline runs
//! on, whether concurrent dispatches are serialized, and middlewares or an
//! override reducer to install before the first action.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::Stream;

use crate::actor::{Pipeline, PipelineMessage, run_pipeline};
use crate::dispatch::{DispatchHandle, Ingress, attach};
use crate::error::{BuildError, StoreError};
use crate::middleware::{Middleware, MiddlewareRegistry};
use crate::multicast::{ReplayCast, StateStream};
use crate::reducer::Reducer;

/// Default name of the dedicated pipeline thread.
const DEFAULT_THREAD_NAME: &str = "statefold-store";

/// Serializable store configuration.
///
/// All fields have defaults, so a partial document deserializes cleanly.
/// Pass to [`StoreBuilder::config`] to apply.
///
/// # Examples
///
/// ```
/// use statefold::StoreConfig;
///
/// let config = StoreConfig {
///     thread_name: "ui-store".into(),
///     ..StoreConfig::default()
/// };
/// assert!(config.serialize_actions);
/// assert_eq!(config.thread_name, "ui-store");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Route every dispatch through the ingestion gate so that concurrent
    /// producers get a well-defined total order.
    ///
    /// Turning this off skips the gate. Actions are still never lost, but
    /// the relative order of actions dispatched at the same instant from
    /// different threads is unspecified. Only disable it when a single
    /// producer dispatches at a time.
    ///
    /// Default: `true`.
    pub serialize_actions: bool,

    /// Name given to the pipeline thread when using
    /// [`Executor::Dedicated`].
    ///
    /// Default: `"statefold-store"`.
    pub thread_name: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            serialize_actions: true,
            thread_name: DEFAULT_THREAD_NAME.to_owned(),
        }
    }
}

/// The serial execution context the pipeline worker runs on.
///
/// Either way the worker is a single loop, so reducers and middleware
/// hooks never run concurrently for the same store.
#[derive(Debug, Clone, Default)]
pub enum Executor {
    /// A dedicated OS thread owned by the store, running its own
    /// current-thread runtime. Attached action sources are forwarded on
    /// that runtime too.
    #[default]
    Dedicated,

    /// A single task spawned on an existing tokio runtime.
    Runtime(tokio::runtime::Handle),
}

impl Executor {
    /// Run on the runtime the caller is currently inside.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn current() -> Self {
        Executor::Runtime(tokio::runtime::Handle::current())
    }
}

/// A single-process, single-state container.
///
/// The store owns exactly one current state. The only way to change it is
/// to [`dispatch`](Store::dispatch) an action: the pipeline worker folds
/// each admitted action through the middleware before-hooks, the reducer,
/// the override reducer, and the after-hooks, then broadcasts the new
/// state to every subscriber.
///
/// The produced states always equal the reducer folded over the actions in
/// admission order, starting from the initial state.
///
/// Dropping the store stops the worker; subscribers then see end-of-stream.
/// Share a store between tasks or threads by wrapping it in an `Arc`.
///
/// # Examples
///
/// ```
/// use statefold::Store;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let store = Store::new(0i64, |count: i64, by: &i64| count + by)?;
/// let mut states = store.states();
///
/// store.dispatch(2)?;
/// store.dispatch(10)?;
///
/// assert_eq!(states.recv().await, Some(Ok(0)));
/// assert_eq!(states.recv().await, Some(Ok(2)));
/// assert_eq!(states.recv().await, Some(Ok(12)));
/// # Ok(())
/// # }
/// ```
pub struct Store<S, A> {
    ingress: Arc<Ingress<S, A>>,
    cast: Arc<ReplayCast<S>>,
    /// Runtime attached action sources are forwarded on.
    runtime: tokio::runtime::Handle,
}

// Manual `Debug` because neither states nor actions are required to be `Debug`.
impl<S, A> std::fmt::Debug for Store<S, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("serialize_actions", &self.ingress.is_serialized())
            .field("running", &!self.ingress.is_closed())
            .finish_non_exhaustive()
    }
}

impl<S, A> Store<S, A>
where
    S: Clone + PartialEq + Send + Sync + 'static,
    A: Send + 'static,
{
    /// Build a store with default configuration.
    ///
    /// Equivalent to `StoreBuilder::new(initial_state, reducer).build()`.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Spawn`] if the dedicated worker thread cannot
    /// be started.
    pub fn new(initial_state: S, reducer: impl Reducer<S, A>) -> Result<Self, BuildError> {
        StoreBuilder::new(initial_state, reducer).build()
    }

    /// Create a builder for a store with custom configuration.
    pub fn builder(initial_state: S, reducer: impl Reducer<S, A>) -> StoreBuilder<S, A> {
        StoreBuilder::new(initial_state, reducer)
    }

    /// Admit one action into the pipeline.
    ///
    /// Never waits for the reduction or for subscribers. With
    /// [`serialize_actions`](StoreConfig::serialize_actions) on it may
    /// briefly wait on the ingestion gate.
    ///
    /// # Errors
    ///
    /// * The terminal error if the store was poisoned by a panicking
    ///   reducer or middleware.
    /// * [`StoreError::Closed`] if the store was shut down.
    pub fn dispatch(&self, action: A) -> Result<(), StoreError> {
        self.ingress.admit(action)
    }

    /// Attach an asynchronous, possibly infinite, source of actions.
    ///
    /// The source is polled on the store's executor: its own runtime for
    /// [`Executor::Dedicated`], which has timers and I/O enabled, or the
    /// supplied runtime for [`Executor::Runtime`].
    ///
    /// Every item the source yields is dispatched as if by
    /// [`dispatch`](Store::dispatch). The returned handle detaches the
    /// source when cancelled. If the store has already stopped, the source
    /// is not polled and the handle is born finished.
    pub fn dispatch_stream<St>(&self, source: St) -> DispatchHandle
    where
        St: Stream<Item = A> + Send + 'static,
    {
        if self.ingress.is_closed() || self.cast.is_terminated() {
            return DispatchHandle::detached();
        }
        attach(self.ingress.clone(), source, &self.runtime)
    }

    /// Attach several sources at once, one independent handle per source.
    ///
    /// Cancelling one handle has no effect on the others.
    pub fn dispatch_streams<I, St>(&self, sources: I) -> Vec<DispatchHandle>
    where
        I: IntoIterator<Item = St>,
        St: Stream<Item = A> + Send + 'static,
    {
        sources
            .into_iter()
            .map(|source| self.dispatch_stream(source))
            .collect()
    }

    /// Subscribe to states with consecutive duplicates suppressed.
    ///
    /// The first item is the current state.
    pub fn states(&self) -> StateStream<S> {
        self.cast.subscribe(true)
    }

    /// Subscribe to every state the pipeline emits, repeats included.
    ///
    /// The first item is the current state; after that exactly one item
    /// arrives per reduced action.
    pub fn indistinct_states(&self) -> StateStream<S> {
        self.cast.subscribe(false)
    }

    /// The most recently emitted state, without waiting on the worker.
    pub fn latest(&self) -> S {
        self.cast.latest()
    }

    /// Ask the worker for the current state.
    ///
    /// The request is queued behind every action this caller dispatched
    /// before it, so the result reflects all of them.
    ///
    /// # Errors
    ///
    /// The terminal error if the store was poisoned, or
    /// [`StoreError::Closed`] after shutdown.
    pub async fn state(&self) -> Result<S, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.ingress.send(PipelineMessage::GetState { reply: tx })?;
        rx.await.map_err(|_| self.ingress.terminal())
    }

    /// Install a hook applied to every reduced state before after-hooks
    /// run and before it is published. Replaces any previous override.
    ///
    /// Takes effect from the next admitted action.
    ///
    /// # Errors
    ///
    /// Returns the terminal error if the store has stopped.
    pub fn set_override_reducer(&self, hook: impl Reducer<S, A>) -> Result<(), StoreError> {
        self.ingress
            .send(PipelineMessage::SetOverride(Some(Box::new(hook))))
    }

    /// Restore the identity override.
    ///
    /// # Errors
    ///
    /// Returns the terminal error if the store has stopped.
    pub fn clear_override_reducer(&self) -> Result<(), StoreError> {
        self.ingress.send(PipelineMessage::SetOverride(None))
    }

    /// Append a middleware. Takes effect from the next admitted action.
    ///
    /// Keep a clone of the `Arc` to remove it later: removal goes by
    /// identity, not by value.
    ///
    /// # Errors
    ///
    /// Returns the terminal error if the store has stopped.
    pub fn add_middleware(&self, middleware: Arc<dyn Middleware<S, A>>) -> Result<(), StoreError> {
        self.ingress
            .send(PipelineMessage::AddMiddleware(middleware))
    }

    /// Remove the first registration of `middleware`, by identity.
    ///
    /// Takes effect from the next admitted action. Returns whether a
    /// registration was actually removed.
    ///
    /// # Errors
    ///
    /// Returns the terminal error if the store has stopped.
    pub async fn remove_middleware(
        &self,
        middleware: &Arc<dyn Middleware<S, A>>,
    ) -> Result<bool, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.ingress.send(PipelineMessage::RemoveMiddleware {
            middleware: middleware.clone(),
            reply: tx,
        })?;
        rx.await.map_err(|_| self.ingress.terminal())
    }

    /// Returns `true` while the worker accepts actions.
    pub fn is_running(&self) -> bool {
        !self.ingress.is_closed() && !self.cast.is_terminated()
    }

    /// Returns `true` if a reducer or middleware fault stopped the store.
    pub fn is_poisoned(&self) -> bool {
        matches!(self.cast.terminal_error(), Some(err) if err != StoreError::Closed)
    }

    /// Stop the worker after it finishes the actions already queued.
    ///
    /// Subscribers see end-of-stream once the queue drains. Calling
    /// `shutdown` more than once is harmless.
    pub fn shutdown(&self) {
        self.ingress.request_shutdown();
    }
}

impl<S, A> Drop for Store<S, A> {
    fn drop(&mut self) {
        self.ingress.request_shutdown();
    }
}

/// Builder for configuring and starting a [`Store`].
///
/// # Examples
///
/// ```
/// use statefold::{Executor, StoreBuilder};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let store = StoreBuilder::new(String::new(), |s: String, c: &char| format!("{s}{c}"))
///     .executor(Executor::current())
///     .serialize_actions(true)
///     .build()?;
///
/// store.dispatch('h')?;
/// store.dispatch('i')?;
/// assert_eq!(store.state().await?, "hi");
/// # Ok(())
/// # }
/// ```
pub struct StoreBuilder<S, A> {
    initial_state: S,
    reducer: Box<dyn Reducer<S, A>>,
    override_reducer: Option<Box<dyn Reducer<S, A>>>,
    middlewares: Vec<Arc<dyn Middleware<S, A>>>,
    executor: Executor,
    config: StoreConfig,
}

impl<S, A> StoreBuilder<S, A>
where
    S: Clone + PartialEq + Send + Sync + 'static,
    A: Send + 'static,
{
    /// Create a builder from the two required parameters.
    pub fn new(initial_state: S, reducer: impl Reducer<S, A>) -> Self {
        Self {
            initial_state,
            reducer: Box::new(reducer),
            override_reducer: None,
            middlewares: Vec::new(),
            executor: Executor::default(),
            config: StoreConfig::default(),
        }
    }

    /// Set the execution context for the pipeline.
    ///
    /// If not called, [`Executor::Dedicated`] is used.
    pub fn executor(mut self, executor: Executor) -> Self {
        self.executor = executor;
        self
    }

    /// Enable or disable the ingestion gate.
    ///
    /// See [`StoreConfig::serialize_actions`].
    pub fn serialize_actions(mut self, enabled: bool) -> Self {
        self.config.serialize_actions = enabled;
        self
    }

    /// Name the dedicated pipeline thread.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.thread_name = name.into();
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a middleware that is in place before the first action.
    pub fn middleware(mut self, middleware: Arc<dyn Middleware<S, A>>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Install an override reducer before the first action.
    pub fn override_reducer(mut self, hook: impl Reducer<S, A>) -> Self {
        self.override_reducer = Some(Box::new(hook));
        self
    }

    /// Start the pipeline worker and return the store.
    ///
    /// The initial state is published immediately, so a subscriber that
    /// attaches right after `build` returns receives it first.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Spawn`] if the dedicated runtime or thread
    /// cannot be created.
    pub fn build(self) -> Result<Store<S, A>, BuildError> {
        let cast = Arc::new(ReplayCast::new(self.initial_state.clone()));

        let mut registry = MiddlewareRegistry::new();
        for middleware in self.middlewares {
            registry.add(middleware);
        }
        let pipeline = Pipeline::new(
            self.initial_state,
            self.reducer,
            self.override_reducer,
            registry,
            cast.clone(),
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let runtime = match self.executor {
            Executor::Dedicated => {
                // The worker gets its own runtime so the store works from
                // synchronous code and from any kind of parent runtime.
                // Attached sources are polled here too and may use timers or
                // I/O.
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()?;
                let handle = rt.handle().clone();
                std::thread::Builder::new()
                    .name(self.config.thread_name.clone())
                    .spawn(move || rt.block_on(run_pipeline(pipeline, rx)))?;
                handle
            }
            Executor::Runtime(handle) => {
                handle.spawn(run_pipeline(pipeline, rx));
                handle
            }
        };

        tracing::debug!(
            serialize_actions = self.config.serialize_actions,
            "store started"
        );

        Ok(Store {
            ingress: Arc::new(Ingress::new(tx, self.config.serialize_actions, cast.clone())),
            cast,
            runtime,
        })
    }
}
