//! A single-store state container built on a serial reduction pipeline.
//!
//! Actions enter a [`Store`] through [`Store::dispatch`] or attached action
//! sources, are folded one at a time through middleware hooks and a
//! [`Reducer`], and every resulting state is broadcast to live
//! [`StateStream`] subscribers.

mod actor;
mod dispatch;
mod error;
mod middleware;
mod multicast;
mod reducer;
mod store;

pub use dispatch::DispatchHandle;
pub use error::{BuildError, Hook, StoreError};
pub use middleware::{Middleware, TracingMiddleware};
pub use multicast::StateStream;
pub use reducer::{CompositeReducer, NoOpReducer, Reducer};
pub use store::{Executor, Store, StoreBuilder, StoreConfig};
