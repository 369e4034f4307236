//! Crate-level error types for building a store and driving its pipeline.

/// Which middleware hook was running when a fault occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    /// [`Middleware::before_reduce`](crate::Middleware::before_reduce).
    BeforeReduce,
    /// [`Middleware::after_reduce`](crate::Middleware::after_reduce).
    AfterReduce,
}

impl std::fmt::Display for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Hook::BeforeReduce => f.write_str("before_reduce"),
            Hook::AfterReduce => f.write_str("after_reduce"),
        }
    }
}

/// Error surfaced by a running [`Store`](crate::Store).
///
/// The pipeline is shared by every subscriber, so a fault cannot be
/// isolated to one of them. The terminal error is therefore `Clone` and
/// delivered to every current and future subscriber of a poisoned store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The reducer (or the override reducer) panicked.
    ///
    /// The store is poisoned and will not produce further states.
    #[error("reducer panicked while processing action #{ticket}: {message}")]
    ReducerPanicked {
        /// Admission ticket of the action being reduced.
        ticket: u64,
        /// Panic payload rendered as text.
        message: String,
    },

    /// A middleware hook panicked.
    ///
    /// Middlewares registered after the failing one were not invoked for
    /// this action. The store is poisoned.
    #[error("middleware `{middleware}` panicked in {hook} for action #{ticket}: {message}")]
    MiddlewarePanicked {
        /// Admission ticket of the action being reduced.
        ticket: u64,
        /// [`Middleware::name`](crate::Middleware::name) of the failing middleware.
        middleware: String,
        /// The hook that panicked.
        hook: Hook,
        /// Panic payload rendered as text.
        message: String,
    },

    /// The pipeline worker has stopped.
    ///
    /// Returned after [`Store::shutdown`](crate::Store::shutdown), or when
    /// the executor the worker ran on was shut down.
    #[error("store pipeline is no longer running")]
    Closed,
}

/// Error returned when a [`Store`](crate::Store) cannot be started.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// The dedicated worker thread or its runtime could not be created.
    #[error("failed to start store worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Render a panic payload caught by `catch_unwind` as text.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reducer_panicked_display() {
        let err = StoreError::ReducerPanicked {
            ticket: 3,
            message: "boom".into(),
        };
        assert_eq!(
            err.to_string(),
            "reducer panicked while processing action #3: boom"
        );
    }

    #[test]
    fn middleware_panicked_display_names_hook() {
        let err = StoreError::MiddlewarePanicked {
            ticket: 7,
            middleware: "audit".into(),
            hook: Hook::AfterReduce,
            message: "disk full".into(),
        };
        assert_eq!(
            err.to_string(),
            "middleware `audit` panicked in after_reduce for action #7: disk full"
        );
    }

    #[test]
    fn closed_display() {
        assert_eq!(
            StoreError::Closed.to_string(),
            "store pipeline is no longer running"
        );
    }

    #[test]
    fn build_error_from_io() {
        let io_err = std::io::Error::other("no threads left");
        let err = BuildError::from(io_err);
        assert!(err.to_string().contains("no threads left"));
    }

    #[test]
    fn panic_message_handles_str_and_string() {
        let payload = std::panic::catch_unwind(|| panic!("static message")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static message");

        let payload = std::panic::catch_unwind(|| panic!("formatted {}", 42)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "formatted 42");
    }

    // Errors cross from the worker thread to subscribers on arbitrary threads.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<StoreError>();
            assert_send_sync::<BuildError>();
        }
    };
}
