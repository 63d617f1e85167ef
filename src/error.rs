//! Error types
//!
//! `execute` surfaces exactly one library error, [`ExecuteError::CircuitOpen`];
//! everything the guarded function returns passes through unchanged as
//! [`ExecuteError::Inner`]. Background failures (log reads and writes,
//! election, probes) never reach `execute` — they are delivered to the
//! configured error sink and the affected loop retries.

use std::fmt;
use std::sync::Arc;

use crate::lifecycle::LifecycleError;
use crate::store::{LogPosition, StoreError};

/// Result type alias for library operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced inside the library.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transient coordination-store failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Lifecycle violation (wrong phase, conflicting config, unrecoverable
    /// instance)
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// A health probe reported failure
    #[error("health probe failed: {0}")]
    Probe(String),

    /// A replicated log entry could not be decoded; the entry is skipped
    #[error("malformed log entry at {position}: {reason}")]
    MalformedEntry {
        position: LogPosition,
        reason: &'static str,
    },
}

/// Error returned by [`CircuitBreaker::execute`](crate::CircuitBreaker::execute).
///
/// Generic over the guarded function's own error type so that callers match
/// on `CircuitOpen` structurally and recover their error otherwise.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ExecuteError<E> {
    /// The circuit is blocking; the guarded function was not invoked.
    #[error("circuit '{id}' is open")]
    CircuitOpen { id: String },

    /// The guarded function ran and failed; its error is unchanged.
    #[error("guarded call failed: {0}")]
    Inner(E),
}

impl<E> ExecuteError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ExecuteError::CircuitOpen { .. })
    }

    /// Recover the guarded function's error, if any.
    pub fn into_inner(self) -> Option<E> {
        match self {
            ExecuteError::Inner(e) => Some(e),
            ExecuteError::CircuitOpen { .. } => None,
        }
    }
}

/// Destination for background errors.
///
/// Wraps the caller's `on_error` callback; without one, errors are logged
/// and the loops carry on.
#[derive(Clone)]
pub struct ErrorSink {
    callback: Option<Arc<dyn Fn(Error) + Send + Sync>>,
}

impl ErrorSink {
    pub fn new(callback: Option<Arc<dyn Fn(Error) + Send + Sync>>) -> Self {
        Self { callback }
    }

    pub fn report(&self, error: Error) {
        match self.callback.as_deref() {
            Some(callback) => callback(error),
            None => tracing::error!(error = %error, "background error"),
        }
    }
}

impl fmt::Debug for ErrorSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorSink")
            .field("custom", &self.callback.is_some())
            .finish()
    }
}
