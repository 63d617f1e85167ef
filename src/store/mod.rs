//! Coordination-store abstraction
//!
//! The library needs exactly two primitives from its backing store: an
//! ordered append-only log with blocking tail reads and MAXLEN trimming,
//! and a distributed mutex with automatic renewal and lock-lost
//! notification. This module defines those contracts; `MemoryStore` is the
//! bundled in-process implementation.
//!
//! # Examples
//!
//! ```no_run
//! use breakwater::store::{CoordinationStore, MemoryStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
//!     let pos = store
//!         .append("demo:log", vec![("k".into(), "v".into())], None)
//!         .await?;
//!     println!("appended at {pos}");
//!     Ok(())
//! }
//! ```

mod memory;

pub use memory::MemoryStore;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Result type alias for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Opaque position of an entry within one log.
///
/// Positions are strings totally ordered lexicographically; implementations
/// must pad or otherwise encode them so that string order equals append
/// order within a log.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogPosition(String);

impl LogPosition {
    /// The position that precedes every real entry.
    pub fn zero() -> Self {
        Self("0".to_string())
    }

    pub fn new(position: impl Into<String>) -> Self {
        Self(position.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One log entry: a position plus ordered field/value pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: LogPosition,
    pub fields: Vec<(String, String)>,
}

impl LogEntry {
    /// Look up a field value by name.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Errors raised by a coordination-store client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Could not establish or re-establish a connection
    #[error("store connection failed: {0}")]
    Connection(String),

    /// Transport-level failure on an established connection
    #[error("store transport error: {0}")]
    Transport(String),

    /// The operation did not complete within its deadline
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    /// The connection was closed, typically during shutdown
    #[error("store connection closed")]
    Closed,
}

impl StoreError {
    /// Whether the affected loop should back off and retry.
    pub fn is_retriable(&self) -> bool {
        match self {
            StoreError::Connection(_) | StoreError::Transport(_) | StoreError::Timeout(_) => true,
            StoreError::Closed => false,
        }
    }
}

/// Client for the coordination store.
///
/// Implementations must preserve insertion order per log key and must make
/// `append` atomic with respect to concurrent appenders. `tail` performs a
/// blocking read bounded by `block`; an empty batch after the block elapses
/// is not an error.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Append an entry, optionally trimming the log to roughly `maxlen_hint`
    /// entries.
    async fn append(
        &self,
        key: &str,
        fields: Vec<(String, String)>,
        maxlen_hint: Option<u64>,
    ) -> StoreResult<LogPosition>;

    /// Read entries between two positions (inclusive bounds, `None` for the
    /// log edge), oldest first, capped at `count` when given.
    async fn read_range(
        &self,
        key: &str,
        from: Option<&LogPosition>,
        to: Option<&LogPosition>,
        count: Option<usize>,
    ) -> StoreResult<Vec<LogEntry>>;

    /// Read up to `count` of the newest entries, newest first.
    async fn read_last(&self, key: &str, count: usize) -> StoreResult<Vec<LogEntry>>;

    /// Blocking tail: entries strictly after `after`, waiting up to `block`
    /// for at least one to arrive. Returns an empty batch on timeout.
    async fn tail(
        &self,
        key: &str,
        after: &LogPosition,
        block: Duration,
    ) -> StoreResult<Vec<LogEntry>>;

    /// Obtain a connection suitable for blocking tail reads, so those reads
    /// cannot starve the shared connection's RPCs.
    async fn dedicated(&self) -> StoreResult<Arc<dyn CoordinationStore>>;

    /// Create a handle on the distributed mutex stored under `key`.
    fn mutex(&self, key: &str) -> Arc<dyn DistributedMutex>;
}

/// Handle on one distributed mutex.
///
/// Renewal while held is the implementation's responsibility; the holder
/// learns about expiry or partition through [`DistributedMutex::lost`].
#[async_trait]
pub trait DistributedMutex: Send + Sync {
    /// Non-blocking acquisition attempt. Re-acquiring a mutex this handle
    /// already holds succeeds.
    async fn try_acquire(&self) -> StoreResult<bool>;

    /// Release the mutex if this handle holds it.
    async fn release(&self) -> StoreResult<()>;

    /// Resolves when a lock held by this handle is lost (expiry, network
    /// partition). Pends forever while the lock is not held.
    async fn lost(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_order_lexicographically() {
        let a = LogPosition::new("0000000000000001");
        let b = LogPosition::new("0000000000000002");
        assert!(a < b);
        assert!(LogPosition::zero() < a);
    }

    #[test]
    fn entry_field_lookup() {
        let entry = LogEntry {
            id: LogPosition::new("1"),
            fields: vec![
                ("state".to_string(), "open".to_string()),
                ("timestamp".to_string(), "42".to_string()),
            ],
        };
        assert_eq!(entry.field("state"), Some("open"));
        assert_eq!(entry.field("timestamp"), Some("42"));
        assert_eq!(entry.field("missing"), None);
    }

    #[test]
    fn error_classification() {
        assert!(StoreError::Transport("reset".into()).is_retriable());
        assert!(StoreError::Timeout(Duration::from_secs(1)).is_retriable());
        assert!(!StoreError::Closed.is_retriable());
    }
}
