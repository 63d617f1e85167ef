//! Breakwater: distributed circuit breaker coordinated through a shared log
//!
//! # Overview
//!
//! A circuit breaker protects callers from a fragile downstream dependency
//! by observing call outcomes and short-circuiting new calls once a failure
//! pattern emerges. Breakwater makes that decision *distributed*: every
//! cooperating process records outcomes on a shared append-only log, a
//! single elected leader evaluates the failure strategy and writes state
//! transitions, and every process tails the state log so the whole fleet
//! blocks and recovers together. Recovery is probed out-of-band by the
//! leader, never with live traffic.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐ execute() ┌──────────────────────────────────────┐
//! │ Application │──────────►│ CircuitBreaker (orchestrator)        │
//! └─────────────┘           │  ├─ CallResultStore   (log tail)     │
//!                           │  ├─ StateStore        (log tail)     │
//!                           │  ├─ LeaderElector     (mutex)        │
//!                           │  └─ HealthCheckScheduler (probes)    │
//!                           └───────────────┬──────────────────────┘
//!                                           │
//!                                           ▼
//!                           ┌──────────────────────────────────────┐
//!                           │ Coordination store                   │
//!                           │  <prefix>:<id>:call-result  (log)    │
//!                           │  <prefix>:<id>:state        (log)    │
//!                           │  <prefix>:<id>:leader       (mutex)  │
//!                           └──────────────────────────────────────┘
//! ```
//!
//! Any store offering an ordered append-only log with blocking tails and a
//! distributed mutex with lock-lost notification can back a circuit; see
//! [`store::CoordinationStore`]. [`store::MemoryStore`] ships in the crate
//! for tests and single-process use.
//!
//! # Usage
//!
//! ```no_run
//! use breakwater::{
//!     check_fn, BreakerConfig, CircuitBreaker, ConsecutiveFailures, ExponentialBackoff,
//!     HealthConfig, MemoryStore,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(MemoryStore::new());
//!     let health = HealthConfig::new(
//!         Arc::new(ExponentialBackoff::default()),
//!         check_fn(|_kind, _cancel| async {
//!             // Ping the dependency out-of-band.
//!             Ok(())
//!         }),
//!     );
//!     let breaker = CircuitBreaker::new(
//!         store,
//!         BreakerConfig::new("payments", Arc::new(ConsecutiveFailures::new(5)), health),
//!     );
//!     breaker.start().await?;
//!
//!     let reply: Result<&str, _> = breaker.execute(|| async { Ok::<_, String>("ok") }).await;
//!     println!("{reply:?}");
//!
//!     breaker.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Guarantees and non-goals
//!
//! - At most one leader per circuit, assuming the store's mutex honours
//!   single-writer semantics; only the leader writes state transitions.
//! - Outcomes recorded before the latest transition never reopen a freshly
//!   recovered circuit.
//! - Background failures (log reads/writes, election, probes) are retried
//!   and reported; they never fail `execute` and never transition state.
//! - No automatic retries of guarded calls, no half-open probing with live
//!   traffic, no quorum replication, no exactly-once transition delivery.

pub mod backoff;
pub mod breaker;
pub mod call_results;
pub mod config;
pub mod delay;
pub mod elector;
pub mod error;
pub mod lifecycle;
pub mod metrics;
mod reader;
pub mod scheduler;
pub mod state_store;
pub mod store;
pub mod strategy;
pub mod types;

// Re-export the main surface for convenience
pub use backoff::{Backoff, ConstantBackoff, ExponentialBackoff};
pub use breaker::CircuitBreaker;
pub use config::{check_fn, BreakerConfig, HealthCheck, HealthConfig, Tuning};
pub use error::{Error, ErrorSink, ExecuteError, Result};
pub use lifecycle::{LifecycleError, PhaseKind};
pub use metrics::{CallMetric, MetricsSink, NoopMetrics, ProbeMetric};
pub use store::MemoryStore;
pub use strategy::{ConsecutiveFailures, FailureCount, FailureStrategy, FailureWindow};
pub use types::{CallOutcome, CallResultEvent, CircuitState, ProbeKind, Role, StateEvent};

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use breakwater::prelude::*;
/// ```
pub mod prelude {
    pub use super::backoff::{Backoff, ConstantBackoff, ExponentialBackoff};
    pub use super::breaker::CircuitBreaker;
    pub use super::config::{check_fn, BreakerConfig, HealthCheck, HealthConfig, Tuning};
    pub use super::error::{Error, ExecuteError, Result};
    pub use super::metrics::{MetricsSink, NoopMetrics};
    pub use super::store::{CoordinationStore, MemoryStore};
    pub use super::strategy::{
        ConsecutiveFailures, FailureCount, FailureStrategy, FailureWindow,
    };
    pub use super::types::{CallOutcome, CircuitState, ProbeKind, Role};
}
