//! Metrics sink contract
//!
//! The orchestrator reports every guarded call, every blocked request and
//! every health probe through a [`MetricsSink`]. All methods have empty
//! default bodies so a sink implements only what it cares about;
//! [`NoopMetrics`] is the default when no sink is configured.

use std::time::Duration;

use crate::types::{CallOutcome, ProbeKind};

/// One completed guarded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallMetric<'a> {
    pub circuit_id: &'a str,
    pub outcome: CallOutcome,
    pub duration: Duration,
}

/// One completed health probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeMetric<'a> {
    pub circuit_id: &'a str,
    pub kind: ProbeKind,
    pub outcome: CallOutcome,
    pub duration: Duration,
}

/// Receiver for breaker telemetry. Called synchronously from hot paths;
/// implementations should hand off expensive work.
pub trait MetricsSink: Send + Sync {
    /// Called once when the breaker is constructed.
    fn initialize(&self, _circuit_id: &str) {}

    fn record_call(&self, _call: &CallMetric<'_>) {}

    /// A call was short-circuited by a blocking circuit.
    fn record_blocked_request(&self, _circuit_id: &str) {}

    fn record_health_check(&self, _probe: &ProbeMetric<'_>) {}
}

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}
