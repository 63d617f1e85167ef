//! Failure-detection strategies
//!
//! A strategy is a pure function from the window of recent call outcomes
//! to a single decision: should the circuit transition to Blocking. The
//! orchestrator filters the window to post-recovery events before asking,
//! so strategies never need to reason about state transitions themselves.

use std::time::Duration;

use crate::types::{now_millis, CallOutcome, CallResultEvent};

/// Decides when a window of outcomes warrants opening the circuit.
pub trait FailureStrategy: Send + Sync {
    /// `window` is oldest-first and already filtered to relevant events.
    fn should_open(&self, window: &[CallResultEvent]) -> bool;
}

/// Open after `threshold` consecutive failures at the newest edge of the
/// window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsecutiveFailures {
    threshold: usize,
}

impl ConsecutiveFailures {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
        }
    }
}

impl FailureStrategy for ConsecutiveFailures {
    fn should_open(&self, window: &[CallResultEvent]) -> bool {
        if window.len() < self.threshold {
            return false;
        }
        window
            .iter()
            .rev()
            .take(self.threshold)
            .all(|e| e.outcome == CallOutcome::Failure)
    }
}

/// Open when at least `threshold` of the newest `sample` events failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureCount {
    threshold: usize,
    sample: usize,
}

impl FailureCount {
    pub fn new(threshold: usize, sample: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            sample: sample.max(1),
        }
    }
}

impl FailureStrategy for FailureCount {
    fn should_open(&self, window: &[CallResultEvent]) -> bool {
        window
            .iter()
            .rev()
            .take(self.sample)
            .filter(|e| e.outcome == CallOutcome::Failure)
            .count()
            >= self.threshold
    }
}

/// Open when at least `threshold` failures fall inside the trailing time
/// window. Relies on appender wall clocks being reasonably synchronised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureWindow {
    threshold: usize,
    window: Duration,
}

impl FailureWindow {
    pub fn new(threshold: usize, window: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            window,
        }
    }
}

impl FailureStrategy for FailureWindow {
    fn should_open(&self, window: &[CallResultEvent]) -> bool {
        let cutoff = now_millis() - self.window.as_millis() as i64;
        window
            .iter()
            .filter(|e| e.outcome == CallOutcome::Failure && e.timestamp_ms >= cutoff)
            .count()
            >= self.threshold
    }
}
