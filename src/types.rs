//! Domain value types and their on-the-wire encodings
//!
//! The string encodings are fixed by the log format so that peers written
//! in other languages can share a circuit: outcomes travel as
//! `success`/`failure`, circuit states as `closed`/`open`.

use serde::{Deserialize, Serialize};

use crate::store::{LogEntry, LogPosition};

/// Field name carrying the outcome on the call-result log.
pub(crate) const FIELD_CALL_RESULT: &str = "callResult";
/// Field name carrying the circuit state on the state log.
pub(crate) const FIELD_STATE: &str = "state";
/// Field name carrying the appender's wall clock, in milliseconds.
pub(crate) const FIELD_TIMESTAMP: &str = "timestamp";

/// Outcome of one guarded call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallOutcome {
    Success,
    Failure,
}

impl CallOutcome {
    pub fn as_wire(self) -> &'static str {
        match self {
            CallOutcome::Success => "success",
            CallOutcome::Failure => "failure",
        }
    }

    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "success" => Some(CallOutcome::Success),
            "failure" => Some(CallOutcome::Failure),
            _ => None,
        }
    }
}

/// Whether the circuit lets calls through or short-circuits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Calls run and their outcomes are observed.
    Passing,
    /// New calls fail immediately with [`crate::ExecuteError::CircuitOpen`].
    Blocking,
}

impl CircuitState {
    /// Wire values follow the classic open/closed breaker vocabulary:
    /// a passing circuit is `closed`, a blocking one is `open`.
    pub fn as_wire(self) -> &'static str {
        match self {
            CircuitState::Passing => "closed",
            CircuitState::Blocking => "open",
        }
    }

    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "closed" => Some(CircuitState::Passing),
            "open" => Some(CircuitState::Blocking),
            _ => None,
        }
    }
}

/// Election role of one orchestrator instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The single process that writes state transitions.
    Leader,
    /// A passive observer of both logs.
    Follower,
}

impl Role {
    pub fn as_wire(self) -> &'static str {
        match self {
            Role::Leader => "leader",
            Role::Follower => "follower",
        }
    }
}

/// Which probing policy a health check runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    /// Probing a blocking circuit for recovery.
    Recovery,
    /// Probing a passing but quiet circuit for silent failure.
    Idle,
}

impl ProbeKind {
    pub fn as_wire(self) -> &'static str {
        match self {
            ProbeKind::Recovery => "recovery",
            ProbeKind::Idle => "idle",
        }
    }
}

/// One replicated call outcome, totally ordered by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResultEvent {
    pub id: LogPosition,
    pub outcome: CallOutcome,
    /// Appender's wall clock, milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
}

impl CallResultEvent {
    pub(crate) fn wire_fields(outcome: CallOutcome, timestamp_ms: i64) -> Vec<(String, String)> {
        vec![
            (FIELD_CALL_RESULT.to_string(), outcome.as_wire().to_string()),
            (FIELD_TIMESTAMP.to_string(), timestamp_ms.to_string()),
        ]
    }

    pub(crate) fn from_entry(entry: &LogEntry) -> Option<Self> {
        let outcome = CallOutcome::from_wire(entry.field(FIELD_CALL_RESULT)?)?;
        let timestamp_ms = entry.field(FIELD_TIMESTAMP)?.parse().ok()?;
        Some(Self {
            id: entry.id.clone(),
            outcome,
            timestamp_ms,
        })
    }
}

/// One replicated state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEvent {
    pub id: LogPosition,
    pub state: CircuitState,
    pub timestamp_ms: i64,
}

impl StateEvent {
    /// The state observed before any transition has ever been written.
    pub(crate) fn initial() -> Self {
        Self {
            id: LogPosition::zero(),
            state: CircuitState::Passing,
            timestamp_ms: 0,
        }
    }

    pub(crate) fn wire_fields(state: CircuitState, timestamp_ms: i64) -> Vec<(String, String)> {
        vec![
            (FIELD_STATE.to_string(), state.as_wire().to_string()),
            (FIELD_TIMESTAMP.to_string(), timestamp_ms.to_string()),
        ]
    }

    pub(crate) fn from_entry(entry: &LogEntry) -> Option<Self> {
        let state = CircuitState::from_wire(entry.field(FIELD_STATE)?)?;
        let timestamp_ms = entry.field(FIELD_TIMESTAMP)?.parse().ok()?;
        Some(Self {
            id: entry.id.clone(),
            state,
            timestamp_ms,
        })
    }
}

/// Current wall clock in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
