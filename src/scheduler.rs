//! Health-check scheduler
//!
//! One probe loop per orchestrator instance, parameterised at start time by
//! a probe kind and a per-attempt delay function. The loop sleeps first
//! (the first probe is intentionally delayed, never immediate), then runs
//! the supplied check; it never interprets the check's outcome. `restart`
//! fully stops the previous loop before the new one takes its first sleep,
//! so probes of two kinds cannot overlap and `attempt` resets to 1.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::delay::{delay, TaskHandle};
use crate::lifecycle::{Lifecycle, LifecycleError};
use crate::types::ProbeKind;

/// Delay function: attempt number (1-based) to sleep duration.
pub type DelayFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// The probe body supplied by the orchestrator. Receives the probe kind
/// and a token that fires when the loop is stopped or restarted.
pub type ProbeRunner =
    Arc<dyn Fn(ProbeKind, CancellationToken) -> BoxFuture<'static, ()> + Send + Sync>;

/// Start config for one probing campaign.
#[derive(Clone)]
pub struct ProbeSchedule {
    pub kind: ProbeKind,
    pub delay_fn: DelayFn,
}

impl ProbeSchedule {
    pub fn new(kind: ProbeKind, delay_fn: DelayFn) -> Self {
        Self { kind, delay_fn }
    }
}

// Delay functions are opaque; two schedules of the same kind are the same
// campaign for lifecycle idempotence purposes.
impl PartialEq for ProbeSchedule {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

impl fmt::Debug for ProbeSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeSchedule")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

pub struct HealthCheckScheduler {
    lifecycle: Lifecycle<ProbeSchedule>,
    run_check: ProbeRunner,
    task: Mutex<Option<TaskHandle>>,
}

impl HealthCheckScheduler {
    pub fn new(run_check: ProbeRunner) -> Self {
        Self {
            lifecycle: Lifecycle::new("health-check scheduler"),
            run_check,
            task: Mutex::new(None),
        }
    }

    pub async fn start(&self, schedule: ProbeSchedule) -> Result<(), LifecycleError> {
        self.lifecycle
            .start(schedule, |cfg| self.start_internal(cfg))
            .await
    }

    pub async fn stop(&self) -> Result<(), LifecycleError> {
        self.lifecycle.stop(|| self.stop_internal()).await
    }

    /// Stop the current campaign (if any) and begin a fresh one.
    pub async fn restart(&self, schedule: ProbeSchedule) -> Result<(), LifecycleError> {
        self.lifecycle
            .restart(
                schedule,
                |cfg| self.start_internal(cfg),
                || self.stop_internal(),
            )
            .await
    }

    pub fn is_operational(&self) -> bool {
        self.lifecycle.is_operational()
    }

    /// Kind of the campaign currently running, if any.
    pub fn current_kind(&self) -> Option<ProbeKind> {
        self.lifecycle.operational_config().map(|cfg| cfg.kind)
    }

    async fn start_internal(&self, schedule: ProbeSchedule) -> crate::Result<()> {
        let token = CancellationToken::new();
        let task_token = token.clone();
        let run_check = Arc::clone(&self.run_check);
        let handle = tokio::spawn(async move {
            let mut attempt: u32 = 1;
            loop {
                let pause = (*schedule.delay_fn)(attempt);
                if !delay(pause, &task_token).await {
                    break;
                }
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    () = (*run_check)(schedule.kind, task_token.child_token()) => {}
                }
                attempt += 1;
            }
            debug!(kind = ?schedule.kind, "probe loop stopped");
        });
        *self.task.lock().expect("scheduler task poisoned") = Some(TaskHandle::new(token, handle));
        Ok(())
    }

    async fn stop_internal(&self) -> crate::Result<()> {
        let task = self.task.lock().expect("scheduler task poisoned").take();
        if let Some(task) = task {
            task.shutdown().await;
        }
        Ok(())
    }
}
