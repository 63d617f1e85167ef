//! Circuit breaker orchestrator
//!
//! Wires the four subsystems together: both replicated stores, the leader
//! elector and the health-check scheduler. Every instance runs one policy
//! task that reacts to window updates, observed state transitions, role
//! transitions and probe outcomes; all state-log writes and scheduler
//! restarts happen on that task, and only while this instance leads.
//! Followers are passive observers.
//!
//! `execute` is the public entry point: it short-circuits while the
//! circuit blocks, otherwise measures the guarded call and records its
//! outcome without waiting for the log append.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::call_results::{CallResultConfig, CallResultStore};
use crate::config::{BreakerConfig, HealthCheck};
use crate::delay::TaskHandle;
use crate::elector::{ElectorConfig, LeaderElector};
use crate::error::{ErrorSink, ExecuteError};
use crate::lifecycle::{Lifecycle, LifecycleError};
use crate::metrics::{CallMetric, MetricsSink, NoopMetrics, ProbeMetric};
use crate::scheduler::{DelayFn, HealthCheckScheduler, ProbeRunner, ProbeSchedule};
use crate::state_store::{StateConfig, StateStore};
use crate::store::CoordinationStore;
use crate::strategy::FailureStrategy;
use crate::types::{
    now_millis, CallOutcome, CallResultEvent, CircuitState, ProbeKind, Role, StateEvent,
};

/// Outcome of one probe, reported by the probe body to the policy task.
#[derive(Debug, Clone, Copy)]
struct ProbeOutcome {
    kind: ProbeKind,
    success: bool,
}

/// Distributed circuit breaker around one downstream dependency.
///
/// Instances sharing the same `id` and coordination store form one
/// circuit: any of them can detect the failure pattern (whichever
/// currently leads), and all of them block and recover together.
pub struct CircuitBreaker {
    id: String,
    tuning: crate::config::Tuning,
    call_results: Arc<CallResultStore>,
    state_store: Arc<StateStore>,
    elector: Arc<LeaderElector>,
    scheduler: Arc<HealthCheckScheduler>,
    strategy: Arc<dyn FailureStrategy>,
    backoff: Arc<dyn Backoff>,
    idle_probe_interval: Option<Duration>,
    metrics: Arc<dyn MetricsSink>,
    errors: ErrorSink,
    lifecycle: Lifecycle<()>,
    policy: Mutex<Option<TaskHandle>>,
    /// Replaced with a fresh channel on every start so probe outcomes from
    /// a previous incarnation cannot leak into the next.
    probe_tx: Arc<Mutex<mpsc::UnboundedSender<ProbeOutcome>>>,
}

impl CircuitBreaker {
    /// Build a breaker over `store`. The metrics sink's `initialize` runs
    /// here, once.
    pub fn new(store: Arc<dyn CoordinationStore>, config: BreakerConfig) -> Self {
        let BreakerConfig {
            id,
            strategy,
            health,
            on_error,
            on_role_change,
            on_state_change,
            metrics,
            tuning,
        } = config;

        let metrics = metrics.unwrap_or_else(|| Arc::new(NoopMetrics));
        metrics.initialize(&id);
        let errors = ErrorSink::new(on_error);

        // Placeholder sender; start() installs the live one.
        let probe_tx = Arc::new(Mutex::new(mpsc::unbounded_channel().0));
        let run_check = probe_runner(
            id.clone(),
            Arc::clone(&health.check),
            Arc::clone(&metrics),
            errors.clone(),
            Arc::clone(&probe_tx),
        );

        Self {
            call_results: Arc::new(CallResultStore::new(Arc::clone(&store), errors.clone())),
            state_store: Arc::new(StateStore::new(
                Arc::clone(&store),
                on_state_change,
                errors.clone(),
            )),
            elector: Arc::new(LeaderElector::new(
                Arc::clone(&store),
                on_role_change,
                errors.clone(),
            )),
            scheduler: Arc::new(HealthCheckScheduler::new(run_check)),
            strategy,
            backoff: health.backoff,
            idle_probe_interval: health.idle_probe_interval,
            metrics,
            errors,
            lifecycle: Lifecycle::new("circuit breaker"),
            policy: Mutex::new(None),
            probe_tx,
            id,
            tuning,
        }
    }

    /// Start both stores, the policy task and the elector. Idempotent.
    pub async fn start(&self) -> Result<(), LifecycleError> {
        self.lifecycle.start((), |()| self.start_internal()).await
    }

    /// Stop the policy task, then all four subsystems concurrently.
    /// Idempotent; a no-op before any `start`.
    pub async fn stop(&self) -> Result<(), LifecycleError> {
        self.lifecycle.stop(|| self.stop_internal()).await
    }

    pub fn is_operational(&self) -> bool {
        self.lifecycle.is_operational()
    }

    /// Locally observed circuit state.
    pub fn state(&self) -> CircuitState {
        self.state_store.state()
    }

    /// This instance's election role.
    pub fn role(&self) -> Role {
        self.elector.role()
    }

    pub fn circuit_id(&self) -> &str {
        &self.id
    }

    /// Run `f` under the circuit.
    ///
    /// While the circuit blocks, `f` is never invoked and the call fails
    /// with [`ExecuteError::CircuitOpen`]. Otherwise the call's outcome is
    /// recorded (metrics synchronously, the log append in the background)
    /// and its result passes through unchanged.
    pub async fn execute<T, E, F, Fut>(&self, f: F) -> Result<T, ExecuteError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        if self.state() == CircuitState::Blocking {
            self.metrics.record_blocked_request(&self.id);
            return Err(ExecuteError::CircuitOpen {
                id: self.id.clone(),
            });
        }

        let started = Instant::now();
        let result = f().await;
        let outcome = match &result {
            Ok(_) => CallOutcome::Success,
            Err(_) => CallOutcome::Failure,
        };
        self.metrics.record_call(&CallMetric {
            circuit_id: &self.id,
            outcome,
            duration: started.elapsed(),
        });
        self.call_results.store_call_result(outcome);
        result.map_err(ExecuteError::Inner)
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}:{}", self.tuning.key_prefix, self.id, suffix)
    }

    async fn start_internal(&self) -> crate::Result<()> {
        let t = &self.tuning;
        self.call_results
            .start(CallResultConfig {
                key: self.key("call-result"),
                window_size: t.window_size,
                tail_block: t.tail_block,
                retry_delay: t.reader_retry_delay,
            })
            .await?;
        self.state_store
            .start(StateConfig {
                key: self.key("state"),
                retention: t.state_retention,
                tail_block: t.tail_block,
                retry_delay: t.reader_retry_delay,
            })
            .await?;

        let (tx, rx) = mpsc::unbounded_channel();
        *self.probe_tx.lock().expect("probe sender poisoned") = tx;
        self.spawn_policy(rx);

        let elector_started = self
            .elector
            .start(ElectorConfig {
                key: self.key("leader"),
                acquire_interval: t.acquire_interval,
            })
            .await;
        if let Err(e) = elector_started {
            // Leave nothing running behind an unrecoverable instance.
            if let Some(task) = self.policy.lock().expect("policy slot poisoned").take() {
                task.shutdown().await;
            }
            let _ = tokio::join!(self.call_results.stop(), self.state_store.stop());
            return Err(e.into());
        }
        info!(circuit = %self.id, "circuit breaker started");
        Ok(())
    }

    async fn stop_internal(&self) -> crate::Result<()> {
        let task = self.policy.lock().expect("policy slot poisoned").take();
        if let Some(task) = task {
            task.shutdown().await;
        }
        let (call_results, state, elector, scheduler) = tokio::join!(
            self.call_results.stop(),
            self.state_store.stop(),
            self.elector.stop(),
            self.scheduler.stop(),
        );
        call_results?;
        state?;
        elector?;
        scheduler?;
        info!(circuit = %self.id, "circuit breaker stopped");
        Ok(())
    }

    fn spawn_policy(&self, mut probe_rx: mpsc::UnboundedReceiver<ProbeOutcome>) {
        let ctx = PolicyCtx {
            id: self.id.clone(),
            call_results: Arc::clone(&self.call_results),
            state_store: Arc::clone(&self.state_store),
            elector: Arc::clone(&self.elector),
            scheduler: Arc::clone(&self.scheduler),
            strategy: Arc::clone(&self.strategy),
            backoff: Arc::clone(&self.backoff),
            idle_probe_interval: self.idle_probe_interval,
            errors: self.errors.clone(),
        };
        let mut window_rx = self.call_results.subscribe();
        let mut state_rx = self.state_store.subscribe();
        let mut role_rx = self.elector.subscribe();

        let token = CancellationToken::new();
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    changed = window_rx.changed() => {
                        if changed.is_err() { break; }
                        let window = window_rx.borrow_and_update().clone();
                        ctx.on_window(window).await;
                    }
                    changed = state_rx.changed() => {
                        if changed.is_err() { break; }
                        let event = state_rx.borrow_and_update().clone();
                        ctx.on_state_event(event).await;
                    }
                    changed = role_rx.changed() => {
                        if changed.is_err() { break; }
                        let role = *role_rx.borrow_and_update();
                        ctx.on_role(role).await;
                    }
                    outcome = probe_rx.recv() => {
                        match outcome {
                            Some(outcome) => ctx.on_probe(outcome).await,
                            None => break,
                        }
                    }
                }
            }
            debug!(circuit = %ctx.id, "policy task stopped");
        });
        *self.policy.lock().expect("policy slot poisoned") = Some(TaskHandle::new(token, handle));
    }
}

/// Everything the policy task needs; holds no reference back to the
/// breaker.
struct PolicyCtx {
    id: String,
    call_results: Arc<CallResultStore>,
    state_store: Arc<StateStore>,
    elector: Arc<LeaderElector>,
    scheduler: Arc<HealthCheckScheduler>,
    strategy: Arc<dyn FailureStrategy>,
    backoff: Arc<dyn Backoff>,
    idle_probe_interval: Option<Duration>,
    errors: ErrorSink,
}

impl PolicyCtx {
    /// New call-result batch arrived. Leader-only: evaluate the strategy
    /// over post-transition events and open the circuit when it demands.
    async fn on_window(&self, window: Vec<CallResultEvent>) {
        if !self.elector.is_leader() {
            return;
        }
        if self.state_store.state() == CircuitState::Blocking {
            return;
        }
        // Outcomes recorded before the last transition must not reopen a
        // freshly recovered circuit.
        let cutoff = self.state_store.last_change_timestamp();
        let relevant: Vec<CallResultEvent> = window
            .into_iter()
            .filter(|e| e.timestamp_ms >= cutoff)
            .collect();
        if self.strategy.should_open(&relevant) {
            info!(circuit = %self.id, "failure threshold crossed; opening circuit");
            if let Err(e) = self.state_store.set_state(CircuitState::Blocking).await {
                self.errors.report(e);
            }
        } else if self.idle_probe_interval.is_some() {
            // Fresh traffic pushes the next idle probe out.
            self.start_idle().await;
        }
    }

    /// A state transition was observed on the log (our own write or a
    /// previous leader's).
    async fn on_state_event(&self, event: StateEvent) {
        if !self.elector.is_leader() {
            return;
        }
        match event.state {
            CircuitState::Blocking => self.start_recovery().await,
            CircuitState::Passing => {
                if self.idle_probe_interval.is_some() {
                    self.start_idle().await;
                } else {
                    self.stop_scheduler().await;
                }
            }
        }
    }

    async fn on_role(&self, role: Role) {
        match role {
            Role::Leader => {
                if self.state_store.state() == CircuitState::Blocking {
                    self.start_recovery().await;
                } else if self.idle_probe_interval.is_some() {
                    self.start_idle().await;
                }
            }
            Role::Follower => self.stop_scheduler().await,
        }
    }

    async fn on_probe(&self, outcome: ProbeOutcome) {
        if !self.elector.is_leader() {
            return;
        }
        match (outcome.kind, outcome.success) {
            (ProbeKind::Recovery, true) => {
                if self.state_store.state() == CircuitState::Blocking {
                    info!(circuit = %self.id, "recovery probe succeeded; closing circuit");
                    if let Err(e) = self.state_store.set_state(CircuitState::Passing).await {
                        self.errors.report(e);
                    }
                }
            }
            (ProbeKind::Idle, false) => {
                if self.state_store.state() == CircuitState::Passing {
                    warn!(circuit = %self.id, "idle probe failed; opening circuit");
                    if let Err(e) = self.state_store.set_state(CircuitState::Blocking).await {
                        self.errors.report(e);
                    }
                }
            }
            // Failed recovery probes just let the backoff continue;
            // successful idle probes need no action.
            _ => {}
        }
    }

    async fn start_recovery(&self) {
        let backoff = Arc::clone(&self.backoff);
        let delay_fn: DelayFn = Arc::new(move |attempt| backoff.delay(attempt));
        if let Err(e) = self
            .scheduler
            .restart(ProbeSchedule::new(ProbeKind::Recovery, delay_fn))
            .await
        {
            self.errors.report(e.into());
        }
    }

    async fn start_idle(&self) {
        let Some(interval) = self.idle_probe_interval else {
            return;
        };
        let call_results = Arc::clone(&self.call_results);
        let interval_ms = interval.as_millis() as i64;
        let delay_fn: DelayFn = Arc::new(move |attempt| {
            if attempt <= 1 {
                // Aim one interval past the newest observed call; with no
                // calls at all the first probe fires immediately.
                let last = call_results.last_event_timestamp().unwrap_or(0);
                let wait = last + interval_ms - now_millis();
                Duration::from_millis(wait.max(0) as u64)
            } else {
                interval
            }
        });
        if let Err(e) = self
            .scheduler
            .restart(ProbeSchedule::new(ProbeKind::Idle, delay_fn))
            .await
        {
            self.errors.report(e.into());
        }
    }

    async fn stop_scheduler(&self) {
        if let Err(e) = self.scheduler.stop().await {
            self.errors.report(e.into());
        }
    }
}

/// Build the probe body handed to the scheduler: run the caller's check,
/// record the probe metric, and report the outcome to the policy task.
/// The scheduler itself never interprets outcomes.
fn probe_runner(
    id: String,
    check: Arc<dyn HealthCheck>,
    metrics: Arc<dyn MetricsSink>,
    errors: ErrorSink,
    probe_tx: Arc<Mutex<mpsc::UnboundedSender<ProbeOutcome>>>,
) -> ProbeRunner {
    Arc::new(move |kind, cancel| {
        let id = id.clone();
        let check = Arc::clone(&check);
        let metrics = Arc::clone(&metrics);
        let errors = errors.clone();
        let probe_tx = Arc::clone(&probe_tx);
        Box::pin(async move {
            let started = Instant::now();
            let result = check.check(kind, cancel.clone()).await;
            if cancel.is_cancelled() {
                // Errors surfacing from a cancelled probe are noise.
                return;
            }
            let outcome = match &result {
                Ok(()) => CallOutcome::Success,
                Err(_) => CallOutcome::Failure,
            };
            metrics.record_health_check(&ProbeMetric {
                circuit_id: &id,
                kind,
                outcome,
                duration: started.elapsed(),
            });
            if let Err(e) = result {
                errors.report(e);
            }
            let sender = probe_tx.lock().expect("probe sender poisoned").clone();
            let _ = sender.send(ProbeOutcome {
                kind,
                success: outcome == CallOutcome::Success,
            });
        })
    })
}
