//! Subsystem lifecycle state machine
//!
//! Every stateful subsystem (the two stores, the elector, the scheduler,
//! the breaker itself) embeds a [`Lifecycle`] instead of ad-hoc "started"
//! flags. Phases move Inactive → Starting → Operational → Stopping →
//! Inactive; a failing start or stop body drives the instance to the
//! terminal Unrecoverable phase.
//!
//! Start and stop coordinate through the phase itself: the caller that
//! claims a transient phase runs the transition. A `start` racing an
//! in-flight `start` with an equal config joins that start's completion;
//! with a different config it fails synchronously with
//! [`LifecycleError::Busy`]. A `stop` racing a `start` waits for the start
//! to finish before draining, and a `stop` racing a `stop` joins the
//! drain. Configs are compared with `PartialEq`.

use std::future::Future;
use std::sync::Mutex;

use tokio::sync::watch;
use tracing::{debug, error};

/// Phase of one subsystem instance.
#[derive(Debug, Clone)]
pub enum LifecyclePhase<C> {
    Inactive,
    Starting { config: C },
    Operational { config: C },
    Stopping,
    /// Terminal: a start or stop body failed. The instance must be
    /// recreated.
    Unrecoverable { cause: String },
}

/// Payload-free view of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseKind {
    Inactive,
    Starting,
    Operational,
    Stopping,
    Unrecoverable,
}

/// Lifecycle violations, surfaced synchronously from the offending call.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum LifecycleError {
    /// A start is already in flight with a different config.
    #[error("{subsystem} is busy starting with a different config")]
    Busy { subsystem: &'static str },

    /// Already operational under a different config.
    #[error("{subsystem} is already running with a different config")]
    AlreadyRunning { subsystem: &'static str },

    /// An operation that requires the Operational phase was called outside
    /// it.
    #[error("{subsystem} is not running")]
    NotRunning { subsystem: &'static str },

    /// The instance hit a terminal failure earlier.
    #[error("{subsystem} is unrecoverable: {cause}")]
    Unrecoverable {
        subsystem: &'static str,
        cause: String,
    },

    /// The start body failed; the instance is now unrecoverable.
    #[error("{subsystem} failed to start: {cause}")]
    StartFailed {
        subsystem: &'static str,
        cause: String,
    },

    /// The stop body failed; the instance is now unrecoverable.
    #[error("{subsystem} failed to stop: {cause}")]
    StopFailed {
        subsystem: &'static str,
        cause: String,
    },
}

/// State machine governing start/stop/restart of one subsystem.
#[derive(Debug)]
pub struct Lifecycle<C> {
    subsystem: &'static str,
    phase: Mutex<LifecyclePhase<C>>,
    /// Bumped on every transition. Waiters subscribe *before* examining
    /// the phase so no change can slip between the check and the wait.
    changed: watch::Sender<u64>,
}

impl<C> Lifecycle<C>
where
    C: Clone + PartialEq + Send,
{
    pub fn new(subsystem: &'static str) -> Self {
        Self {
            subsystem,
            phase: Mutex::new(LifecyclePhase::Inactive),
            changed: watch::channel(0).0,
        }
    }

    pub fn phase_kind(&self) -> PhaseKind {
        match *self.phase.lock().expect("lifecycle phase poisoned") {
            LifecyclePhase::Inactive => PhaseKind::Inactive,
            LifecyclePhase::Starting { .. } => PhaseKind::Starting,
            LifecyclePhase::Operational { .. } => PhaseKind::Operational,
            LifecyclePhase::Stopping => PhaseKind::Stopping,
            LifecyclePhase::Unrecoverable { .. } => PhaseKind::Unrecoverable,
        }
    }

    pub fn is_operational(&self) -> bool {
        self.phase_kind() == PhaseKind::Operational
    }

    /// Config of the current Operational phase, if any.
    pub fn operational_config(&self) -> Option<C> {
        match &*self.phase.lock().expect("lifecycle phase poisoned") {
            LifecyclePhase::Operational { config } => Some(config.clone()),
            _ => None,
        }
    }

    fn set_phase(&self, next: LifecyclePhase<C>) {
        *self.phase.lock().expect("lifecycle phase poisoned") = next;
        self.changed.send_modify(|generation| *generation += 1);
    }

    /// Promote Inactive → Starting → Operational, running `start_internal`
    /// in between.
    ///
    /// Starting with the config the instance is already starting or
    /// operational under joins or no-ops; a different config fails
    /// synchronously with [`LifecycleError::Busy`] or
    /// [`LifecycleError::AlreadyRunning`]. During `Stopping` the call
    /// waits for the drain and then starts. A failing `start_internal`
    /// leaves the instance [`PhaseKind::Unrecoverable`].
    pub async fn start<F, Fut>(&self, config: C, start_internal: F) -> Result<(), LifecycleError>
    where
        F: FnOnce(C) -> Fut,
        Fut: Future<Output = crate::Result<()>>,
    {
        loop {
            let mut changes = self.changed.subscribe();
            let claimed = {
                let mut phase = self.phase.lock().expect("lifecycle phase poisoned");
                let claim = match &*phase {
                    LifecyclePhase::Inactive => true,
                    // An equal-config start is in flight; join its
                    // completion.
                    LifecyclePhase::Starting { config: current } if *current == config => false,
                    LifecyclePhase::Starting { .. } => {
                        return Err(LifecycleError::Busy {
                            subsystem: self.subsystem,
                        });
                    }
                    LifecyclePhase::Operational { config: current } if *current == config => {
                        return Ok(());
                    }
                    LifecyclePhase::Operational { .. } => {
                        return Err(LifecycleError::AlreadyRunning {
                            subsystem: self.subsystem,
                        });
                    }
                    // A stop is draining; wait for Inactive and try again.
                    LifecyclePhase::Stopping => false,
                    LifecyclePhase::Unrecoverable { cause } => {
                        return Err(LifecycleError::Unrecoverable {
                            subsystem: self.subsystem,
                            cause: cause.clone(),
                        });
                    }
                };
                if claim {
                    *phase = LifecyclePhase::Starting {
                        config: config.clone(),
                    };
                }
                claim
            };
            if claimed {
                break;
            }
            let _ = changes.changed().await;
        }
        self.changed.send_modify(|generation| *generation += 1);

        debug!(subsystem = self.subsystem, "starting");
        match start_internal(config.clone()).await {
            Ok(()) => {
                self.set_phase(LifecyclePhase::Operational { config });
                debug!(subsystem = self.subsystem, "operational");
                Ok(())
            }
            Err(e) => {
                let cause = e.to_string();
                error!(subsystem = self.subsystem, error = %cause, "start failed");
                self.set_phase(LifecyclePhase::Unrecoverable {
                    cause: cause.clone(),
                });
                Err(LifecycleError::StartFailed {
                    subsystem: self.subsystem,
                    cause,
                })
            }
        }
    }

    /// Demote Operational → Stopping → Inactive, running `stop_internal`
    /// in between. Idempotent on Inactive. During `Starting` the call
    /// waits for the start to finish and then stops; during `Stopping` it
    /// joins the drain already in flight.
    pub async fn stop<F, Fut>(&self, stop_internal: F) -> Result<(), LifecycleError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = crate::Result<()>>,
    {
        loop {
            let mut changes = self.changed.subscribe();
            let claimed = {
                let mut phase = self.phase.lock().expect("lifecycle phase poisoned");
                let claim = match &*phase {
                    LifecyclePhase::Inactive => return Ok(()),
                    LifecyclePhase::Operational { .. } => true,
                    // Let the in-flight start finish, then stop it.
                    LifecyclePhase::Starting { .. } => false,
                    // Join the drain already in flight.
                    LifecyclePhase::Stopping => false,
                    LifecyclePhase::Unrecoverable { cause } => {
                        return Err(LifecycleError::Unrecoverable {
                            subsystem: self.subsystem,
                            cause: cause.clone(),
                        });
                    }
                };
                if claim {
                    *phase = LifecyclePhase::Stopping;
                }
                claim
            };
            if claimed {
                break;
            }
            let _ = changes.changed().await;
        }
        self.changed.send_modify(|generation| *generation += 1);

        debug!(subsystem = self.subsystem, "stopping");
        match stop_internal().await {
            Ok(()) => {
                self.set_phase(LifecyclePhase::Inactive);
                debug!(subsystem = self.subsystem, "inactive");
                Ok(())
            }
            Err(e) => {
                let cause = e.to_string();
                error!(subsystem = self.subsystem, error = %cause, "stop failed");
                self.set_phase(LifecyclePhase::Unrecoverable {
                    cause: cause.clone(),
                });
                Err(LifecycleError::StopFailed {
                    subsystem: self.subsystem,
                    cause,
                })
            }
        }
    }

    /// Stop until Inactive, then start with `config`.
    ///
    /// Guarantees the previous incarnation has fully stopped before
    /// `start_internal` runs.
    pub async fn restart<SF, SFut, TF, TFut>(
        &self,
        config: C,
        start_internal: SF,
        stop_internal: TF,
    ) -> Result<(), LifecycleError>
    where
        SF: FnOnce(C) -> SFut,
        SFut: Future<Output = crate::Result<()>>,
        TF: Fn() -> TFut,
        TFut: Future<Output = crate::Result<()>>,
    {
        while self.phase_kind() != PhaseKind::Inactive {
            self.stop(&stop_internal).await?;
        }
        self.start(config, start_internal).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn counted(counter: &Arc<AtomicUsize>) -> impl Future<Output = crate::Result<()>> {
        let counter = Arc::clone(counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Spawn a start whose body sleeps, so the Starting phase stays
    /// observable from the test task.
    fn slow_start(
        lifecycle: &Arc<Lifecycle<u32>>,
        config: u32,
        starts: &Arc<AtomicUsize>,
    ) -> tokio::task::JoinHandle<Result<(), LifecycleError>> {
        let lifecycle = Arc::clone(lifecycle);
        let starts = Arc::clone(starts);
        tokio::spawn(async move {
            lifecycle
                .start(config, |_| async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    starts.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
        })
    }

    #[tokio::test]
    async fn start_is_idempotent_for_equal_configs() {
        let lifecycle: Lifecycle<u32> = Lifecycle::new("test");
        let starts = Arc::new(AtomicUsize::new(0));

        lifecycle.start(1, |_| counted(&starts)).await.unwrap();
        lifecycle.start(1, |_| counted(&starts)).await.unwrap();

        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert!(lifecycle.is_operational());
        assert_eq!(lifecycle.operational_config(), Some(1));
    }

    #[tokio::test]
    async fn start_with_different_config_fails() {
        let lifecycle: Lifecycle<u32> = Lifecycle::new("test");
        lifecycle.start(1, |_| async { Ok(()) }).await.unwrap();

        let err = lifecycle.start(2, |_| async { Ok(()) }).await.unwrap_err();
        assert_eq!(err, LifecycleError::AlreadyRunning { subsystem: "test" });
    }

    #[tokio::test]
    async fn stop_before_start_is_a_noop() {
        let lifecycle: Lifecycle<u32> = Lifecycle::new("test");
        let stops = Arc::new(AtomicUsize::new(0));

        lifecycle.stop(|| counted(&stops)).await.unwrap();

        assert_eq!(stops.load(Ordering::SeqCst), 0);
        assert_eq!(lifecycle.phase_kind(), PhaseKind::Inactive);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let lifecycle: Lifecycle<u32> = Lifecycle::new("test");
        let stops = Arc::new(AtomicUsize::new(0));

        lifecycle.start(1, |_| async { Ok(()) }).await.unwrap();
        lifecycle.stop(|| counted(&stops)).await.unwrap();
        lifecycle.stop(|| counted(&stops)).await.unwrap();

        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_start_is_terminal() {
        let lifecycle: Lifecycle<u32> = Lifecycle::new("test");

        let err = lifecycle
            .start(1, |_| async {
                Err(crate::Error::Probe("kaboom".to_string()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::StartFailed { .. }));
        assert_eq!(lifecycle.phase_kind(), PhaseKind::Unrecoverable);

        let err = lifecycle.start(1, |_| async { Ok(()) }).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Unrecoverable { .. }));
        let err = lifecycle.stop(|| async { Ok(()) }).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Unrecoverable { .. }));
    }

    #[tokio::test]
    async fn concurrent_start_with_equal_config_joins() {
        let lifecycle: Arc<Lifecycle<u32>> = Arc::new(Lifecycle::new("test"));
        let starts = Arc::new(AtomicUsize::new(0));

        let slow = slow_start(&lifecycle, 1, &starts);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(lifecycle.phase_kind(), PhaseKind::Starting);

        // Joins the in-flight start; its own body never runs.
        lifecycle.start(1, |_| counted(&starts)).await.unwrap();
        slow.await.unwrap().unwrap();

        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert!(lifecycle.is_operational());
    }

    #[tokio::test]
    async fn concurrent_start_with_different_config_is_busy() {
        let lifecycle: Arc<Lifecycle<u32>> = Arc::new(Lifecycle::new("test"));
        let starts = Arc::new(AtomicUsize::new(0));

        let slow = slow_start(&lifecycle, 1, &starts);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(lifecycle.phase_kind(), PhaseKind::Starting);

        // Fails fast instead of waiting out the in-flight start.
        let before = std::time::Instant::now();
        let err = lifecycle.start(2, |_| counted(&starts)).await.unwrap_err();
        assert_eq!(err, LifecycleError::Busy { subsystem: "test" });
        assert!(before.elapsed() < Duration::from_millis(40));

        slow.await.unwrap().unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(lifecycle.operational_config(), Some(1));
    }

    #[tokio::test]
    async fn stop_during_start_waits_for_the_start() {
        let lifecycle: Arc<Lifecycle<u32>> = Arc::new(Lifecycle::new("test"));
        let starts = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));

        let slow = slow_start(&lifecycle, 1, &starts);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(lifecycle.phase_kind(), PhaseKind::Starting);

        lifecycle.stop(|| counted(&stops)).await.unwrap();
        slow.await.unwrap().unwrap();

        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert_eq!(lifecycle.phase_kind(), PhaseKind::Inactive);
    }

    #[tokio::test]
    async fn restart_stops_then_starts() {
        let lifecycle: Lifecycle<u32> = Lifecycle::new("test");
        let starts = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));

        lifecycle.start(1, |_| counted(&starts)).await.unwrap();
        lifecycle
            .restart(2, |_| counted(&starts), || counted(&stops))
            .await
            .unwrap();

        assert_eq!(starts.load(Ordering::SeqCst), 2);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert_eq!(lifecycle.operational_config(), Some(2));
    }
}
