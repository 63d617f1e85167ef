//! Leader election over a distributed mutex
//!
//! Every instance starts as Follower. A background loop attempts
//! `try_acquire` at a fixed cadence; once the mutex is held the loop parks
//! on the mutex's lock-lost future instead of ticking, demotes on loss and
//! resumes attempting. Stop releases the mutex explicitly and demotes.
//! Role changes are published on a watch channel, genuine transitions
//! only.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::RoleCallback;
use crate::delay::TaskHandle;
use crate::error::ErrorSink;
use crate::lifecycle::{Lifecycle, LifecycleError};
use crate::store::{CoordinationStore, DistributedMutex};
use crate::types::Role;

/// Start config for the elector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectorConfig {
    /// Mutex key, e.g. `breakwater:payments:leader`.
    pub key: String,
    /// Cadence of acquisition attempts while Follower. Failover latency
    /// after a leader crash is bounded below by one cadence.
    pub acquire_interval: Duration,
}

pub struct LeaderElector {
    store: Arc<dyn CoordinationStore>,
    lifecycle: Lifecycle<ElectorConfig>,
    role_tx: watch::Sender<Role>,
    on_role_change: Option<RoleCallback>,
    runtime: Mutex<Option<ElectorRuntime>>,
    errors: ErrorSink,
}

struct ElectorRuntime {
    task: TaskHandle,
    mutex: Arc<dyn DistributedMutex>,
}

impl LeaderElector {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        on_role_change: Option<RoleCallback>,
        errors: ErrorSink,
    ) -> Self {
        Self {
            store,
            lifecycle: Lifecycle::new("leader elector"),
            role_tx: watch::channel(Role::Follower).0,
            on_role_change,
            runtime: Mutex::new(None),
            errors,
        }
    }

    pub async fn start(&self, config: ElectorConfig) -> Result<(), LifecycleError> {
        self.lifecycle
            .start(config, |cfg| self.start_internal(cfg))
            .await
    }

    pub async fn stop(&self) -> Result<(), LifecycleError> {
        self.lifecycle.stop(|| self.stop_internal()).await
    }

    pub fn is_operational(&self) -> bool {
        self.lifecycle.is_operational()
    }

    pub fn role(&self) -> Role {
        *self.role_tx.borrow()
    }

    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    /// Observe role transitions.
    pub fn subscribe(&self) -> watch::Receiver<Role> {
        self.role_tx.subscribe()
    }

    async fn start_internal(&self, cfg: ElectorConfig) -> crate::Result<()> {
        let mutex = self.store.mutex(&cfg.key);
        let token = CancellationToken::new();
        let task_token = token.clone();
        let loop_mutex = Arc::clone(&mutex);
        let role_tx = self.role_tx.clone();
        let on_role_change = self.on_role_change.clone();
        let errors = self.errors.clone();
        let key = cfg.key.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cfg.acquire_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                let leading = *role_tx.borrow() == Role::Leader;
                if leading {
                    tokio::select! {
                        _ = task_token.cancelled() => break,
                        _ = loop_mutex.lost() => {
                            info!(key = %key, "leadership lost");
                            publish(&role_tx, &on_role_change, Role::Follower);
                            ticker.reset();
                        }
                    }
                } else {
                    tokio::select! {
                        _ = task_token.cancelled() => break,
                        _ = ticker.tick() => {
                            match loop_mutex.try_acquire().await {
                                Ok(true) => {
                                    info!(key = %key, "leadership acquired");
                                    publish(&role_tx, &on_role_change, Role::Leader);
                                }
                                Ok(false) => {}
                                Err(e) => errors.report(e.into()),
                            }
                        }
                    }
                }
            }
            debug!(key = %key, "acquire loop stopped");
        });

        *self.runtime.lock().expect("elector runtime poisoned") = Some(ElectorRuntime {
            task: TaskHandle::new(token, handle),
            mutex,
        });
        Ok(())
    }

    async fn stop_internal(&self) -> crate::Result<()> {
        let runtime = self.runtime.lock().expect("elector runtime poisoned").take();
        if let Some(runtime) = runtime {
            runtime.task.shutdown().await;
            if let Err(e) = runtime.mutex.release().await {
                self.errors.report(e.into());
            }
        }
        publish(&self.role_tx, &self.on_role_change, Role::Follower);
        Ok(())
    }
}

/// Publish only genuine transitions, so neither the watch channel nor the
/// user callback ever sees a duplicate role.
fn publish(role_tx: &watch::Sender<Role>, callback: &Option<RoleCallback>, role: Role) {
    let modified = role_tx.send_if_modified(|current| {
        if *current == role {
            false
        } else {
            *current = role;
            true
        }
    });
    if modified {
        if let Some(callback) = callback.as_deref() {
            callback(role);
        }
    }
}
