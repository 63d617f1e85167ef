//! Replicated circuit state
//!
//! Caches the most recent entry of the state log, or Passing when the log
//! is empty. Tailed batches collapse to their last entry; a genuine state
//! change (never the initial load) is published on a watch channel. Writes
//! keep a short retention since only the newest entry matters.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::config::StateCallback;
use crate::delay::TaskHandle;
use crate::error::{Error, ErrorSink};
use crate::lifecycle::{Lifecycle, LifecycleError};
use crate::reader::{spawn_tail, ReaderParams};
use crate::store::{CoordinationStore, LogPosition};
use crate::types::{now_millis, CircuitState, StateEvent};

/// Start config for the state store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateConfig {
    /// Log key, e.g. `breakwater:payments:state`.
    pub key: String,
    /// MAXLEN trim hint for state appends.
    pub retention: u64,
    pub tail_block: std::time::Duration,
    pub retry_delay: std::time::Duration,
}

pub struct StateStore {
    store: Arc<dyn CoordinationStore>,
    lifecycle: Lifecycle<StateConfig>,
    cache: Arc<Mutex<StateEvent>>,
    changes_tx: watch::Sender<StateEvent>,
    on_state_change: Option<StateCallback>,
    reader: Mutex<Option<TaskHandle>>,
    errors: ErrorSink,
}

impl StateStore {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        on_state_change: Option<StateCallback>,
        errors: ErrorSink,
    ) -> Self {
        Self {
            store,
            lifecycle: Lifecycle::new("state store"),
            cache: Arc::new(Mutex::new(StateEvent::initial())),
            changes_tx: watch::channel(StateEvent::initial()).0,
            on_state_change,
            reader: Mutex::new(None),
            errors,
        }
    }

    pub async fn start(&self, config: StateConfig) -> Result<(), LifecycleError> {
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

    /// Currently cached circuit state.
    pub fn state(&self) -> CircuitState {
        self.cache.lock().expect("state cache poisoned").state
    }

    /// Timestamp of the most recent observed transition (0 before any).
    pub fn last_change_timestamp(&self) -> i64 {
        self.cache.lock().expect("state cache poisoned").timestamp_ms
    }

    /// Observe genuine state changes. The initial load never fires here.
    pub fn subscribe(&self) -> watch::Receiver<StateEvent> {
        self.changes_tx.subscribe()
    }

    /// Append a transition stamped with the local wall clock.
    pub async fn set_state(&self, state: CircuitState) -> crate::Result<LogPosition> {
        let Some(cfg) = self.lifecycle.operational_config() else {
            return Err(LifecycleError::NotRunning {
                subsystem: "state store",
            }
            .into());
        };
        let fields = StateEvent::wire_fields(state, now_millis());
        let position = self
            .store
            .append(&cfg.key, fields, Some(cfg.retention))
            .await?;
        Ok(position)
    }

    async fn start_internal(&self, cfg: StateConfig) -> crate::Result<()> {
        let conn = self.store.dedicated().await?;

        let newest = self.store.read_last(&cfg.key, 1).await?;
        let initial = match newest.first() {
            Some(entry) => StateEvent::from_entry(entry).ok_or(Error::MalformedEntry {
                position: entry.id.clone(),
                reason: "unparseable state entry",
            })?,
            None => StateEvent::initial(),
        };
        *self.cache.lock().expect("state cache poisoned") = initial;

        let cache = Arc::clone(&self.cache);
        let cursor = {
            let cache = Arc::clone(&cache);
            move || cache.lock().expect("state cache poisoned").id.clone()
        };
        let on_entries = {
            let cache = Arc::clone(&cache);
            let changes_tx = self.changes_tx.clone();
            let on_state_change = self.on_state_change.clone();
            let errors = self.errors.clone();
            move |entries: Vec<crate::store::LogEntry>| {
                let newest = entries.last().expect("batches are non-empty");
                let Some(event) = StateEvent::from_entry(newest) else {
                    errors.report(Error::MalformedEntry {
                        position: newest.id.clone(),
                        reason: "unparseable state entry",
                    });
                    // Still advance past the bad entry.
                    cache.lock().expect("state cache poisoned").id = newest.id.clone();
                    return;
                };
                let changed = {
                    let mut cache = cache.lock().expect("state cache poisoned");
                    let changed = cache.state != event.state;
                    *cache = event.clone();
                    changed
                };
                if changed {
                    if let Some(callback) = on_state_change.as_deref() {
                        callback(event.state);
                    }
                    changes_tx.send_replace(event);
                }
            }
        };
        let task = spawn_tail(
            ReaderParams {
                conn,
                key: cfg.key.clone(),
                block: cfg.tail_block,
                retry_delay: cfg.retry_delay,
            },
            cursor,
            on_entries,
            self.errors.clone(),
        );
        *self.reader.lock().expect("reader slot poisoned") = Some(task);
        Ok(())
    }

    async fn stop_internal(&self) -> crate::Result<()> {
        let task = self.reader.lock().expect("reader slot poisoned").take();
        if let Some(task) = task {
            task.shutdown().await;
        }
        *self.cache.lock().expect("state cache poisoned") = StateEvent::initial();
        Ok(())
    }
}
