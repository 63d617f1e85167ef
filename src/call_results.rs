//! Replicated window of recent call outcomes
//!
//! Every instance tails the shared call-result log into a bounded
//! in-memory window (oldest first). Appends are fire-and-forget: `execute`
//! never waits for the log write, and write failures surface through the
//! error sink only. The full window is published on a watch channel after
//! the initial load and after every tailed batch; subscribers must
//! tolerate seeing the same tail repeatedly.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::warn;

use crate::delay::TaskHandle;
use crate::error::{Error, ErrorSink};
use crate::lifecycle::{Lifecycle, LifecycleError};
use crate::reader::{spawn_tail, ReaderParams};
use crate::store::{CoordinationStore, LogPosition};
use crate::types::{now_millis, CallOutcome, CallResultEvent};

/// Start config for the call-result store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResultConfig {
    /// Log key, e.g. `breakwater:payments:call-result`.
    pub key: String,
    /// Window bound; doubles as the log's MAXLEN trim hint.
    pub window_size: usize,
    /// Blocking-read bound for the tail loop.
    pub tail_block: std::time::Duration,
    /// Back-off after a failed tail read.
    pub retry_delay: std::time::Duration,
}

pub struct CallResultStore {
    store: Arc<dyn CoordinationStore>,
    lifecycle: Lifecycle<CallResultConfig>,
    window: Arc<Mutex<VecDeque<CallResultEvent>>>,
    events_tx: watch::Sender<Vec<CallResultEvent>>,
    reader: Mutex<Option<TaskHandle>>,
    errors: ErrorSink,
}

impl CallResultStore {
    pub fn new(store: Arc<dyn CoordinationStore>, errors: ErrorSink) -> Self {
        Self {
            store,
            lifecycle: Lifecycle::new("call-result store"),
            window: Arc::new(Mutex::new(VecDeque::new())),
            events_tx: watch::channel(Vec::new()).0,
            reader: Mutex::new(None),
            errors,
        }
    }

    pub async fn start(&self, config: CallResultConfig) -> Result<(), LifecycleError> {
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

    /// Snapshot of the current window, oldest first.
    pub fn events(&self) -> Vec<CallResultEvent> {
        self.window
            .lock()
            .expect("call window poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Timestamp of the newest event in the window, if any.
    pub fn last_event_timestamp(&self) -> Option<i64> {
        self.window
            .lock()
            .expect("call window poisoned")
            .back()
            .map(|e| e.timestamp_ms)
    }

    /// Observe window updates. Each message is the full window, not a
    /// delta.
    pub fn subscribe(&self) -> watch::Receiver<Vec<CallResultEvent>> {
        self.events_tx.subscribe()
    }

    /// Append one outcome to the shared log, stamped with the local wall
    /// clock. Fire-and-forget: errors go to the error sink.
    pub fn store_call_result(&self, outcome: CallOutcome) {
        let Some(cfg) = self.lifecycle.operational_config() else {
            warn!("call result dropped: store is not operational");
            return;
        };
        let store = Arc::clone(&self.store);
        let errors = self.errors.clone();
        let fields = CallResultEvent::wire_fields(outcome, now_millis());
        tokio::spawn(async move {
            if let Err(e) = store
                .append(&cfg.key, fields, Some(cfg.window_size as u64))
                .await
            {
                errors.report(e.into());
            }
        });
    }

    async fn start_internal(&self, cfg: CallResultConfig) -> crate::Result<()> {
        let conn = self.store.dedicated().await?;

        // Newest-first from the store, reversed into insertion order.
        let recent = self.store.read_last(&cfg.key, cfg.window_size).await?;
        {
            let mut window = self.window.lock().expect("call window poisoned");
            window.clear();
            for entry in recent.iter().rev() {
                match CallResultEvent::from_entry(entry) {
                    Some(event) => window.push_back(event),
                    None => self.errors.report(Error::MalformedEntry {
                        position: entry.id.clone(),
                        reason: "unparseable call-result entry",
                    }),
                }
            }
        }
        let loaded = self.events();
        if !loaded.is_empty() {
            self.events_tx.send_replace(loaded);
        }

        let window = Arc::clone(&self.window);
        let cursor = {
            let window = Arc::clone(&window);
            move || {
                window
                    .lock()
                    .expect("call window poisoned")
                    .back()
                    .map(|e| e.id.clone())
                    .unwrap_or_else(LogPosition::zero)
            }
        };
        let on_entries = {
            let window = Arc::clone(&window);
            let events_tx = self.events_tx.clone();
            let errors = self.errors.clone();
            let cap = cfg.window_size;
            move |entries: Vec<crate::store::LogEntry>| {
                let snapshot = {
                    let mut window = window.lock().expect("call window poisoned");
                    for entry in &entries {
                        match CallResultEvent::from_entry(entry) {
                            Some(event) => window.push_back(event),
                            None => errors.report(Error::MalformedEntry {
                                position: entry.id.clone(),
                                reason: "unparseable call-result entry",
                            }),
                        }
                    }
                    while window.len() > cap {
                        window.pop_front();
                    }
                    window.iter().cloned().collect::<Vec<_>>()
                };
                events_tx.send_replace(snapshot);
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
        self.window.lock().expect("call window poisoned").clear();
        Ok(())
    }
}
