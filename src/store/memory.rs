//! In-process coordination store
//!
//! `MemoryStore` implements the full store contract over shared process
//! memory: logs are bounded deques with watch-based wakeups for blocked
//! tails, and mutexes grant to a single handle until released or broken.
//! It backs the test suite and lets applications run the same code path
//! without an external store.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex};

use super::{CoordinationStore, DistributedMutex, LogEntry, LogPosition, StoreResult};

/// Shared-memory implementation of [`CoordinationStore`].
///
/// Cloning is cheap and every clone observes the same logs and mutexes, so
/// a clone doubles as the "dedicated connection" of the contract.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

struct Shared {
    logs: Mutex<HashMap<String, Log>>,
    mutexes: Mutex<HashMap<String, MutexSlot>>,
    /// Monotonic source for positions and mutex handle identities.
    seq: AtomicU64,
}

struct Log {
    entries: VecDeque<LogEntry>,
    /// Bumped on every append; tails subscribe under the log lock so no
    /// append can slip between the emptiness check and the wait.
    version: watch::Sender<u64>,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
            version: watch::channel(0).0,
        }
    }
}

#[derive(Default)]
struct MutexSlot {
    holder: Option<Holder>,
}

struct Holder {
    id: u64,
    lost_tx: oneshot::Sender<()>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                logs: Mutex::new(HashMap::new()),
                mutexes: Mutex::new(HashMap::new()),
                seq: AtomicU64::new(0),
            }),
        }
    }

    /// Simulate expiry or partition of the mutex under `key`: the current
    /// holder is evicted and its `lost()` future resolves.
    pub fn break_lock(&self, key: &str) {
        let holder = {
            let mut mutexes = self.shared.mutexes.lock().expect("mutex map poisoned");
            mutexes.get_mut(key).and_then(|slot| slot.holder.take())
        };
        if let Some(holder) = holder {
            let _ = holder.lost_tx.send(());
        }
    }

    /// Number of entries currently retained under `key`.
    pub fn log_len(&self, key: &str) -> usize {
        let logs = self.shared.logs.lock().expect("log map poisoned");
        logs.get(key).map_or(0, |log| log.entries.len())
    }

    fn next_seq(&self) -> u64 {
        self.shared.seq.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn append(
        &self,
        key: &str,
        fields: Vec<(String, String)>,
        maxlen_hint: Option<u64>,
    ) -> StoreResult<LogPosition> {
        let position = LogPosition::new(format!("{:016}", self.next_seq()));
        let mut logs = self.shared.logs.lock().expect("log map poisoned");
        let log = logs.entry(key.to_string()).or_default();
        log.entries.push_back(LogEntry {
            id: position.clone(),
            fields,
        });
        if let Some(maxlen) = maxlen_hint {
            while log.entries.len() as u64 > maxlen {
                log.entries.pop_front();
            }
        }
        let version = *log.version.borrow();
        log.version.send_replace(version + 1);
        Ok(position)
    }

    async fn read_range(
        &self,
        key: &str,
        from: Option<&LogPosition>,
        to: Option<&LogPosition>,
        count: Option<usize>,
    ) -> StoreResult<Vec<LogEntry>> {
        let logs = self.shared.logs.lock().expect("log map poisoned");
        let Some(log) = logs.get(key) else {
            return Ok(Vec::new());
        };
        let entries = log
            .entries
            .iter()
            .filter(|e| from.map_or(true, |f| &e.id >= f))
            .filter(|e| to.map_or(true, |t| &e.id <= t))
            .take(count.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(entries)
    }

    async fn read_last(&self, key: &str, count: usize) -> StoreResult<Vec<LogEntry>> {
        let logs = self.shared.logs.lock().expect("log map poisoned");
        let Some(log) = logs.get(key) else {
            return Ok(Vec::new());
        };
        Ok(log.entries.iter().rev().take(count).cloned().collect())
    }

    async fn tail(
        &self,
        key: &str,
        after: &LogPosition,
        block: Duration,
    ) -> StoreResult<Vec<LogEntry>> {
        let deadline = tokio::time::Instant::now() + block;
        let mut version_rx = {
            let mut logs = self.shared.logs.lock().expect("log map poisoned");
            let log = logs.entry(key.to_string()).or_default();
            let newer: Vec<LogEntry> = log
                .entries
                .iter()
                .filter(|e| &e.id > after)
                .cloned()
                .collect();
            if !newer.is_empty() {
                return Ok(newer);
            }
            log.version.subscribe()
        };
        loop {
            tokio::select! {
                changed = version_rx.changed() => {
                    if changed.is_err() {
                        return Ok(Vec::new());
                    }
                    let logs = self.shared.logs.lock().expect("log map poisoned");
                    if let Some(log) = logs.get(key) {
                        let newer: Vec<LogEntry> = log
                            .entries
                            .iter()
                            .filter(|e| &e.id > after)
                            .cloned()
                            .collect();
                        if !newer.is_empty() {
                            return Ok(newer);
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
            }
        }
    }

    async fn dedicated(&self) -> StoreResult<Arc<dyn CoordinationStore>> {
        Ok(Arc::new(self.clone()))
    }

    fn mutex(&self, key: &str) -> Arc<dyn DistributedMutex> {
        Arc::new(MemoryMutex {
            shared: self.shared.clone(),
            key: key.to_string(),
            id: self.next_seq(),
            lost_rx: AsyncMutex::new(None),
        })
    }
}

/// Handle on one in-process mutex. Each handle has its own identity; the
/// slot remembers which handle holds it.
struct MemoryMutex {
    shared: Arc<Shared>,
    key: String,
    id: u64,
    lost_rx: AsyncMutex<Option<oneshot::Receiver<()>>>,
}

#[async_trait]
impl DistributedMutex for MemoryMutex {
    async fn try_acquire(&self) -> StoreResult<bool> {
        let rx = {
            let mut mutexes = self.shared.mutexes.lock().expect("mutex map poisoned");
            let slot = mutexes.entry(self.key.clone()).or_default();
            let current_holder = slot.holder.as_ref().map(|h| h.id);
            match current_holder {
                Some(id) if id == self.id => return Ok(true),
                Some(_) => return Ok(false),
                None => {
                    let (lost_tx, lost_rx) = oneshot::channel();
                    slot.holder = Some(Holder {
                        id: self.id,
                        lost_tx,
                    });
                    lost_rx
                }
            }
        };
        *self.lost_rx.lock().await = Some(rx);
        Ok(true)
    }

    async fn release(&self) -> StoreResult<()> {
        // Drop the receiver first so the sender drop below cannot be
        // mistaken for a lost lock by a concurrent `lost()` waiter.
        self.lost_rx.lock().await.take();
        let mut mutexes = self.shared.mutexes.lock().expect("mutex map poisoned");
        if let Some(slot) = mutexes.get_mut(&self.key) {
            if slot.holder.as_ref().is_some_and(|h| h.id == self.id) {
                slot.holder = None;
            }
        }
        Ok(())
    }

    async fn lost(&self) {
        let rx = self.lost_rx.lock().await.take();
        match rx {
            Some(rx) => {
                // Resolves on `break_lock`; a dropped sender also counts as
                // losing the slot.
                let _ = rx.await;
            }
            None => std::future::pending().await,
        }
    }
}
