//! Blocking log tail loop
//!
//! One `LogReader` task continuously tails a single log key over a
//! dedicated connection: blocking reads with a bounded block interval,
//! cursor re-queried from the owning subsystem on every iteration (the
//! subsystem's own state is the cursor of truth), transport errors
//! reported and retried after a short back-off, prompt exit on shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::delay::{delay, TaskHandle};
use crate::error::ErrorSink;
use crate::store::{CoordinationStore, LogEntry, LogPosition};

pub(crate) struct ReaderParams {
    /// Dedicated connection; blocking reads must not starve shared RPCs.
    pub conn: Arc<dyn CoordinationStore>,
    pub key: String,
    /// Upper bound on one blocking read, so cancellation is observed
    /// within this interval even on a quiet log.
    pub block: Duration,
    /// Pause before retrying after a transport error.
    pub retry_delay: Duration,
}

/// Spawn a tail loop. `cursor` yields the position to resume after;
/// `on_entries` receives every non-empty batch.
pub(crate) fn spawn_tail(
    params: ReaderParams,
    cursor: impl Fn() -> LogPosition + Send + 'static,
    on_entries: impl Fn(Vec<LogEntry>) + Send + 'static,
    errors: ErrorSink,
) -> TaskHandle {
    let token = CancellationToken::new();
    let task_token = token.clone();
    let handle = tokio::spawn(async move {
        let ReaderParams {
            conn,
            key,
            block,
            retry_delay,
        } = params;
        loop {
            if task_token.is_cancelled() {
                break;
            }
            let after = cursor();
            let batch = tokio::select! {
                _ = task_token.cancelled() => break,
                batch = conn.tail(&key, &after, block) => batch,
            };
            match batch {
                Ok(entries) => {
                    if !entries.is_empty() {
                        on_entries(entries);
                    }
                }
                Err(e) => {
                    // Errors caused by tearing the connection down are
                    // shutdown noise, not failures.
                    if task_token.is_cancelled() {
                        break;
                    }
                    errors.report(e.into());
                    delay(retry_delay, &task_token).await;
                }
            }
        }
        debug!(key = %key, "log tail stopped");
    });
    TaskHandle::new(token, handle)
}
