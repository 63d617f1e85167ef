//! Cooperative cancellation primitives
//!
//! Every background loop in the library owns a [`CancellationToken`] and
//! sleeps through [`delay`], so stop and restart are observed promptly and
//! cancellation is never an error.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Sleep for `duration` or return early when `cancel` fires.
///
/// Returns `true` when the full duration elapsed, `false` on cancellation.
pub async fn delay(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// A spawned loop paired with its cancellation token.
#[derive(Debug)]
pub(crate) struct TaskHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    pub(crate) fn new(token: CancellationToken, handle: JoinHandle<()>) -> Self {
        Self { token, handle }
    }

    /// Cancel the loop and wait for it to finish.
    pub(crate) async fn shutdown(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }
}
