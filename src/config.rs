//! Breaker configuration
//!
//! [`BreakerConfig`] carries the required pieces (circuit id, failure
//! strategy, health probing) plus optional callbacks, a metrics sink and
//! coordination tuning knobs. `Tuning` is plain serde-friendly data; the
//! strategy, backoff and probe are trait objects supplied by the caller.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::metrics::MetricsSink;
use crate::strategy::FailureStrategy;
use crate::types::{CircuitState, ProbeKind, Role};
use crate::Error;

/// User callback for genuine circuit-state transitions.
pub type StateCallback = Arc<dyn Fn(CircuitState) + Send + Sync>;
/// User callback for genuine role transitions.
pub type RoleCallback = Arc<dyn Fn(Role) + Send + Sync>;
/// User callback for background errors.
pub type ErrorCallback = Arc<dyn Fn(Error) + Send + Sync>;

/// Health probe supplied by the caller.
///
/// The probe imposes its own per-attempt timeout and must return promptly
/// when `cancel` fires; an error after cancellation is treated as
/// cancellation noise, not a failed probe. The probe must not retain a
/// reference back to the breaker.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self, kind: ProbeKind, cancel: CancellationToken) -> crate::Result<()>;
}

/// Wrap an async closure as a [`HealthCheck`].
pub fn check_fn<F, Fut>(f: F) -> Arc<dyn HealthCheck>
where
    F: Fn(ProbeKind, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = crate::Result<()>> + Send + 'static,
{
    struct FnCheck<F>(F);

    #[async_trait]
    impl<F, Fut> HealthCheck for FnCheck<F>
    where
        F: Fn(ProbeKind, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = crate::Result<()>> + Send + 'static,
    {
        async fn check(&self, kind: ProbeKind, cancel: CancellationToken) -> crate::Result<()> {
            (self.0)(kind, cancel).await
        }
    }

    Arc::new(FnCheck(f))
}

/// Probing configuration.
#[derive(Clone)]
pub struct HealthConfig {
    /// Delay function for recovery probing.
    pub backoff: Arc<dyn Backoff>,
    /// The probe itself.
    pub check: Arc<dyn HealthCheck>,
    /// Enables idle probing of a quiet passing circuit when set.
    pub idle_probe_interval: Option<Duration>,
}

impl HealthConfig {
    pub fn new(backoff: Arc<dyn Backoff>, check: Arc<dyn HealthCheck>) -> Self {
        Self {
            backoff,
            check,
            idle_probe_interval: None,
        }
    }

    pub fn with_idle_probe_interval(mut self, interval: Duration) -> Self {
        self.idle_probe_interval = Some(interval);
        self
    }
}

/// Coordination tuning knobs with conservative defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tuning {
    /// Bound on the replicated call-result window; also the log trim hint.
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Cadence of mutex acquisition attempts while Follower.
    #[serde(default = "default_acquire_interval")]
    pub acquire_interval: Duration,

    /// Upper bound on one blocking tail read.
    #[serde(default = "default_tail_block")]
    pub tail_block: Duration,

    /// Pause before a tail loop retries after a transport error.
    #[serde(default = "default_reader_retry_delay")]
    pub reader_retry_delay: Duration,

    /// Trim hint for the state log; only the newest entry matters.
    #[serde(default = "default_state_retention")]
    pub state_retention: u64,

    /// Leading component of every log and mutex key.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_window_size() -> usize {
    1000
}

fn default_acquire_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_tail_block() -> Duration {
    Duration::from_secs(1)
}

fn default_reader_retry_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_state_retention() -> u64 {
    10
}

fn default_key_prefix() -> String {
    "breakwater".to_string()
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            acquire_interval: default_acquire_interval(),
            tail_block: default_tail_block(),
            reader_retry_delay: default_reader_retry_delay(),
            state_retention: default_state_retention(),
            key_prefix: default_key_prefix(),
        }
    }
}

/// Full configuration for one circuit breaker instance.
#[derive(Clone)]
pub struct BreakerConfig {
    /// Circuit identity; namespaces every coordination key.
    pub id: String,
    pub strategy: Arc<dyn FailureStrategy>,
    pub health: HealthConfig,
    pub on_error: Option<ErrorCallback>,
    pub on_role_change: Option<RoleCallback>,
    pub on_state_change: Option<StateCallback>,
    pub metrics: Option<Arc<dyn MetricsSink>>,
    pub tuning: Tuning,
}

impl BreakerConfig {
    pub fn new(
        id: impl Into<String>,
        strategy: Arc<dyn FailureStrategy>,
        health: HealthConfig,
    ) -> Self {
        Self {
            id: id.into(),
            strategy,
            health,
            on_error: None,
            on_role_change: None,
            on_state_change: None,
            metrics: None,
            tuning: Tuning::default(),
        }
    }

    pub fn on_error(mut self, callback: ErrorCallback) -> Self {
        self.on_error = Some(callback);
        self
    }

    pub fn on_role_change(mut self, callback: RoleCallback) -> Self {
        self.on_role_change = Some(callback);
        self
    }

    pub fn on_state_change(mut self, callback: StateCallback) -> Self {
        self.on_state_change = Some(callback);
        self
    }

    pub fn metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(sink);
        self
    }

    pub fn tuning(mut self, tuning: Tuning) -> Self {
        self.tuning = tuning;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::ConstantBackoff;
    use crate::strategy::ConsecutiveFailures;

    #[test]
    fn tuning_defaults() {
        let tuning = Tuning::default();
        assert_eq!(tuning.window_size, 1000);
        assert_eq!(tuning.acquire_interval, Duration::from_secs(5));
        assert_eq!(tuning.tail_block, Duration::from_secs(1));
        assert_eq!(tuning.state_retention, 10);
        assert_eq!(tuning.key_prefix, "breakwater");
    }

    #[test]
    fn builder_fills_optional_pieces() {
        let health = HealthConfig::new(
            Arc::new(ConstantBackoff(Duration::from_millis(5))),
            check_fn(|_, _| async { Ok(()) }),
        )
        .with_idle_probe_interval(Duration::from_secs(30));

        let config = BreakerConfig::new("payments", Arc::new(ConsecutiveFailures::new(3)), health)
            .on_state_change(Arc::new(|_| {}))
            .tuning(Tuning {
                window_size: 50,
                ..Tuning::default()
            });

        assert_eq!(config.id, "payments");
        assert!(config.on_state_change.is_some());
        assert!(config.on_role_change.is_none());
        assert_eq!(config.tuning.window_size, 50);
        assert_eq!(
            config.health.idle_probe_interval,
            Some(Duration::from_secs(30))
        );
    }

    #[tokio::test]
    async fn check_fn_adapts_closures() {
        let check = check_fn(|kind, _| async move {
            if kind == ProbeKind::Recovery {
                Ok(())
            } else {
                Err(Error::Probe("idle probe refused".to_string()))
            }
        });
        assert!(check
            .check(ProbeKind::Recovery, CancellationToken::new())
            .await
            .is_ok());
        assert!(check
            .check(ProbeKind::Idle, CancellationToken::new())
            .await
            .is_err());
    }
}
