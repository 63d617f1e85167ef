//! Shared fixtures for the scenario tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use breakwater::{
    check_fn, BreakerConfig, CallMetric, CallOutcome, CircuitBreaker, CircuitState,
    ConsecutiveFailures, ConstantBackoff, HealthConfig, MemoryStore, MetricsSink, ProbeKind,
    ProbeMetric, Tuning,
};

/// Route library tracing into the test harness when `RUST_LOG` is set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Coordination intervals tuned down so scenarios settle in milliseconds.
pub fn fast_tuning() -> Tuning {
    Tuning {
        window_size: 100,
        acquire_interval: Duration::from_millis(25),
        tail_block: Duration::from_millis(20),
        reader_retry_delay: Duration::from_millis(10),
        state_retention: 10,
        key_prefix: "test".to_string(),
    }
}

/// A health probe whose verdict is flipped from the test body.
#[derive(Clone)]
pub struct ProbeSwitch {
    healthy: Arc<AtomicBool>,
}

impl ProbeSwitch {
    pub fn healthy() -> Self {
        Self {
            healthy: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn unhealthy() -> Self {
        Self {
            healthy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn health_config(&self, backoff_ms: u64) -> HealthConfig {
        let healthy = Arc::clone(&self.healthy);
        HealthConfig::new(
            Arc::new(ConstantBackoff(Duration::from_millis(backoff_ms))),
            check_fn(move |_, _| {
                let healthy = Arc::clone(&healthy);
                async move {
                    if healthy.load(Ordering::SeqCst) {
                        Ok(())
                    } else {
                        Err(breakwater::Error::Probe("dependency down".to_string()))
                    }
                }
            }),
        )
    }
}

/// Metrics sink that remembers everything it saw.
#[derive(Default)]
pub struct RecordingMetrics {
    pub calls: Mutex<Vec<CallOutcome>>,
    pub blocked: AtomicUsize,
    pub probes: Mutex<Vec<(ProbeKind, CallOutcome)>>,
}

impl MetricsSink for RecordingMetrics {
    fn record_call(&self, call: &CallMetric<'_>) {
        self.calls.lock().unwrap().push(call.outcome);
    }

    fn record_blocked_request(&self, _circuit_id: &str) {
        self.blocked.fetch_add(1, Ordering::SeqCst);
    }

    fn record_health_check(&self, probe: &ProbeMetric<'_>) {
        self.probes.lock().unwrap().push((probe.kind, probe.outcome));
    }
}

/// A breaker with consecutive-failure detection over a shared store.
pub fn breaker_with(
    store: &MemoryStore,
    id: &str,
    threshold: usize,
    health: HealthConfig,
) -> CircuitBreaker {
    CircuitBreaker::new(
        Arc::new(store.clone()),
        BreakerConfig::new(id, Arc::new(ConsecutiveFailures::new(threshold)), health)
            .tuning(fast_tuning()),
    )
}

/// Poll `condition` until it holds or the scenario times out.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}

pub async fn wait_for_state(breaker: &CircuitBreaker, state: CircuitState) {
    wait_until(&format!("state {state:?}"), || breaker.state() == state).await;
}
