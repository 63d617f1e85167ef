//! Multi-instance coordination scenarios
//!
//! Two breakers share one circuit through the same store: transitions
//! written by the leader propagate to followers, recovery notifies every
//! instance, and leadership hands over when the leader stops.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use breakwater::{CircuitState, ExecuteError, MemoryStore, Role};
use common::{breaker_with, wait_for_state, wait_until, ProbeSwitch};

async fn fail_once(breaker: &breakwater::CircuitBreaker) {
    let result: Result<(), ExecuteError<&str>> = breaker.execute(|| async { Err("boom") }).await;
    assert_eq!(result.unwrap_err().into_inner(), Some("boom"));
}

#[tokio::test]
async fn leader_transition_propagates_to_follower() -> anyhow::Result<()> {
    common::init_tracing();
    let store = MemoryStore::new();
    let probe_a = ProbeSwitch::unhealthy();
    let probe_b = ProbeSwitch::unhealthy();

    let a = breaker_with(&store, "s2", 1, probe_a.health_config(60_000));
    a.start().await?;
    wait_until("a leads", || a.role() == Role::Leader).await;

    let b = breaker_with(&store, "s2", 1, probe_b.health_config(60_000));
    b.start().await?;
    assert_eq!(b.role(), Role::Follower);

    // The leader detects the breach and writes the transition; the
    // follower observes it through the state log.
    fail_once(&a).await;
    wait_for_state(&a, CircuitState::Blocking).await;
    wait_for_state(&b, CircuitState::Blocking).await;

    let blocked: Result<(), ExecuteError<&str>> = b.execute(|| async { Ok(()) }).await;
    assert!(blocked.unwrap_err().is_circuit_open());

    // Exactly one transition was written: the follower never touches the
    // state log.
    assert_eq!(store.log_len("test:s2:state"), 1);

    a.stop().await?;
    b.stop().await?;
    Ok(())
}

#[tokio::test]
async fn recovery_notifies_leader_and_follower() -> anyhow::Result<()> {
    common::init_tracing();
    let store = MemoryStore::new();
    let probe = ProbeSwitch::unhealthy();

    let seen_a: Arc<Mutex<Vec<CircuitState>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_b: Arc<Mutex<Vec<CircuitState>>> = Arc::new(Mutex::new(Vec::new()));

    let record = |seen: &Arc<Mutex<Vec<CircuitState>>>| {
        let seen = Arc::clone(seen);
        Arc::new(move |state| seen.lock().unwrap().push(state)) as breakwater::config::StateCallback
    };

    let a = breakwater::CircuitBreaker::new(
        Arc::new(store.clone()),
        breakwater::BreakerConfig::new(
            "s3",
            Arc::new(breakwater::ConsecutiveFailures::new(1)),
            probe.health_config(5),
        )
        .on_state_change(record(&seen_a))
        .tuning(common::fast_tuning()),
    );
    a.start().await?;
    wait_until("a leads", || a.role() == Role::Leader).await;

    let b = breakwater::CircuitBreaker::new(
        Arc::new(store.clone()),
        breakwater::BreakerConfig::new(
            "s3",
            Arc::new(breakwater::ConsecutiveFailures::new(1)),
            ProbeSwitch::unhealthy().health_config(5),
        )
        .on_state_change(record(&seen_b))
        .tuning(common::fast_tuning()),
    );
    b.start().await?;

    fail_once(&a).await;
    wait_for_state(&a, CircuitState::Blocking).await;
    wait_for_state(&b, CircuitState::Blocking).await;

    // Dependency recovers; the leader's probe closes the circuit and both
    // instances hear about it.
    probe.set_healthy(true);
    wait_for_state(&a, CircuitState::Passing).await;
    wait_for_state(&b, CircuitState::Passing).await;

    wait_until("a sees Passing", || {
        seen_a.lock().unwrap().contains(&CircuitState::Passing)
    })
    .await;
    wait_until("b sees Passing", || {
        seen_b.lock().unwrap().contains(&CircuitState::Passing)
    })
    .await;
    assert_eq!(
        seen_a.lock().unwrap().as_slice(),
        &[CircuitState::Blocking, CircuitState::Passing]
    );
    assert_eq!(
        seen_b.lock().unwrap().as_slice(),
        &[CircuitState::Blocking, CircuitState::Passing]
    );

    a.stop().await?;
    b.stop().await?;
    Ok(())
}

#[tokio::test]
async fn leadership_hands_over_and_blocking_state_persists() -> anyhow::Result<()> {
    common::init_tracing();
    let store = MemoryStore::new();
    let probe_a = ProbeSwitch::unhealthy();
    let probe_b = ProbeSwitch::unhealthy();

    let roles_b: Arc<Mutex<Vec<Role>>> = Arc::new(Mutex::new(Vec::new()));
    let a = breaker_with(&store, "s6", 1, probe_a.health_config(60_000));
    a.start().await?;
    wait_until("a leads", || a.role() == Role::Leader).await;

    let b = breakwater::CircuitBreaker::new(
        Arc::new(store.clone()),
        breakwater::BreakerConfig::new(
            "s6",
            Arc::new(breakwater::ConsecutiveFailures::new(1)),
            probe_b.health_config(5),
        )
        .on_role_change({
            let roles_b = Arc::clone(&roles_b);
            Arc::new(move |role| roles_b.lock().unwrap().push(role))
        })
        .tuning(common::fast_tuning()),
    );
    b.start().await?;

    // Open the circuit under A's leadership.
    fail_once(&a).await;
    wait_for_state(&b, CircuitState::Blocking).await;

    // A goes away: it demotes immediately, B picks the mutex up at its
    // next acquire tick, and the blocking state survives the handover.
    a.stop().await?;
    assert_eq!(a.role(), Role::Follower);
    wait_until("b leads", || b.role() == Role::Leader).await;
    assert_eq!(b.state(), CircuitState::Blocking);
    assert_eq!(roles_b.lock().unwrap().as_slice(), &[Role::Leader]);

    // The new leader owns recovery now.
    probe_b.set_healthy(true);
    wait_for_state(&b, CircuitState::Passing).await;

    b.stop().await?;
    Ok(())
}

#[tokio::test]
async fn late_joiner_adopts_current_state_from_the_log() -> anyhow::Result<()> {
    common::init_tracing();
    let store = MemoryStore::new();
    let probe = ProbeSwitch::unhealthy();

    let a = breaker_with(&store, "late", 1, probe.health_config(60_000));
    a.start().await?;
    wait_until("a leads", || a.role() == Role::Leader).await;
    fail_once(&a).await;
    wait_for_state(&a, CircuitState::Blocking).await;

    // A brand-new instance reads the blocking state during start.
    let b = breaker_with(&store, "late", 1, ProbeSwitch::unhealthy().health_config(60_000));
    b.start().await?;
    assert_eq!(b.state(), CircuitState::Blocking);
    let blocked: Result<(), ExecuteError<&str>> = b.execute(|| async { Ok(()) }).await;
    assert!(blocked.unwrap_err().is_circuit_open());

    a.stop().await?;
    b.stop().await?;
    Ok(())
}

#[tokio::test]
async fn call_results_from_every_instance_share_one_log() -> anyhow::Result<()> {
    common::init_tracing();
    let store = MemoryStore::new();
    let probe = ProbeSwitch::healthy();

    let a = breaker_with(&store, "conv", 10, probe.health_config(60_000));
    let b = breaker_with(&store, "conv", 10, ProbeSwitch::healthy().health_config(60_000));
    a.start().await?;
    b.start().await?;

    for _ in 0..3 {
        let _: Result<(), ExecuteError<&str>> = a.execute(|| async { Ok(()) }).await;
        let _: Result<(), ExecuteError<&str>> = b.execute(|| async { Err("x") }).await;
    }

    // Both instances converge on the same six events in log order.
    wait_until("windows converge", || {
        store.log_len("test:conv:call-result") == 6
    })
    .await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(store.log_len("test:conv:call-result"), 6);

    a.stop().await?;
    b.stop().await?;
    Ok(())
}
