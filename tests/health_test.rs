//! Persistence tests for the circuit breaker's durable state, including the
//! single-in-flight-probe guarantee a `half_open` destination must enforce.
//!
//! Timestamps that need to look "old enough to retry" are backdated directly
//! via SQL rather than by sleeping for the real `recovery_timeout`.

mod common;

use delivery_core::config::CircuitBreakerConfig;
use delivery_core::db::models::health::CircuitBreakerState;
use delivery_core::health::HealthMonitor;
use delivery_core::types::DestinationId;
use sqlx::PgPool;
use std::time::Duration;

fn config() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: 3,
        recovery_timeout: Duration::from_secs(30),
        success_rate_window: 20,
    }
}

async fn backdate_opened_at(pool: &PgPool, destination_id: DestinationId) {
    sqlx::query("UPDATE delivery_destination_health SET circuit_breaker_opened_at = now() - interval '1 hour' WHERE destination_id = $1")
        .bind(destination_id)
        .execute(pool)
        .await
        .expect("backdate circuit_breaker_opened_at");
}

async fn backdate_probe_at(pool: &PgPool, destination_id: DestinationId) {
    sqlx::query("UPDATE delivery_destination_health SET half_open_probe_at = now() - interval '1 hour' WHERE destination_id = $1")
        .bind(destination_id)
        .execute(pool)
        .await
        .expect("backdate half_open_probe_at");
}

#[sqlx::test]
#[test_log::test]
async fn closed_circuit_allows_delivery_and_opens_after_threshold_failures(pool: PgPool) {
    let (_organization_id, destination_id) = common::create_destination(&pool).await;
    let monitor = HealthMonitor::new(pool.clone(), config());

    assert!(monitor.should_allow_delivery(destination_id, false).await.expect("allow check"));

    for _ in 0..3 {
        monitor.record_failure(destination_id).await.expect("record failure");
    }

    let health = monitor.get_health(destination_id).await.expect("get health").expect("health row exists");
    assert_eq!(health.state(), CircuitBreakerState::Open);
}

#[sqlx::test]
#[test_log::test]
async fn disabled_destination_never_allows_delivery_regardless_of_state(pool: PgPool) {
    let (_organization_id, destination_id) = common::create_destination(&pool).await;
    let monitor = HealthMonitor::new(pool.clone(), config());

    assert!(!monitor.should_allow_delivery(destination_id, true).await.expect("allow check"));
}

#[sqlx::test]
#[test_log::test]
async fn open_circuit_before_recovery_timeout_blocks_delivery(pool: PgPool) {
    let (_organization_id, destination_id) = common::create_destination(&pool).await;
    let monitor = HealthMonitor::new(pool.clone(), config());

    for _ in 0..3 {
        monitor.record_failure(destination_id).await.expect("record failure");
    }

    assert!(!monitor.should_allow_delivery(destination_id, false).await.expect("still within recovery_timeout"));
}

#[sqlx::test]
#[test_log::test]
async fn half_open_admits_exactly_one_concurrent_probe(pool: PgPool) {
    let (_organization_id, destination_id) = common::create_destination(&pool).await;
    let monitor = HealthMonitor::new(pool.clone(), config());

    for _ in 0..3 {
        monitor.record_failure(destination_id).await.expect("record failure");
    }
    backdate_opened_at(&pool, destination_id).await;

    // The call that observes `open` past `recovery_timeout` transitions the
    // circuit to `half_open` and is itself the admitted probe.
    assert!(monitor.should_allow_delivery(destination_id, false).await.expect("first probe"));

    let health = monitor.get_health(destination_id).await.expect("get health").expect("health row exists");
    assert_eq!(health.state(), CircuitBreakerState::HalfOpen);
    assert!(health.half_open_probe_at.is_some());

    // A second, concurrent delivery_id hitting the same half-open destination
    // must not also be admitted while the first probe is outstanding.
    let second = monitor.should_allow_delivery(destination_id, false).await.expect("second probe attempt");
    assert!(!second, "only one in-flight probe should be admitted per half-open destination");

    // Once the probe resolves (success closes the circuit), new checks are allowed again.
    monitor.record_success(destination_id, 12.0).await.expect("record success");
    assert!(monitor.should_allow_delivery(destination_id, false).await.expect("post-recovery check"));
}

#[sqlx::test]
#[test_log::test]
async fn half_open_probe_failing_reopens_the_circuit(pool: PgPool) {
    let (_organization_id, destination_id) = common::create_destination(&pool).await;
    let monitor = HealthMonitor::new(pool.clone(), config());

    for _ in 0..3 {
        monitor.record_failure(destination_id).await.expect("record failure");
    }
    backdate_opened_at(&pool, destination_id).await;
    assert!(monitor.should_allow_delivery(destination_id, false).await.expect("probe admitted"));

    monitor.record_failure(destination_id).await.expect("probe fails");
    let health = monitor.get_health(destination_id).await.expect("get health").expect("health row exists");
    assert_eq!(health.state(), CircuitBreakerState::Open);
    assert!(health.circuit_breaker_opened_at.is_some());
}

#[sqlx::test]
#[test_log::test]
async fn a_stalled_half_open_probe_can_be_reclaimed(pool: PgPool) {
    let (_organization_id, destination_id) = common::create_destination(&pool).await;
    let monitor = HealthMonitor::new(pool.clone(), config());

    for _ in 0..3 {
        monitor.record_failure(destination_id).await.expect("record failure");
    }
    backdate_opened_at(&pool, destination_id).await;
    assert!(monitor.should_allow_delivery(destination_id, false).await.expect("first probe"));

    // Simulate the worker holding the first probe having crashed: its claim
    // timestamp is now old enough to be presumed lost.
    backdate_probe_at(&pool, destination_id).await;

    assert!(monitor.should_allow_delivery(destination_id, false).await.expect("reclaimed probe"), "a stalled probe should be reclaimable");
}
