//! Health Monitor & Circuit Breaker: the per-destination finite-state machine
//! that decides whether deliveries should be attempted at all.

use chrono::{Duration as ChronoDuration, Utc};
use sqlx::PgPool;

use crate::config::CircuitBreakerConfig;
use crate::db::errors::DbError;
use crate::db::handlers::Health as HealthRepo;
use crate::db::models::health::{CircuitBreakerState, DestinationHealth, HealthStatus};
use crate::errors::Result;
use crate::types::DestinationId;

pub struct HealthMonitor {
    pool: PgPool,
    config: CircuitBreakerConfig,
}

impl HealthMonitor {
    pub fn new(pool: PgPool, config: CircuitBreakerConfig) -> Self {
        Self { pool, config }
    }

    /// `false` iff the destination is disabled, its circuit is `open` and the
    /// recovery timeout has not yet elapsed, or its circuit is `half_open` and a
    /// probe is already outstanding. An `open` circuit past the recovery timeout
    /// transitions to `half_open` and allows exactly the probe that triggered this
    /// check through (the `UPDATE ... WHERE state = 'open'` in `try_half_open`
    /// only matches once); a `half_open` circuit admits exactly one in-flight
    /// probe at a time via `try_claim_half_open_probe`, so concurrent claims to
    /// the same half-open destination don't all slip through before the probe's
    /// outcome closes or reopens the breaker.
    pub async fn should_allow_delivery(&self, destination_id: DestinationId, destination_disabled: bool) -> Result<bool> {
        if destination_disabled {
            return Ok(false);
        }

        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let mut repo = HealthRepo::new(&mut conn);
        let health = repo.get_or_create(destination_id).await?;

        match health.state() {
            CircuitBreakerState::Closed => Ok(true),
            CircuitBreakerState::Open => {
                let cutoff = Utc::now() - chrono_duration(self.config.recovery_timeout);
                let transitioned = repo.try_half_open(destination_id, cutoff).await?;
                Ok(transitioned.is_some())
            }
            CircuitBreakerState::HalfOpen => {
                let stall_cutoff = Utc::now() - chrono_duration(self.config.recovery_timeout);
                let claimed = repo.try_claim_half_open_probe(destination_id, stall_cutoff).await?;
                Ok(claimed.is_some())
            }
        }
    }

    pub async fn record_success(&self, destination_id: DestinationId, response_time_ms: f64) -> Result<DestinationHealth> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let mut repo = HealthRepo::new(&mut conn);
        let health = repo.record_success(destination_id, response_time_ms).await?;
        Ok(health)
    }

    pub async fn record_failure(&self, destination_id: DestinationId) -> Result<DestinationHealth> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let mut repo = HealthRepo::new(&mut conn);
        let current = repo.get_or_create(destination_id).await?;

        let should_open = match current.state() {
            CircuitBreakerState::HalfOpen => true,
            CircuitBreakerState::Open => true,
            CircuitBreakerState::Closed => current.consecutive_failures + 1 >= self.config.failure_threshold as i32,
        };

        let new_total_deliveries = current.total_deliveries + 1;
        let new_total_failures = current.total_failures + 1;
        let success_rate = 1.0 - (new_total_failures as f64 / new_total_deliveries as f64);
        let status = derive_status(success_rate, new_total_deliveries).as_str();

        let health = repo.record_failure(destination_id, should_open, status).await?;
        Ok(health)
    }

    /// Combined entry point matching the spec's named operation: dispatches to
    /// `record_success`/`record_failure` based on outcome.
    pub async fn update_circuit_breaker_state(&self, destination_id: DestinationId, success: bool, response_time_ms: Option<f64>) -> Result<DestinationHealth> {
        if success {
            self.record_success(destination_id, response_time_ms.unwrap_or(0.0)).await
        } else {
            self.record_failure(destination_id).await
        }
    }

    pub async fn get_health(&self, destination_id: DestinationId) -> Result<Option<DestinationHealth>> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let mut repo = HealthRepo::new(&mut conn);
        let health = repo.get(destination_id).await?;
        Ok(health)
    }

    pub async fn find_unhealthy(&self) -> Result<Vec<DestinationHealth>> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let mut repo = HealthRepo::new(&mut conn);
        let rows = repo.find_unhealthy().await?;
        Ok(rows)
    }
}

fn chrono_duration(d: std::time::Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or(ChronoDuration::seconds(30))
}

/// `healthy` (>= 95% success), `degraded` (>= 70%), otherwise `unhealthy`.
/// A destination with zero recorded deliveries is `healthy` by default: there is
/// no evidence of trouble yet.
fn derive_status(success_rate: f64, total_deliveries: i64) -> HealthStatus {
    if total_deliveries == 0 {
        return HealthStatus::Healthy;
    }
    if success_rate >= 0.95 {
        HealthStatus::Healthy
    } else if success_rate >= 0.70 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Unhealthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_healthy_above_95_percent() {
        assert_eq!(derive_status(0.99, 100), HealthStatus::Healthy);
        assert_eq!(derive_status(0.95, 100), HealthStatus::Healthy);
    }

    #[test]
    fn derives_degraded_between_70_and_95_percent() {
        assert_eq!(derive_status(0.80, 100), HealthStatus::Degraded);
        assert_eq!(derive_status(0.70, 100), HealthStatus::Degraded);
    }

    #[test]
    fn derives_unhealthy_below_70_percent() {
        assert_eq!(derive_status(0.50, 100), HealthStatus::Unhealthy);
    }

    #[test]
    fn no_deliveries_defaults_healthy() {
        assert_eq!(derive_status(1.0, 0), HealthStatus::Healthy);
    }
}
