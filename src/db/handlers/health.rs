//! Repository for `DestinationHealth` rows — the circuit breaker's durable state.
//! A row is created lazily on first attempt; all transitions happen in-place so
//! readers always see a consistent snapshot.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;

use crate::db::errors::Result;
use crate::db::models::health::DestinationHealth;
use crate::types::DestinationId;

pub struct Health<'c> {
    conn: &'c mut PgConnection,
}

impl<'c> Health<'c> {
    pub fn new(conn: &'c mut PgConnection) -> Self {
        Self { conn }
    }

    /// Fetch the row, creating a fresh `closed`/`healthy` one if this destination
    /// has never recorded an attempt.
    pub async fn get_or_create(&mut self, destination_id: DestinationId) -> Result<DestinationHealth> {
        let health = sqlx::query_as::<_, DestinationHealth>(
            r#"
            INSERT INTO delivery_destination_health (destination_id)
            VALUES ($1)
            ON CONFLICT (destination_id) DO UPDATE SET destination_id = EXCLUDED.destination_id
            RETURNING *
            "#,
        )
        .bind(destination_id)
        .fetch_one(&mut *self.conn)
        .await?;

        Ok(health)
    }

    pub async fn get(&mut self, destination_id: DestinationId) -> Result<Option<DestinationHealth>> {
        let health = sqlx::query_as::<_, DestinationHealth>("SELECT * FROM delivery_destination_health WHERE destination_id = $1")
            .bind(destination_id)
            .fetch_optional(&mut *self.conn)
            .await?;

        Ok(health)
    }

    /// Record a successful delivery: resets `consecutive_failures`, folds the
    /// response time into the running average, closes the circuit if it was
    /// `half_open`.
    pub async fn record_success(&mut self, destination_id: DestinationId, response_time_ms: f64) -> Result<DestinationHealth> {
        let health = sqlx::query_as::<_, DestinationHealth>(
            r#"
            UPDATE delivery_destination_health
            SET
                consecutive_failures = 0,
                total_deliveries = total_deliveries + 1,
                average_response_time_ms = (average_response_time_ms * total_deliveries + $2) / (total_deliveries + 1),
                circuit_breaker_state = 'closed',
                circuit_breaker_opened_at = NULL,
                half_open_probe_at = NULL,
                status = 'healthy',
                updated_at = now()
            WHERE destination_id = $1
            RETURNING *
            "#,
        )
        .bind(destination_id)
        .bind(response_time_ms)
        .fetch_one(&mut *self.conn)
        .await?;

        Ok(health)
    }

    /// Record a failed delivery: bumps both failure counters and, when
    /// `open_circuit` is true (caller already decided the threshold was crossed),
    /// flips the breaker to `open` and stamps `circuit_breaker_opened_at`.
    pub async fn record_failure(&mut self, destination_id: DestinationId, open_circuit: bool, status: &str) -> Result<DestinationHealth> {
        let health = sqlx::query_as::<_, DestinationHealth>(
            r#"
            UPDATE delivery_destination_health
            SET
                consecutive_failures = consecutive_failures + 1,
                total_failures = total_failures + 1,
                total_deliveries = total_deliveries + 1,
                last_failure_at = now(),
                circuit_breaker_state = CASE WHEN $2 THEN 'open' ELSE circuit_breaker_state END,
                circuit_breaker_opened_at = CASE WHEN $2 THEN now() ELSE circuit_breaker_opened_at END,
                half_open_probe_at = CASE WHEN $2 THEN NULL ELSE half_open_probe_at END,
                status = $3,
                updated_at = now()
            WHERE destination_id = $1
            RETURNING *
            "#,
        )
        .bind(destination_id)
        .bind(open_circuit)
        .bind(status)
        .fetch_one(&mut *self.conn)
        .await?;

        Ok(health)
    }

    /// Transition `open` to `half_open` once `recovery_timeout` has elapsed. The
    /// call that performs the transition also claims the single probe slot (sets
    /// `half_open_probe_at`), since it is itself the admitted probe; a concurrent
    /// caller that instead observes the row already `half_open` must go through
    /// `try_claim_half_open_probe`, which will find the slot occupied.
    pub async fn try_half_open(&mut self, destination_id: DestinationId, opened_before: DateTime<Utc>) -> Result<Option<DestinationHealth>> {
        let health = sqlx::query_as::<_, DestinationHealth>(
            r#"
            UPDATE delivery_destination_health
            SET circuit_breaker_state = 'half_open', half_open_probe_at = now(), updated_at = now()
            WHERE destination_id = $1 AND circuit_breaker_state = 'open' AND circuit_breaker_opened_at <= $2
            RETURNING *
            "#,
        )
        .bind(destination_id)
        .bind(opened_before)
        .fetch_optional(&mut *self.conn)
        .await?;

        Ok(health)
    }

    /// Atomically claim the single in-flight probe slot for a `half_open`
    /// destination. Returns `None` if the state is not `half_open` or a probe is
    /// already outstanding and not yet past `stall_cutoff` (the point at which an
    /// outstanding probe is presumed lost and may be retried).
    pub async fn try_claim_half_open_probe(&mut self, destination_id: DestinationId, stall_cutoff: DateTime<Utc>) -> Result<Option<DestinationHealth>> {
        let health = sqlx::query_as::<_, DestinationHealth>(
            r#"
            UPDATE delivery_destination_health
            SET half_open_probe_at = now(), updated_at = now()
            WHERE destination_id = $1
              AND circuit_breaker_state = 'half_open'
              AND (half_open_probe_at IS NULL OR half_open_probe_at <= $2)
            RETURNING *
            "#,
        )
        .bind(destination_id)
        .bind(stall_cutoff)
        .fetch_optional(&mut *self.conn)
        .await?;

        Ok(health)
    }

    pub async fn find_unhealthy(&mut self) -> Result<Vec<DestinationHealth>> {
        let rows = sqlx::query_as::<_, DestinationHealth>(
            "SELECT * FROM delivery_destination_health WHERE status IN ('degraded', 'unhealthy') ORDER BY updated_at DESC",
        )
        .fetch_all(&mut *self.conn)
        .await?;

        Ok(rows)
    }
}
