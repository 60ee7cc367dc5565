//! Repository for `DeliveryLog` rows — the append-style audit trail keyed by
//! `delivery_id`. One row accumulates across every attempt for a given
//! delivery, independent of how many queue items / retries produced it.

use sqlx::PgConnection;

use crate::db::errors::{DbError, Result};
use crate::db::models::delivery_logs::{DeliveryLog, DeliveryLogAppend};
use crate::types::{DestinationId, OrganizationId};

pub struct DeliveryLogs<'c> {
    conn: &'c mut PgConnection,
}

impl<'c> DeliveryLogs<'c> {
    pub fn new(conn: &'c mut PgConnection) -> Self {
        Self { conn }
    }

    /// Upsert the log row for `delivery_id`: create it on the first attempt,
    /// otherwise bump `attempt_count` and the terminal fields.
    pub async fn append(&mut self, entry: &DeliveryLogAppend) -> Result<DeliveryLog> {
        let status = if entry.success { "delivered" } else { "failed" };

        let log = sqlx::query_as::<_, DeliveryLog>(
            r#"
            INSERT INTO delivery_logs (
                delivery_id, organization_id, destination_id, status, attempt_count,
                last_attempt_at, delivered_at, failure_reason, cross_system_reference
            )
            VALUES ($1, $2, $3, $4, 1, now(), CASE WHEN $5 THEN now() ELSE NULL END, $6, $7)
            ON CONFLICT (delivery_id) DO UPDATE SET
                status = EXCLUDED.status,
                attempt_count = delivery_logs.attempt_count + 1,
                last_attempt_at = now(),
                delivered_at = CASE WHEN $5 THEN now() ELSE delivery_logs.delivered_at END,
                failure_reason = EXCLUDED.failure_reason,
                cross_system_reference = COALESCE(EXCLUDED.cross_system_reference, delivery_logs.cross_system_reference),
                updated_at = now()
            RETURNING *
            "#,
        )
        .bind(&entry.delivery_id)
        .bind(entry.organization_id)
        .bind(entry.destination_id)
        .bind(status)
        .bind(entry.success)
        .bind(&entry.failure_reason)
        .bind(&entry.cross_system_reference)
        .fetch_one(&mut *self.conn)
        .await?;

        Ok(log)
    }

    pub async fn get(&mut self, delivery_id: &str) -> Result<DeliveryLog> {
        sqlx::query_as::<_, DeliveryLog>("SELECT * FROM delivery_logs WHERE delivery_id = $1")
            .bind(delivery_id)
            .fetch_optional(&mut *self.conn)
            .await?
            .ok_or(DbError::NotFound)
    }

    pub async fn find_by_destination(&mut self, destination_id: DestinationId, limit: i64) -> Result<Vec<DeliveryLog>> {
        let logs = sqlx::query_as::<_, DeliveryLog>(
            "SELECT * FROM delivery_logs WHERE destination_id = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(destination_id)
        .bind(limit)
        .fetch_all(&mut *self.conn)
        .await?;

        Ok(logs)
    }

    pub async fn find_by_org(&mut self, organization_id: OrganizationId, limit: i64) -> Result<Vec<DeliveryLog>> {
        let logs = sqlx::query_as::<_, DeliveryLog>(
            "SELECT * FROM delivery_logs WHERE organization_id = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(organization_id)
        .bind(limit)
        .fetch_all(&mut *self.conn)
        .await?;

        Ok(logs)
    }
}
