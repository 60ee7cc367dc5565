//! Repository for `QueueItem` rows — the durable delivery queue.
//!
//! `claim_ready` is the core concurrency primitive: it atomically selects and marks
//! a batch of eligible rows as `processing` using `FOR UPDATE SKIP LOCKED`, so
//! concurrent workers (in this process or another replica) never claim the same
//! row twice. The query also joins the owning destination so the processor gets
//! everything it needs to dispatch in one round trip.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgConnection;
use uuid::Uuid;

use crate::db::errors::{DbError, Result};
use crate::db::models::queue::{ClaimedQueueItem, QueueEnqueueRequest, QueueItem, QueueStatus};
use crate::types::{DestinationId, OrganizationId, QueueItemId};

pub struct Queue<'c> {
    conn: &'c mut PgConnection,
}

/// Outcome of [`Queue::enqueue`]: distinguishes a fresh row from one returned
/// because of an idempotency-key collision (`DUPLICATE_IDEMPOTENCY_KEY`).
pub enum EnqueueOutcome {
    Created(QueueItem),
    Duplicate(QueueItem),
}

impl EnqueueOutcome {
    pub fn into_item(self) -> QueueItem {
        match self {
            EnqueueOutcome::Created(item) | EnqueueOutcome::Duplicate(item) => item,
        }
    }
}

impl<'c> Queue<'c> {
    pub fn new(conn: &'c mut PgConnection) -> Self {
        Self { conn }
    }

    /// Insert a new queue row, or return the existing non-terminal row sharing the
    /// same `(organization_id, destination_id, idempotency_key)` (testable property
    /// 1: idempotent enqueue).
    pub async fn enqueue(&mut self, request: &QueueEnqueueRequest) -> Result<EnqueueOutcome> {
        let inserted = sqlx::query_as::<_, QueueItem>(
            r#"
            INSERT INTO delivery_queue_items (
                id, organization_id, destination_id, delivery_id, correlation_id,
                idempotency_key, kind, payload, priority, status, scheduled_at,
                next_retry_at, processed_at, retry_count, max_retries, metadata
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, 'pending', $10,
                NULL, NULL, 0, $11, '{}'::jsonb
            )
            ON CONFLICT (organization_id, destination_id, idempotency_key)
                WHERE idempotency_key IS NOT NULL AND status <> 'failed'
            DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(request.organization_id)
        .bind(request.destination_id)
        .bind(&request.delivery_id)
        .bind(&request.correlation_id)
        .bind(&request.idempotency_key)
        .bind(&request.kind)
        .bind(sqlx::types::Json(&request.payload))
        .bind(request.priority)
        .bind(request.scheduled_at)
        .bind(request.max_retries)
        .fetch_optional(&mut *self.conn)
        .await?;

        if let Some(item) = inserted {
            return Ok(EnqueueOutcome::Created(item));
        }

        let existing = sqlx::query_as::<_, QueueItem>(
            r#"
            SELECT * FROM delivery_queue_items
            WHERE organization_id = $1 AND destination_id = $2 AND idempotency_key = $3 AND status <> 'failed'
            "#,
        )
        .bind(request.organization_id)
        .bind(request.destination_id)
        .bind(&request.idempotency_key)
        .fetch_one(&mut *self.conn)
        .await?;

        Ok(EnqueueOutcome::Duplicate(existing))
    }

    /// Atomically claim up to `batch_size` eligible rows, ordered by
    /// `(priority DESC, scheduled_at ASC)`, and transition them to `processing`.
    pub async fn claim_ready(&mut self, batch_size: i64) -> Result<Vec<ClaimedQueueItem>> {
        let claimed = sqlx::query_as::<_, ClaimedQueueItem>(
            r#"
            WITH candidates AS (
                SELECT id FROM delivery_queue_items
                WHERE status = 'pending'
                  AND scheduled_at <= now()
                  AND (next_retry_at IS NULL OR next_retry_at <= now())
                ORDER BY priority DESC, scheduled_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            ),
            updated AS (
                UPDATE delivery_queue_items q
                SET status = 'processing', processed_at = now(), updated_at = now()
                FROM candidates
                WHERE q.id = candidates.id
                RETURNING q.*
            )
            SELECT u.*, d.config AS destination_config, d.disabled AS destination_disabled
            FROM updated u
            JOIN delivery_destinations d ON d.id = u.destination_id
            "#,
        )
        .bind(batch_size)
        .fetch_all(&mut *self.conn)
        .await?;

        Ok(claimed)
    }

    /// Mark a row `completed` after a successful delivery attempt.
    pub async fn mark_completed(&mut self, id: QueueItemId) -> Result<()> {
        sqlx::query("UPDATE delivery_queue_items SET status = 'completed', updated_at = now() WHERE id = $1")
            .bind(id)
            .execute(&mut *self.conn)
            .await?;

        Ok(())
    }

    /// Reschedule a row for retry at `next_retry_at`, recording the incremented
    /// `retry_count` and appending `attempt_metadata` into `metadata.retry_attempts`.
    pub async fn schedule_retry(&mut self, id: QueueItemId, next_retry_at: DateTime<Utc>, attempt_metadata: Value) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE delivery_queue_items
            SET
                status = 'pending',
                retry_count = retry_count + 1,
                next_retry_at = $2,
                metadata = jsonb_set(
                    metadata,
                    '{retry_attempts}',
                    COALESCE(metadata->'retry_attempts', '[]'::jsonb) || $3::jsonb
                ),
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(next_retry_at)
        .bind(sqlx::types::Json(attempt_metadata))
        .execute(&mut *self.conn)
        .await?;

        Ok(())
    }

    /// Mark a row `failed` (terminal), recording `failure_reason` and whether the
    /// cause was classified non-retryable.
    pub async fn mark_failed(&mut self, id: QueueItemId, non_retryable: bool, attempt_metadata: Value) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE delivery_queue_items
            SET
                status = 'failed',
                metadata = jsonb_set(
                    jsonb_set(metadata, '{non_retryable}', to_jsonb($2::bool)),
                    '{retry_attempts}',
                    COALESCE(metadata->'retry_attempts', '[]'::jsonb) || $3::jsonb
                ),
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(non_retryable)
        .bind(sqlx::types::Json(attempt_metadata))
        .execute(&mut *self.conn)
        .await?;

        Ok(())
    }

    /// Reschedule without recording an attempt (used when the circuit breaker is
    /// open — "no attempt recorded").
    pub async fn reschedule_without_attempt(&mut self, id: QueueItemId, next_retry_at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE delivery_queue_items SET status = 'pending', next_retry_at = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(next_retry_at)
            .execute(&mut *self.conn)
            .await?;

        Ok(())
    }

    pub async fn find_by_delivery_id(&mut self, organization_id: OrganizationId, delivery_id: &str) -> Result<Option<QueueItem>> {
        let item = sqlx::query_as::<_, QueueItem>("SELECT * FROM delivery_queue_items WHERE organization_id = $1 AND delivery_id = $2")
            .bind(organization_id)
            .bind(delivery_id)
            .fetch_optional(&mut *self.conn)
            .await?;

        Ok(item)
    }

    pub async fn find_by_status(&mut self, organization_id: OrganizationId, status: QueueStatus) -> Result<Vec<QueueItem>> {
        let items = sqlx::query_as::<_, QueueItem>(
            "SELECT * FROM delivery_queue_items WHERE organization_id = $1 AND status = $2 ORDER BY created_at DESC",
        )
        .bind(organization_id)
        .bind(status.as_str())
        .fetch_all(&mut *self.conn)
        .await?;

        Ok(items)
    }

    /// Crash recovery sweep: rows left in `processing` past the
    /// visibility timeout are assumed abandoned by a dead worker and returned to
    /// `pending` so they can be re-claimed.
    pub async fn reclaim_stale_processing(&mut self, visibility_timeout_secs: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_queue_items
            SET status = 'pending', updated_at = now()
            WHERE status = 'processing'
              AND processed_at < now() - make_interval(secs => $1)
            "#,
        )
        .bind(visibility_timeout_secs as f64)
        .execute(&mut *self.conn)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn get_by_id(&mut self, id: QueueItemId) -> Result<QueueItem> {
        sqlx::query_as::<_, QueueItem>("SELECT * FROM delivery_queue_items WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.conn)
            .await?
            .ok_or(DbError::NotFound)
    }

    pub async fn destination_has_active_items(&mut self, destination_id: DestinationId) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM delivery_queue_items WHERE destination_id = $1 AND status IN ('pending', 'processing')",
        )
        .bind(destination_id)
        .fetch_one(&mut *self.conn)
        .await?;

        Ok(count > 0)
    }
}
