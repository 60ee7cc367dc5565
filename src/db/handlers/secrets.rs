//! Repository for `WebhookSecret` rows — supports rotation with overlap:
//! more than one `is_active` secret can exist per destination during the overlap
//! window, but at most one is `is_primary` (used for signing new deliveries).

use chrono::Utc;
use sqlx::PgConnection;
use uuid::Uuid;

use crate::db::errors::{DbError, Result};
use crate::db::models::secrets::{SecretCreateRequest, WebhookSecret};
use crate::types::{DestinationId, SecretId};

pub struct Secrets<'c> {
    conn: &'c mut PgConnection,
}

impl<'c> Secrets<'c> {
    pub fn new(conn: &'c mut PgConnection) -> Self {
        Self { conn }
    }

    pub async fn create(&mut self, request: &SecretCreateRequest) -> Result<WebhookSecret> {
        if request.is_primary {
            sqlx::query("UPDATE delivery_webhook_secrets SET is_primary = false WHERE destination_id = $1")
                .bind(request.destination_id)
                .execute(&mut *self.conn)
                .await?;
        }

        let secret = sqlx::query_as::<_, WebhookSecret>(
            r#"
            INSERT INTO delivery_webhook_secrets (id, destination_id, secret_ciphertext, algorithm, is_active, is_primary, expires_at)
            VALUES ($1, $2, $3, $4, true, $5, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(request.destination_id)
        .bind(&request.secret_ciphertext)
        .bind(&request.algorithm)
        .bind(request.is_primary)
        .bind(request.expires_at)
        .fetch_one(&mut *self.conn)
        .await?;

        Ok(secret)
    }

    pub async fn find_active_by_destination(&mut self, destination_id: DestinationId) -> Result<Vec<WebhookSecret>> {
        let secrets = sqlx::query_as::<_, WebhookSecret>(
            "SELECT * FROM delivery_webhook_secrets WHERE destination_id = $1 AND is_active = true ORDER BY is_primary DESC, created_at DESC",
        )
        .bind(destination_id)
        .fetch_all(&mut *self.conn)
        .await?;

        Ok(secrets)
    }

    pub async fn find_primary(&mut self, destination_id: DestinationId) -> Result<Option<WebhookSecret>> {
        let secret = sqlx::query_as::<_, WebhookSecret>(
            "SELECT * FROM delivery_webhook_secrets WHERE destination_id = $1 AND is_active = true AND is_primary = true",
        )
        .bind(destination_id)
        .fetch_optional(&mut *self.conn)
        .await?;

        Ok(secret)
    }

    pub async fn record_usage(&mut self, id: SecretId) -> Result<()> {
        sqlx::query("UPDATE delivery_webhook_secrets SET usage_count = usage_count + 1, last_used_at = $2 WHERE id = $1")
            .bind(id)
            .bind(Utc::now())
            .execute(&mut *self.conn)
            .await?;

        Ok(())
    }

    /// Deactivate a secret (end of its overlap window, or explicit revocation).
    pub async fn mark_inactive(&mut self, id: SecretId) -> Result<WebhookSecret> {
        let secret = sqlx::query_as::<_, WebhookSecret>(
            "UPDATE delivery_webhook_secrets SET is_active = false, is_primary = false, rotated_at = now() WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .fetch_optional(&mut *self.conn)
        .await?
        .ok_or(DbError::NotFound)?;

        Ok(secret)
    }

    /// Deactivate every active secret for a destination, e.g. before installing a
    /// bring-your-own-secret replacement that must be the sole active secret.
    pub async fn deactivate_all(&mut self, destination_id: DestinationId) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE delivery_webhook_secrets SET is_active = false, is_primary = false, rotated_at = now() WHERE destination_id = $1 AND is_active = true",
        )
        .bind(destination_id)
        .execute(&mut *self.conn)
        .await?;

        Ok(result.rows_affected())
    }

    /// Deactivate every secret whose overlap period has expired.
    pub async fn cleanup_expired(&mut self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE delivery_webhook_secrets SET is_active = false, is_primary = false, rotated_at = now() WHERE is_active = true AND expires_at IS NOT NULL AND expires_at <= now()",
        )
        .execute(&mut *self.conn)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn count_active(&mut self, destination_id: DestinationId) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM delivery_webhook_secrets WHERE destination_id = $1 AND is_active = true",
        )
        .bind(destination_id)
        .fetch_one(&mut *self.conn)
        .await?;

        Ok(count)
    }
}
