//! Repository for `DownloadLink` rows and their per-access audit log.

use chrono::Utc;
use sqlx::PgConnection;
use uuid::Uuid;

use crate::db::errors::{DbError, Result};
use crate::db::models::download_links::{DownloadLink, DownloadLinkAccess, DownloadLinkCreateRequest};
use crate::types::{DownloadLinkId, OrganizationId};

pub struct DownloadLinks<'c> {
    conn: &'c mut PgConnection,
}

impl<'c> DownloadLinks<'c> {
    pub fn new(conn: &'c mut PgConnection) -> Self {
        Self { conn }
    }

    pub async fn create(&mut self, request: &DownloadLinkCreateRequest) -> Result<DownloadLink> {
        let link = sqlx::query_as::<_, DownloadLink>(
            r#"
            INSERT INTO delivery_download_links (id, organization_id, object_type, file_name, file_size, expires_at, max_access)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(request.organization_id)
        .bind(&request.object_type)
        .bind(&request.file_name)
        .bind(request.file_size)
        .bind(request.expires_at)
        .bind(request.max_access)
        .fetch_one(&mut *self.conn)
        .await?;

        Ok(link)
    }

    pub async fn get_by_id(&mut self, id: DownloadLinkId) -> Result<Option<DownloadLink>> {
        let link = sqlx::query_as::<_, DownloadLink>("SELECT * FROM delivery_download_links WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.conn)
            .await?;

        Ok(link)
    }

    /// Atomically bump `access_count` if the link is still active, not expired,
    /// and under `max_access`. Returns `None` when the access must be rejected,
    /// so the caller can tell which invariant failed by re-reading the row.
    pub async fn try_consume_access(&mut self, id: DownloadLinkId) -> Result<Option<DownloadLink>> {
        let link = sqlx::query_as::<_, DownloadLink>(
            r#"
            UPDATE delivery_download_links
            SET access_count = access_count + 1
            WHERE id = $1
              AND is_active = true
              AND expires_at > now()
              AND access_count < max_access
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.conn)
        .await?;

        Ok(link)
    }

    pub async fn record_access(
        &mut self,
        link_id: DownloadLinkId,
        success: bool,
        user_id: Option<&str>,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<DownloadLinkAccess> {
        let access = sqlx::query_as::<_, DownloadLinkAccess>(
            r#"
            INSERT INTO delivery_download_link_accesses (link_id, success, user_id, ip, user_agent)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(link_id)
        .bind(success)
        .bind(user_id)
        .bind(ip)
        .bind(user_agent)
        .fetch_one(&mut *self.conn)
        .await?;

        Ok(access)
    }

    pub async fn revoke(&mut self, id: DownloadLinkId, reason: &str) -> Result<DownloadLink> {
        let link = sqlx::query_as::<_, DownloadLink>(
            "UPDATE delivery_download_links SET is_active = false, revoked_at = now(), revoked_reason = $2 WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(reason)
        .fetch_optional(&mut *self.conn)
        .await?
        .ok_or(DbError::NotFound)?;

        Ok(link)
    }

    pub async fn cleanup_expired(&mut self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE delivery_download_links SET is_active = false, revoked_reason = 'expired' WHERE is_active = true AND expires_at <= now()",
        )
        .execute(&mut *self.conn)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn access_stats(&mut self, link_id: DownloadLinkId) -> Result<Vec<DownloadLinkAccess>> {
        let accesses = sqlx::query_as::<_, DownloadLinkAccess>(
            "SELECT * FROM delivery_download_link_accesses WHERE link_id = $1 ORDER BY accessed_at DESC",
        )
        .bind(link_id)
        .fetch_all(&mut *self.conn)
        .await?;

        Ok(accesses)
    }

    pub async fn find_by_org(&mut self, organization_id: OrganizationId) -> Result<Vec<DownloadLink>> {
        let links = sqlx::query_as::<_, DownloadLink>(
            "SELECT * FROM delivery_download_links WHERE organization_id = $1 ORDER BY created_at DESC",
        )
        .bind(organization_id)
        .fetch_all(&mut *self.conn)
        .await?;

        Ok(links)
    }

    /// Record and update in one call: used by the Download Manager's
    /// `validate_access` → `record_access` flow.
    pub async fn consume_and_log(
        &mut self,
        id: DownloadLinkId,
        user_id: Option<&str>,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<Option<DownloadLink>> {
        let link = self.try_consume_access(id).await?;
        self.record_access(id, link.is_some(), user_id, ip, user_agent).await?;
        Ok(link)
    }
}
