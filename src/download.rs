//! Download Manager: access validation and analytics for `download`-kind
//! destinations' time-limited links. Delivery itself (minting the link row)
//! happens through [`crate::handlers::storage::DownloadLinkCreator`]; this
//! module is the read/audit side plus the background cleanup sweep.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::config::DownloadLinkConfig;
use crate::db::errors::DbError;
use crate::db::handlers::DownloadLinks;
use crate::db::models::download_links::{DownloadLink, DownloadLinkAccess, DownloadLinkCreateRequest};
use crate::errors::Result;
use crate::handlers::storage::DownloadLinkCreator;
use crate::handlers::DeliveryEnvelope;
use crate::types::{DownloadLinkId, OrganizationId};

#[derive(Debug, Clone, Serialize)]
pub struct AccessValidation {
    pub allowed: bool,
    pub reason: Option<String>,
    pub remaining_access: Option<i32>,
    pub time_until_expiry_secs: Option<i64>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ObjectTypeCount {
    pub object_type: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DailyCount {
    pub day: NaiveDate,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct HourlyCount {
    pub hour: DateTime<Utc>,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AgentCount {
    pub user_agent: Option<String>,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct IpCount {
    pub ip: Option<String>,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadAnalytics {
    pub total_links: i64,
    pub total_accesses: i64,
    pub unique_users: i64,
    pub top_object_types: Vec<ObjectTypeCount>,
    pub daily_histogram: Vec<DailyCount>,
    pub recent_activity: Vec<DownloadLinkAccess>,
}

#[derive(Debug, Clone, Default)]
pub struct AnalyticsFilter {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub object_type: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkStats {
    pub link_id: DownloadLinkId,
    pub hourly: Vec<HourlyCount>,
    pub daily: Vec<DailyCount>,
    pub top_user_agents: Vec<AgentCount>,
    pub top_ips: Vec<IpCount>,
    pub success_rate: f64,
}

pub struct DownloadManager {
    pool: PgPool,
    config: DownloadLinkConfig,
}

impl DownloadManager {
    pub fn new(pool: PgPool, config: DownloadLinkConfig) -> Self {
        Self { pool, config }
    }

    pub async fn create_link(&self, request: &DownloadLinkCreateRequest) -> Result<DownloadLink> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let mut repo = DownloadLinks::new(&mut conn);
        Ok(repo.create(request).await?)
    }

    /// Validates and atomically consumes one access slot, recording the
    /// attempt (success or failure) either way.
    pub async fn validate_access(&self, link_id: DownloadLinkId, user_id: Option<&str>, ip: Option<&str>, user_agent: Option<&str>) -> Result<AccessValidation> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let mut repo = DownloadLinks::new(&mut conn);

        let Some(existing) = repo.get_by_id(link_id).await? else {
            return Ok(AccessValidation {
                allowed: false,
                reason: Some("link not found".to_string()),
                remaining_access: None,
                time_until_expiry_secs: None,
            });
        };

        let consumed = repo.consume_and_log(link_id, user_id, ip, user_agent).await?;
        Ok(match consumed {
            Some(link) => AccessValidation {
                allowed: true,
                reason: None,
                remaining_access: Some((link.max_access - link.access_count).max(0)),
                time_until_expiry_secs: Some((link.expires_at - Utc::now()).num_seconds().max(0)),
            },
            None => AccessValidation {
                allowed: false,
                reason: Some(denial_reason(&existing)),
                remaining_access: Some((existing.max_access - existing.access_count).max(0)),
                time_until_expiry_secs: None,
            },
        })
    }

    /// Record an access attempt outside the `validate_access` flow (e.g. a
    /// caller that already validated by other means).
    pub async fn record_access(&self, link_id: DownloadLinkId, success: bool, user_id: Option<&str>, ip: Option<&str>, user_agent: Option<&str>) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let mut repo = DownloadLinks::new(&mut conn);
        repo.record_access(link_id, success, user_id, ip, user_agent).await?;
        Ok(())
    }

    pub async fn get_analytics(&self, organization_id: OrganizationId, filter: &AnalyticsFilter) -> Result<DownloadAnalytics> {
        let start = filter.start.unwrap_or_else(|| Utc::now() - ChronoDuration::days(30));
        let end = filter.end.unwrap_or_else(Utc::now);

        let total_links: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM delivery_download_links WHERE organization_id = $1 AND created_at BETWEEN $2 AND $3 AND ($4::text IS NULL OR object_type = $4)",
        )
        .bind(organization_id)
        .bind(start)
        .bind(end)
        .bind(&filter.object_type)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::from)?;

        let total_accesses: i64 = sqlx::query_scalar(
            r#"
            SELECT count(*) FROM delivery_download_link_accesses a
            JOIN delivery_download_links l ON l.id = a.link_id
            WHERE l.organization_id = $1 AND a.accessed_at BETWEEN $2 AND $3 AND ($4::text IS NULL OR l.object_type = $4)
            "#,
        )
        .bind(organization_id)
        .bind(start)
        .bind(end)
        .bind(&filter.object_type)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::from)?;

        let unique_users: i64 = sqlx::query_scalar(
            r#"
            SELECT count(DISTINCT a.user_id) FROM delivery_download_link_accesses a
            JOIN delivery_download_links l ON l.id = a.link_id
            WHERE l.organization_id = $1 AND a.accessed_at BETWEEN $2 AND $3 AND ($4::text IS NULL OR l.object_type = $4)
            "#,
        )
        .bind(organization_id)
        .bind(start)
        .bind(end)
        .bind(&filter.object_type)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::from)?;

        let top_object_types = sqlx::query_as::<_, ObjectTypeCount>(
            r#"
            SELECT object_type, count(*) as count FROM delivery_download_links
            WHERE organization_id = $1 AND created_at BETWEEN $2 AND $3
            GROUP BY object_type ORDER BY count DESC LIMIT 10
            "#,
        )
        .bind(organization_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        let daily_histogram = sqlx::query_as::<_, DailyCount>(
            r#"
            SELECT date_trunc('day', a.accessed_at)::date as day, count(*) as count
            FROM delivery_download_link_accesses a
            JOIN delivery_download_links l ON l.id = a.link_id
            WHERE l.organization_id = $1 AND a.accessed_at >= now() - interval '30 days'
            GROUP BY day ORDER BY day ASC
            "#,
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        let recent_activity = sqlx::query_as::<_, DownloadLinkAccess>(
            r#"
            SELECT a.* FROM delivery_download_link_accesses a
            JOIN delivery_download_links l ON l.id = a.link_id
            WHERE l.organization_id = $1
            ORDER BY a.accessed_at DESC LIMIT 50
            "#,
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(DownloadAnalytics {
            total_links,
            total_accesses,
            unique_users,
            top_object_types,
            daily_histogram,
            recent_activity,
        })
    }

    pub async fn get_link_stats(&self, link_id: DownloadLinkId) -> Result<LinkStats> {
        let hourly = sqlx::query_as::<_, HourlyCount>(
            r#"
            SELECT date_trunc('hour', accessed_at) as hour, count(*) as count
            FROM delivery_download_link_accesses
            WHERE link_id = $1 AND accessed_at >= now() - interval '24 hours'
            GROUP BY hour ORDER BY hour ASC
            "#,
        )
        .bind(link_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        let daily = sqlx::query_as::<_, DailyCount>(
            r#"
            SELECT date_trunc('day', accessed_at)::date as day, count(*) as count
            FROM delivery_download_link_accesses
            WHERE link_id = $1 AND accessed_at >= now() - interval '30 days'
            GROUP BY day ORDER BY day ASC
            "#,
        )
        .bind(link_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        let top_user_agents = sqlx::query_as::<_, AgentCount>(
            "SELECT user_agent, count(*) as count FROM delivery_download_link_accesses WHERE link_id = $1 GROUP BY user_agent ORDER BY count DESC LIMIT 10",
        )
        .bind(link_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        let top_ips = sqlx::query_as::<_, IpCount>(
            "SELECT ip, count(*) as count FROM delivery_download_link_accesses WHERE link_id = $1 GROUP BY ip ORDER BY count DESC LIMIT 10",
        )
        .bind(link_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        let (successes, total): (i64, i64) = sqlx::query_as(
            "SELECT count(*) FILTER (WHERE success), count(*) FROM delivery_download_link_accesses WHERE link_id = $1",
        )
        .bind(link_id)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::from)?;

        let success_rate = if total == 0 { 1.0 } else { successes as f64 / total as f64 };

        Ok(LinkStats {
            link_id,
            hourly,
            daily,
            top_user_agents,
            top_ips,
            success_rate,
        })
    }

    /// Deactivates expired/inactive links and returns the total `file_size`
    /// freed. Intended to run on `config.cleanup_interval`.
    pub async fn cleanup_expired_links(&self) -> Result<i64> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        let bytes_freed: Option<i64> = sqlx::query_scalar(
            "SELECT sum(file_size) FROM delivery_download_links WHERE is_active = true AND expires_at <= now()",
        )
        .fetch_one(&mut *tx)
        .await
        .map_err(DbError::from)?;

        sqlx::query("UPDATE delivery_download_links SET is_active = false, revoked_reason = 'expired' WHERE is_active = true AND expires_at <= now()")
            .execute(&mut *tx)
            .await
            .map_err(DbError::from)?;

        tx.commit().await.map_err(DbError::from)?;
        Ok(bytes_freed.unwrap_or(0))
    }

    pub fn cleanup_interval(&self) -> std::time::Duration {
        self.config.cleanup_interval
    }

    pub fn default_ttl_seconds(&self) -> i64 {
        self.config.default_ttl_seconds
    }

    pub fn default_max_access(&self) -> i32 {
        self.config.default_max_access
    }
}

fn denial_reason(link: &DownloadLink) -> String {
    if !link.is_active {
        "link revoked".to_string()
    } else if link.expires_at <= Utc::now() {
        "link expired".to_string()
    } else if link.access_count >= link.max_access {
        "max access count reached".to_string()
    } else {
        "access denied".to_string()
    }
}

#[async_trait]
impl DownloadLinkCreator for DownloadManager {
    async fn create_link(&self, _destination_id: Uuid, envelope: &DeliveryEnvelope, ttl_seconds: i64, max_access: Option<i32>) -> std::result::Result<String, String> {
        let body = serde_json::to_vec(envelope).map_err(|e| e.to_string())?;
        let request = DownloadLinkCreateRequest {
            organization_id: envelope.organization_id,
            object_type: envelope.kind.clone(),
            file_name: format!("{}.json", envelope.delivery_id),
            file_size: body.len() as i64,
            expires_at: Utc::now() + ChronoDuration::seconds(ttl_seconds),
            max_access: max_access.unwrap_or(self.default_max_access()),
        };
        let link = self.create_link(&request).await.map_err(|e| e.to_string())?;
        Ok(link.id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(is_active: bool, expires_at: DateTime<Utc>, access_count: i32, max_access: i32) -> DownloadLink {
        DownloadLink {
            id: Uuid::nil(),
            organization_id: Uuid::nil(),
            object_type: "audit.event".to_string(),
            file_name: "f.json".to_string(),
            file_size: 10,
            expires_at,
            max_access,
            access_count,
            is_active,
            revoked_at: None,
            revoked_reason: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn denial_reason_prioritizes_revocation() {
        let l = link(false, Utc::now() + ChronoDuration::hours(1), 0, 5);
        assert_eq!(denial_reason(&l), "link revoked");
    }

    #[test]
    fn denial_reason_detects_expiry() {
        let l = link(true, Utc::now() - ChronoDuration::hours(1), 0, 5);
        assert_eq!(denial_reason(&l), "link expired");
    }

    #[test]
    fn denial_reason_detects_access_exhaustion() {
        let l = link(true, Utc::now() + ChronoDuration::hours(1), 5, 5);
        assert_eq!(denial_reason(&l), "max access count reached");
    }
}
