//! `DownloadLink` and per-access records.

use chrono::{DateTime, Utc};

use crate::types::{DownloadLinkId, OrganizationId};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DownloadLink {
    pub id: DownloadLinkId,
    pub organization_id: OrganizationId,
    pub object_type: String,
    pub file_name: String,
    pub file_size: i64,
    pub expires_at: DateTime<Utc>,
    pub max_access: i32,
    pub access_count: i32,
    pub is_active: bool,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoked_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DownloadLinkCreateRequest {
    pub organization_id: OrganizationId,
    pub object_type: String,
    pub file_name: String,
    pub file_size: i64,
    pub expires_at: DateTime<Utc>,
    pub max_access: i32,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DownloadLinkAccess {
    pub id: i64,
    pub link_id: DownloadLinkId,
    pub success: bool,
    pub user_id: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub accessed_at: DateTime<Utc>,
}
