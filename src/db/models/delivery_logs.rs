//! `DeliveryLog` records — append-style audit trail per delivery id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{DestinationId, OrganizationId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryLogStatus {
    Pending,
    Delivered,
    Failed,
}

impl DeliveryLogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryLogStatus::Pending => "pending",
            DeliveryLogStatus::Delivered => "delivered",
            DeliveryLogStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeliveryLog {
    pub delivery_id: String,
    pub organization_id: OrganizationId,
    pub destination_id: DestinationId,
    pub status: String,
    pub attempt_count: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub cross_system_reference: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DeliveryLogAppend {
    pub delivery_id: String,
    pub organization_id: OrganizationId,
    pub destination_id: DestinationId,
    pub success: bool,
    pub failure_reason: Option<String>,
    pub cross_system_reference: Option<String>,
}
