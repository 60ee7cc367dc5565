//! `QueueItem` records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{DestinationId, OrganizationId, QueueItemId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "processing" => Ok(QueueStatus::Processing),
            "completed" => Ok(QueueStatus::Completed),
            "failed" => Ok(QueueStatus::Failed),
            other => anyhow::bail!("unknown queue status: {other}"),
        }
    }
}

/// One row per `(payload, destination)` attempt chain.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueueItem {
    pub id: QueueItemId,
    pub organization_id: OrganizationId,
    pub destination_id: DestinationId,
    pub delivery_id: String,
    pub correlation_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub kind: String,
    pub payload: sqlx::types::Json<Value>,
    pub priority: i16,
    pub status: String,
    pub scheduled_at: DateTime<Utc>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub metadata: sqlx::types::Json<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueItem {
    pub fn queue_status(&self) -> QueueStatus {
        self.status.parse().unwrap_or(QueueStatus::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct QueueEnqueueRequest {
    pub organization_id: OrganizationId,
    pub destination_id: DestinationId,
    pub delivery_id: String,
    pub correlation_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub kind: String,
    pub payload: Value,
    pub priority: i16,
    pub scheduled_at: DateTime<Utc>,
    pub max_retries: i32,
}

/// A row claimed by `claim_ready`, joined with its destination so the processor
/// does not need a second round-trip to dispatch it.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ClaimedQueueItem {
    pub id: QueueItemId,
    pub organization_id: OrganizationId,
    pub destination_id: DestinationId,
    pub delivery_id: String,
    pub correlation_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub kind: String,
    pub payload: sqlx::types::Json<Value>,
    pub priority: i16,
    pub status: String,
    pub scheduled_at: DateTime<Utc>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub metadata: sqlx::types::Json<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub destination_config: sqlx::types::Json<super::destinations::DestinationConfig>,
    pub destination_disabled: bool,
}

impl ClaimedQueueItem {
    pub fn as_queue_item(&self) -> QueueItem {
        QueueItem {
            id: self.id,
            organization_id: self.organization_id,
            destination_id: self.destination_id,
            delivery_id: self.delivery_id.clone(),
            correlation_id: self.correlation_id.clone(),
            idempotency_key: self.idempotency_key.clone(),
            kind: self.kind.clone(),
            payload: self.payload.clone(),
            priority: self.priority,
            status: self.status.clone(),
            scheduled_at: self.scheduled_at,
            next_retry_at: self.next_retry_at,
            processed_at: self.processed_at,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            metadata: self.metadata.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}
