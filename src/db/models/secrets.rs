//! `WebhookSecret` records.

use chrono::{DateTime, Utc};

use crate::types::{DestinationId, SecretId};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WebhookSecret {
    pub id: SecretId,
    pub destination_id: DestinationId,
    /// Ciphertext in `hex(nonce):hex(ciphertext_and_tag)` form.
    pub secret_ciphertext: String,
    pub algorithm: String,
    pub is_active: bool,
    pub is_primary: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub rotated_at: Option<DateTime<Utc>>,
    pub usage_count: i64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SecretCreateRequest {
    pub destination_id: DestinationId,
    pub secret_ciphertext: String,
    pub algorithm: String,
    pub is_primary: bool,
    pub expires_at: Option<DateTime<Utc>>,
}
