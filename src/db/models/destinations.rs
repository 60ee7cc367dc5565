//! `DeliveryDestination` records and their typed configuration union.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::types::{DestinationId, OrganizationId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    Webhook,
    Email,
    Sftp,
    Storage,
    Download,
}

impl DestinationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DestinationKind::Webhook => "webhook",
            DestinationKind::Email => "email",
            DestinationKind::Sftp => "sftp",
            DestinationKind::Storage => "storage",
            DestinationKind::Download => "download",
        }
    }
}

impl std::str::FromStr for DestinationKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "webhook" => Ok(DestinationKind::Webhook),
            "email" => Ok(DestinationKind::Email),
            "sftp" => Ok(DestinationKind::Sftp),
            "storage" => Ok(DestinationKind::Storage),
            "download" => Ok(DestinationKind::Download),
            other => anyhow::bail!("unknown destination kind: {other}"),
        }
    }
}

/// Typed configuration union, discriminated by `kind`. Stored as `jsonb`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DestinationConfig {
    Webhook {
        url: String,
        #[serde(default = "default_webhook_method")]
        method: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default = "default_webhook_timeout_ms")]
        timeout_ms: u64,
        #[serde(default)]
        retry_config: Option<WebhookRetryConfig>,
    },
    Email {
        service: EmailService,
        from: String,
        subject: String,
        #[serde(default)]
        body_template: Option<String>,
        #[serde(default)]
        attachment_name: Option<String>,
        #[serde(default)]
        recipients: Vec<String>,
        #[serde(default)]
        smtp_config: Option<SmtpConfig>,
        #[serde(default)]
        api_key: Option<String>,
    },
    Sftp {
        host: String,
        port: u16,
        username: String,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        private_key: Option<String>,
        path: String,
        #[serde(default)]
        filename: Option<String>,
    },
    Storage {
        provider: StorageProvider,
        bucket: String,
        #[serde(default)]
        region: Option<String>,
        path: String,
    },
    Download {
        ttl_seconds: i64,
        #[serde(default)]
        max_access: Option<i32>,
    },
}

fn default_webhook_method() -> String {
    "POST".to_string()
}

fn default_webhook_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookRetryConfig {
    pub max_retries: u32,
    pub backoff_multiplier: f64,
    pub max_backoff_delay_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmailService {
    Smtp,
    Sendgrid,
    Resend,
    Ses,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub secure: bool,
    pub auth: SmtpAuth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpAuth {
    pub user: String,
    pub pass: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageProvider {
    S3,
    Gcp,
    Azure,
}

impl DestinationConfig {
    pub fn kind(&self) -> DestinationKind {
        match self {
            DestinationConfig::Webhook { .. } => DestinationKind::Webhook,
            DestinationConfig::Email { .. } => DestinationKind::Email,
            DestinationConfig::Sftp { .. } => DestinationKind::Sftp,
            DestinationConfig::Storage { .. } => DestinationKind::Storage,
            DestinationConfig::Download { .. } => DestinationKind::Download,
        }
    }
}

/// A configured delivery destination.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Destination {
    pub id: DestinationId,
    pub organization_id: OrganizationId,
    pub label: String,
    pub kind: String,
    pub config: sqlx::types::Json<DestinationConfig>,
    pub disabled: bool,
    pub disabled_at: Option<DateTime<Utc>>,
    pub disabled_by: Option<Uuid>,
    pub count_usage: i64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Destination {
    pub fn destination_kind(&self) -> DestinationKind {
        self.kind.parse().unwrap_or_else(|_| self.config.0.kind())
    }
}

#[derive(Debug, Clone)]
pub struct DestinationCreateRequest {
    pub organization_id: OrganizationId,
    pub label: String,
    pub config: DestinationConfig,
}

#[derive(Debug, Clone, Default)]
pub struct DestinationUpdateRequest {
    pub label: Option<String>,
    pub config: Option<DestinationConfig>,
}
