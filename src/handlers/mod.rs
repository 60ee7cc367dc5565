//! Destination Handlers: one implementation per delivery protocol, behind a
//! shared trait so the Queue Processor can dispatch without knowing the
//! destination kind up front.
//!
//! Handlers never mutate the payload. The [`DeliveryEnvelope`] each handler
//! receives is built once by the facade from the queue row and is the same
//! deterministic wire representation across retries of the same delivery.

pub mod email;
pub mod signing;
pub mod sftp;
pub mod storage;
pub mod webhook;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::db::models::destinations::DestinationConfig;

/// The wire representation delivered to every destination kind. Field order
/// matches the canonical JSON envelope so the webhook signature is computed
/// over a stable byte sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryEnvelope {
    pub delivery_id: String,
    pub organization_id: Uuid,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    pub metadata: Value,
    pub correlation_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl DeliveryEnvelope {
    /// The exact JSON bytes signed and transmitted. Handlers must serialize the
    /// envelope exactly once per attempt and reuse the bytes for both the wire
    /// body and the signature, so a receiver verifying against the body it
    /// actually got always agrees with the sender.
    pub fn canonical_body(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Optional capabilities a handler may or may not provide; the Queue Processor
/// and facade query this before relying on a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerFeature {
    SignatureVerification,
    Idempotency,
    RetryWithBackoff,
    ConnectionPooling,
    RateLimiting,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn from_errors(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
            warnings: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionTestResult {
    pub success: bool,
    pub response_time_ms: f64,
    pub error: Option<String>,
    pub details: Option<Value>,
}

/// Outcome of a single delivery attempt, as reported by a handler. The Queue
/// Processor folds this into a [`crate::retry::AttemptOutcome`] for the Retry
/// Manager; `retryable` here is the handler's own first-order classification
/// and is logged alongside, not the final word (the Retry Manager's retry
/// count and status-code table decide what actually happens next).
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryResult {
    pub success: bool,
    pub response_time_ms: f64,
    pub delivered_at: Option<DateTime<Utc>>,
    pub cross_system_reference: Option<String>,
    pub status_code: Option<u16>,
    pub network_error_code: Option<String>,
    pub error: Option<String>,
    pub retryable: bool,
}

impl DeliveryResult {
    pub fn failure(error: impl Into<String>, response_time_ms: f64, retryable: bool) -> Self {
        Self {
            success: false,
            response_time_ms,
            delivered_at: None,
            cross_system_reference: None,
            status_code: None,
            network_error_code: None,
            error: Some(error.into()),
            retryable,
        }
    }
}

#[async_trait]
pub trait DestinationHandler: Send + Sync {
    /// Statically check a config for structural problems before it is stored.
    fn validate_config(&self, config: &DestinationConfig) -> ValidationResult;

    /// Probe reachability without recording a delivery attempt.
    async fn test_connection(&self, config: &DestinationConfig) -> ConnectionTestResult;

    /// Deliver one envelope. `destination_id` is available for handlers that
    /// need per-destination state (webhook signing secrets, SFTP/email
    /// connection pool keys).
    async fn deliver(&self, destination_id: Uuid, envelope: &DeliveryEnvelope, config: &DestinationConfig) -> DeliveryResult;

    fn supports_feature(&self, feature: HandlerFeature) -> bool;

    fn config_schema(&self) -> Value;
}

/// Default per-attempt timeout when a destination config does not override it.
pub const DEFAULT_HANDLER_TIMEOUT_MS: u64 = 30_000;
