//! Storage handler (S3/GCP/Azure object upload) and the `download` destination
//! kind, which never leaves the process: it hands off to whatever implements
//! [`DownloadLinkCreator`] (the Download Manager) to mint a link row instead.

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use super::{ConnectionTestResult, DeliveryEnvelope, DeliveryResult, DestinationHandler, HandlerFeature, ValidationResult};
use crate::db::models::destinations::{DestinationConfig, StorageProvider};

fn object_key(path: &str, envelope: &DeliveryEnvelope) -> String {
    let path = path.trim_end_matches('/');
    format!("{path}/{}-{}.json", envelope.kind.replace('.', "_"), envelope.delivery_id)
}

pub struct StorageHandler {
    s3: aws_sdk_s3::Client,
    http: reqwest::Client,
}

impl StorageHandler {
    pub async fn new() -> Self {
        let sdk_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self {
            s3: aws_sdk_s3::Client::new(&sdk_config),
            http: reqwest::Client::new(),
        }
    }

    async fn upload_s3(&self, bucket: &str, region: Option<&str>, key: &str, body: Vec<u8>) -> Result<(), String> {
        let mut request = self.s3.put_object().bucket(bucket).key(key).body(ByteStream::from(body)).content_type("application/json");
        if let Some(region) = region {
            // per-request region override is not supported by the shared client; callers
            // that need cross-region buckets should configure the client's default region
            // via AWS_REGION instead. Accepted here for config validation symmetry only.
            let _ = region;
        }
        request.send().await.map_err(|e| e.to_string())?;
        Ok(())
    }

    async fn upload_gcp(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), String> {
        let token = std::env::var("GCP_STORAGE_ACCESS_TOKEN").map_err(|_| "GCP_STORAGE_ACCESS_TOKEN is not set".to_string())?;
        let url = format!("https://storage.googleapis.com/upload/storage/v1/b/{bucket}/o?uploadType=media&name={}", urlencoding_escape(key));
        let response = self.http.post(&url).bearer_auth(token).header("Content-Type", "application/json").body(body).send().await.map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("GCS upload failed with status {}", response.status()));
        }
        Ok(())
    }

    async fn upload_azure(&self, account: &str, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), String> {
        let sas_token = std::env::var("AZURE_SAS_TOKEN").map_err(|_| "AZURE_SAS_TOKEN is not set".to_string())?;
        let url = format!("https://{account}.blob.core.windows.net/{bucket}/{key}?{sas_token}");
        let response = self
            .http
            .put(&url)
            .header("x-ms-blob-type", "BlockBlob")
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("Azure blob upload failed with status {}", response.status()));
        }
        Ok(())
    }
}

/// Minimal percent-encoding for object keys placed into a query string; keys
/// only ever contain the path segments we generate plus the delivery id, so
/// this covers the characters that actually appear (`/`).
fn urlencoding_escape(s: &str) -> String {
    s.replace('/', "%2F")
}

#[async_trait]
impl DestinationHandler for StorageHandler {
    fn validate_config(&self, config: &DestinationConfig) -> ValidationResult {
        let DestinationConfig::Storage { bucket, path, .. } = config else {
            return ValidationResult::from_errors(vec!["config is not a storage destination".to_string()]);
        };
        let mut errors = Vec::new();
        if bucket.is_empty() {
            errors.push("bucket is required".to_string());
        }
        if path.is_empty() {
            errors.push("path is required".to_string());
        }
        ValidationResult {
            valid: errors.is_empty(),
            errors,
            warnings: Vec::new(),
        }
    }

    async fn test_connection(&self, config: &DestinationConfig) -> ConnectionTestResult {
        let DestinationConfig::Storage { provider, bucket, region, .. } = config else {
            return ConnectionTestResult {
                success: false,
                response_time_ms: 0.0,
                error: Some("config is not a storage destination".to_string()),
                details: None,
            };
        };

        let start = Instant::now();
        let result = match provider {
            StorageProvider::S3 => self.s3.head_bucket().bucket(bucket).send().await.map(|_| ()).map_err(|e| e.to_string()),
            StorageProvider::Gcp => self.upload_gcp(bucket, "__connection_test__", Vec::new()).await,
            StorageProvider::Azure => {
                let account = region.clone().unwrap_or_default();
                self.upload_azure(&account, bucket, "__connection_test__", Vec::new()).await
            }
        };

        ConnectionTestResult {
            success: result.is_ok(),
            response_time_ms: start.elapsed().as_secs_f64() * 1000.0,
            error: result.err(),
            details: None,
        }
    }

    async fn deliver(&self, _destination_id: Uuid, envelope: &DeliveryEnvelope, config: &DestinationConfig) -> DeliveryResult {
        let DestinationConfig::Storage { provider, bucket, region, path } = config else {
            return DeliveryResult::failure("config is not a storage destination", 0.0, false);
        };

        let body = match serde_json::to_vec_pretty(envelope) {
            Ok(b) => b,
            Err(e) => return DeliveryResult::failure(format!("failed to serialize envelope: {e}"), 0.0, false),
        };
        let key = object_key(path, envelope);

        let start = Instant::now();
        let result = match provider {
            StorageProvider::S3 => self.upload_s3(bucket, region.as_deref(), &key, body).await,
            StorageProvider::Gcp => self.upload_gcp(bucket, &key, body).await,
            StorageProvider::Azure => {
                let account = region.clone().unwrap_or_default();
                self.upload_azure(&account, bucket, &key, body).await
            }
        };
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(()) => DeliveryResult {
                success: true,
                response_time_ms: elapsed_ms,
                delivered_at: Some(chrono::Utc::now()),
                cross_system_reference: Some(key),
                status_code: None,
                network_error_code: None,
                error: None,
                retryable: false,
            },
            Err(e) => DeliveryResult::failure(e, elapsed_ms, true),
        }
    }

    fn supports_feature(&self, feature: HandlerFeature) -> bool {
        matches!(feature, HandlerFeature::RetryWithBackoff)
    }

    fn config_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "required": ["provider", "bucket", "path"],
            "properties": {
                "provider": { "type": "string", "enum": ["s3", "gcp", "azure"] },
                "bucket": { "type": "string" },
                "region": { "type": "string" },
                "path": { "type": "string" }
            }
        })
    }
}

/// Implemented by the Download Manager so the `download` destination kind can
/// be dispatched through the same [`DestinationHandler`] interface as every
/// other kind without the handler layer depending on persistence directly.
#[async_trait]
pub trait DownloadLinkCreator: Send + Sync {
    async fn create_link(&self, destination_id: Uuid, envelope: &DeliveryEnvelope, ttl_seconds: i64, max_access: Option<i32>) -> Result<String, String>;
}

pub struct DownloadHandler {
    creator: Arc<dyn DownloadLinkCreator>,
}

impl DownloadHandler {
    pub fn new(creator: Arc<dyn DownloadLinkCreator>) -> Self {
        Self { creator }
    }
}

#[async_trait]
impl DestinationHandler for DownloadHandler {
    fn validate_config(&self, config: &DestinationConfig) -> ValidationResult {
        let DestinationConfig::Download { ttl_seconds, .. } = config else {
            return ValidationResult::from_errors(vec!["config is not a download destination".to_string()]);
        };
        if *ttl_seconds <= 0 {
            return ValidationResult::from_errors(vec!["ttl_seconds must be positive".to_string()]);
        }
        ValidationResult::ok()
    }

    async fn test_connection(&self, _config: &DestinationConfig) -> ConnectionTestResult {
        ConnectionTestResult {
            success: true,
            response_time_ms: 0.0,
            error: None,
            details: Some(serde_json::json!({ "note": "download links are created on delivery; there is no remote endpoint to probe" })),
        }
    }

    async fn deliver(&self, destination_id: Uuid, envelope: &DeliveryEnvelope, config: &DestinationConfig) -> DeliveryResult {
        let DestinationConfig::Download { ttl_seconds, max_access } = config else {
            return DeliveryResult::failure("config is not a download destination", 0.0, false);
        };

        let start = Instant::now();
        match self.creator.create_link(destination_id, envelope, *ttl_seconds, *max_access).await {
            Ok(link_id) => DeliveryResult {
                success: true,
                response_time_ms: start.elapsed().as_secs_f64() * 1000.0,
                delivered_at: Some(chrono::Utc::now()),
                cross_system_reference: Some(link_id),
                status_code: None,
                network_error_code: None,
                error: None,
                retryable: false,
            },
            Err(e) => DeliveryResult::failure(e, start.elapsed().as_secs_f64() * 1000.0, false),
        }
    }

    fn supports_feature(&self, _feature: HandlerFeature) -> bool {
        false
    }

    fn config_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "required": ["ttl_seconds"],
            "properties": {
                "ttl_seconds": { "type": "integer", "minimum": 1 },
                "max_access": { "type": "integer", "minimum": 1 }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn envelope() -> DeliveryEnvelope {
        DeliveryEnvelope {
            delivery_id: "del-1".to_string(),
            organization_id: Uuid::nil(),
            kind: "audit.event".to_string(),
            data: json!({}),
            metadata: json!({}),
            correlation_id: None,
            idempotency_key: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn object_key_strips_trailing_slash_and_embeds_delivery_id() {
        let key = object_key("audit/exports/", &envelope());
        assert_eq!(key, "audit/exports/audit_event-del-1.json");
    }

    #[test]
    fn urlencoding_escapes_path_separators() {
        assert_eq!(urlencoding_escape("a/b/c"), "a%2Fb%2Fc");
    }

    struct AlwaysFails;
    #[async_trait]
    impl DownloadLinkCreator for AlwaysFails {
        async fn create_link(&self, _destination_id: Uuid, _envelope: &DeliveryEnvelope, _ttl_seconds: i64, _max_access: Option<i32>) -> Result<String, String> {
            Err("db unavailable".to_string())
        }
    }

    #[tokio::test]
    async fn download_handler_surfaces_creator_errors_as_non_retryable() {
        let handler = DownloadHandler::new(Arc::new(AlwaysFails));
        let config = DestinationConfig::Download { ttl_seconds: 3600, max_access: None };
        let result = handler.deliver(Uuid::nil(), &envelope(), &config).await;
        assert!(!result.success);
        assert!(!result.retryable);
    }
}
