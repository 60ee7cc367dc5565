//! Webhook Handler: HTTP delivery with HMAC-signed security headers.

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::signing;
use super::{ConnectionTestResult, DeliveryEnvelope, DeliveryResult, DestinationHandler, HandlerFeature, ValidationResult};
use crate::db::models::destinations::DestinationConfig;
use crate::secrets::SecretManager;

pub struct WebhookHandler {
    client: Client,
    secrets: Arc<SecretManager>,
    retryable_status_codes: Vec<u16>,
}

impl WebhookHandler {
    pub fn new(secrets: Arc<SecretManager>, retryable_status_codes: Vec<u16>) -> anyhow::Result<Self> {
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            secrets,
            retryable_status_codes,
        })
    }

    fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_status_codes.contains(&status)
    }
}

/// First match of `x-request-id`, `x-correlation-id`, `x-trace-id` (case
/// insensitive, which `HeaderMap::get` already is for ASCII header names), or
/// the first populated body field among `id`, `requestId`, `correlationId`,
/// `traceId`, `reference`.
fn extract_cross_system_reference(headers: &HeaderMap, body: &Value) -> Option<String> {
    const HEADER_CANDIDATES: &[&str] = &["x-request-id", "x-correlation-id", "x-trace-id"];
    for name in HEADER_CANDIDATES {
        if let Some(value) = headers.get(*name)
            && let Ok(s) = value.to_str()
        {
            return Some(s.to_string());
        }
    }

    const BODY_FIELDS: &[&str] = &["id", "requestId", "correlationId", "traceId", "reference"];
    let object = body.as_object()?;
    for field in BODY_FIELDS {
        if let Some(value) = object.get(*field) {
            return Some(value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string()));
        }
    }
    None
}

#[async_trait]
impl DestinationHandler for WebhookHandler {
    fn validate_config(&self, config: &DestinationConfig) -> ValidationResult {
        let DestinationConfig::Webhook { url, method, timeout_ms, .. } = config else {
            return ValidationResult::from_errors(vec!["config is not a webhook destination".to_string()]);
        };

        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        match url::Url::parse(url) {
            Ok(parsed) if parsed.scheme() == "http" || parsed.scheme() == "https" => {
                if parsed.scheme() == "http" {
                    warnings.push("webhook URL uses plaintext http, not https".to_string());
                }
            }
            Ok(_) => errors.push("webhook url must use http or https".to_string()),
            Err(e) => errors.push(format!("webhook url is not a valid URL: {e}")),
        }

        if !method.eq_ignore_ascii_case("post") && !method.eq_ignore_ascii_case("put") {
            errors.push("webhook method must be POST or PUT".to_string());
        }

        if !(1000..=300_000).contains(timeout_ms) {
            errors.push("webhook timeout_ms must be between 1000 and 300000".to_string());
        }

        ValidationResult {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    async fn test_connection(&self, config: &DestinationConfig) -> ConnectionTestResult {
        let DestinationConfig::Webhook { url, timeout_ms, .. } = config else {
            return ConnectionTestResult {
                success: false,
                response_time_ms: 0.0,
                error: Some("config is not a webhook destination".to_string()),
                details: None,
            };
        };

        let start = Instant::now();
        let result = self.client.head(url).timeout(Duration::from_millis(*timeout_ms)).send().await;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        match result {
            // Any response at all, even a non-2xx one, confirms the endpoint is
            // reachable and speaks HTTP; that's all a connectivity probe checks.
            Ok(response) => ConnectionTestResult {
                success: true,
                response_time_ms: elapsed_ms,
                error: None,
                details: Some(serde_json::json!({ "status_code": response.status().as_u16() })),
            },
            Err(e) => ConnectionTestResult {
                success: false,
                response_time_ms: elapsed_ms,
                error: Some(e.to_string()),
                details: None,
            },
        }
    }

    async fn deliver(&self, destination_id: Uuid, envelope: &DeliveryEnvelope, config: &DestinationConfig) -> DeliveryResult {
        let DestinationConfig::Webhook {
            url,
            method,
            headers: custom_headers,
            timeout_ms,
            ..
        } = config
        else {
            return DeliveryResult::failure("config is not a webhook destination", 0.0, false);
        };

        let body = match envelope.canonical_body() {
            Ok(b) => b,
            Err(e) => return DeliveryResult::failure(format!("failed to serialize envelope: {e}"), 0.0, false),
        };

        let primary_secret = match self.secrets.get_primary_secret(destination_id).await {
            Ok(s) => s,
            Err(e) => return DeliveryResult::failure(format!("failed to load signing secret: {e}"), 0.0, true),
        };

        let mut request = self
            .client
            .request(reqwest::Method::from_str(method).unwrap_or(reqwest::Method::POST), url)
            .timeout(Duration::from_millis(*timeout_ms))
            .header("Content-Type", "application/json")
            .header("User-Agent", concat!("delivery-core/", env!("CARGO_PKG_VERSION")))
            .header("X-Delivery-ID", envelope.delivery_id.as_str())
            .header("X-Organization-ID", envelope.organization_id.to_string())
            .header("X-Timestamp", envelope.timestamp.to_rfc3339());

        if let Some(correlation_id) = &envelope.correlation_id {
            request = request.header("X-Correlation-ID", correlation_id.as_str());
        }

        if let Some(secret) = &primary_secret {
            let signature = signing::sign(signing::DEFAULT_ALGORITHM, &secret.plaintext, &body);
            request = request.header("X-Signature", signature).header("X-Algorithm", signing::DEFAULT_ALGORITHM);
        }

        for (name, value) in custom_headers {
            if let (Ok(name), Ok(value)) = (HeaderName::from_str(name), HeaderValue::from_str(value)) {
                request = request.header(name, value);
            }
        }

        let start = Instant::now();
        let response = request.body(body).send().await;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                let retryable = e.is_timeout() || e.is_connect() || e.is_request();
                let mut result = DeliveryResult::failure(e.to_string(), elapsed_ms, retryable);
                if retryable {
                    result.network_error_code = Some(if e.is_timeout() { "ETIMEDOUT".to_string() } else { "ECONNREFUSED".to_string() });
                }
                return result;
            }
        };

        let status = response.status();
        let response_headers = response.headers().clone();
        let response_body: Value = response.json().await.unwrap_or(Value::Null);
        let cross_system_reference = extract_cross_system_reference(&response_headers, &response_body);

        if status.is_success() {
            DeliveryResult {
                success: true,
                response_time_ms: elapsed_ms,
                delivered_at: Some(chrono::Utc::now()),
                cross_system_reference,
                status_code: Some(status.as_u16()),
                network_error_code: None,
                error: None,
                retryable: false,
            }
        } else {
            DeliveryResult {
                success: false,
                response_time_ms: elapsed_ms,
                delivered_at: None,
                cross_system_reference,
                status_code: Some(status.as_u16()),
                network_error_code: None,
                error: Some(format!("webhook endpoint returned status {}", status.as_u16())),
                retryable: self.is_retryable_status(status.as_u16()),
            }
        }
    }

    fn supports_feature(&self, feature: HandlerFeature) -> bool {
        matches!(feature, HandlerFeature::SignatureVerification | HandlerFeature::Idempotency | HandlerFeature::RetryWithBackoff)
    }

    fn config_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "required": ["url"],
            "properties": {
                "url": { "type": "string", "format": "uri" },
                "method": { "type": "string", "enum": ["POST", "PUT"], "default": "POST" },
                "headers": { "type": "object", "additionalProperties": { "type": "string" } },
                "timeout_ms": { "type": "integer", "minimum": 1000, "maximum": 300_000, "default": 30_000 },
                "retry_config": {
                    "type": "object",
                    "properties": {
                        "max_retries": { "type": "integer", "minimum": 0, "maximum": 10 },
                        "backoff_multiplier": { "type": "number", "minimum": 1, "maximum": 10 },
                        "max_backoff_delay_ms": { "type": "integer", "minimum": 1000, "maximum": 3_600_000 }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DestinationConfig {
        DestinationConfig::Webhook {
            url: "https://example.com/hook".to_string(),
            method: "POST".to_string(),
            headers: Default::default(),
            timeout_ms: 30_000,
            retry_config: None,
        }
    }

    fn handler() -> WebhookHandler {
        let pool = sqlx::PgPool::connect_lazy("postgres://invalid/invalid").expect("lazy pool never fails");
        let secrets = Arc::new(SecretManager::new(pool, crate::config::SecretsConfig { enabled: false, ..Default::default() }).expect("secrets disabled, no key required"));
        WebhookHandler::new(secrets, vec![408, 429, 500, 502, 503, 504]).expect("client builds")
    }

    #[test]
    fn validates_scheme_and_method() {
        let h = handler();
        let result = h.validate_config(&config());
        assert!(result.valid, "{:?}", result.errors);

        let mut bad = config();
        if let DestinationConfig::Webhook { url, .. } = &mut bad {
            *url = "ftp://example.com".to_string();
        }
        assert!(!h.validate_config(&bad).valid);
    }

    #[test]
    fn plaintext_http_is_a_warning_not_an_error() {
        let h = handler();
        let mut cfg = config();
        if let DestinationConfig::Webhook { url, .. } = &mut cfg {
            *url = "http://example.com/hook".to_string();
        }
        let result = h.validate_config(&cfg);
        assert!(result.valid);
        assert!(!result.warnings.is_empty());
    }

    #[test]
    fn rejects_timeout_out_of_range() {
        let h = handler();
        let mut cfg = config();
        if let DestinationConfig::Webhook { timeout_ms, .. } = &mut cfg {
            *timeout_ms = 500;
        }
        assert!(!h.validate_config(&cfg).valid);
    }

    #[test]
    fn extracts_reference_from_header_before_body() {
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", HeaderValue::from_static("req-123"));
        let body = serde_json::json!({ "id": "body-id" });
        assert_eq!(extract_cross_system_reference(&headers, &body), Some("req-123".to_string()));
    }

    #[test]
    fn extracts_reference_from_body_when_no_header() {
        let headers = HeaderMap::new();
        let body = serde_json::json!({ "requestId": "body-id" });
        assert_eq!(extract_cross_system_reference(&headers, &body), Some("body-id".to_string()));
    }
}
