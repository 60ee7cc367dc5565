//! Email Handler: provider-agnostic delivery over SMTP, SendGrid, Resend, or
//! SES, with per-provider connection pooling, rate limiting, and templated
//! subject/body rendering.

pub mod providers;
pub mod rate_limit;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use super::{ConnectionTestResult, DeliveryEnvelope, DeliveryResult, DestinationHandler, HandlerFeature, ValidationResult};
use crate::config::EmailConfig;
use crate::db::models::destinations::{DestinationConfig, EmailService};
use crate::template::{self, RenderOptions};
use providers::{EmailProvider, EmailSendRequest, ResendProvider, SendgridProvider, SesProvider, SmtpProvider};
use rate_limit::RateLimiter;

#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

const WINDOWS_RESERVED: &[&str] = &["CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8", "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9"];

fn validate_attachment_filename(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("attachment filename must not be empty".to_string());
    }
    if name.contains("..") || name.contains('/') || name.contains('\\') {
        return Err(format!("attachment filename '{name}' contains a path traversal sequence"));
    }
    if name.starts_with('.') {
        return Err(format!("attachment filename '{name}' must not start with a dot"));
    }
    let stem = name.split('.').next().unwrap_or(name).to_uppercase();
    if WINDOWS_RESERVED.contains(&stem.as_str()) {
        return Err(format!("attachment filename '{name}' is a reserved Windows device name"));
    }
    Ok(())
}

/// Gather attachments from `payload.data.attachments` (explicit `content` +
/// `filename` entries) and `payload.metadata.attachments`, enforcing the
/// per-attachment, total, and count caps.
fn collect_attachments(envelope: &DeliveryEnvelope, config: &EmailConfig) -> Result<Vec<Attachment>, String> {
    let mut attachments = Vec::new();
    for source in [envelope.data.get("attachments"), envelope.metadata.get("attachments")] {
        let Some(Value::Array(items)) = source else { continue };
        for item in items {
            let filename = item.get("filename").and_then(Value::as_str).ok_or_else(|| "attachment missing filename".to_string())?;
            validate_attachment_filename(filename)?;

            let content_b64 = item.get("content").and_then(Value::as_str).ok_or_else(|| "attachment missing content".to_string())?;
            let content = {
                use base64::Engine;
                base64::engine::general_purpose::STANDARD.decode(content_b64).map_err(|e| format!("attachment content is not valid base64: {e}"))?
            };

            if content.len() as u64 > config.max_attachment_bytes {
                return Err(format!("attachment '{filename}' exceeds the per-attachment cap of {} bytes", config.max_attachment_bytes));
            }

            let content_type = item.get("content_type").and_then(Value::as_str).unwrap_or("application/octet-stream").to_string();
            attachments.push(Attachment {
                filename: filename.to_string(),
                content_type,
                content,
            });
        }
    }

    if attachments.len() > config.max_attachments {
        return Err(format!("{} attachments exceeds the max of {}", attachments.len(), config.max_attachments));
    }
    let total_bytes: u64 = attachments.iter().map(|a| a.content.len() as u64).sum();
    if total_bytes > config.max_total_bytes {
        return Err(format!("total attachment size {total_bytes} exceeds the cap of {} bytes", config.max_total_bytes));
    }
    Ok(attachments)
}

fn credential_fingerprint(config: &DestinationConfig) -> String {
    let DestinationConfig::Email { service, smtp_config, api_key, .. } = config else {
        return "invalid".to_string();
    };
    let mut hasher = DefaultHasher::new();
    Into::<&'static str>::into(*service).hash(&mut hasher);
    if let Some(smtp) = smtp_config {
        smtp.host.hash(&mut hasher);
        smtp.port.hash(&mut hasher);
        smtp.auth.user.hash(&mut hasher);
    }
    if let Some(key) = api_key {
        key.hash(&mut hasher);
    }
    format!("{:016x}", hasher.finish())
}

pub struct EmailHandler {
    config: EmailConfig,
    rate_limiter: RateLimiter,
    pool: DashMap<String, Arc<dyn EmailProvider>>,
}

impl EmailHandler {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config,
            rate_limiter: RateLimiter::new(),
            pool: DashMap::new(),
        }
    }

    async fn provider_for(&self, config: &DestinationConfig) -> Result<Arc<dyn EmailProvider>, String> {
        let fingerprint = credential_fingerprint(config);
        if let Some(existing) = self.pool.get(&fingerprint) {
            return Ok(existing.clone());
        }

        let DestinationConfig::Email { service, smtp_config, api_key, .. } = config else {
            return Err("config is not an email destination".to_string());
        };

        let provider: Arc<dyn EmailProvider> = match service {
            EmailService::Smtp => match smtp_config {
                Some(s) => Arc::new(SmtpProvider::from_destination(&s.host, s.port, s.secure, &s.auth.user, &s.auth.pass).map_err(|e| e.to_string())?),
                None => match &self.config.transport {
                    crate::config::EmailTransportConfig::Smtp { host, port, username, password, use_tls } => {
                        Arc::new(SmtpProvider::from_destination(host, *port, *use_tls, username, password).map_err(|e| e.to_string())?)
                    }
                    crate::config::EmailTransportConfig::File { path } => Arc::new(SmtpProvider::file(path).map_err(|e| e.to_string())?),
                },
            },
            EmailService::Sendgrid => {
                let key = api_key.as_deref().ok_or("SendGrid requires api_key")?;
                Arc::new(SendgridProvider::new(key).map_err(|e| e.to_string())?)
            }
            EmailService::Resend => {
                let key = api_key.as_deref().ok_or("Resend requires api_key")?;
                Arc::new(ResendProvider::new(key).map_err(|e| e.to_string())?)
            }
            EmailService::Ses => Arc::new(SesProvider::new().await),
        };

        self.pool.insert(fingerprint, provider.clone());
        Ok(provider)
    }

    fn template_context(envelope: &DeliveryEnvelope) -> Value {
        serde_json::json!({
            "delivery_id": envelope.delivery_id,
            "organization_id": envelope.organization_id,
            "type": envelope.kind,
            "data": envelope.data,
            "metadata": envelope.metadata,
            "correlation_id": envelope.correlation_id,
            "idempotency_key": envelope.idempotency_key,
            "timestamp": envelope.timestamp.to_rfc3339(),
        })
    }
}

#[async_trait]
impl DestinationHandler for EmailHandler {
    fn validate_config(&self, config: &DestinationConfig) -> ValidationResult {
        let DestinationConfig::Email { from, subject, recipients, .. } = config else {
            return ValidationResult::from_errors(vec!["config is not an email destination".to_string()]);
        };

        let mut result = providers::validate_provider_config(config);
        if from.is_empty() {
            result.errors.push("from address is required".to_string());
        }
        if subject.len() > 998 {
            result.errors.push("subject exceeds 998 characters".to_string());
        }
        if !recipients.is_empty() {
            let recipient_check = template::validate_recipients(recipients, self.config.max_recipients);
            result.errors.extend(recipient_check.errors);
            result.warnings.extend(recipient_check.warnings);
        }
        result.valid = result.errors.is_empty();
        result
    }

    async fn test_connection(&self, config: &DestinationConfig) -> ConnectionTestResult {
        let start = Instant::now();
        match self.provider_for(config).await {
            Ok(_) => ConnectionTestResult {
                success: true,
                response_time_ms: start.elapsed().as_secs_f64() * 1000.0,
                error: None,
                details: None,
            },
            Err(e) => ConnectionTestResult {
                success: false,
                response_time_ms: start.elapsed().as_secs_f64() * 1000.0,
                error: Some(e),
                details: None,
            },
        }
    }

    async fn deliver(&self, _destination_id: Uuid, envelope: &DeliveryEnvelope, config: &DestinationConfig) -> DeliveryResult {
        let DestinationConfig::Email {
            from, subject, body_template, recipients, ..
        } = config
        else {
            return DeliveryResult::failure("config is not an email destination", 0.0, false);
        };

        if recipients.is_empty() {
            return DeliveryResult::failure("email destination has no recipients configured", 0.0, false);
        }
        let recipient_check = template::validate_recipients(recipients, self.config.max_recipients);
        if !recipient_check.valid {
            return DeliveryResult::failure(recipient_check.errors.join("; "), 0.0, false);
        }

        let attachments = match collect_attachments(envelope, &self.config) {
            Ok(a) => a,
            Err(e) => return DeliveryResult::failure(e, 0.0, false),
        };

        let context = Self::template_context(envelope);
        let render_options = RenderOptions::default();
        let rendered_subject = template::process_template(subject, &context, &render_options).unwrap_or_else(|_| subject.clone());
        let body_source = body_template.as_deref().unwrap_or_default();
        let rendered_body = match template::process_template(body_source, &context, &render_options) {
            Ok(b) => b,
            Err(e) => return DeliveryResult::failure(format!("template render failed: {e}"), 0.0, false),
        };

        let provider = match self.provider_for(config).await {
            Ok(p) => p,
            Err(e) => return DeliveryResult::failure(e, 0.0, true),
        };

        let fingerprint = credential_fingerprint(config);
        if let Err(reset_after) = self.rate_limiter.check_limit(&fingerprint, &provider.rate_limits()) {
            let mut result = DeliveryResult::failure(format!("rate limited, retry after {}ms", reset_after.as_millis()), 0.0, true);
            result.network_error_code = Some("RATE_LIMITED".to_string());
            return result;
        }

        let organization_id = envelope.organization_id.to_string();
        let request = EmailSendRequest {
            from,
            to: recipients,
            subject: &rendered_subject,
            html_body: &rendered_body,
            reply_to: None,
            attachments: &attachments,
            delivery_id: &envelope.delivery_id,
            organization_id: &organization_id,
            correlation_id: envelope.correlation_id.as_deref(),
        };

        let start = Instant::now();
        let result = provider.send(&request).await;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(response) => DeliveryResult {
                success: true,
                response_time_ms: elapsed_ms,
                delivered_at: Some(chrono::Utc::now()),
                cross_system_reference: response.message_id,
                status_code: None,
                network_error_code: None,
                error: None,
                retryable: false,
            },
            Err(e) => {
                let retryable = matches!(e, providers::ProviderError::Transport(_));
                DeliveryResult::failure(e.to_string(), elapsed_ms, retryable)
            }
        }
    }

    fn supports_feature(&self, feature: HandlerFeature) -> bool {
        matches!(feature, HandlerFeature::ConnectionPooling | HandlerFeature::RateLimiting | HandlerFeature::RetryWithBackoff)
    }

    fn config_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "required": ["service", "from", "subject"],
            "properties": {
                "service": { "type": "string", "enum": ["smtp", "sendgrid", "resend", "ses"] },
                "from": { "type": "string", "format": "email" },
                "subject": { "type": "string", "maxLength": 998 },
                "body_template": { "type": "string" },
                "recipients": { "type": "array", "items": { "type": "string", "format": "email" }, "maxItems": 50 },
                "smtp_config": { "type": "object" },
                "api_key": { "type": "string" }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_path_traversal_filenames() {
        assert!(validate_attachment_filename("../../etc/passwd").is_err());
        assert!(validate_attachment_filename("a/b.txt").is_err());
    }

    #[test]
    fn rejects_leading_dot_and_reserved_names() {
        assert!(validate_attachment_filename(".hidden").is_err());
        assert!(validate_attachment_filename("CON.txt").is_err());
        assert!(validate_attachment_filename("com1").is_err());
    }

    #[test]
    fn accepts_ordinary_filenames() {
        assert!(validate_attachment_filename("report.pdf").is_ok());
    }
}
