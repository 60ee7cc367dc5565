//! Provider factory: one [`EmailProvider`] implementation per supported
//! `email.service` value, each knowing how to validate its own credentials and
//! actually place a call.

use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart, SinglePart, header::ContentType};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncFileTransport, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use thiserror::Error as ThisError;

use super::Attachment;
use super::rate_limit::{RESEND_DEFAULT, RateLimits, SENDGRID_DEFAULT, SES_DEFAULT, SMTP_DEFAULT};
use crate::db::models::destinations::{DestinationConfig, EmailService};
use crate::handlers::ValidationResult;

#[derive(Debug, ThisError)]
pub enum ProviderError {
    #[error("provider rejected the message: {0}")]
    Rejected(String),
    #[error("provider transport error: {0}")]
    Transport(String),
    #[error("provider credentials are invalid or missing: {0}")]
    Credentials(String),
}

#[derive(Debug, Clone, Default)]
pub struct ProviderResponse {
    pub message_id: Option<String>,
}

pub struct EmailSendRequest<'a> {
    pub from: &'a str,
    pub to: &'a [String],
    pub subject: &'a str,
    pub html_body: &'a str,
    pub reply_to: Option<&'a str>,
    pub attachments: &'a [Attachment],
    pub delivery_id: &'a str,
    pub organization_id: &'a str,
    pub correlation_id: Option<&'a str>,
}

#[async_trait]
pub trait EmailProvider: Send + Sync {
    async fn send(&self, request: &EmailSendRequest<'_>) -> Result<ProviderResponse, ProviderError>;
    fn rate_limits(&self) -> RateLimits;
}

/// Build the message once, shared by every provider that sends through `lettre`.
fn build_message(request: &EmailSendRequest<'_>) -> Result<Message, ProviderError> {
    let from: Mailbox = request.from.parse().map_err(|e| ProviderError::Rejected(format!("invalid from address: {e}")))?;

    let mut builder = Message::builder()
        .from(from)
        .subject(request.subject)
        .header(ContentType::TEXT_HTML)
        .header(lettre::message::header::HeaderName::new_from_ascii_str("X-Delivery-ID"), request.delivery_id.to_string())
        .header(lettre::message::header::HeaderName::new_from_ascii_str("X-Organization-ID"), request.organization_id.to_string());

    if let Some(correlation_id) = request.correlation_id {
        builder = builder.header(lettre::message::header::HeaderName::new_from_ascii_str("X-Correlation-ID"), correlation_id.to_string());
    }

    for recipient in request.to {
        let mailbox: Mailbox = recipient.parse().map_err(|e| ProviderError::Rejected(format!("invalid recipient {recipient}: {e}")))?;
        builder = builder.to(mailbox);
    }

    if let Some(reply_to) = request.reply_to {
        let mailbox: Mailbox = reply_to.parse().map_err(|e| ProviderError::Rejected(format!("invalid reply-to {reply_to}: {e}")))?;
        builder = builder.reply_to(mailbox);
    }

    if request.attachments.is_empty() {
        builder
            .body(request.html_body.to_string())
            .map_err(|e| ProviderError::Rejected(e.to_string()))
    } else {
        let mut multipart = MultiPart::mixed().singlepart(SinglePart::html(request.html_body.to_string()));
        for attachment in request.attachments {
            let content_type: ContentType = attachment.content_type.parse().unwrap_or(ContentType::TEXT_PLAIN);
            multipart = multipart.singlepart(lettre::message::Attachment::new(attachment.filename.clone()).body(attachment.content.clone(), content_type));
        }
        builder.multipart(multipart).map_err(|e| ProviderError::Rejected(e.to_string()))
    }
}

/// Wraps the two transports the configured-default SMTP provider may use: a
/// real relay in production, a file-backed transport for local development
/// (mirrors `EmailConfig::transport`).
pub enum SmtpTransport {
    Smtp(AsyncSmtpTransport<Tokio1Executor>),
    File(AsyncFileTransport<Tokio1Executor>),
}

pub struct SmtpProvider {
    transport: SmtpTransport,
}

impl SmtpProvider {
    pub fn from_destination(host: &str, port: u16, secure: bool, user: &str, pass: &str) -> Result<Self, ProviderError> {
        let creds = Credentials::new(user.to_string(), pass.to_string());
        let builder = if secure {
            AsyncSmtpTransport::<Tokio1Executor>::relay(host).map_err(|e| ProviderError::Transport(e.to_string()))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
        };
        let transport = builder.port(port).credentials(creds).build();
        Ok(Self {
            transport: SmtpTransport::Smtp(transport),
        })
    }

    pub fn file(path: &str) -> Result<Self, ProviderError> {
        let transport = AsyncFileTransport::<Tokio1Executor>::new(path);
        Ok(Self {
            transport: SmtpTransport::File(transport),
        })
    }

    pub fn validate_config(config: &DestinationConfig) -> ValidationResult {
        let DestinationConfig::Email { smtp_config, .. } = config else {
            return ValidationResult::from_errors(vec!["config is not an email destination".to_string()]);
        };
        match smtp_config {
            Some(s) if s.host.is_empty() => ValidationResult::from_errors(vec!["smtp_config.host is required".to_string()]),
            Some(s) if s.auth.user.is_empty() || s.auth.pass.is_empty() => ValidationResult::from_errors(vec!["smtp_config.auth requires user and pass".to_string()]),
            Some(_) => ValidationResult::ok(),
            None => ValidationResult::ok(),
        }
    }
}

#[async_trait]
impl EmailProvider for SmtpProvider {
    async fn send(&self, request: &EmailSendRequest<'_>) -> Result<ProviderResponse, ProviderError> {
        let message = build_message(request)?;
        match &self.transport {
            SmtpTransport::Smtp(t) => t.send(message).await.map_err(|e| ProviderError::Transport(e.to_string()))?,
            SmtpTransport::File(t) => t.send(message).await.map_err(|e| ProviderError::Transport(e.to_string()))?,
        };
        Ok(ProviderResponse::default())
    }

    fn rate_limits(&self) -> RateLimits {
        SMTP_DEFAULT
    }
}

/// Shared shape for the two transactional-email REST providers (SendGrid,
/// Resend): both take a bearer API key and a JSON body, differing only in
/// endpoint and payload shape.
struct HttpApiProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    body_fn: fn(&EmailSendRequest<'_>) -> serde_json::Value,
}

impl HttpApiProvider {
    fn sendgrid(api_key: &str) -> Result<Self, ProviderError> {
        if !api_key.starts_with("SG.") {
            return Err(ProviderError::Credentials("SendGrid API keys must start with 'SG.'".to_string()));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint: "https://api.sendgrid.com/v3/mail/send".to_string(),
            api_key: api_key.to_string(),
            body_fn: sendgrid_body,
        })
    }

    fn resend(api_key: &str) -> Result<Self, ProviderError> {
        if !api_key.starts_with("re_") {
            return Err(ProviderError::Credentials("Resend API keys must start with 're_'".to_string()));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint: "https://api.resend.com/emails".to_string(),
            api_key: api_key.to_string(),
            body_fn: resend_body,
        })
    }
}

fn sendgrid_body(request: &EmailSendRequest<'_>) -> serde_json::Value {
    serde_json::json!({
        "personalizations": [{ "to": request.to.iter().map(|addr| serde_json::json!({ "email": addr })).collect::<Vec<_>>() }],
        "from": { "email": request.from },
        "subject": request.subject,
        "content": [{ "type": "text/html", "value": request.html_body }],
    })
}

fn resend_body(request: &EmailSendRequest<'_>) -> serde_json::Value {
    serde_json::json!({
        "from": request.from,
        "to": request.to,
        "subject": request.subject,
        "html": request.html_body,
    })
}

#[async_trait]
impl EmailProvider for HttpApiProvider {
    async fn send(&self, request: &EmailSendRequest<'_>) -> Result<ProviderResponse, ProviderError> {
        let body = (self.body_fn)(request);
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::Rejected(format!("provider returned {status}: {text}")));
        }

        let message_id = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|v| v.get("id").and_then(|id| id.as_str()).map(str::to_string));

        Ok(ProviderResponse { message_id })
    }

    fn rate_limits(&self) -> RateLimits {
        if self.endpoint.contains("sendgrid") {
            SENDGRID_DEFAULT
        } else {
            RESEND_DEFAULT
        }
    }
}

pub struct SendgridProvider(HttpApiProvider);

impl SendgridProvider {
    pub fn new(api_key: &str) -> Result<Self, ProviderError> {
        Ok(Self(HttpApiProvider::sendgrid(api_key)?))
    }

    pub fn validate_config(config: &DestinationConfig) -> ValidationResult {
        let DestinationConfig::Email { api_key, .. } = config else {
            return ValidationResult::from_errors(vec!["config is not an email destination".to_string()]);
        };
        match api_key {
            Some(key) if key.starts_with("SG.") => ValidationResult::ok(),
            Some(_) => ValidationResult::from_errors(vec!["SendGrid api_key must start with 'SG.'".to_string()]),
            None => ValidationResult::from_errors(vec!["SendGrid requires api_key".to_string()]),
        }
    }
}

#[async_trait]
impl EmailProvider for SendgridProvider {
    async fn send(&self, request: &EmailSendRequest<'_>) -> Result<ProviderResponse, ProviderError> {
        self.0.send(request).await
    }
    fn rate_limits(&self) -> RateLimits {
        self.0.rate_limits()
    }
}

pub struct ResendProvider(HttpApiProvider);

impl ResendProvider {
    pub fn new(api_key: &str) -> Result<Self, ProviderError> {
        Ok(Self(HttpApiProvider::resend(api_key)?))
    }

    pub fn validate_config(config: &DestinationConfig) -> ValidationResult {
        let DestinationConfig::Email { api_key, .. } = config else {
            return ValidationResult::from_errors(vec!["config is not an email destination".to_string()]);
        };
        match api_key {
            Some(key) if key.starts_with("re_") => ValidationResult::ok(),
            Some(_) => ValidationResult::from_errors(vec!["Resend api_key must start with 're_'".to_string()]),
            None => ValidationResult::from_errors(vec!["Resend requires api_key".to_string()]),
        }
    }
}

#[async_trait]
impl EmailProvider for ResendProvider {
    async fn send(&self, request: &EmailSendRequest<'_>) -> Result<ProviderResponse, ProviderError> {
        self.0.send(request).await
    }
    fn rate_limits(&self) -> RateLimits {
        self.0.rate_limits()
    }
}

/// Amazon SES via `aws-sdk-sesv2`, mirroring the S3 storage provider's use of
/// the AWS SDK rather than a hand-rolled SigV4 REST client.
pub struct SesProvider {
    client: aws_sdk_sesv2::Client,
}

impl SesProvider {
    pub async fn new() -> Self {
        let sdk_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self {
            client: aws_sdk_sesv2::Client::new(&sdk_config),
        }
    }

    pub fn validate_config(_config: &DestinationConfig) -> ValidationResult {
        if std::env::var("AWS_ACCESS_KEY_ID").is_err() && std::env::var("AWS_PROFILE").is_err() {
            return ValidationResult {
                valid: true,
                errors: Vec::new(),
                warnings: vec!["no AWS credential environment variables detected; SES calls will fail unless credentials are supplied another way".to_string()],
            };
        }
        ValidationResult::ok()
    }
}

#[async_trait]
impl EmailProvider for SesProvider {
    async fn send(&self, request: &EmailSendRequest<'_>) -> Result<ProviderResponse, ProviderError> {
        use aws_sdk_sesv2::types::{Body, Content, Destination, EmailContent, Message as SesMessage};

        let destination = Destination::builder().set_to_addresses(Some(request.to.to_vec())).build();

        let html_content = Content::builder()
            .data(request.html_body)
            .build()
            .map_err(|e| ProviderError::Rejected(e.to_string()))?;
        let subject_content = Content::builder()
            .data(request.subject)
            .build()
            .map_err(|e| ProviderError::Rejected(e.to_string()))?;

        let body = Body::builder().html(html_content).build();
        let message = SesMessage::builder().subject(subject_content).body(body).build();
        let content = EmailContent::builder().simple(message).build();

        let result = self
            .client
            .send_email()
            .from_email_address(request.from)
            .destination(destination)
            .content(content)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        Ok(ProviderResponse {
            message_id: result.message_id().map(str::to_string),
        })
    }

    fn rate_limits(&self) -> RateLimits {
        SES_DEFAULT
    }
}

impl From<EmailService> for &'static str {
    fn from(service: EmailService) -> Self {
        match service {
            EmailService::Smtp => "smtp",
            EmailService::Sendgrid => "sendgrid",
            EmailService::Resend => "resend",
            EmailService::Ses => "ses",
        }
    }
}

/// Config-level validation dispatched to the relevant provider's own checks,
/// without constructing a live connection.
pub fn validate_provider_config(config: &DestinationConfig) -> ValidationResult {
    let DestinationConfig::Email { service, .. } = config else {
        return ValidationResult::from_errors(vec!["config is not an email destination".to_string()]);
    };
    match service {
        EmailService::Smtp => SmtpProvider::validate_config(config),
        EmailService::Sendgrid => SendgridProvider::validate_config(config),
        EmailService::Resend => ResendProvider::validate_config(config),
        EmailService::Ses => SesProvider::validate_config(config),
    }
}
