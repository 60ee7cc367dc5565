//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The
//! configuration file path defaults to `config.yaml` but can be specified via `-f`
//! flag or the `DELIVERY_CONFIG` environment variable.
//!
//! ## Loading Priority
//!
//! Configuration sources are merged in the following order (later sources override
//! earlier ones):
//!
//! 1. **YAML config file** — base configuration (default: `config.yaml`)
//! 2. **Environment variables** — variables prefixed with `DELIVERY_` override YAML
//!    values. For nested values use double underscores, e.g.
//!    `DELIVERY_RETRY__MAX_RETRIES=3` sets `retry.max_retries`.
//! 3. **DATABASE_URL** — special case: overrides `database.url` if set.
//!
//! The webhook-secret encryption key is never read from the YAML file; it must come
//! from `DELIVERY_SECRETS__ENCRYPTION_KEY` (or the bare `DELIVERY_ENCRYPTION_KEY`
//! alias) so it is never accidentally checked into a config file.

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::Error;

/// CLI arguments: just the config file path and a dry-run validation flag.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "DELIVERY_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the service.
    #[arg(long)]
    pub validate: bool,
}

/// Root configuration structure loaded from YAML and environment variables.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub secrets: SecretsConfig,
    pub email: EmailConfig,
    pub sftp: SftpConfig,
    pub download_links: DownloadLinkConfig,
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            queue: QueueConfig::default(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            secrets: SecretsConfig::default(),
            email: EmailConfig::default(),
            sftp: SftpConfig::default(),
            download_links: DownloadLinkConfig::default(),
            log_filter: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file merged with environment overrides.
    pub fn load(args: &Args) -> anyhow::Result<Self> {
        let figment = Figment::from(figment::providers::Serialized::defaults(Config::default()))
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("DELIVERY_").split("__"));

        let mut config: Config = figment.extract()?;

        if let Ok(database_url) = std::env::var("DATABASE_URL") {
            config.database.url = database_url;
        }
        if let Ok(key) = std::env::var("DELIVERY_ENCRYPTION_KEY") {
            config.secrets.encryption_key = Some(key);
        }

        config.validate()?;
        Ok(config)
    }

    /// Eagerly validate cross-field invariants that serde alone cannot express.
    pub fn validate(&self) -> Result<(), Error> {
        if self.database.url.is_empty() {
            return Err(Error::InvalidConfig {
                message: "database.url must be set".to_string(),
            });
        }
        if self.secrets.enabled && self.secrets.encryption_key.is_none() {
            return Err(Error::InvalidConfig {
                message: "secrets.encryption_key (or DELIVERY_ENCRYPTION_KEY) is required when the secret manager is enabled".to_string(),
            });
        }
        if let Some(key) = &self.secrets.encryption_key {
            if key.len() != 64 || !key.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(Error::InvalidConfig {
                    message: "secrets.encryption_key must be 64 hex characters (256 bits)".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Database connection configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool: PoolSettings,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            pool: PoolSettings::default(),
        }
    }
}

/// SQLx connection pool parameters.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub min_connections: u32,
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

/// Queue Processor scheduling knobs.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Number of worker tasks polling the queue.
    pub workers: usize,
    /// Rows claimed per `claim_ready` call.
    pub batch_size: i64,
    /// Sleep between polls when a worker finds nothing to claim.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Per-worker bound on concurrently in-flight handler calls.
    pub max_concurrent_deliveries: usize,
    /// How long `stop()` waits for in-flight attempts to finish before cancelling.
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,
    /// Rows stuck in `processing` longer than this are assumed crashed and reclaimed.
    #[serde(with = "humantime_serde")]
    pub visibility_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            batch_size: 20,
            poll_interval: Duration::from_millis(500),
            max_concurrent_deliveries: 20,
            drain_timeout: Duration::from_secs(30),
            visibility_timeout: Duration::from_secs(300),
        }
    }
}

/// Retry Manager backoff defaults.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter_enabled: bool,
    pub jitter_max_percent: f64,
    pub retryable_status_codes: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
            jitter_enabled: true,
            jitter_max_percent: 10.0,
            retryable_status_codes: vec![408, 429, 500, 502, 503, 504],
        }
    }
}

/// Health Monitor & Circuit Breaker thresholds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    #[serde(with = "humantime_serde")]
    pub recovery_timeout: Duration,
    /// Window (in recent attempts) used to derive `success_rate` health status.
    pub success_rate_window: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            success_rate_window: 20,
        }
    }
}

/// Secret Manager configuration. The encryption key itself is never read from
/// YAML; see [`Config::load`].
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecretsConfig {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,
    pub max_active_secrets: u32,
    pub default_overlap_period_days: i64,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            encryption_key: None,
            max_active_secrets: 2,
            default_overlap_period_days: 7,
        }
    }
}

/// Email handler (C5.2) configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmailConfig {
    pub transport: EmailTransportConfig,
    pub max_attachment_bytes: u64,
    pub max_total_bytes: u64,
    pub max_attachments: usize,
    pub max_recipients: usize,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            transport: EmailTransportConfig::File { path: "/tmp/delivery-emails".to_string() },
            max_attachment_bytes: 10 * 1024 * 1024,
            max_total_bytes: 25 * 1024 * 1024,
            max_attachments: 10,
            max_recipients: 50,
        }
    }
}

/// Email transport: SMTP in production, file-based for development/testing.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EmailTransportConfig {
    Smtp {
        host: String,
        port: u16,
        username: String,
        password: String,
        use_tls: bool,
    },
    File {
        path: String,
    },
}

/// SFTP handler (C5.3) connection pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SftpConfig {
    pub max_pool_size: usize,
    #[serde(with = "humantime_serde")]
    pub connection_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub pool_cleanup_interval: Duration,
}

impl Default for SftpConfig {
    fn default() -> Self {
        Self {
            max_pool_size: 10,
            connection_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            pool_cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Download Manager configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DownloadLinkConfig {
    pub default_ttl_seconds: i64,
    pub default_max_access: i32,
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for DownloadLinkConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 24 * 60 * 60,
            default_max_access: 10,
            cleanup_interval: Duration::from_secs(60 * 60),
        }
    }
}
