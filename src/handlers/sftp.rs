//! SFTP Handler: uploads the delivery envelope as a file over SFTP, pooling
//! connections per `host:port:username` since the underlying `ssh2` crate is
//! a blocking libssh2 binding with no async story of its own.

use async_trait::async_trait;
use serde_json::Value;
use std::io::Write;
use std::net::TcpStream;
use std::time::{Duration, Instant};
use thiserror::Error as ThisError;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{ConnectionTestResult, DeliveryEnvelope, DeliveryResult, DestinationHandler, HandlerFeature, ValidationResult};
use crate::config::SftpConfig;
use crate::db::models::destinations::DestinationConfig;

#[derive(Debug, ThisError)]
enum SftpError {
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sftp protocol error: {0}")]
    Ssh(#[from] ssh2::Error),
    #[error("integrity check failed: wrote {wrote} bytes but remote stat reports {stat} bytes")]
    Integrity { wrote: u64, stat: u64 },
}

impl SftpError {
    fn is_retryable(&self) -> bool {
        match self {
            SftpError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::TimedOut | std::io::ErrorKind::ConnectionAborted | std::io::ErrorKind::BrokenPipe
            ),
            SftpError::Ssh(_) => true,
            SftpError::Integrity { .. } => false,
        }
    }
}

struct PooledSession {
    session: ssh2::Session,
    last_used: Instant,
}

fn pool_key(host: &str, port: u16, username: &str) -> String {
    format!("{host}:{port}:{username}")
}

pub struct SftpHandler {
    config: SftpConfig,
    pool: Mutex<std::collections::HashMap<String, Vec<PooledSession>>>,
}

impl SftpHandler {
    pub fn new(config: SftpConfig) -> Self {
        Self {
            config,
            pool: Mutex::new(std::collections::HashMap::new()),
        }
    }

    async fn acquire(&self, host: String, port: u16, username: String, password: Option<String>, private_key: Option<String>) -> Result<ssh2::Session, SftpError> {
        let key = pool_key(&host, port, &username);
        let idle_timeout = self.config.idle_timeout;

        {
            let mut pool = self.pool.lock().await;
            if let Some(sessions) = pool.get_mut(&key) {
                while let Some(pooled) = sessions.pop() {
                    if pooled.last_used.elapsed() < idle_timeout {
                        return Ok(pooled.session);
                    }
                }
            }
        }

        let connect_timeout = self.config.connection_timeout;
        tokio::task::spawn_blocking(move || connect(&host, port, &username, password.as_deref(), private_key.as_deref(), connect_timeout))
            .await
            .expect("blocking sftp connect task panicked")
    }

    async fn release(&self, host: &str, port: u16, username: &str, session: ssh2::Session) {
        let key = pool_key(host, port, username);
        let mut pool = self.pool.lock().await;
        let sessions = pool.entry(key).or_default();
        if sessions.len() < self.config.max_pool_size {
            sessions.push(PooledSession { session, last_used: Instant::now() });
        }
    }

    /// Drop sessions that have sat idle past the configured timeout. Intended
    /// to be called periodically by the facade's maintenance loop.
    pub async fn prune_idle(&self) {
        let idle_timeout = self.config.idle_timeout;
        let mut pool = self.pool.lock().await;
        for sessions in pool.values_mut() {
            sessions.retain(|p| p.last_used.elapsed() < idle_timeout);
        }
        pool.retain(|_, sessions| !sessions.is_empty());
    }
}

fn connect(host: &str, port: u16, username: &str, password: Option<&str>, private_key: Option<&str>, timeout: Duration) -> Result<ssh2::Session, SftpError> {
    let tcp = TcpStream::connect_timeout(&format!("{host}:{port}").parse().map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid host:port"))?, timeout)?;
    tcp.set_read_timeout(Some(timeout))?;
    tcp.set_write_timeout(Some(timeout))?;

    let mut session = ssh2::Session::new().map_err(SftpError::Ssh)?;
    session.set_tcp_stream(tcp);
    session.handshake().map_err(SftpError::Ssh)?;

    match (password, private_key) {
        (Some(password), _) => session.userauth_password(username, password).map_err(SftpError::Ssh)?,
        (None, Some(key)) => {
            if std::path::Path::new(key).exists() {
                session.userauth_pubkey_file(username, None, std::path::Path::new(key), None).map_err(SftpError::Ssh)?;
            } else {
                session.userauth_pubkey_memory(username, None, key, None).map_err(SftpError::Ssh)?;
            }
        }
        (None, None) => {
            return Err(SftpError::Ssh(ssh2::Error::from_errno(ssh2::ErrorCode::Session(-18))));
        }
    }

    Ok(session)
}

fn render_filename(pattern: &str, delivery_id: &str, organization_id: &str, kind: &str, timestamp: chrono::DateTime<chrono::Utc>) -> String {
    pattern
        .replace("{deliveryId}", delivery_id)
        .replace("{organizationId}", organization_id)
        .replace("{type}", kind)
        .replace("{timestamp}", &timestamp.timestamp().to_string())
}

/// Upload `body` to `{remote_dir}/{filename}`, creating the directory (mode
/// 0755) if absent, writing the file with mode 0644, and verifying the
/// remote size matches what was written.
fn upload(session: &ssh2::Session, remote_dir: &str, filename: &str, body: &[u8]) -> Result<(), SftpError> {
    let sftp = session.sftp().map_err(SftpError::Ssh)?;

    if sftp.stat(std::path::Path::new(remote_dir)).is_err() {
        sftp.mkdir(std::path::Path::new(remote_dir), 0o755).map_err(SftpError::Ssh)?;
    }

    let remote_path = std::path::Path::new(remote_dir).join(filename);
    let mut file = sftp
        .open_mode(&remote_path, ssh2::OpenFlags::WRITE | ssh2::OpenFlags::CREATE | ssh2::OpenFlags::TRUNCATE, 0o644, ssh2::OpenType::File)
        .map_err(SftpError::Ssh)?;
    file.write_all(body)?;
    drop(file);

    let stat = sftp.stat(&remote_path).map_err(SftpError::Ssh)?;
    let remote_size = stat.size.unwrap_or(0);
    if remote_size != body.len() as u64 {
        return Err(SftpError::Integrity { wrote: body.len() as u64, stat: remote_size });
    }
    Ok(())
}

#[async_trait]
impl DestinationHandler for SftpHandler {
    fn validate_config(&self, config: &DestinationConfig) -> ValidationResult {
        let DestinationConfig::Sftp {
            host, port, path, password, private_key, ..
        } = config
        else {
            return ValidationResult::from_errors(vec!["config is not an sftp destination".to_string()]);
        };

        let mut errors = Vec::new();
        if host.is_empty() {
            errors.push("host is required".to_string());
        }
        if *port == 0 {
            errors.push("port must be between 1 and 65535".to_string());
        }
        if !path.starts_with('/') {
            errors.push("path must be absolute".to_string());
        }
        match (password, private_key) {
            (Some(_), Some(_)) => errors.push("exactly one of password or private_key must be set, not both".to_string()),
            (None, None) => errors.push("one of password or private_key is required".to_string()),
            _ => {}
        }

        ValidationResult {
            valid: errors.is_empty(),
            errors,
            warnings: Vec::new(),
        }
    }

    async fn test_connection(&self, config: &DestinationConfig) -> ConnectionTestResult {
        let DestinationConfig::Sftp {
            host, port, username, password, private_key, ..
        } = config
        else {
            return ConnectionTestResult {
                success: false,
                response_time_ms: 0.0,
                error: Some("config is not an sftp destination".to_string()),
                details: None,
            };
        };

        let start = Instant::now();
        match self.acquire(host.clone(), *port, username.clone(), password.clone(), private_key.clone()).await {
            Ok(session) => {
                self.release(host, *port, username, session).await;
                ConnectionTestResult {
                    success: true,
                    response_time_ms: start.elapsed().as_secs_f64() * 1000.0,
                    error: None,
                    details: None,
                }
            }
            Err(e) => ConnectionTestResult {
                success: false,
                response_time_ms: start.elapsed().as_secs_f64() * 1000.0,
                error: Some(e.to_string()),
                details: None,
            },
        }
    }

    async fn deliver(&self, _destination_id: Uuid, envelope: &DeliveryEnvelope, config: &DestinationConfig) -> DeliveryResult {
        let DestinationConfig::Sftp {
            host,
            port,
            username,
            password,
            private_key,
            path,
            filename,
        } = config
        else {
            return DeliveryResult::failure("config is not an sftp destination", 0.0, false);
        };

        let body = match serde_json::to_vec_pretty(envelope) {
            Ok(b) => b,
            Err(e) => return DeliveryResult::failure(format!("failed to serialize envelope: {e}"), 0.0, false),
        };

        let pattern = filename.as_deref().unwrap_or("{deliveryId}.json");
        let remote_filename = render_filename(pattern, &envelope.delivery_id, &envelope.organization_id.to_string(), &envelope.kind, envelope.timestamp);

        let start = Instant::now();
        let session = match self.acquire(host.clone(), *port, username.clone(), password.clone(), private_key.clone()).await {
            Ok(s) => s,
            Err(e) => return DeliveryResult::failure(e.to_string(), start.elapsed().as_secs_f64() * 1000.0, e.is_retryable()),
        };

        let path = path.clone();
        let upload_result = tokio::task::spawn_blocking({
            let session = session;
            let path = path.clone();
            let remote_filename = remote_filename.clone();
            move || {
                let result = upload(&session, &path, &remote_filename, &body);
                (session, result)
            }
        })
        .await
        .expect("blocking sftp upload task panicked");

        let (session, result) = upload_result;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(()) => {
                self.release(host, *port, username, session).await;
                DeliveryResult {
                    success: true,
                    response_time_ms: elapsed_ms,
                    delivered_at: Some(chrono::Utc::now()),
                    cross_system_reference: Some(format!("{path}/{remote_filename}")),
                    status_code: None,
                    network_error_code: None,
                    error: None,
                    retryable: false,
                }
            }
            Err(e) => {
                let retryable = e.is_retryable();
                DeliveryResult::failure(e.to_string(), elapsed_ms, retryable)
            }
        }
    }

    fn supports_feature(&self, feature: HandlerFeature) -> bool {
        matches!(feature, HandlerFeature::ConnectionPooling | HandlerFeature::RetryWithBackoff)
    }

    fn config_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "required": ["host", "port", "username", "path"],
            "properties": {
                "host": { "type": "string" },
                "port": { "type": "integer", "minimum": 1, "maximum": 65535 },
                "username": { "type": "string" },
                "password": { "type": "string" },
                "private_key": { "type": "string" },
                "path": { "type": "string" },
                "filename": { "type": "string" }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_all_pattern_placeholders() {
        let ts = chrono::DateTime::parse_from_rfc3339("2024-01-15T10:30:00Z").unwrap().with_timezone(&chrono::Utc);
        let name = render_filename("{organizationId}/{type}-{deliveryId}-{timestamp}.json", "del-1", "org-1", "audit.event", ts);
        assert_eq!(name, "org-1/audit.event-del-1-1705314600.json");
    }

    #[test]
    fn pool_key_combines_host_port_username() {
        assert_eq!(pool_key("example.com", 22, "alice"), "example.com:22:alice");
    }
}
