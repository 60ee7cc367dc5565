//! Delivery Service Facade: the single entry point a caller embeds. Wires
//! together the Persistence Gateway, Secret Manager, Retry Manager, Health
//! Monitor, Destination Handlers, Queue Processor and Download Manager behind
//! one `start`/`stop` lifecycle.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db::errors::DbError;
use crate::db::handlers::Destinations;
use crate::db::models::destinations::{Destination, DestinationConfig, DestinationCreateRequest, DestinationUpdateRequest};
use crate::db::models::health::DestinationHealth;
use crate::download::DownloadManager;
use crate::errors::{Error, Result};
use crate::handlers::email::EmailHandler;
use crate::handlers::sftp::SftpHandler;
use crate::handlers::storage::{DownloadHandler, StorageHandler};
use crate::handlers::webhook::WebhookHandler;
use crate::handlers::{ConnectionTestResult, DestinationHandler, ValidationResult};
use crate::health::HealthMonitor;
use crate::queue_processor::{HandlerRegistry, QueueProcessor};
use crate::retry::RetryManager;
use crate::secrets::SecretManager;
use crate::types::{DestinationId, OrganizationId};

#[derive(Debug, Clone, serde::Serialize)]
pub struct ServiceHealth {
    pub database_ok: bool,
    pub unhealthy_destination_count: usize,
    pub healthy: bool,
}

pub struct DeliveryService {
    pool: sqlx::PgPool,
    handlers: HandlerRegistryRef,
    retry_manager: Arc<RetryManager>,
    health_monitor: Arc<HealthMonitor>,
    secrets: Arc<SecretManager>,
    download_manager: Arc<DownloadManager>,
    queue_config: crate::config::QueueConfig,
    cancellation: Mutex<Option<CancellationToken>>,
    worker_handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

/// Cloneable handle onto the five handler instances, shared by the facade's
/// direct `validate_config`/`test_connection` calls and the processor's
/// per-kind dispatch.
#[derive(Clone)]
struct HandlerRegistryRef {
    webhook: Arc<dyn DestinationHandler>,
    email: Arc<dyn DestinationHandler>,
    sftp: Arc<dyn DestinationHandler>,
    storage: Arc<dyn DestinationHandler>,
    download: Arc<dyn DestinationHandler>,
}

impl HandlerRegistryRef {
    fn get(&self, kind: crate::db::models::destinations::DestinationKind) -> &Arc<dyn DestinationHandler> {
        use crate::db::models::destinations::DestinationKind::*;
        match kind {
            Webhook => &self.webhook,
            Email => &self.email,
            Sftp => &self.sftp,
            Storage => &self.storage,
            Download => &self.download,
        }
    }

    fn to_processor_registry(&self) -> HandlerRegistry {
        HandlerRegistry {
            webhook: Arc::clone(&self.webhook),
            email: Arc::clone(&self.email),
            sftp: Arc::clone(&self.sftp),
            storage: Arc::clone(&self.storage),
            download: Arc::clone(&self.download),
        }
    }
}

impl DeliveryService {
    pub async fn new(pool: sqlx::PgPool, config: &Config) -> Result<Self> {
        let secrets = Arc::new(SecretManager::new(pool.clone(), config.secrets.clone())?);
        let retry_manager = Arc::new(RetryManager::new(pool.clone(), config.retry.clone()));
        let health_monitor = Arc::new(HealthMonitor::new(pool.clone(), config.circuit_breaker.clone()));
        let download_manager = Arc::new(DownloadManager::new(pool.clone(), config.download_links.clone()));

        let webhook: Arc<dyn DestinationHandler> =
            Arc::new(WebhookHandler::new(Arc::clone(&secrets), config.retry.retryable_status_codes.clone()).map_err(Error::Other)?);
        let email: Arc<dyn DestinationHandler> = Arc::new(EmailHandler::new(config.email.clone()));
        let sftp: Arc<dyn DestinationHandler> = Arc::new(SftpHandler::new(config.sftp.clone()));
        let storage: Arc<dyn DestinationHandler> = Arc::new(StorageHandler::new().await);
        let download: Arc<dyn DestinationHandler> = Arc::new(DownloadHandler::new(Arc::clone(&download_manager)));

        let handlers = HandlerRegistryRef {
            webhook,
            email,
            sftp,
            storage,
            download,
        };

        Ok(Self {
            pool,
            handlers,
            retry_manager,
            health_monitor,
            secrets,
            download_manager,
            queue_config: config.queue.clone(),
            cancellation: Mutex::new(None),
            worker_handles: Mutex::new(Vec::new()),
        })
    }

    // -- Destination CRUD -------------------------------------------------

    pub async fn create_destination(&self, request: &DestinationCreateRequest) -> Result<Destination> {
        let validation = self.handlers.get(request.config.kind()).validate_config(&request.config);
        if !validation.valid {
            return Err(Error::InvalidConfig {
                message: validation.errors.join("; "),
            });
        }
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let mut repo = Destinations::new(&mut conn);
        Ok(repo.create(request).await?)
    }

    pub async fn get_destination(&self, id: DestinationId) -> Result<Destination> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let mut repo = Destinations::new(&mut conn);
        repo.get_by_id(id).await?.ok_or_else(|| Error::NotFound {
            resource: "destination".to_string(),
            id: id.to_string(),
        })
    }

    pub async fn list_destinations(&self, organization_id: OrganizationId) -> Result<Vec<Destination>> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let mut repo = Destinations::new(&mut conn);
        Ok(repo.find_by_org(organization_id).await?)
    }

    pub async fn update_destination(&self, id: DestinationId, request: &DestinationUpdateRequest) -> Result<Destination> {
        if let Some(config) = &request.config {
            let validation = self.handlers.get(config.kind()).validate_config(config);
            if !validation.valid {
                return Err(Error::InvalidConfig {
                    message: validation.errors.join("; "),
                });
            }
        }
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let mut repo = Destinations::new(&mut conn);
        Ok(repo.update(id, request).await?)
    }

    pub async fn disable_destination(&self, id: DestinationId, disabled_by: Option<Uuid>) -> Result<Destination> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let mut repo = Destinations::new(&mut conn);
        Ok(repo.disable(id, disabled_by).await?)
    }

    pub fn validate_config(&self, config: &DestinationConfig) -> ValidationResult {
        self.handlers.get(config.kind()).validate_config(config)
    }

    pub async fn test_connection(&self, config: &DestinationConfig) -> ConnectionTestResult {
        self.handlers.get(config.kind()).test_connection(config).await
    }

    // -- Health -------------------------------------------------------------

    pub async fn get_destination_health(&self, destination_id: DestinationId) -> Result<Option<DestinationHealth>> {
        self.health_monitor.get_health(destination_id).await
    }

    pub async fn find_unhealthy_destinations(&self) -> Result<Vec<DestinationHealth>> {
        self.health_monitor.find_unhealthy().await
    }

    /// Convenience wrapper for callers recording an attempt outcome outside the
    /// queue processor's own dispatch path (e.g. a one-off manual redelivery).
    pub async fn record_delivery_success(&self, destination_id: DestinationId, response_time_ms: f64) -> Result<DestinationHealth> {
        self.health_monitor.record_success(destination_id, response_time_ms).await
    }

    pub async fn record_delivery_failure(&self, destination_id: DestinationId) -> Result<DestinationHealth> {
        self.health_monitor.record_failure(destination_id).await
    }

    pub fn secrets(&self) -> &Arc<SecretManager> {
        &self.secrets
    }

    pub fn download_manager(&self) -> &Arc<DownloadManager> {
        &self.download_manager
    }

    pub fn retry_manager(&self) -> &Arc<RetryManager> {
        &self.retry_manager
    }

    pub async fn health_check(&self) -> ServiceHealth {
        let database_ok = sqlx::query("SELECT 1").execute(&self.pool).await.is_ok();
        let unhealthy_destination_count = self.health_monitor.find_unhealthy().await.map(|v| v.len()).unwrap_or(0);
        ServiceHealth {
            database_ok,
            unhealthy_destination_count,
            healthy: database_ok,
        }
    }

    // -- Lifecycle ------------------------------------------------------------

    /// Launch the queue worker pool, the crash-recovery sweep, and the
    /// periodic maintenance loops (expired download link / secret cleanup).
    pub async fn start(&self) {
        let token = CancellationToken::new();

        let processor = Arc::new(QueueProcessor::new(
            self.pool.clone(),
            self.queue_config.clone(),
            Arc::clone(&self.retry_manager),
            Arc::clone(&self.health_monitor),
            self.handlers.to_processor_registry(),
        ));
        let mut handles = processor.spawn(token.clone());

        handles.push(spawn_maintenance_loop(token.clone(), self.download_manager.cleanup_interval(), {
            let download_manager = Arc::clone(&self.download_manager);
            move || {
                let download_manager = Arc::clone(&download_manager);
                async move {
                    match download_manager.cleanup_expired_links().await {
                        Ok(bytes) => info!(bytes_freed = bytes, "cleaned up expired download links"),
                        Err(e) => error!(error = %e, "download link cleanup failed"),
                    }
                }
            }
        }));

        handles.push(spawn_maintenance_loop(token.clone(), Duration::from_secs(3600), {
            let secrets = Arc::clone(&self.secrets);
            move || {
                let secrets = Arc::clone(&secrets);
                async move {
                    match secrets.cleanup_expired_secrets().await {
                        Ok(n) if n > 0 => info!(count = n, "deactivated expired webhook secrets"),
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "secret cleanup failed"),
                    }
                }
            }
        }));

        *self.cancellation.lock().await = Some(token);
        *self.worker_handles.lock().await = handles;
        info!("delivery service started");
    }

    /// Cancel the poll loops and wait up to `drain_timeout` for in-flight
    /// handler calls to finish before forcibly dropping the remaining handles.
    pub async fn stop(&self, drain_timeout: Duration) {
        let Some(token) = self.cancellation.lock().await.take() else {
            return;
        };
        token.cancel();

        let handles = std::mem::take(&mut *self.worker_handles.lock().await);
        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };

        if tokio::time::timeout(drain_timeout, drain).await.is_err() {
            warn!("drain timeout elapsed; some in-flight deliveries may be abandoned and will be reclaimed on next startup");
        }
        info!("delivery service stopped");
    }
}

fn spawn_maintenance_loop<F, Fut>(cancellation: CancellationToken, interval: Duration, mut task: F) -> tokio::task::JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancellation.cancelled() => break,
            }
            task().await;
        }
    })
}
