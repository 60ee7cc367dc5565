//! Queue Processor: the central dispatch loop. A configurable number of
//! worker tasks repeatedly claim a batch of ready rows, fan them out up to a
//! per-worker concurrency limit, and feed the outcome back through the Retry
//! Manager and Health Monitor.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::db::handlers::{DeliveryLogs, Queue};
use crate::db::models::delivery_logs::DeliveryLogAppend;
use crate::db::models::destinations::DestinationKind;
use crate::db::models::queue::ClaimedQueueItem;
use crate::handlers::{DeliveryEnvelope, DestinationHandler};
use crate::health::HealthMonitor;
use crate::retry::{AttemptOutcome, RetryManager};
use crate::types::DestinationId;
use sqlx::PgPool;

/// One handler implementation per destination kind. The `download` kind is
/// wired in by whichever caller constructs the registry (it requires a
/// [`crate::handlers::storage::DownloadLinkCreator`] that only the facade can
/// supply).
pub struct HandlerRegistry {
    pub webhook: Arc<dyn DestinationHandler>,
    pub email: Arc<dyn DestinationHandler>,
    pub sftp: Arc<dyn DestinationHandler>,
    pub storage: Arc<dyn DestinationHandler>,
    pub download: Arc<dyn DestinationHandler>,
}

impl HandlerRegistry {
    fn get(&self, kind: DestinationKind) -> &Arc<dyn DestinationHandler> {
        match kind {
            DestinationKind::Webhook => &self.webhook,
            DestinationKind::Email => &self.email,
            DestinationKind::Sftp => &self.sftp,
            DestinationKind::Storage => &self.storage,
            DestinationKind::Download => &self.download,
        }
    }
}

pub struct QueueProcessor {
    pool: PgPool,
    config: QueueConfig,
    retry_manager: Arc<RetryManager>,
    health_monitor: Arc<HealthMonitor>,
    handlers: HandlerRegistry,
}

impl QueueProcessor {
    pub fn new(pool: PgPool, config: QueueConfig, retry_manager: Arc<RetryManager>, health_monitor: Arc<HealthMonitor>, handlers: HandlerRegistry) -> Self {
        Self {
            pool,
            config,
            retry_manager,
            health_monitor,
            handlers,
        }
    }

    /// Spawn `config.workers` poll loops plus one stale-row recovery sweep.
    /// Every task observes `cancellation` and exits once cancelled; callers
    /// await the returned handles (with their own timeout) to drain.
    pub fn spawn(self: Arc<Self>, cancellation: CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.config.workers + 1);

        for worker_id in 0..self.config.workers {
            let processor = Arc::clone(&self);
            let token = cancellation.clone();
            handles.push(tokio::spawn(async move { processor.worker_loop(worker_id, token).await }));
        }

        let processor = Arc::clone(&self);
        let token = cancellation.clone();
        handles.push(tokio::spawn(async move { processor.recovery_loop(token).await }));

        handles
    }

    async fn worker_loop(&self, worker_id: usize, cancellation: CancellationToken) {
        info!(worker_id, "queue worker starting");
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_deliveries));

        loop {
            if cancellation.is_cancelled() {
                break;
            }

            let claimed = {
                let mut conn = match self.pool.acquire().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(worker_id, error = %e, "failed to acquire connection for claim_ready");
                        tokio::time::sleep(self.config.poll_interval).await;
                        continue;
                    }
                };
                let mut repo = Queue::new(&mut conn);
                repo.claim_ready(self.config.batch_size).await
            };

            let batch = match claimed {
                Ok(rows) => rows,
                Err(e) => {
                    error!(worker_id, error = %e, "claim_ready failed");
                    tokio::time::sleep(self.config.poll_interval).await;
                    continue;
                }
            };

            if batch.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = cancellation.cancelled() => break,
                }
                continue;
            }

            debug!(worker_id, count = batch.len(), "claimed batch");

            let semaphore = Arc::clone(&semaphore);
            stream::iter(batch)
                .for_each_concurrent(self.config.max_concurrent_deliveries, |item| {
                    let semaphore = Arc::clone(&semaphore);
                    async move {
                        let _permit = match semaphore.acquire().await {
                            Ok(p) => p,
                            Err(_) => return,
                        };
                        self.process_item(item).await;
                    }
                })
                .await;
        }

        info!(worker_id, "queue worker stopped");
    }

    async fn recovery_loop(&self, cancellation: CancellationToken) {
        let interval = self.config.visibility_timeout.max(Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancellation.cancelled() => break,
            }

            let mut conn = match self.pool.acquire().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!(error = %e, "recovery sweep failed to acquire connection");
                    continue;
                }
            };
            let mut repo = Queue::new(&mut conn);
            match repo.reclaim_stale_processing(self.config.visibility_timeout.as_secs() as i64).await {
                Ok(0) => {}
                Ok(n) => warn!(count = n, "reclaimed stale processing rows"),
                Err(e) => error!(error = %e, "reclaim_stale_processing failed"),
            }
        }
    }

    async fn process_item(&self, item: ClaimedQueueItem) {
        let destination_id: DestinationId = item.destination_id;

        if item.destination_disabled {
            self.fail_without_attempt(&item, "destination disabled").await;
            return;
        }

        match self.health_monitor.should_allow_delivery(destination_id, false).await {
            Ok(true) => {}
            Ok(false) => {
                self.reschedule_suppressed(&item).await;
                return;
            }
            Err(e) => {
                error!(delivery_id = %item.delivery_id, error = %e, "should_allow_delivery check failed");
                self.reschedule_suppressed(&item).await;
                return;
            }
        }

        let envelope = DeliveryEnvelope {
            delivery_id: item.delivery_id.clone(),
            organization_id: item.organization_id,
            kind: item.kind.clone(),
            data: item.payload.0.clone(),
            metadata: item.metadata.0.clone(),
            correlation_id: item.correlation_id.clone(),
            idempotency_key: item.idempotency_key.clone(),
            timestamp: item.created_at,
        };

        let handler = self.handlers.get(item.destination_config.0.kind()).clone();
        let timeout = Duration::from_millis(crate::handlers::DEFAULT_HANDLER_TIMEOUT_MS);

        let outcome = match tokio::time::timeout(timeout, handler.deliver(destination_id, &envelope, &item.destination_config.0)).await {
            Ok(result) => result,
            Err(_) => crate::handlers::DeliveryResult::failure("handler call timed out", timeout.as_millis() as f64, true),
        };

        let attempt = if outcome.success {
            AttemptOutcome::success(outcome.response_time_ms, outcome.cross_system_reference.clone())
        } else {
            let mut attempt = AttemptOutcome::failure(outcome.error.clone().unwrap_or_else(|| "delivery failed".to_string()));
            attempt.response_time_ms = outcome.response_time_ms;
            if let Some(code) = outcome.status_code {
                attempt = attempt.with_status_code(code);
            }
            if let Some(code) = &outcome.network_error_code {
                attempt = attempt.with_network_error_code(code.clone());
            }
            attempt
        };

        let queue_item = item.as_queue_item();
        if let Err(e) = self.retry_manager.record_attempt(&queue_item, &attempt).await {
            error!(delivery_id = %item.delivery_id, error = %e, "record_attempt failed");
        }

        if let Err(e) = self.health_monitor.update_circuit_breaker_state(destination_id, outcome.success, Some(outcome.response_time_ms)).await {
            error!(delivery_id = %item.delivery_id, error = %e, "update_circuit_breaker_state failed");
        }

        self.append_log(&item, outcome.success, outcome.error.clone(), outcome.cross_system_reference.clone()).await;
    }

    async fn reschedule_suppressed(&self, item: &ClaimedQueueItem) {
        let backoff = self.retry_manager.calculate_backoff(item.retry_count as u32) / 2;
        let next_retry_at = chrono::Utc::now() + chrono::Duration::from_std(backoff).unwrap_or(chrono::Duration::seconds(1));

        let mut conn = match self.pool.acquire().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(delivery_id = %item.delivery_id, error = %e, "failed to acquire connection to reschedule suppressed item");
                return;
            }
        };
        let mut repo = Queue::new(&mut conn);
        if let Err(e) = repo.reschedule_without_attempt(item.id, next_retry_at).await {
            error!(delivery_id = %item.delivery_id, error = %e, "reschedule_without_attempt failed");
        }
    }

    async fn fail_without_attempt(&self, item: &ClaimedQueueItem, reason: &str) {
        if let Err(e) = self.retry_manager.mark_as_non_retryable(item.id, reason).await {
            error!(delivery_id = %item.delivery_id, error = %e, "mark_as_non_retryable failed");
        }
        self.append_log(item, false, Some(reason.to_string()), None).await;
    }

    async fn append_log(&self, item: &ClaimedQueueItem, success: bool, failure_reason: Option<String>, cross_system_reference: Option<String>) {
        let mut conn = match self.pool.acquire().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(delivery_id = %item.delivery_id, error = %e, "failed to acquire connection to append delivery log");
                return;
            }
        };
        let mut repo = DeliveryLogs::new(&mut conn);
        let entry = DeliveryLogAppend {
            delivery_id: item.delivery_id.clone(),
            organization_id: item.organization_id,
            destination_id: item.destination_id,
            success,
            failure_reason,
            cross_system_reference,
        };
        if let Err(e) = repo.append(&entry).await {
            error!(delivery_id = %item.delivery_id, error = %e, "delivery log append failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::destinations::DestinationKind;

    struct NullHandler;
    #[async_trait::async_trait]
    impl DestinationHandler for NullHandler {
        fn validate_config(&self, _config: &crate::db::models::destinations::DestinationConfig) -> crate::handlers::ValidationResult {
            crate::handlers::ValidationResult::ok()
        }
        async fn test_connection(&self, _config: &crate::db::models::destinations::DestinationConfig) -> crate::handlers::ConnectionTestResult {
            crate::handlers::ConnectionTestResult {
                success: true,
                response_time_ms: 0.0,
                error: None,
                details: None,
            }
        }
        async fn deliver(
            &self,
            _destination_id: uuid::Uuid,
            _envelope: &DeliveryEnvelope,
            _config: &crate::db::models::destinations::DestinationConfig,
        ) -> crate::handlers::DeliveryResult {
            crate::handlers::DeliveryResult {
                success: true,
                response_time_ms: 1.0,
                delivered_at: Some(chrono::Utc::now()),
                cross_system_reference: None,
                status_code: None,
                network_error_code: None,
                error: None,
                retryable: false,
            }
        }
        fn supports_feature(&self, _feature: crate::handlers::HandlerFeature) -> bool {
            false
        }
        fn config_schema(&self) -> serde_json::Value {
            serde_json::json!({})
        }
    }

    #[test]
    fn registry_dispatches_by_kind() {
        let registry = HandlerRegistry {
            webhook: Arc::new(NullHandler),
            email: Arc::new(NullHandler),
            sftp: Arc::new(NullHandler),
            storage: Arc::new(NullHandler),
            download: Arc::new(NullHandler),
        };
        let _ = registry.get(DestinationKind::Webhook);
        let _ = registry.get(DestinationKind::Download);
    }

    #[test]
    fn null_handler_reports_success_without_a_tokio_runtime_attribute() {
        let handler = NullHandler;
        let envelope = DeliveryEnvelope {
            delivery_id: "delivery-1".to_string(),
            organization_id: uuid::Uuid::new_v4(),
            kind: "audit.event".to_string(),
            data: serde_json::json!({}),
            metadata: serde_json::json!({}),
            correlation_id: None,
            idempotency_key: None,
            timestamp: chrono::Utc::now(),
        };
        let config = crate::db::models::destinations::DestinationConfig::Webhook {
            url: "https://example.com".to_string(),
            method: "POST".to_string(),
            headers: Default::default(),
            timeout_ms: 30_000,
            retry_config: None,
        };

        let result = tokio_test::block_on(handler.deliver(uuid::Uuid::new_v4(), &envelope, &config));
        assert!(result.success);
    }
}
