//! Retry Manager: backoff calculation, error classification, and attempt
//! bookkeeping against the durable queue.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::prelude::RngExt;
use serde_json::json;
use sqlx::PgPool;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::db::errors::DbError;
use crate::db::handlers::Queue;
use crate::db::models::queue::QueueItem;
use crate::errors::Result;
use crate::types::QueueItemId;

const NETWORK_RETRYABLE_CODES: &[&str] = &["ECONNRESET", "ECONNREFUSED", "ETIMEDOUT", "ENOTFOUND", "EAI_AGAIN"];

/// The outcome of a single delivery attempt, as reported by a destination handler.
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    pub success: bool,
    pub status_code: Option<u16>,
    pub network_error_code: Option<String>,
    pub message: Option<String>,
    pub response_time_ms: f64,
    pub cross_system_reference: Option<String>,
}

impl AttemptOutcome {
    pub fn success(response_time_ms: f64, cross_system_reference: Option<String>) -> Self {
        Self {
            success: true,
            status_code: None,
            network_error_code: None,
            message: None,
            response_time_ms,
            cross_system_reference,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            status_code: None,
            network_error_code: None,
            message: Some(message.into()),
            response_time_ms: 0.0,
            cross_system_reference: None,
        }
    }

    pub fn with_status_code(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    pub fn with_network_error_code(mut self, code: impl Into<String>) -> Self {
        self.network_error_code = Some(code.into());
        self
    }
}

/// Summary of where a queue item stands in its retry lifecycle.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RetrySchedule {
    pub current_attempt: i32,
    pub max_attempts: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub backoff_delay_ms: i64,
    pub total_delay_ms: i64,
}

pub struct RetryManager {
    pool: PgPool,
    config: RetryConfig,
}

impl RetryManager {
    pub fn new(pool: PgPool, config: RetryConfig) -> Self {
        Self { pool, config }
    }

    /// `delay = min(base_delay * multiplier^attempt, max_delay)`, plus uniform
    /// jitter up to `jitter_max_percent` when enabled.
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay.as_secs_f64();
        let raw = base * self.config.backoff_multiplier.powi(attempt as i32);
        let capped = raw.min(self.config.max_delay.as_secs_f64());

        let delay_secs = if self.config.jitter_enabled {
            let jitter_fraction = self.config.jitter_max_percent / 100.0;
            let jitter = capped * jitter_fraction * rand::rng().random::<f64>();
            capped + jitter
        } else {
            capped
        };

        Duration::from_secs_f64(delay_secs.max(0.0))
    }

    /// Classify a failure as retryable or not.
    pub fn is_retryable(&self, outcome: &AttemptOutcome) -> bool {
        if let Some(status) = outcome.status_code {
            return self.config.retryable_status_codes.contains(&status);
        }

        if let Some(code) = &outcome.network_error_code {
            return NETWORK_RETRYABLE_CODES.contains(&code.as_str());
        }

        if let Some(message) = &outcome.message {
            let lower = message.to_lowercase();
            if lower.contains("rate limit") || lower.contains("service unavailable") || lower.contains("timed out") || lower.contains("timeout") {
                return true;
            }
            if lower.contains("unauthorized") || lower.contains("forbidden") || lower.contains("invalid") || lower.contains("not found") {
                return false;
            }
        }

        // Unclassified errors default to retryable: a transient condition we don't
        // recognize should not permanently strand a delivery.
        true
    }

    pub fn should_retry(&self, item: &QueueItem, outcome: &AttemptOutcome) -> bool {
        if item.retry_count >= item.max_retries {
            return false;
        }
        self.is_retryable(outcome)
    }

    pub fn get_retry_schedule(&self, item: &QueueItem) -> RetrySchedule {
        let backoff = self.calculate_backoff(item.retry_count as u32);
        let total_delay: Duration = (0..=item.retry_count as u32).map(|attempt| self.calculate_backoff(attempt)).sum();

        RetrySchedule {
            current_attempt: item.retry_count,
            max_attempts: item.max_retries,
            next_retry_at: item.next_retry_at,
            backoff_delay_ms: backoff.as_millis() as i64,
            total_delay_ms: total_delay.as_millis() as i64,
        }
    }

    /// Persist the result of an attempt: complete, reschedule, or fail terminally.
    /// Returns `true` if the item will be retried.
    pub async fn record_attempt(&self, item: &QueueItem, outcome: &AttemptOutcome) -> Result<bool> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let mut repo = Queue::new(&mut conn);

        if outcome.success {
            repo.mark_completed(item.id).await?;
            return Ok(false);
        }

        let attempt_record = json!({
            "attempt": item.retry_count,
            "at": Utc::now().to_rfc3339(),
            "status_code": outcome.status_code,
            "network_error_code": outcome.network_error_code,
            "message": outcome.message,
        });

        if self.should_retry(item, outcome) {
            let delay = self.calculate_backoff(item.retry_count as u32);
            let next_retry_at = Utc::now() + ChronoDuration::from_std(delay).unwrap_or(ChronoDuration::seconds(1));
            repo.schedule_retry(item.id, next_retry_at, attempt_record).await?;
            Ok(true)
        } else {
            repo.mark_failed(item.id, !self.is_retryable(outcome), attempt_record).await?;
            Ok(false)
        }
    }

    /// Operator tool: reset a failed item back to `pending` with a clean attempt
    /// count, for manual redelivery.
    pub async fn reset_retry_count(&self, item_id: QueueItemId) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        sqlx::query("UPDATE delivery_queue_items SET status = 'pending', retry_count = 0, next_retry_at = NULL, updated_at = now() WHERE id = $1")
            .bind(item_id)
            .execute(&mut *conn)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }

    /// Operator tool: force an item to terminal `failed`, bypassing further retry
    /// eligibility, e.g. after determining the destination config itself is broken.
    pub async fn mark_as_non_retryable(&self, item_id: QueueItemId, reason: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let mut repo = Queue::new(&mut conn);
        let record = json!({ "at": Utc::now().to_rfc3339(), "message": reason, "forced": true });
        repo.mark_failed(item_id, true, record).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn config() -> RetryConfig {
        RetryConfig {
            max_retries: 5,
            base_delay: StdDuration::from_secs(1),
            max_delay: StdDuration::from_secs(300),
            backoff_multiplier: 2.0,
            jitter_enabled: false,
            jitter_max_percent: 10.0,
            retryable_status_codes: vec![408, 429, 500, 502, 503, 504],
        }
    }

    fn manager() -> RetryManager {
        RetryManager {
            pool: unreachable_pool(),
            config: config(),
        }
    }

    // The backoff/classification methods never touch the pool; this lets unit
    // tests exercise them without a database.
    fn unreachable_pool() -> PgPool {
        PgPool::connect_lazy("postgres://invalid/invalid").expect("lazy pool construction never fails")
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let m = manager();
        assert_eq!(m.calculate_backoff(0), StdDuration::from_secs(1));
        assert_eq!(m.calculate_backoff(1), StdDuration::from_secs(2));
        assert_eq!(m.calculate_backoff(2), StdDuration::from_secs(4));
        assert_eq!(m.calculate_backoff(10), StdDuration::from_secs(300));
    }

    #[test]
    fn classifies_retryable_status_codes() {
        let m = manager();
        assert!(m.is_retryable(&AttemptOutcome::failure("server error").with_status_code(503)));
        assert!(!m.is_retryable(&AttemptOutcome::failure("bad request").with_status_code(400)));
    }

    #[test]
    fn classifies_network_errors() {
        let m = manager();
        assert!(m.is_retryable(&AttemptOutcome::failure("reset").with_network_error_code("ECONNRESET")));
        assert!(!m.is_retryable(&AttemptOutcome::failure("reset").with_network_error_code("EBADF")));
    }

    #[test]
    fn classifies_message_text() {
        let m = manager();
        assert!(m.is_retryable(&AttemptOutcome::failure("Rate limit exceeded, retry later")));
        assert!(!m.is_retryable(&AttemptOutcome::failure("Unauthorized: invalid API key")));
    }
}
