//! `wiremock`-backed HTTP delivery tests for the webhook handler, covering
//! signature header emission and the retryable/non-retryable status split.

mod common;

use delivery_core::config::SecretsConfig;
use delivery_core::db::models::destinations::DestinationConfig;
use delivery_core::handlers::DestinationHandler;
use delivery_core::handlers::webhook::WebhookHandler;
use delivery_core::secrets::SecretManager;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;
use wiremock::matchers::{header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn envelope() -> delivery_core::handlers::DeliveryEnvelope {
    delivery_core::handlers::DeliveryEnvelope {
        delivery_id: "delivery-1".to_string(),
        organization_id: Uuid::new_v4(),
        kind: "audit.event".to_string(),
        data: serde_json::json!({ "action": "export" }),
        metadata: serde_json::json!({}),
        correlation_id: Some("corr-1".to_string()),
        idempotency_key: None,
        timestamp: chrono::Utc::now(),
    }
}

fn config_for(url: String) -> DestinationConfig {
    DestinationConfig::Webhook {
        url,
        method: "POST".to_string(),
        headers: Default::default(),
        timeout_ms: 5_000,
        retry_config: None,
    }
}

fn secrets_manager(pool: PgPool) -> Arc<SecretManager> {
    Arc::new(
        SecretManager::new(
            pool,
            SecretsConfig {
                enabled: true,
                encryption_key: Some("ab".repeat(32)),
                max_active_secrets: 2,
                default_overlap_period_days: 7,
            },
        )
        .expect("construct secret manager"),
    )
}

#[sqlx::test]
#[test_log::test]
async fn delivers_signed_payload_when_a_primary_secret_exists(pool: PgPool) {
    let (_organization_id, destination_id) = common::create_destination(&pool).await;
    let secrets = secrets_manager(pool.clone());
    secrets.create_secret(destination_id).await.expect("create primary secret");

    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(header_exists("X-Signature"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "ok": true })))
        .mount(&mock_server)
        .await;

    let handler = WebhookHandler::new(secrets, vec![408, 429, 500, 502, 503, 504]).expect("build handler");
    let cfg = config_for(format!("{}/hook", mock_server.uri()));
    let result = handler.deliver(destination_id, &envelope(), &cfg).await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.status_code, Some(200));
}

#[sqlx::test]
#[test_log::test]
async fn delivers_unsigned_when_destination_has_no_primary_secret(pool: PgPool) {
    let (_organization_id, destination_id) = common::create_destination(&pool).await;
    let secrets = secrets_manager(pool.clone());

    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let handler = WebhookHandler::new(secrets, vec![408, 429, 500, 502, 503, 504]).expect("build handler");
    let cfg = config_for(format!("{}/hook", mock_server.uri()));
    let result = handler.deliver(destination_id, &envelope(), &cfg).await;

    assert!(result.success, "{:?}", result.error);
}

#[sqlx::test]
#[test_log::test]
async fn retryable_status_is_flagged_retryable(pool: PgPool) {
    let (_organization_id, destination_id) = common::create_destination(&pool).await;
    let secrets = secrets_manager(pool.clone());

    let mock_server = MockServer::start().await;
    Mock::given(method("POST")).and(path("/hook")).respond_with(ResponseTemplate::new(503)).mount(&mock_server).await;

    let handler = WebhookHandler::new(secrets, vec![408, 429, 500, 502, 503, 504]).expect("build handler");
    let cfg = config_for(format!("{}/hook", mock_server.uri()));
    let result = handler.deliver(destination_id, &envelope(), &cfg).await;

    assert!(!result.success);
    assert_eq!(result.status_code, Some(503));
    assert!(result.retryable);
}

#[sqlx::test]
#[test_log::test]
async fn non_retryable_status_is_not_flagged_retryable(pool: PgPool) {
    let (_organization_id, destination_id) = common::create_destination(&pool).await;
    let secrets = secrets_manager(pool.clone());

    let mock_server = MockServer::start().await;
    Mock::given(method("POST")).and(path("/hook")).respond_with(ResponseTemplate::new(400)).mount(&mock_server).await;

    let handler = WebhookHandler::new(secrets, vec![408, 429, 500, 502, 503, 504]).expect("build handler");
    let cfg = config_for(format!("{}/hook", mock_server.uri()));
    let result = handler.deliver(destination_id, &envelope(), &cfg).await;

    assert!(!result.success);
    assert_eq!(result.status_code, Some(400));
    assert!(!result.retryable);
}

#[sqlx::test]
#[test_log::test]
async fn a_connection_failure_is_reported_as_a_retryable_network_error(pool: PgPool) {
    let (_organization_id, destination_id) = common::create_destination(&pool).await;
    let secrets = secrets_manager(pool.clone());

    let handler = WebhookHandler::new(secrets, vec![408, 429, 500, 502, 503, 504]).expect("build handler");
    // Port 1 is reserved and nothing should be listening on localhost there.
    let cfg = config_for("http://127.0.0.1:1/hook".to_string());
    let result = handler.deliver(destination_id, &envelope(), &cfg).await;

    assert!(!result.success);
    assert!(result.retryable);
    assert!(result.network_error_code.is_some());
}
