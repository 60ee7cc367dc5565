//! Shared helpers for the crate's `#[sqlx::test]` integration suite.

use delivery_core::db::handlers::Destinations;
use delivery_core::db::models::destinations::{DestinationConfig, DestinationCreateRequest};
use delivery_core::types::{DestinationId, OrganizationId};
use sqlx::PgPool;
use std::collections::HashMap;
use uuid::Uuid;

/// Insert a webhook destination and return its id, satisfying the queue/health/
/// secrets tables' foreign keys onto `delivery_destinations`.
pub async fn create_destination(pool: &PgPool) -> (OrganizationId, DestinationId) {
    let organization_id = Uuid::new_v4();
    let mut conn = pool.acquire().await.expect("acquire connection");
    let destination = Destinations::new(&mut conn)
        .create(&DestinationCreateRequest {
            organization_id,
            label: "test destination".to_string(),
            config: DestinationConfig::Webhook {
                url: "https://example.com/hook".to_string(),
                method: "POST".to_string(),
                headers: HashMap::new(),
                timeout_ms: 30_000,
                retry_config: None,
            },
        })
        .await
        .expect("create destination");

    (organization_id, destination.id)
}
