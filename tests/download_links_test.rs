//! Persistence tests for download link creation, access consumption, and
//! expiry/cleanup.

mod common;

use chrono::{Duration, Utc};
use delivery_core::db::handlers::DownloadLinks;
use delivery_core::db::models::download_links::DownloadLinkCreateRequest;
use sqlx::PgPool;
use uuid::Uuid;

fn create_request(organization_id: Uuid, ttl: Duration, max_access: i32) -> DownloadLinkCreateRequest {
    DownloadLinkCreateRequest {
        organization_id,
        object_type: "export".to_string(),
        file_name: "audit-export.csv".to_string(),
        file_size: 4096,
        expires_at: Utc::now() + ttl,
        max_access,
    }
}

#[sqlx::test]
#[test_log::test]
async fn a_fresh_link_can_be_consumed_up_to_max_access_times(pool: PgPool) {
    let organization_id = Uuid::new_v4();
    let mut conn = pool.acquire().await.expect("acquire connection");
    let mut repo = DownloadLinks::new(&mut conn);

    let link = repo.create(&create_request(organization_id, Duration::hours(1), 2)).await.expect("create link");

    let first = repo.try_consume_access(link.id).await.expect("first consume").expect("first access allowed");
    assert_eq!(first.access_count, 1);

    let second = repo.try_consume_access(link.id).await.expect("second consume").expect("second access allowed");
    assert_eq!(second.access_count, 2);

    let third = repo.try_consume_access(link.id).await.expect("third consume");
    assert!(third.is_none(), "access beyond max_access must be rejected");
}

#[sqlx::test]
#[test_log::test]
async fn an_expired_link_cannot_be_consumed(pool: PgPool) {
    let organization_id = Uuid::new_v4();
    let mut conn = pool.acquire().await.expect("acquire connection");
    let mut repo = DownloadLinks::new(&mut conn);

    let link = repo.create(&create_request(organization_id, Duration::hours(-1), 5)).await.expect("create already-expired link");

    let consumed = repo.try_consume_access(link.id).await.expect("consume attempt");
    assert!(consumed.is_none());
}

#[sqlx::test]
#[test_log::test]
async fn a_revoked_link_cannot_be_consumed(pool: PgPool) {
    let organization_id = Uuid::new_v4();
    let mut conn = pool.acquire().await.expect("acquire connection");
    let mut repo = DownloadLinks::new(&mut conn);

    let link = repo.create(&create_request(organization_id, Duration::hours(1), 5)).await.expect("create link");
    repo.revoke(link.id, "manually revoked").await.expect("revoke");

    let consumed = repo.try_consume_access(link.id).await.expect("consume attempt");
    assert!(consumed.is_none());
}

#[sqlx::test]
#[test_log::test]
async fn consume_and_log_records_both_successful_and_failed_accesses(pool: PgPool) {
    let organization_id = Uuid::new_v4();
    let mut conn = pool.acquire().await.expect("acquire connection");
    let mut repo = DownloadLinks::new(&mut conn);

    let link = repo.create(&create_request(organization_id, Duration::hours(1), 1)).await.expect("create link");

    let first = repo.consume_and_log(link.id, Some("user-1"), Some("127.0.0.1"), Some("test-agent")).await.expect("first access");
    assert!(first.is_some());

    let second = repo.consume_and_log(link.id, Some("user-1"), Some("127.0.0.1"), Some("test-agent")).await.expect("second access");
    assert!(second.is_none(), "max_access of 1 forbids a second consumption");

    let accesses = repo.access_stats(link.id).await.expect("access stats");
    assert_eq!(accesses.len(), 2);
    assert!(accesses.iter().any(|a| a.success));
    assert!(accesses.iter().any(|a| !a.success));
}

#[sqlx::test]
#[test_log::test]
async fn cleanup_expired_deactivates_but_does_not_delete_expired_links(pool: PgPool) {
    let organization_id = Uuid::new_v4();
    let mut conn = pool.acquire().await.expect("acquire connection");
    let mut repo = DownloadLinks::new(&mut conn);

    let link = repo.create(&create_request(organization_id, Duration::hours(-1), 5)).await.expect("create already-expired link");

    let cleaned = repo.cleanup_expired().await.expect("cleanup");
    assert_eq!(cleaned, 1);

    let refreshed = repo.get_by_id(link.id).await.expect("get by id").expect("link still exists");
    assert!(!refreshed.is_active);
    assert_eq!(refreshed.revoked_reason.as_deref(), Some("expired"));
}
