//! Persistence tests for webhook secret rotation overlap (testable property 7)
//! and bring-your-own-secret replacement semantics.

mod common;

use delivery_core::config::SecretsConfig;
use delivery_core::db::handlers::Secrets;
use delivery_core::secrets::SecretManager;
use sqlx::PgPool;

fn test_encryption_key() -> String {
    "ab".repeat(32)
}

fn config(max_active_secrets: u32) -> SecretsConfig {
    SecretsConfig {
        enabled: true,
        encryption_key: Some(test_encryption_key()),
        max_active_secrets,
        default_overlap_period_days: 7,
    }
}

#[sqlx::test]
#[test_log::test]
async fn rotation_leaves_the_outgoing_primary_active_with_an_overlap_expiry(pool: PgPool) {
    let (_organization_id, destination_id) = common::create_destination(&pool).await;
    let manager = SecretManager::new(pool.clone(), config(2)).expect("construct manager");

    let original = manager.create_secret(destination_id).await.expect("create initial secret");
    let rotated = manager.rotate_secret(destination_id, None).await.expect("rotate");

    assert_ne!(original.id, rotated.id);

    let mut conn = pool.acquire().await.expect("acquire connection");
    let mut repo = Secrets::new(&mut conn);
    let active = repo.find_active_by_destination(destination_id).await.expect("find active");
    assert_eq!(active.len(), 2, "outgoing primary stays active during the overlap window");

    let outgoing = active.iter().find(|s| s.id == original.id).expect("outgoing secret still active");
    assert!(!outgoing.is_primary);
    assert!(outgoing.expires_at.is_some(), "outgoing primary must be given an overlap expiry");

    let incoming = active.iter().find(|s| s.id == rotated.id).expect("incoming secret active");
    assert!(incoming.is_primary);
}

#[sqlx::test]
#[test_log::test]
async fn rotation_respects_max_active_secrets_by_expiring_the_oldest_overlap_first(pool: PgPool) {
    let (_organization_id, destination_id) = common::create_destination(&pool).await;
    let manager = SecretManager::new(pool.clone(), config(2)).expect("construct manager");

    manager.create_secret(destination_id).await.expect("create initial secret");
    manager.rotate_secret(destination_id, None).await.expect("first rotation");

    let mut conn = pool.acquire().await.expect("acquire connection");
    let active_before = Secrets::new(&mut conn).count_active(destination_id).await.expect("count before");
    assert_eq!(active_before, 2);
}

#[sqlx::test]
#[test_log::test]
async fn configure_byos_deactivates_every_prior_secret_even_at_the_active_cap(pool: PgPool) {
    let (_organization_id, destination_id) = common::create_destination(&pool).await;
    let manager = SecretManager::new(pool.clone(), config(2)).expect("construct manager");

    // Fill the destination up to `max_active_secrets` via ordinary rotation, so
    // a plain `store_secret` call would be rejected outright.
    manager.create_secret(destination_id).await.expect("create initial secret");
    manager.rotate_secret(destination_id, None).await.expect("rotate to cap");

    let mut conn = pool.acquire().await.expect("acquire connection");
    assert_eq!(Secrets::new(&mut conn).count_active(destination_id).await.expect("count at cap"), 2);

    let byos_plaintext = "customer-supplied-secret-value-with-sufficient-entropy-here";
    let installed = manager.configure_byos(destination_id, byos_plaintext, true).await.expect("configure byos");

    let mut conn = pool.acquire().await.expect("acquire connection");
    let mut repo = Secrets::new(&mut conn);
    let active = repo.find_active_by_destination(destination_id).await.expect("find active");
    assert_eq!(active.len(), 1, "byos must be the destination's sole active secret");
    assert_eq!(active[0].id, installed.id);
    assert!(active[0].is_primary);
}

#[sqlx::test]
#[test_log::test]
async fn configure_byos_without_rotation_managed_leaves_no_expiry(pool: PgPool) {
    let (_organization_id, destination_id) = common::create_destination(&pool).await;
    let manager = SecretManager::new(pool.clone(), config(2)).expect("construct manager");

    let byos_plaintext = "customer-supplied-secret-value-with-sufficient-entropy-here";
    let installed = manager.configure_byos(destination_id, byos_plaintext, false).await.expect("configure byos");

    assert!(installed.expires_at.is_none(), "rotation_managed=false must not assign an expiry");
}

#[sqlx::test]
#[test_log::test]
async fn configure_byos_rejects_a_secret_that_fails_validation(pool: PgPool) {
    let (_organization_id, destination_id) = common::create_destination(&pool).await;
    let manager = SecretManager::new(pool.clone(), config(2)).expect("construct manager");

    let result = manager.configure_byos(destination_id, "too-short", true).await;
    assert!(result.is_err());

    let mut conn = pool.acquire().await.expect("acquire connection");
    let active = Secrets::new(&mut conn).count_active(destination_id).await.expect("count active");
    assert_eq!(active, 0, "a rejected byos secret must not be installed");
}
