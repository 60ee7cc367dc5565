//! Persistence tests for the durable queue: idempotent enqueue (testable
//! property 1) and `claim_ready`'s at-most-one-in-flight guarantee (testable
//! property 2).

mod common;

use chrono::Utc;
use delivery_core::db::handlers::Queue;
use delivery_core::db::handlers::queue::EnqueueOutcome;
use delivery_core::db::models::queue::QueueEnqueueRequest;
use sqlx::PgPool;

fn request(organization_id: uuid::Uuid, destination_id: uuid::Uuid, idempotency_key: &str) -> QueueEnqueueRequest {
    QueueEnqueueRequest {
        organization_id,
        destination_id,
        delivery_id: format!("delivery-{idempotency_key}"),
        correlation_id: None,
        idempotency_key: Some(idempotency_key.to_string()),
        kind: "audit.event".to_string(),
        payload: serde_json::json!({ "hello": "world" }),
        priority: 0,
        scheduled_at: Utc::now(),
        max_retries: 5,
    }
}

#[sqlx::test]
#[test_log::test]
async fn enqueue_is_idempotent_on_key_collision(pool: PgPool) {
    let (organization_id, destination_id) = common::create_destination(&pool).await;
    let mut conn = pool.acquire().await.expect("acquire connection");
    let mut queue = Queue::new(&mut conn);

    let first = queue.enqueue(&request(organization_id, destination_id, "key-1")).await.expect("first enqueue");
    let EnqueueOutcome::Created(first_item) = first else {
        panic!("expected the first enqueue to create a row");
    };

    let second = queue.enqueue(&request(organization_id, destination_id, "key-1")).await.expect("second enqueue");
    let EnqueueOutcome::Duplicate(duplicate_item) = second else {
        panic!("expected the second enqueue to report a duplicate");
    };

    assert_eq!(first_item.id, duplicate_item.id);

    let count: i64 = sqlx::query_scalar("SELECT count(*) FROM delivery_queue_items WHERE organization_id = $1")
        .bind(organization_id)
        .fetch_one(&pool)
        .await
        .expect("count rows");
    assert_eq!(count, 1);
}

#[sqlx::test]
#[test_log::test]
async fn a_failed_row_does_not_block_re_enqueueing_the_same_key(pool: PgPool) {
    let (organization_id, destination_id) = common::create_destination(&pool).await;
    let mut conn = pool.acquire().await.expect("acquire connection");
    let mut queue = Queue::new(&mut conn);

    let first = queue.enqueue(&request(organization_id, destination_id, "key-2")).await.expect("first enqueue").into_item();
    sqlx::query("UPDATE delivery_queue_items SET status = 'failed' WHERE id = $1")
        .bind(first.id)
        .execute(&mut *conn)
        .await
        .expect("mark failed");

    let mut queue = Queue::new(&mut conn);
    let second = queue.enqueue(&request(organization_id, destination_id, "key-2")).await.expect("second enqueue");
    assert!(matches!(second, EnqueueOutcome::Created(_)), "a failed row's idempotency key should be reusable");
}

#[sqlx::test]
#[test_log::test]
async fn claim_ready_transitions_rows_to_processing_and_does_not_reclaim_them(pool: PgPool) {
    let (organization_id, destination_id) = common::create_destination(&pool).await;
    let mut conn = pool.acquire().await.expect("acquire connection");
    let mut queue = Queue::new(&mut conn);

    queue.enqueue(&request(organization_id, destination_id, "key-3")).await.expect("enqueue");
    queue.enqueue(&request(organization_id, destination_id, "key-4")).await.expect("enqueue");

    let first_claim = queue.claim_ready(10).await.expect("first claim");
    assert_eq!(first_claim.len(), 2);
    for item in &first_claim {
        assert_eq!(item.status, "processing");
    }

    let second_claim = queue.claim_ready(10).await.expect("second claim");
    assert!(second_claim.is_empty(), "rows already claimed must not be claimed again");
}
