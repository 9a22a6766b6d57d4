//! Runs against a live Redis only when `REDIS_TEST_URL` is set.

mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use uuid::Uuid;

use common::{prescription, TestSetup};
use service_request_cell::{
    AtomicOp, RedisRequestStore, RequestFeeds, RequestPatch, RequestQuery, RequestStore,
    ServiceRequest, ServiceStage, StoreError, VisitRecord,
};
use shared_database::{connect_url, RedisPool};

async fn redis_store() -> Option<Arc<RedisRequestStore>> {
    let url = std::env::var("REDIS_TEST_URL").ok()?;
    let prefix = format!("test:{}", Uuid::new_v4());
    let pool = connect_url(&url, &prefix).await.expect("redis reachable");
    Some(Arc::new(RedisRequestStore::new(pool, RequestFeeds::new(16))))
}

fn sample_request() -> ServiceRequest {
    let setup = TestSetup::new();
    ServiceRequest::new(setup.patient.user_id, setup.intake())
}

#[tokio::test]
async fn test_redis_update_is_compare_and_set() {
    let Some(store) = redis_store().await else {
        eprintln!("REDIS_TEST_URL not set; skipping");
        return;
    };

    let inserted = store.insert(sample_request()).await.unwrap();
    assert_eq!(inserted.version, 1);

    let patch = RequestPatch {
        doctor_reached: Some(true),
        ..RequestPatch::default()
    };
    let updated = store.update(inserted.id, patch.clone(), Some(1)).await.unwrap();
    assert_eq!(updated.version, 2);

    assert_matches!(
        store.update(inserted.id, patch, Some(1)).await,
        Err(StoreError::Conflict { expected: 1, actual: 2 })
    );

    let listed = store
        .list(&RequestQuery::for_doctor(inserted.doctor_id))
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn test_redis_atomic_completion_is_all_or_nothing() {
    let Some(store) = redis_store().await else {
        eprintln!("REDIS_TEST_URL not set; skipping");
        return;
    };

    let mut request = sample_request();
    request.stage = ServiceStage::AwaitingVerification {
        prescription: prescription(),
        completion_code: "123456".to_string(),
        issued_at: chrono::Utc::now(),
        patient_verified: true,
    };
    let request = store.insert(request).await.unwrap();
    let record = VisitRecord::from_completed(&request, prescription());

    // Stale version: nothing may be written.
    let stale = store
        .run_atomic(vec![
            AtomicOp::CreateRecord(record.clone()),
            AtomicOp::DeleteRequest {
                id: request.id,
                expected_version: request.version + 5,
            },
        ])
        .await;
    assert_matches!(stale, Err(StoreError::Conflict { .. }));
    assert!(store.record_for_request(request.id).await.unwrap().is_none());

    let committed = store
        .run_atomic(vec![
            AtomicOp::CreateRecord(record.clone()),
            AtomicOp::DeleteRequest {
                id: request.id,
                expected_version: request.version,
            },
        ])
        .await
        .unwrap();
    assert_eq!(committed.deleted, vec![request.id]);
    assert_matches!(store.get(request.id).await, Err(StoreError::NotFound(_)));

    let history = store.records_for_doctor(request.doctor_id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].request_id, request.id);

    let again = store
        .run_atomic(vec![AtomicOp::CreateRecord(record)])
        .await;
    assert_matches!(again, Err(StoreError::DuplicateRecord(_)));
}

/// Touches `watched_key` from outside the pool, then runs a MULTI/EXEC on
/// every pooled connection. EXEC comes back nil on a connection that still
/// carries a WATCH on that key.
async fn pooled_connections_unwatched(pool: &RedisPool, url: &str, watched_key: &str) -> bool {
    let mut first = pool.get().await.unwrap();
    let mut second = pool.get().await.unwrap();

    let client = redis::Client::open(url).unwrap();
    let mut outside = client.get_multiplexed_async_connection().await.unwrap();
    let raw: Option<String> = redis::cmd("GET").arg(watched_key).query_async(&mut outside).await.unwrap();
    let _: () = redis::cmd("SET")
        .arg(watched_key)
        .arg(raw.unwrap_or_default())
        .query_async(&mut outside)
        .await
        .unwrap();

    for conn in [&mut first, &mut second] {
        let committed: Option<redis::Value> = redis::pipe()
            .atomic()
            .set(pool.key("scratch"), "1")
            .query_async(conn)
            .await
            .unwrap();
        if committed.is_none() {
            return false;
        }
    }
    true
}

#[tokio::test]
async fn test_redis_failed_writes_release_their_watch() {
    let Ok(url) = std::env::var("REDIS_TEST_URL") else {
        eprintln!("REDIS_TEST_URL not set; skipping");
        return;
    };
    let pool = connect_url(&url, &format!("test:{}", Uuid::new_v4())).await.expect("redis reachable");
    let store = RedisRequestStore::new(pool.clone(), RequestFeeds::new(16));
    let inserted = store.insert(sample_request()).await.unwrap();
    let request_key = pool.key(&format!("service_request:{}", inserted.id));

    let stale = store
        .update(inserted.id, RequestPatch::default(), Some(inserted.version + 3))
        .await;
    assert_matches!(stale, Err(StoreError::Conflict { .. }));
    assert!(pooled_connections_unwatched(&pool, &url, &request_key).await);

    let missing = store
        .run_atomic(vec![AtomicOp::DeleteRequest {
            id: inserted.id,
            expected_version: inserted.version + 3,
        }])
        .await;
    assert_matches!(missing, Err(StoreError::Conflict { .. }));
    assert!(pooled_connections_unwatched(&pool, &url, &request_key).await);

    let updated = store
        .update(inserted.id, RequestPatch::default(), Some(inserted.version))
        .await
        .unwrap();
    assert_eq!(updated.version, inserted.version + 1);
}
