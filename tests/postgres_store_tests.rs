//! Exercises the Postgres store against a live database, in the same way
//! the rest of the suite uses the in-memory store. Run with
//! `cargo test -- --ignored` and a DATABASE_URL pointing at Postgres.

mod common;

use std::sync::Arc;

use http::Method;
use uuid::Uuid;

use dedup_engine::fingerprint::ContentFingerprint;
use dedup_engine::request::RequestContext;
use dedup_engine::store::{
    CapturedResponse, ClaimOutcome, PostgresRecordStore, RecordStatus, RecordStore,
};

fn fingerprint_for(body: &str) -> ContentFingerprint {
    let request = RequestContext::new(Method::POST, "/orders").with_body(body);
    ContentFingerprint::compute(&request, true)
}

fn unique_key(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

#[tokio::test]
#[ignore = "requires a running postgres instance"]
async fn test_postgres_claim_and_duplicate() {
    let pool = common::setup_test_db().await;
    let store = PostgresRecordStore::new(pool.clone());
    let key = unique_key("claim");
    let fp = fingerprint_for(r#"{"sku":"X"}"#);

    assert_eq!(
        store.try_create(&key, &fp, 60).await.expect("claim works"),
        ClaimOutcome::Created
    );
    assert_eq!(
        store.try_create(&key, &fp, 60).await.expect("claim works"),
        ClaimOutcome::AlreadyPending {
            fingerprint: fp.clone()
        }
    );

    common::cleanup_test_data(&pool).await;
}

#[tokio::test]
#[ignore = "requires a running postgres instance"]
async fn test_postgres_commit_and_replay() {
    let pool = common::setup_test_db().await;
    let store = PostgresRecordStore::new(pool.clone());
    let key = unique_key("commit");
    let fp = fingerprint_for(r#"{"sku":"X"}"#);

    store.try_create(&key, &fp, 60).await.expect("claim works");

    let response = CapturedResponse::json(201, r#"{"id":"tx-1"}"#);
    store.commit(&key, &response).await.expect("commit works");

    assert_eq!(
        store.get_status(&key).await.expect("query works"),
        Some(RecordStatus::Completed)
    );
    let stored = store
        .get_completed(&key)
        .await
        .expect("query works")
        .expect("response present");
    assert_eq!(stored, response);

    // A second commit must not overwrite the stored response.
    store
        .commit(&key, &CapturedResponse::json(200, "{}"))
        .await
        .expect("idempotent commit works");
    let unchanged = store
        .get_completed(&key)
        .await
        .expect("query works")
        .expect("response present");
    assert_eq!(unchanged, response);

    common::cleanup_test_data(&pool).await;
}

#[tokio::test]
#[ignore = "requires a running postgres instance"]
async fn test_postgres_abandon_frees_the_key() {
    let pool = common::setup_test_db().await;
    let store = PostgresRecordStore::new(pool.clone());
    let key = unique_key("abandon");
    let fp = fingerprint_for("{}");

    store.try_create(&key, &fp, 60).await.expect("claim works");
    store.abandon(&key).await.expect("abandon works");

    assert_eq!(store.get_status(&key).await.expect("query works"), None);
    assert_eq!(
        store.try_create(&key, &fp, 60).await.expect("claim works"),
        ClaimOutcome::Created
    );

    common::cleanup_test_data(&pool).await;
}

#[tokio::test]
#[ignore = "requires a running postgres instance"]
async fn test_postgres_expired_row_is_reclaimed_in_place() {
    let pool = common::setup_test_db().await;
    let store = PostgresRecordStore::new(pool.clone());
    let key = unique_key("expired");
    let fp = fingerprint_for("{}");

    store.try_create(&key, &fp, -1).await.expect("claim works");
    assert_eq!(
        store.get_status(&key).await.expect("query works"),
        Some(RecordStatus::Expired)
    );

    assert_eq!(
        store.try_create(&key, &fp, 60).await.expect("claim works"),
        ClaimOutcome::Created,
        "an expired row counts as absent"
    );
    assert_eq!(
        store.get_status(&key).await.expect("query works"),
        Some(RecordStatus::Pending)
    );

    common::cleanup_test_data(&pool).await;
}

#[tokio::test]
#[ignore = "requires a running postgres instance"]
async fn test_postgres_concurrent_claims_yield_exactly_one_created() {
    let pool = common::setup_test_db().await;
    let store = Arc::new(PostgresRecordStore::new(pool.clone()));
    let key = unique_key("race");
    let fp = fingerprint_for("{}");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = Arc::clone(&store);
        let key = key.clone();
        let fp = fp.clone();
        handles.push(tokio::spawn(async move {
            store.try_create(&key, &fp, 60).await
        }));
    }

    let mut created = 0;
    for handle in handles {
        if let ClaimOutcome::Created =
            handle.await.expect("task not panicked").expect("claim works")
        {
            created += 1;
        }
    }

    assert_eq!(created, 1);

    common::cleanup_test_data(&pool).await;
}

#[tokio::test]
#[ignore = "requires a running postgres instance"]
async fn test_postgres_sweep_removes_expired_rows() {
    let pool = common::setup_test_db().await;
    common::cleanup_test_data(&pool).await;

    let store = PostgresRecordStore::new(pool.clone());
    let fp = fingerprint_for("{}");

    store
        .try_create(&unique_key("dead"), &fp, -1)
        .await
        .expect("claim works");
    store
        .try_create(&unique_key("live"), &fp, 60)
        .await
        .expect("claim works");

    let swept = store.sweep_expired().await.expect("sweep works");
    assert_eq!(swept, 1);

    common::cleanup_test_data(&pool).await;
}
