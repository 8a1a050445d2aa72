use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{AppError, Result};
use crate::fingerprint::ContentFingerprint;
use crate::store::{CapturedResponse, ClaimOutcome, DedupRecord, RecordStatus, RecordStore};

/// In-memory record store. A single mutex over the record map makes every
/// operation linearizable; expiry is checked lazily on each access so
/// logical expiration never waits for a sweep.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: Mutex<HashMap<String, DedupRecord>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .map(|records| records.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, DedupRecord>>> {
        self.records
            .lock()
            .map_err(|_| AppError::StoreUnavailable(anyhow::anyhow!("record map mutex poisoned")))
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn try_create(
        &self,
        key: &str,
        fingerprint: &ContentFingerprint,
        ttl_seconds: i64,
    ) -> Result<ClaimOutcome> {
        let mut records = self.lock()?;

        if let Some(existing) = records.get(key) {
            match existing.live_status() {
                RecordStatus::Pending => {
                    return Ok(ClaimOutcome::AlreadyPending {
                        fingerprint: existing.fingerprint.clone(),
                    })
                }
                RecordStatus::Completed => {
                    return Ok(ClaimOutcome::AlreadyCompleted {
                        fingerprint: existing.fingerprint.clone(),
                    })
                }
                RecordStatus::Expired => {}
            }
        }

        records.insert(
            key.to_string(),
            DedupRecord::new(key.to_string(), fingerprint.clone(), ttl_seconds),
        );
        Ok(ClaimOutcome::Created)
    }

    async fn get_status(&self, key: &str) -> Result<Option<RecordStatus>> {
        let records = self.lock()?;
        Ok(records.get(key).map(DedupRecord::live_status))
    }

    async fn get_completed(&self, key: &str) -> Result<Option<CapturedResponse>> {
        let records = self.lock()?;
        match records.get(key) {
            Some(record) if record.live_status() == RecordStatus::Completed => {
                record.completed_response()
            }
            _ => Ok(None),
        }
    }

    async fn commit(&self, key: &str, response: &CapturedResponse) -> Result<()> {
        let mut records = self.lock()?;
        if let Some(record) = records.get_mut(key) {
            if record.live_status() == RecordStatus::Pending {
                record.status = RecordStatus::Completed;
                record.response = Some(
                    serde_json::to_value(response)
                        .map_err(|e| anyhow::anyhow!("response not serializable: {}", e))?,
                );
                record.completed_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn abandon(&self, key: &str) -> Result<()> {
        let mut records = self.lock()?;
        if let Some(record) = records.get(key) {
            if record.status == RecordStatus::Pending {
                records.remove(key);
            }
        }
        Ok(())
    }

    async fn sweep_expired(&self) -> Result<u64> {
        let mut records = self.lock()?;
        let before = records.len();
        let now = Utc::now();
        records.retain(|_, record| record.expires_at >= now);
        Ok((before - records.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestContext;
    use http::Method;

    fn fingerprint(body: &str) -> ContentFingerprint {
        let request = RequestContext::new(Method::POST, "/orders").with_body(body);
        ContentFingerprint::compute(&request, true)
    }

    #[test]
    fn test_claim_then_duplicate_claim() {
        tokio_test::block_on(async {
            let store = InMemoryRecordStore::new();
            let fp = fingerprint(r#"{"sku":"X"}"#);

            let first = store.try_create("abc", &fp, 60).await.unwrap();
            assert_eq!(first, ClaimOutcome::Created);

            let second = store.try_create("abc", &fp, 60).await.unwrap();
            assert_eq!(
                second,
                ClaimOutcome::AlreadyPending {
                    fingerprint: fp.clone()
                }
            );
        });
    }

    #[test]
    fn test_commit_is_idempotent() {
        tokio_test::block_on(async {
            let store = InMemoryRecordStore::new();
            let fp = fingerprint("{}");
            store.try_create("abc", &fp, 60).await.unwrap();

            let response = CapturedResponse::json(201, r#"{"id":1}"#);
            store.commit("abc", &response).await.unwrap();

            // A second commit must not overwrite the stored response.
            let other = CapturedResponse::json(200, r#"{"id":2}"#);
            store.commit("abc", &other).await.unwrap();

            let stored = store.get_completed("abc").await.unwrap().unwrap();
            assert_eq!(stored, response);

            // Committing an absent key is a no-op, not an error.
            store.commit("nope", &response).await.unwrap();
        });
    }

    #[test]
    fn test_abandon_frees_the_key() {
        tokio_test::block_on(async {
            let store = InMemoryRecordStore::new();
            let fp = fingerprint("{}");
            store.try_create("abc", &fp, 60).await.unwrap();
            store.abandon("abc").await.unwrap();

            assert_eq!(store.get_status("abc").await.unwrap(), None);
            let reclaimed = store.try_create("abc", &fp, 60).await.unwrap();
            assert_eq!(reclaimed, ClaimOutcome::Created);
        });
    }

    #[test]
    fn test_abandon_leaves_completed_records() {
        tokio_test::block_on(async {
            let store = InMemoryRecordStore::new();
            let fp = fingerprint("{}");
            store.try_create("abc", &fp, 60).await.unwrap();
            store
                .commit("abc", &CapturedResponse::json(201, "{}"))
                .await
                .unwrap();

            store.abandon("abc").await.unwrap();
            assert_eq!(
                store.get_status("abc").await.unwrap(),
                Some(RecordStatus::Completed)
            );
        });
    }

    #[test]
    fn test_expired_record_is_logically_absent() {
        tokio_test::block_on(async {
            let store = InMemoryRecordStore::new();
            let fp = fingerprint("{}");
            store.try_create("abc", &fp, -1).await.unwrap();
            store
                .commit("abc", &CapturedResponse::json(201, "{}"))
                .await
                .ok();

            assert_eq!(
                store.get_status("abc").await.unwrap(),
                Some(RecordStatus::Expired)
            );
            assert!(store.get_completed("abc").await.unwrap().is_none());

            let reclaimed = store.try_create("abc", &fp, 60).await.unwrap();
            assert_eq!(reclaimed, ClaimOutcome::Created);
        });
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        tokio_test::block_on(async {
            let store = InMemoryRecordStore::new();
            let fp = fingerprint("{}");
            store.try_create("dead", &fp, -1).await.unwrap();
            store.try_create("live", &fp, 60).await.unwrap();

            let swept = store.sweep_expired().await.unwrap();
            assert_eq!(swept, 1);
            assert_eq!(store.len(), 1);
            assert_eq!(
                store.get_status("live").await.unwrap(),
                Some(RecordStatus::Pending)
            );
        });
    }
}
