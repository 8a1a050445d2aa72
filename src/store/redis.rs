use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;

use crate::error::{AppError, Result};
use crate::fingerprint::ContentFingerprint;
use crate::store::{CapturedResponse, ClaimOutcome, DedupRecord, RecordStatus, RecordStore};

/// Redis-backed record store. The claim is `SET NX EX`; the record itself
/// is stored as JSON under a prefixed key and Redis's own key expiry does
/// the sweeping.
///
/// Once a caller holds the claim it is the only writer for that key until
/// commit or abandon, so the read-modify-write in `commit` needs no
/// transaction.
pub struct RedisRecordStore {
    client: redis::Client,
    key_prefix: String,
}

impl RedisRecordStore {
    pub fn new(client: redis::Client, key_prefix: impl Into<String>) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
        }
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(AppError::Redis)
    }

    async fn fetch(&self, key: &str) -> Result<Option<DedupRecord>> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn
            .get(self.storage_key(key))
            .await
            .map_err(AppError::Redis)?;

        match raw {
            Some(json) => {
                let record = serde_json::from_str(&json)
                    .map_err(|e| anyhow::anyhow!("stored record for key is not decodable: {}", e))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, record: &DedupRecord, keep_ttl: bool) -> Result<bool> {
        let json = serde_json::to_string(record)
            .map_err(|e| anyhow::anyhow!("record not serializable: {}", e))?;
        let ttl_seconds = (record.expires_at - Utc::now()).num_seconds().max(1);

        let mut conn = self.connection().await?;
        let options = if keep_ttl {
            redis::SetOptions::default()
                .conditional_set(redis::ExistenceCheck::XX)
                .with_expiration(redis::SetExpiry::KEEPTTL)
        } else {
            redis::SetOptions::default()
                .conditional_set(redis::ExistenceCheck::NX)
                .with_expiration(redis::SetExpiry::EX(ttl_seconds as usize))
        };

        let outcome: Option<String> = conn
            .set_options(self.storage_key(&record.record_key), json, options)
            .await
            .map_err(AppError::Redis)?;

        Ok(outcome.is_some())
    }
}

#[async_trait]
impl RecordStore for RedisRecordStore {
    async fn try_create(
        &self,
        key: &str,
        fingerprint: &ContentFingerprint,
        ttl_seconds: i64,
    ) -> Result<ClaimOutcome> {
        // Two rounds cover the window where the existing key expires
        // between the failed SET NX and the GET.
        for _ in 0..2 {
            let record = DedupRecord::new(key.to_string(), fingerprint.clone(), ttl_seconds);
            if self.put(&record, false).await? {
                return Ok(ClaimOutcome::Created);
            }

            match self.fetch(key).await? {
                Some(existing) => match existing.live_status() {
                    RecordStatus::Pending => {
                        return Ok(ClaimOutcome::AlreadyPending {
                            fingerprint: existing.fingerprint,
                        })
                    }
                    RecordStatus::Completed => {
                        return Ok(ClaimOutcome::AlreadyCompleted {
                            fingerprint: existing.fingerprint,
                        })
                    }
                    // Redis should have evicted this; race with expiry.
                    RecordStatus::Expired => continue,
                },
                None => continue,
            }
        }

        Err(AppError::Internal(anyhow::anyhow!(
            "claim for key did not settle against redis expiry"
        )))
    }

    async fn get_status(&self, key: &str) -> Result<Option<RecordStatus>> {
        Ok(self.fetch(key).await?.map(|record| record.live_status()))
    }

    async fn get_completed(&self, key: &str) -> Result<Option<CapturedResponse>> {
        match self.fetch(key).await? {
            Some(record) if record.live_status() == RecordStatus::Completed => {
                record.completed_response()
            }
            _ => Ok(None),
        }
    }

    async fn commit(&self, key: &str, response: &CapturedResponse) -> Result<()> {
        let Some(mut record) = self.fetch(key).await? else {
            return Ok(());
        };
        if record.live_status() != RecordStatus::Pending {
            return Ok(());
        }

        record.status = RecordStatus::Completed;
        record.response = Some(
            serde_json::to_value(response)
                .map_err(|e| anyhow::anyhow!("response not serializable: {}", e))?,
        );
        record.completed_at = Some(Utc::now());

        self.put(&record, true).await?;
        Ok(())
    }

    async fn abandon(&self, key: &str) -> Result<()> {
        let Some(record) = self.fetch(key).await? else {
            return Ok(());
        };
        if record.status != RecordStatus::Pending {
            return Ok(());
        }

        let mut conn = self.connection().await?;
        let _: i64 = conn
            .del(self.storage_key(key))
            .await
            .map_err(AppError::Redis)?;
        Ok(())
    }

    async fn sweep_expired(&self) -> Result<u64> {
        // Redis evicts expired keys itself; nothing to do.
        Ok(0)
    }
}
