pub mod memory;
pub mod postgres;
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::fingerprint::ContentFingerprint;

pub use memory::InMemoryRecordStore;
pub use postgres::PostgresRecordStore;
pub use redis::RedisRecordStore;

/// Status of a deduplication record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "UPPERCASE")]
pub enum RecordStatus {
    Pending,
    Completed,
    /// Computed from `expires_at`, never written to storage. An expired
    /// record is logically absent whether or not it has been swept.
    Expired,
}

/// A captured operation result, replayed verbatim for duplicate requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl CapturedResponse {
    pub fn new(status: u16, content_type: Option<String>, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type,
            body: body.into(),
            created_at: Utc::now(),
        }
    }

    pub fn json(status: u16, body: impl Into<String>) -> Self {
        Self::new(status, Some("application/json".to_string()), body)
    }
}

/// The unit of state per idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DedupRecord {
    pub id: Uuid,
    pub record_key: String,
    pub fingerprint: ContentFingerprint,
    pub status: RecordStatus,
    pub response: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DedupRecord {
    pub fn new(record_key: String, fingerprint: ContentFingerprint, ttl_seconds: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            record_key,
            fingerprint,
            status: RecordStatus::Pending,
            response: None,
            created_at: now,
            expires_at: now + Duration::seconds(ttl_seconds),
            completed_at: None,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Status with lazy expiry applied.
    pub fn live_status(&self) -> RecordStatus {
        if self.is_expired() {
            RecordStatus::Expired
        } else {
            self.status
        }
    }

    pub fn completed_response(&self) -> Result<Option<CapturedResponse>> {
        match &self.response {
            Some(value) => {
                let response = serde_json::from_value(value.clone()).map_err(|e| {
                    anyhow::anyhow!("stored response for key is not decodable: {}", e)
                })?;
                Ok(Some(response))
            }
            None => Ok(None),
        }
    }
}

/// Result of an atomic claim attempt. The carried fingerprint is the one
/// the existing record was created with, for content validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Created,
    AlreadyPending { fingerprint: ContentFingerprint },
    AlreadyCompleted { fingerprint: ContentFingerprint },
}

/// Backing store for deduplication records.
///
/// `try_create` must be linearizable per key: among any set of concurrent
/// callers racing on the same key, exactly one observes `Created` while no
/// unexpired record exists. Store failures are reported as errors, never
/// as "record absent".
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Atomic create-if-absent. An expired record counts as absent and is
    /// replaced.
    async fn try_create(
        &self,
        key: &str,
        fingerprint: &ContentFingerprint,
        ttl_seconds: i64,
    ) -> Result<ClaimOutcome>;

    /// Three-state status query, distinct from result retrieval.
    async fn get_status(&self, key: &str) -> Result<Option<RecordStatus>>;

    /// The stored response, only when Completed and unexpired.
    async fn get_completed(&self, key: &str) -> Result<Option<CapturedResponse>>;

    /// Pending → Completed. Idempotent: a no-op when the record is absent
    /// or already Completed.
    async fn commit(&self, key: &str, response: &CapturedResponse) -> Result<()>;

    /// Removes a Pending record so the key becomes retryable.
    async fn abandon(&self, key: &str) -> Result<()>;

    /// Physically removes expired records; returns how many went away.
    async fn sweep_expired(&self) -> Result<u64>;
}
