use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::{AppError, Result};
use crate::fingerprint::ContentFingerprint;
use crate::store::{CapturedResponse, ClaimOutcome, DedupRecord, RecordStatus, RecordStore};

/// PostgreSQL-backed record store. The `dedup_records` table's unique key
/// constraint is the linearization point: the claim is an
/// `INSERT ... ON CONFLICT ... RETURNING` that tells us whether our row or
/// a concurrent caller's row won.
pub struct PostgresRecordStore {
    pool: PgPool,
}

impl PostgresRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_or_fetch(&self, record: &DedupRecord) -> Result<DedupRecord> {
        let row = sqlx::query_as::<_, DedupRecord>(
            r#"
            INSERT INTO dedup_records (id, record_key, fingerprint, status, response, created_at, expires_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (record_key) DO UPDATE SET record_key = dedup_records.record_key
            RETURNING id, record_key, fingerprint, status, response, created_at, expires_at, completed_at
            "#,
        )
        .bind(record.id)
        .bind(&record.record_key)
        .bind(&record.fingerprint)
        .bind(record.status)
        .bind(&record.response)
        .bind(record.created_at)
        .bind(record.expires_at)
        .bind(record.completed_at)
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Reclaims an expired row in place. Returns true when this caller won
    /// the takeover; the `expires_at` guard keeps concurrent takeovers from
    /// both succeeding.
    async fn take_over_expired(&self, record: &DedupRecord) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE dedup_records
            SET id = $2, fingerprint = $3, status = $4, response = NULL,
                created_at = $5, expires_at = $6, completed_at = NULL
            WHERE record_key = $1 AND expires_at < NOW()
            "#,
        )
        .bind(&record.record_key)
        .bind(record.id)
        .bind(&record.fingerprint)
        .bind(RecordStatus::Pending)
        .bind(record.created_at)
        .bind(record.expires_at)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    async fn try_create(
        &self,
        key: &str,
        fingerprint: &ContentFingerprint,
        ttl_seconds: i64,
    ) -> Result<ClaimOutcome> {
        let record = DedupRecord::new(key.to_string(), fingerprint.clone(), ttl_seconds);

        // Two rounds cover the window where the winning row expires or is
        // swept between our insert attempt and the takeover.
        for _ in 0..2 {
            let existing = self.insert_or_fetch(&record).await?;

            if existing.id == record.id {
                return Ok(ClaimOutcome::Created);
            }

            match existing.live_status() {
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
                RecordStatus::Expired => {
                    if self.take_over_expired(&record).await? {
                        return Ok(ClaimOutcome::Created);
                    }
                    // Lost the takeover race; observe the winner's row.
                }
            }
        }

        Err(AppError::Internal(anyhow::anyhow!(
            "claim for key did not settle after concurrent takeover"
        )))
    }

    async fn get_status(&self, key: &str) -> Result<Option<RecordStatus>> {
        let row: Option<(RecordStatus, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT status, expires_at FROM dedup_records WHERE record_key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row.map(|(status, expires_at)| {
            if Utc::now() > expires_at {
                RecordStatus::Expired
            } else {
                status
            }
        }))
    }

    async fn get_completed(&self, key: &str) -> Result<Option<CapturedResponse>> {
        let row: Option<(Option<serde_json::Value>,)> = sqlx::query_as(
            r#"
            SELECT response FROM dedup_records
            WHERE record_key = $1 AND status = $2 AND expires_at > NOW()
            "#,
        )
        .bind(key)
        .bind(RecordStatus::Completed)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;

        match row.and_then(|(response,)| response) {
            Some(value) => {
                let response = serde_json::from_value(value).map_err(|e| {
                    anyhow::anyhow!("stored response for key is not decodable: {}", e)
                })?;
                Ok(Some(response))
            }
            None => Ok(None),
        }
    }

    async fn commit(&self, key: &str, response: &CapturedResponse) -> Result<()> {
        let value = serde_json::to_value(response)
            .map_err(|e| anyhow::anyhow!("response not serializable: {}", e))?;

        sqlx::query(
            r#"
            UPDATE dedup_records
            SET status = $2, response = $3, completed_at = NOW()
            WHERE record_key = $1 AND status = $4 AND expires_at > NOW()
            "#,
        )
        .bind(key)
        .bind(RecordStatus::Completed)
        .bind(value)
        .bind(RecordStatus::Pending)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    async fn abandon(&self, key: &str) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM dedup_records WHERE record_key = $1 AND status = $2
            "#,
        )
        .bind(key)
        .bind(RecordStatus::Pending)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    async fn sweep_expired(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM dedup_records WHERE expires_at < NOW()
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected())
    }
}
