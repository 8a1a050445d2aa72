use http::StatusCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

/// Application error taxonomy.
#[derive(Debug, Error)]
pub enum AppError {
    /// A deduplicated request arrived without the required idempotency key.
    #[error("idempotency key missing: header '{0}' not present on request")]
    MissingKey(String),

    /// An idempotency key was replayed with materially different content.
    #[error("idempotency key reused with different request content")]
    PayloadConflict,

    /// Another request holding the same key is still executing.
    #[error("request with this idempotency key is still being processed; retry in {retry_after_secs}s")]
    InFlight { retry_after_secs: u64 },

    /// The backing store cannot be reached or cannot guarantee atomicity.
    #[error("deduplication store unavailable: {0}")]
    StoreUnavailable(#[source] anyhow::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The underlying business operation failed. Not a deduplication error;
    /// propagated to the caller unchanged after the claim is abandoned.
    #[error("operation failed: {0}")]
    Operation(#[source] anyhow::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// True when the error means the backing store could not be used.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(
            self,
            AppError::StoreUnavailable(_) | AppError::Database(_) | AppError::Redis(_)
        )
    }

    /// HTTP status a transport adapter should answer with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::MissingKey(_) => StatusCode::BAD_REQUEST,
            AppError::PayloadConflict | AppError::InFlight { .. } => StatusCode::CONFLICT,
            AppError::StoreUnavailable(_) | AppError::Database(_) | AppError::Redis(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::Operation(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code for error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::MissingKey(_) => "MISSING_IDEMPOTENCY_KEY",
            AppError::PayloadConflict => "IDEMPOTENCY_CONFLICT",
            AppError::InFlight { .. } => "REQUEST_IN_FLIGHT",
            AppError::StoreUnavailable(_) | AppError::Database(_) | AppError::Redis(_) => {
                "STORE_UNAVAILABLE"
            }
            AppError::Operation(_) => "OPERATION_FAILED",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}
