use thiserror::Error;
use uuid::Uuid;

use shared_models::error::AppError;

/// Failures reported by a `RequestStore` backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Document not found: {0}")]
    NotFound(Uuid),

    #[error("Version conflict: expected {expected}, found {actual}")]
    Conflict { expected: u64, actual: u64 },

    #[error("A visit record already exists for request {0}")]
    DuplicateRecord(Uuid),

    #[error("Visit record {0} already has a review")]
    AlreadyReviewed(Uuid),

    #[error("Transaction aborted: {0}")]
    Aborted(String),

    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Redis connection error: {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Service request not found: {0}")]
    NotFound(Uuid),

    #[error("Visit record not found: {0}")]
    RecordNotFound(Uuid),

    #[error("Service request {0} was modified concurrently")]
    Conflict(Uuid),

    #[error("Cannot {event} while request is {from}: {reason}")]
    InvalidTransition {
        from: String,
        event: String,
        reason: String,
    },

    #[error("Advance payment has not been confirmed for request {0}")]
    PaymentNotConfirmed(Uuid),

    #[error("Completion of request {request_id} aborted after {attempts} attempts")]
    TransactionAborted { request_id: Uuid, attempts: u32 },

    #[error("Not permitted: {0}")]
    Forbidden(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl LifecycleError {
    pub fn invalid(from: impl ToString, event: &str, reason: impl Into<String>) -> Self {
        LifecycleError::InvalidTransition {
            from: from.to_string(),
            event: event.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<LifecycleError> for AppError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::NotFound(_) | LifecycleError::RecordNotFound(_) => {
                AppError::NotFound(err.to_string())
            }
            LifecycleError::Conflict(_) => AppError::Conflict(err.to_string()),
            LifecycleError::InvalidTransition { .. } | LifecycleError::PaymentNotConfirmed(_) => {
                AppError::BadRequest(err.to_string())
            }
            LifecycleError::ValidationError(msg) => AppError::ValidationError(msg),
            LifecycleError::Forbidden(msg) => AppError::Auth(msg),
            LifecycleError::TransactionAborted { .. } => AppError::Unavailable(err.to_string()),
            LifecycleError::Store(StoreError::NotFound(id)) => {
                AppError::NotFound(format!("Document not found: {}", id))
            }
            LifecycleError::Store(
                StoreError::Conflict { .. }
                | StoreError::DuplicateRecord(_)
                | StoreError::AlreadyReviewed(_),
            ) => AppError::Conflict(err.to_string()),
            LifecycleError::Store(e) => AppError::Database(e.to_string()),
        }
    }
}
