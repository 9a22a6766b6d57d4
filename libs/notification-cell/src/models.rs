use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use shared_models::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    NewRequest,
    PaymentReceived,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationKind::NewRequest => write!(f, "new_request"),
            NotificationKind::PaymentReceived => write!(f, "payment_received"),
        }
    }
}

/// Append-only inbox entry; only `read` ever changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: Uuid,
    pub recipient_id: Uuid,
    pub title: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    #[serde(default)]
    pub request_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
}

impl Notification {
    pub fn new(
        recipient_id: Uuid,
        kind: NotificationKind,
        title: impl Into<String>,
        message: impl Into<String>,
        request_id: Option<Uuid>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            recipient_id,
            title: title.into(),
            message: message.into(),
            kind,
            request_id,
            timestamp: Utc::now(),
            read: false,
        }
    }
}

/// Payload handed to a `PushTransport`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushMessage {
    pub to: String,
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
    pub sound: &'static str,
}

impl PushMessage {
    pub fn for_notification(token: &str, notification: &Notification) -> Self {
        Self {
            to: token.to_string(),
            title: notification.title.clone(),
            body: notification.message.clone(),
            data: serde_json::json!({
                "notificationId": notification.id,
                "requestId": notification.request_id,
                "type": notification.kind,
            }),
            sound: "default",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterPushTokenRequest {
    pub token: String,
}

#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("Notification not found: {0}")]
    NotFound(Uuid),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Push delivery failed: {0}")]
    PushFailed(String),

    #[error("Notification store error: {0}")]
    StoreError(String),

    #[error("Redis connection error: {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl From<reqwest::Error> for NotificationError {
    fn from(err: reqwest::Error) -> Self {
        NotificationError::PushFailed(err.to_string())
    }
}

impl From<NotificationError> for AppError {
    fn from(err: NotificationError) -> Self {
        match err {
            NotificationError::NotFound(_) => AppError::NotFound(err.to_string()),
            NotificationError::ValidationError(msg) => AppError::ValidationError(msg),
            NotificationError::PushFailed(_) => AppError::Internal(err.to_string()),
            _ => AppError::Database(err.to_string()),
        }
    }
}
