use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
    Extension,
};
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use shared_models::{auth::Identity, error::AppError};

use crate::router::NotificationState;
use crate::{NotificationError, RegisterPushTokenRequest};

pub async fn list_notifications(
    State(state): State<NotificationState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<Value>, AppError> {
    let notifications = state.inbox.list(identity.user_id).await?;
    let unread = notifications.iter().filter(|n| !n.read).count();

    Ok(Json(json!({
        "notifications": notifications,
        "unreadCount": unread,
    })))
}

pub async fn mark_read(
    State(state): State<NotificationState>,
    Extension(identity): Extension<Identity>,
    Path(notification_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let notification = state.inbox.mark_read(identity.user_id, notification_id).await?;

    Ok(Json(json!({
        "success": true,
        "notification": notification,
    })))
}

pub async fn notification_events(
    State(state): State<NotificationState>,
    Extension(identity): Extension<Identity>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let notifications = state.inbox.watch(identity.user_id).await?;
    info!("Streaming notifications to {}", identity.user_id);

    let stream = notifications.map(|notification| {
        let event = match serde_json::to_string(&notification) {
            Ok(data) => Event::default()
                .event("notification")
                .id(notification.id.to_string())
                .data(data),
            Err(e) => Event::default().event("error").data(e.to_string()),
        };
        Ok(event)
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

pub async fn register_push_token(
    State(state): State<NotificationState>,
    Extension(identity): Extension<Identity>,
    Json(payload): Json<RegisterPushTokenRequest>,
) -> Result<Json<Value>, AppError> {
    let token = payload.token.trim();
    if token.is_empty() {
        return Err(NotificationError::ValidationError("Push token must not be empty".to_string()).into());
    }

    state.tokens.register(identity.user_id, token.to_string()).await?;
    info!("Registered push token for {}", identity.user_id);

    Ok(Json(json!({ "success": true })))
}
