use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use shared_config::AppConfig;
use shared_utils::extractor::auth_middleware;

use crate::handlers::{list_notifications, mark_read, notification_events, register_push_token};
use crate::services::{inbox::NotificationInbox, push::PushTokenDirectory};

#[derive(Clone)]
pub struct NotificationState {
    pub config: Arc<AppConfig>,
    pub inbox: Arc<NotificationInbox>,
    pub tokens: Arc<dyn PushTokenDirectory>,
}

pub fn notification_routes(state: NotificationState) -> Router {
    Router::new()
        .route("/notifications", get(list_notifications))
        .route("/notifications/events", get(notification_events))
        .route("/notifications/{notification_id}/read", post(mark_read))
        .route("/devices/push-token", post(register_push_token))
        .layer(middleware::from_fn_with_state(
            state.config.clone(),
            auth_middleware,
        ))
        .with_state(state)
}
