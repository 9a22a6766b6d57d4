use axum::{routing::get, Router};

use notification_cell::{notification_routes, NotificationState};
use service_request_cell::{service_request_routes, LifecycleState};

pub fn create_router(lifecycle: LifecycleState, notifications: NotificationState) -> Router {
    Router::new()
        .route("/", get(|| async { "Care lifecycle API is running!" }))
        .merge(service_request_routes(lifecycle))
        .merge(notification_routes(notifications))
}
