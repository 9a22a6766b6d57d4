use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::time::{sleep, timeout, Duration};
use tower::ServiceExt;
use uuid::Uuid;

use notification_cell::{
    notification_routes, notifications_topic, InMemoryNotificationStore, InMemoryPushTokens, Notification,
    NotificationInbox, NotificationKind, NotificationState, PushTokenDirectory,
};
use shared_realtime::ChangeFeed;
use shared_utils::test_utils::{JwtTestUtils, TestConfig, TestUser};

struct TestApp {
    config: TestConfig,
    inbox: Arc<NotificationInbox>,
    tokens: Arc<InMemoryPushTokens>,
    doctor: TestUser,
}

impl TestApp {
    fn new() -> Self {
        Self {
            config: TestConfig::default(),
            inbox: Arc::new(NotificationInbox::new(
                Arc::new(InMemoryNotificationStore::new()),
                ChangeFeed::new(16),
            )),
            tokens: Arc::new(InMemoryPushTokens::new()),
            doctor: TestUser::doctor("+15550002001"),
        }
    }

    fn router(&self) -> Router {
        notification_routes(NotificationState {
            config: self.config.to_arc(),
            inbox: self.inbox.clone(),
            tokens: self.tokens.clone() as Arc<dyn PushTokenDirectory>,
        })
    }

    async fn call(&self, user: Option<&TestUser>, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header("Authorization", JwtTestUtils::bearer(user, &self.config));
        }
        let request = match body {
            Some(body) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn seed(&self, title: &str) -> Notification {
        self.inbox
            .append(Notification::new(
                self.doctor.uuid(),
                NotificationKind::NewRequest,
                title,
                "A patient needs a visit",
                Some(Uuid::new_v4()),
            ))
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn test_requires_authentication() {
    let app = TestApp::new();
    let (status, _) = app.call(None, "GET", "/notifications", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_list_and_mark_read() {
    let app = TestApp::new();
    let older = app.seed("older").await;
    app.seed("newer").await;

    let (status, body) = app.call(Some(&app.doctor), "GET", "/notifications", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["unreadCount"], 2);
    assert_eq!(body["notifications"][0]["title"], "newer");
    assert_eq!(body["notifications"][1]["type"], "new_request");

    let uri = format!("/notifications/{}/read", older.id);
    let (status, body) = app.call(Some(&app.doctor), "POST", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["notification"]["read"], true);

    let (status, _) = app.call(Some(&app.doctor), "POST", &uri, None).await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = app.call(Some(&app.doctor), "GET", "/notifications", None).await;
    assert_eq!(body["unreadCount"], 1);
}

#[tokio::test]
async fn test_cannot_read_someone_elses_notification() {
    let app = TestApp::new();
    let entry = app.seed("private").await;
    let other = TestUser::doctor("+15550002002");

    let uri = format!("/notifications/{}/read", entry.id);
    let (status, _) = app.call(Some(&other), "POST", &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_register_push_token() {
    let app = TestApp::new();

    let (status, _) = app
        .call(Some(&app.doctor), "POST", "/devices/push-token", Some(json!({ "token": "  " })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = app
        .call(
            Some(&app.doctor),
            "POST",
            "/devices/push-token",
            Some(json!({ "token": "ExponentPushToken[abc]" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(
        app.tokens.token_for(app.doctor.uuid()).await.unwrap(),
        Some("ExponentPushToken[abc]".to_string())
    );
}

#[tokio::test]
async fn test_event_stream_replays_inbox_and_releases_on_disconnect() {
    let app = TestApp::new();
    let entry = app.seed("waiting").await;

    let request = Request::builder()
        .method("GET")
        .uri("/notifications/events")
        .header("Authorization", JwtTestUtils::bearer(&app.doctor, &app.config))
        .body(Body::empty())
        .unwrap();
    let response = app.router().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body().into_data_stream();
    let first = timeout(Duration::from_secs(2), body.next())
        .await
        .expect("first event within timeout")
        .expect("stream open")
        .unwrap();
    let text = String::from_utf8(first.to_vec()).unwrap();
    assert!(text.contains("event: notification"), "{}", text);
    assert!(text.contains(&entry.id.to_string()), "{}", text);

    let topic = notifications_topic(app.doctor.uuid());
    assert_eq!(app.inbox.feed().subscriber_count(&topic).await, 1);

    drop(body);
    timeout(Duration::from_secs(2), async {
        while !app.inbox.feed().active_topics().await.is_empty() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("notification topic released");
    assert_eq!(app.inbox.feed().subscriber_count(&topic).await, 0);
}
