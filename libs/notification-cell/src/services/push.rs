use std::collections::HashMap;

use async_trait::async_trait;
use redis::AsyncCommands;
use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE},
    Client,
};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, error};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_database::RedisPool;

use crate::{NotificationError, PushMessage};

/// Fire-and-forget delivery to a device.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn send(&self, message: &PushMessage) -> Result<(), NotificationError>;
}

#[derive(Debug, Deserialize)]
struct ExpoTicket {
    status: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExpoResponse {
    data: ExpoTicket,
}

/// Client for an Expo-compatible push API.
pub struct ExpoPushClient {
    client: Client,
    url: String,
    access_token: Option<String>,
}

impl ExpoPushClient {
    pub fn new(config: &AppConfig) -> Self {
        Self::with_url(config.push_api_url.clone(), config.push_access_token.clone())
    }

    pub fn with_url(url: String, access_token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            url,
            access_token,
        }
    }

    fn headers(&self) -> Result<HeaderMap, NotificationError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        if let Some(token) = &self.access_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| NotificationError::PushFailed(format!("Invalid access token: {}", e)))?;
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }
}

#[async_trait]
impl PushTransport for ExpoPushClient {
    async fn send(&self, message: &PushMessage) -> Result<(), NotificationError> {
        debug!("Sending push to {}", self.url);

        let response = self
            .client
            .post(&self.url)
            .headers(self.headers()?)
            .json(message)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("Push API error ({}): {}", status, error_text);
            return Err(NotificationError::PushFailed(format!(
                "push API returned {}",
                status
            )));
        }

        let body: ExpoResponse = response.json().await?;
        if body.data.status != "ok" {
            return Err(NotificationError::PushFailed(
                body.data
                    .message
                    .unwrap_or_else(|| format!("ticket status {}", body.data.status)),
            ));
        }
        Ok(())
    }
}

/// Device tokens registered by the mobile apps.
#[async_trait]
pub trait PushTokenDirectory: Send + Sync {
    async fn register(&self, user_id: Uuid, token: String) -> Result<(), NotificationError>;

    async fn token_for(&self, user_id: Uuid) -> Result<Option<String>, NotificationError>;
}

#[derive(Default)]
pub struct InMemoryPushTokens {
    tokens: RwLock<HashMap<Uuid, String>>,
}

impl InMemoryPushTokens {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PushTokenDirectory for InMemoryPushTokens {
    async fn register(&self, user_id: Uuid, token: String) -> Result<(), NotificationError> {
        self.tokens.write().await.insert(user_id, token);
        Ok(())
    }

    async fn token_for(&self, user_id: Uuid) -> Result<Option<String>, NotificationError> {
        Ok(self.tokens.read().await.get(&user_id).cloned())
    }
}

pub struct RedisPushTokens {
    pool: RedisPool,
}

impl RedisPushTokens {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }

    fn key(&self, user_id: Uuid) -> String {
        self.pool.key(&format!("push_token:{}", user_id))
    }
}

#[async_trait]
impl PushTokenDirectory for RedisPushTokens {
    async fn register(&self, user_id: Uuid, token: String) -> Result<(), NotificationError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| NotificationError::StoreError(e.to_string()))?;
        let _: () = conn.set(self.key(user_id), token).await?;
        Ok(())
    }

    async fn token_for(&self, user_id: Uuid) -> Result<Option<String>, NotificationError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| NotificationError::StoreError(e.to_string()))?;
        Ok(conn.get(self.key(user_id)).await?)
    }
}
