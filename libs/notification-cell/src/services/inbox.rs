use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use redis::AsyncCommands;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use shared_database::RedisPool;
use shared_realtime::{ChangeFeed, Subscription, Topic};

use crate::{Notification, NotificationError};

pub fn notifications_topic(recipient_id: Uuid) -> Topic {
    Topic::new(format!("notifications/{}", recipient_id))
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn append(&self, notification: Notification) -> Result<Notification, NotificationError>;

    /// Newest first.
    async fn list(&self, recipient_id: Uuid) -> Result<Vec<Notification>, NotificationError>;

    /// Returns the entry and whether its flag actually changed.
    async fn mark_read(
        &self,
        recipient_id: Uuid,
        id: Uuid,
    ) -> Result<(Notification, bool), NotificationError>;
}

#[derive(Default)]
pub struct InMemoryNotificationStore {
    entries: RwLock<HashMap<Uuid, Vec<Notification>>>,
}

impl InMemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NotificationStore for InMemoryNotificationStore {
    async fn append(&self, notification: Notification) -> Result<Notification, NotificationError> {
        let mut entries = self.entries.write().await;
        entries
            .entry(notification.recipient_id)
            .or_default()
            .push(notification.clone());
        Ok(notification)
    }

    async fn list(&self, recipient_id: Uuid) -> Result<Vec<Notification>, NotificationError> {
        let entries = self.entries.read().await;
        let mut list = entries.get(&recipient_id).cloned().unwrap_or_default();
        list.reverse();
        Ok(list)
    }

    async fn mark_read(
        &self,
        recipient_id: Uuid,
        id: Uuid,
    ) -> Result<(Notification, bool), NotificationError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(&recipient_id)
            .and_then(|list| list.iter_mut().find(|n| n.id == id))
            .ok_or(NotificationError::NotFound(id))?;

        let changed = !entry.read;
        entry.read = true;
        Ok((entry.clone(), changed))
    }
}

/// Redis layout: `notification:{id}` holds the JSON entry and
/// `notifications:{recipient}` lists ids newest first.
pub struct RedisNotificationStore {
    pool: RedisPool,
}

impl RedisNotificationStore {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }

    fn entry_key(&self, id: Uuid) -> String {
        self.pool.key(&format!("notification:{}", id))
    }

    fn inbox_key(&self, recipient_id: Uuid) -> String {
        self.pool.key(&format!("notifications:{}", recipient_id))
    }
}

#[async_trait]
impl NotificationStore for RedisNotificationStore {
    async fn append(&self, notification: Notification) -> Result<Notification, NotificationError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| NotificationError::StoreError(e.to_string()))?;

        let data = serde_json::to_string(&notification)?;
        let _: () = redis::pipe()
            .atomic()
            .set(self.entry_key(notification.id), data)
            .ignore()
            .lpush(self.inbox_key(notification.recipient_id), notification.id.to_string())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(notification)
    }

    async fn list(&self, recipient_id: Uuid) -> Result<Vec<Notification>, NotificationError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| NotificationError::StoreError(e.to_string()))?;

        let ids: Vec<String> = conn.lrange(self.inbox_key(recipient_id), 0, -1).await?;
        let mut list = Vec::with_capacity(ids.len());
        for raw_id in ids {
            let Ok(id) = Uuid::parse_str(&raw_id) else {
                continue;
            };
            let data: Option<String> = conn.get(self.entry_key(id)).await?;
            if let Some(data) = data {
                list.push(serde_json::from_str(&data)?);
            }
        }
        Ok(list)
    }

    async fn mark_read(
        &self,
        recipient_id: Uuid,
        id: Uuid,
    ) -> Result<(Notification, bool), NotificationError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| NotificationError::StoreError(e.to_string()))?;

        let data: Option<String> = conn.get(self.entry_key(id)).await?;
        let mut notification: Notification = match data {
            Some(data) => serde_json::from_str(&data)?,
            None => return Err(NotificationError::NotFound(id)),
        };
        if notification.recipient_id != recipient_id {
            return Err(NotificationError::NotFound(id));
        }
        if notification.read {
            return Ok((notification, false));
        }

        notification.read = true;
        let _: () = conn
            .set(self.entry_key(id), serde_json::to_string(&notification)?)
            .await?;
        Ok((notification, true))
    }
}

/// Per-recipient inbox; every append and read-flag change is published on the
/// recipient's topic.
pub struct NotificationInbox {
    store: Arc<dyn NotificationStore>,
    feed: ChangeFeed<Notification>,
}

impl NotificationInbox {
    pub fn new(store: Arc<dyn NotificationStore>, feed: ChangeFeed<Notification>) -> Self {
        Self { store, feed }
    }

    pub fn feed(&self) -> &ChangeFeed<Notification> {
        &self.feed
    }

    pub async fn append(&self, notification: Notification) -> Result<Notification, NotificationError> {
        let stored = self.store.append(notification).await?;
        self.feed
            .publish(&notifications_topic(stored.recipient_id), stored.clone())
            .await;
        debug!("Notification {} appended for {}", stored.id, stored.recipient_id);
        Ok(stored)
    }

    pub async fn list(&self, recipient_id: Uuid) -> Result<Vec<Notification>, NotificationError> {
        self.store.list(recipient_id).await
    }

    pub async fn unread_count(&self, recipient_id: Uuid) -> Result<usize, NotificationError> {
        Ok(self
            .store
            .list(recipient_id)
            .await?
            .iter()
            .filter(|n| !n.read)
            .count())
    }

    /// Idempotent.
    pub async fn mark_read(&self, recipient_id: Uuid, id: Uuid) -> Result<Notification, NotificationError> {
        let (notification, changed) = self.store.mark_read(recipient_id, id).await?;
        if changed {
            self.feed
                .publish(&notifications_topic(recipient_id), notification.clone())
                .await;
        }
        Ok(notification)
    }

    /// Yields the existing entries oldest first, then new ones as they arrive.
    pub async fn subscribe(&self, recipient_id: Uuid) -> Result<Subscription<Notification>, NotificationError> {
        let mut existing = self.store.list(recipient_id).await?;
        existing.reverse();
        Ok(self
            .feed
            .subscribe(notifications_topic(recipient_id), existing)
            .await)
    }

    /// Open-ended `subscribe` that hands the subscription back when dropped.
    pub async fn watch(
        &self,
        recipient_id: Uuid,
    ) -> Result<BoxStream<'static, Notification>, NotificationError> {
        let subscription = self.subscribe(recipient_id).await?;
        Ok(self.feed.stream_until(subscription, |_| false).boxed())
    }

    pub async fn unsubscribe(&self, subscription: Subscription<Notification>) {
        self.feed.unsubscribe(subscription).await;
    }
}
