use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use futures::Stream;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(String);

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// `collection/id`, e.g. `requests/<uuid>`.
    pub fn scoped(collection: &str, id: impl fmt::Display) -> Self {
        Self(format!("{}/{}", collection, id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Topic-keyed fan-out of snapshots of type `T`.
///
/// Subscriptions stay open until the consumer hands them back through
/// [`ChangeFeed::unsubscribe`]. Topics whose receivers are all gone are pruned
/// on the next publish.
pub struct ChangeFeed<T> {
    channels: Arc<RwLock<HashMap<Topic, broadcast::Sender<T>>>>,
    capacity: usize,
}

impl<T> Clone for ChangeFeed<T> {
    fn clone(&self) -> Self {
        Self {
            channels: Arc::clone(&self.channels),
            capacity: self.capacity,
        }
    }
}

impl<T> ChangeFeed<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Opens a subscription that first yields `initial` (the current state as
    /// read by the caller), then every snapshot published on `topic`.
    pub async fn subscribe(&self, topic: Topic, initial: Vec<T>) -> Subscription<T> {
        let receiver = {
            let mut channels = self.channels.write().await;
            channels
                .entry(topic.clone())
                .or_insert_with(|| broadcast::channel(self.capacity).0)
                .subscribe()
        };

        debug!("Subscribed to {}", topic);
        Subscription {
            topic,
            initial: initial.into(),
            receiver,
        }
    }

    /// Delivers `snapshot` to every current subscriber of `topic`; returns the
    /// number of receivers reached.
    pub async fn publish(&self, topic: &Topic, snapshot: T) -> usize {
        let delivered = {
            let channels = self.channels.read().await;
            match channels.get(topic) {
                Some(sender) => sender.send(snapshot).ok(),
                None => return 0,
            }
        };

        match delivered {
            Some(count) => count,
            None => {
                self.prune(topic).await;
                0
            }
        }
    }

    pub async fn publish_all(&self, topics: &[Topic], snapshot: T) {
        for topic in topics {
            self.publish(topic, snapshot.clone()).await;
        }
    }

    /// Explicit teardown of a subscription.
    pub async fn unsubscribe(&self, subscription: Subscription<T>) {
        let topic = subscription.topic.clone();
        drop(subscription);
        self.prune(&topic).await;
        debug!("Unsubscribed from {}", topic);
    }

    /// Streams `subscription` until the first item for which `is_last` holds.
    /// The subscription is handed back to the feed when the stream ends or is
    /// dropped, e.g. when an SSE client disconnects.
    pub fn stream_until<F>(&self, subscription: Subscription<T>, is_last: F) -> impl Stream<Item = T> + Send
    where
        F: Fn(&T) -> bool + Send + 'static,
    {
        let guard = SubscriptionGuard {
            feed: self.clone(),
            subscription: Some(subscription),
        };

        futures::stream::unfold((guard, is_last, false), |(mut guard, is_last, done)| async move {
            if done {
                return None;
            }
            let snapshot = guard.subscription.as_mut()?.next().await?;
            let done = is_last(&snapshot);
            Some((snapshot, (guard, is_last, done)))
        })
    }

    pub async fn subscriber_count(&self, topic: &Topic) -> usize {
        let channels = self.channels.read().await;
        channels.get(topic).map(|s| s.receiver_count()).unwrap_or(0)
    }

    pub async fn active_topics(&self) -> Vec<Topic> {
        let channels = self.channels.read().await;
        let mut topics: Vec<Topic> = channels.keys().cloned().collect();
        topics.sort();
        topics
    }

    async fn prune(&self, topic: &Topic) {
        let mut channels = self.channels.write().await;
        if let Some(sender) = channels.get(topic) {
            if sender.receiver_count() == 0 {
                channels.remove(topic);
                debug!("Removed idle topic {}", topic);
            }
        }
    }
}

/// Unsubscribes on drop. Drop cannot await, so the teardown runs as a task
/// on the current runtime.
struct SubscriptionGuard<T: Clone + Send + 'static> {
    feed: ChangeFeed<T>,
    subscription: Option<Subscription<T>>,
}

impl<T: Clone + Send + 'static> Drop for SubscriptionGuard<T> {
    fn drop(&mut self) {
        let Some(subscription) = self.subscription.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let feed = self.feed.clone();
                handle.spawn(async move { feed.unsubscribe(subscription).await });
            }
            Err(_) => warn!("No runtime to release subscription on {}", subscription.topic),
        }
    }
}

pub struct Subscription<T> {
    topic: Topic,
    initial: VecDeque<T>,
    receiver: broadcast::Receiver<T>,
}

impl<T> Subscription<T>
where
    T: Clone + Send + 'static,
{
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Next snapshot, or `None` once the feed itself is gone. A lagging
    /// receiver skips ahead; since snapshots are full documents the newest one
    /// still carries the current state.
    pub async fn next(&mut self) -> Option<T> {
        if let Some(snapshot) = self.initial.pop_front() {
            return Some(snapshot);
        }

        loop {
            match self.receiver.recv().await {
                Ok(snapshot) => return Some(snapshot),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Subscriber on {} lagged, skipped {} snapshots", self.topic, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking poll used by tests and drain loops.
    pub fn try_next(&mut self) -> Option<T> {
        if let Some(snapshot) = self.initial.pop_front() {
            return Some(snapshot);
        }

        loop {
            match self.receiver.try_recv() {
                Ok(snapshot) => return Some(snapshot),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!("Subscriber on {} lagged, skipped {} snapshots", self.topic, skipped);
                }
                Err(_) => return None,
            }
        }
    }
}
