use tokio::time::{timeout, Duration};

use shared_realtime::{ChangeFeed, SnapshotCursor, Topic};

#[derive(Debug, Clone, PartialEq)]
struct Doc {
    id: &'static str,
    version: u64,
}

#[tokio::test]
async fn test_subscription_yields_initial_state_first() {
    let feed: ChangeFeed<Doc> = ChangeFeed::new(16);
    let topic = Topic::scoped("requests", "r1");

    let mut sub = feed.subscribe(topic.clone(), vec![Doc { id: "r1", version: 1 }]).await;
    feed.publish(&topic, Doc { id: "r1", version: 2 }).await;

    assert_eq!(sub.next().await, Some(Doc { id: "r1", version: 1 }));
    assert_eq!(sub.next().await, Some(Doc { id: "r1", version: 2 }));
}

#[tokio::test]
async fn test_publish_reaches_every_subscriber_of_topic_only() {
    let feed: ChangeFeed<Doc> = ChangeFeed::new(16);
    let topic = Topic::new("doctors/d1/requests");
    let other = Topic::new("doctors/d2/requests");

    let mut first = feed.subscribe(topic.clone(), vec![]).await;
    let mut second = feed.subscribe(topic.clone(), vec![]).await;
    let mut unrelated = feed.subscribe(other, vec![]).await;

    let reached = feed.publish(&topic, Doc { id: "r9", version: 4 }).await;
    assert_eq!(reached, 2);

    assert_eq!(first.try_next(), Some(Doc { id: "r9", version: 4 }));
    assert_eq!(second.try_next(), Some(Doc { id: "r9", version: 4 }));
    assert_eq!(unrelated.try_next(), None);
}

#[tokio::test]
async fn test_unsubscribe_removes_idle_topic() {
    let feed: ChangeFeed<Doc> = ChangeFeed::new(16);
    let topic = Topic::scoped("requests", "r2");

    let sub = feed.subscribe(topic.clone(), vec![]).await;
    assert_eq!(feed.subscriber_count(&topic).await, 1);

    feed.unsubscribe(sub).await;
    assert_eq!(feed.subscriber_count(&topic).await, 0);
    assert!(feed.active_topics().await.is_empty());
    assert_eq!(feed.publish(&topic, Doc { id: "r2", version: 1 }).await, 0);
}

#[tokio::test]
async fn test_dropped_receiver_topic_is_pruned_on_publish() {
    let feed: ChangeFeed<Doc> = ChangeFeed::new(16);
    let topic = Topic::scoped("requests", "r3");

    drop(feed.subscribe(topic.clone(), vec![]).await);
    assert_eq!(feed.active_topics().await, vec![topic.clone()]);

    feed.publish(&topic, Doc { id: "r3", version: 1 }).await;
    assert!(feed.active_topics().await.is_empty());
}

#[tokio::test]
async fn test_lagging_subscriber_still_sees_latest_snapshot() {
    let feed: ChangeFeed<Doc> = ChangeFeed::new(2);
    let topic = Topic::scoped("requests", "r4");
    let mut sub = feed.subscribe(topic.clone(), vec![]).await;

    for version in 1..=5 {
        feed.publish(&topic, Doc { id: "r4", version }).await;
    }

    let mut last = None;
    while let Some(doc) = sub.try_next() {
        last = Some(doc.version);
    }
    assert_eq!(last, Some(5));
}

#[tokio::test]
async fn test_cursor_filters_repeated_delivery() {
    let feed: ChangeFeed<Doc> = ChangeFeed::new(16);
    let topic = Topic::scoped("requests", "r5");
    let mut sub = feed.subscribe(topic.clone(), vec![Doc { id: "r5", version: 1 }]).await;

    feed.publish(&topic, Doc { id: "r5", version: 1 }).await;
    feed.publish(&topic, Doc { id: "r5", version: 2 }).await;
    feed.publish(&topic, Doc { id: "r5", version: 2 }).await;

    let mut cursor = SnapshotCursor::new();
    let mut applied = Vec::new();
    for _ in 0..4 {
        let doc = timeout(Duration::from_secs(1), sub.next())
            .await
            .expect("snapshot within timeout")
            .expect("feed open");
        if cursor.accept(doc.id, doc.version) {
            applied.push(doc.version);
        }
    }

    assert_eq!(applied, vec![1, 2]);
}

#[test]
fn test_next_is_pending_until_publish() {
    let feed: ChangeFeed<Doc> = ChangeFeed::new(4);
    let topic = Topic::new("requests");
    let mut sub = tokio_test::block_on(feed.subscribe(topic.clone(), vec![]));

    let mut next = tokio_test::task::spawn(sub.next());
    tokio_test::assert_pending!(next.poll());

    tokio_test::block_on(feed.publish(&topic, Doc { id: "r3", version: 1 }));
    assert!(next.is_woken());
    assert_eq!(
        tokio_test::assert_ready!(next.poll()),
        Some(Doc { id: "r3", version: 1 })
    );
}

#[tokio::test]
async fn test_stream_until_ends_on_last_item_and_releases_topic() {
    use futures::StreamExt;

    let feed: ChangeFeed<Doc> = ChangeFeed::new(16);
    let topic = Topic::scoped("requests", "r6");
    let sub = feed.subscribe(topic.clone(), vec![Doc { id: "r6", version: 1 }]).await;
    let mut stream = Box::pin(feed.stream_until(sub, |doc: &Doc| doc.version >= 2));

    feed.publish(&topic, Doc { id: "r6", version: 2 }).await;
    feed.publish(&topic, Doc { id: "r6", version: 3 }).await;

    let versions: Vec<u64> = timeout(Duration::from_secs(1), async {
        let mut seen = Vec::new();
        while let Some(doc) = stream.next().await {
            seen.push(doc.version);
        }
        seen
    })
    .await
    .expect("stream ends after the last item");
    assert_eq!(versions, vec![1, 2]);

    wait_for_release(&feed, &topic).await;
}

#[tokio::test]
async fn test_dropping_stream_releases_topic() {
    let feed: ChangeFeed<Doc> = ChangeFeed::new(16);
    let topic = Topic::scoped("requests", "r7");
    let sub = feed.subscribe(topic.clone(), vec![]).await;
    let stream = feed.stream_until(sub, |_: &Doc| false);
    assert_eq!(feed.subscriber_count(&topic).await, 1);

    drop(stream);

    wait_for_release(&feed, &topic).await;
}

async fn wait_for_release(feed: &ChangeFeed<Doc>, topic: &Topic) {
    timeout(Duration::from_secs(1), async {
        while feed.active_topics().await.contains(topic) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("topic released");
    assert_eq!(feed.subscriber_count(topic).await, 0);
}
