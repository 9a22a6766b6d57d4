use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use shared_realtime::{SnapshotCursor, Subscription};

use crate::services::engine::LifecycleEngine;
use crate::services::tasks::{shutdown_channel, TaskHandle};
use crate::{CompletionOutcome, RequestSnapshot};

/// Finalizes requests whose patient-verified flag was set by any writer,
/// including a patient app that only flips the flag.
pub struct CompletionWatcher {
    engine: Arc<LifecycleEngine>,
}

impl CompletionWatcher {
    pub fn new(engine: Arc<LifecycleEngine>) -> Self {
        Self { engine }
    }

    /// Subscribes before returning so no snapshot written afterwards is missed.
    pub async fn spawn(self) -> TaskHandle {
        let subscription = self.engine.store().feeds().subscribe_all_requests().await;
        let (tx, rx) = shutdown_channel();
        let join = tokio::spawn(async move { self.run(subscription, rx).await });
        TaskHandle::new("completion-watcher", tx, join)
    }

    #[instrument(skip_all)]
    async fn run(self, mut subscription: Subscription<RequestSnapshot>, mut shutdown: watch::Receiver<bool>) {
        info!("Completion watcher started");
        let mut cursor: SnapshotCursor<Uuid> = SnapshotCursor::new();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!("Completion watcher received shutdown signal");
                    break;
                }
                snapshot = subscription.next() => {
                    let Some(snapshot) = snapshot else {
                        debug!("Request feed closed");
                        break;
                    };
                    self.observe(&mut cursor, snapshot).await;
                }
            }
        }

        self.engine.unsubscribe(subscription).await;
        info!("Completion watcher stopped");
    }

    async fn observe(&self, cursor: &mut SnapshotCursor<Uuid>, snapshot: RequestSnapshot) {
        if !cursor.accept(snapshot.request_id, snapshot.version) {
            return;
        }
        // Deleted and terminal requests never change again.
        if snapshot.is_final() {
            cursor.forget(&snapshot.request_id);
            return;
        }
        if !snapshot.ready_for_completion() {
            return;
        }

        match self.engine.finalize(snapshot.request_id).await {
            Ok(CompletionOutcome::Completed { record }) => {
                debug!("Watcher completed {} as record {}", snapshot.request_id, record.id)
            }
            Ok(_) => {}
            Err(e) => error!("Watcher could not finalize {}: {}", snapshot.request_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::store::{InMemoryRequestStore, RequestStore};
    use crate::{
        EventBus, InMemoryRefundDesk, Location, NewServiceRequest, RandomCodeGenerator,
        RequestFeeds, ServiceRequest, ServiceStage,
    };
    use shared_config::LifecycleSettings;

    fn watcher() -> CompletionWatcher {
        let store = Arc::new(InMemoryRequestStore::new(RequestFeeds::new(16)));
        CompletionWatcher::new(Arc::new(LifecycleEngine::new(
            store as Arc<dyn RequestStore>,
            LifecycleSettings::default(),
            Arc::new(RandomCodeGenerator),
            EventBus::new(16),
            Arc::new(InMemoryRefundDesk::new()),
        )))
    }

    fn request() -> ServiceRequest {
        ServiceRequest::new(
            Uuid::new_v4(),
            NewServiceRequest {
                doctor_id: Uuid::new_v4(),
                patient_id: None,
                patient_name: "Latha".to_string(),
                health_issue: "Dizziness".to_string(),
                symptoms: vec![],
                location: Location::Address("Villa 7".to_string()),
                distance: None,
                patient_image: None,
                advance_payment_amount: 250,
            },
        )
    }

    #[tokio::test]
    async fn terminal_snapshot_is_dropped_from_cursor() {
        let watcher = watcher();
        let mut cursor = SnapshotCursor::new();
        let mut request = request();

        watcher.observe(&mut cursor, RequestSnapshot::of(&request)).await;
        assert_eq!(cursor.last_seen(&request.id), Some(request.version));

        request.stage = ServiceStage::Rejected;
        request.version += 1;
        watcher.observe(&mut cursor, RequestSnapshot::of(&request)).await;
        assert!(cursor.is_empty());
    }

    #[tokio::test]
    async fn tombstone_is_dropped_from_cursor() {
        let watcher = watcher();
        let mut cursor = SnapshotCursor::new();
        let request = request();

        watcher.observe(&mut cursor, RequestSnapshot::of(&request)).await;
        watcher.observe(&mut cursor, RequestSnapshot::tombstone(&request)).await;
        assert!(cursor.is_empty());
    }
}
