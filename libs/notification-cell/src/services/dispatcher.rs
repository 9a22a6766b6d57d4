use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, instrument, warn};

use service_request_cell::{
    shutdown_channel, EventBus, LifecycleEvent, LifecycleEventKind, TaskHandle,
};

use crate::services::inbox::NotificationInbox;
use crate::services::push::{PushTokenDirectory, PushTransport};
use crate::{Notification, NotificationError, NotificationKind, PushMessage};

/// Turns lifecycle events into doctor inbox entries and push messages.
/// Runs as its own event-bus subscriber, so nothing here can hold up or undo
/// the write that produced the event.
pub struct NotificationDispatcher {
    inbox: Arc<NotificationInbox>,
    tokens: Arc<dyn PushTokenDirectory>,
    push: Arc<dyn PushTransport>,
}

impl NotificationDispatcher {
    pub fn new(
        inbox: Arc<NotificationInbox>,
        tokens: Arc<dyn PushTokenDirectory>,
        push: Arc<dyn PushTransport>,
    ) -> Self {
        Self { inbox, tokens, push }
    }

    fn compose(event: &LifecycleEvent) -> Option<Notification> {
        let (kind, title, message) = match event.kind {
            LifecycleEventKind::RequestCreated => (
                NotificationKind::NewRequest,
                "New request",
                format!(
                    "{} requested a home visit for {}",
                    event.patient_name, event.health_issue
                ),
            ),
            LifecycleEventKind::PaymentConfirmed => (
                NotificationKind::PaymentReceived,
                "Payment received",
                format!(
                    "Advance payment of {} received from {}",
                    event.amount, event.patient_name
                ),
            ),
            _ => return None,
        };

        Some(Notification::new(
            event.doctor_id,
            kind,
            title,
            message,
            Some(event.request_id),
        ))
    }

    /// Appends one inbox entry for events of interest and attempts a push.
    /// Push failures are logged and swallowed.
    #[instrument(skip(self, event), fields(kind = ?event.kind, request_id = %event.request_id))]
    pub async fn handle(&self, event: &LifecycleEvent) -> Result<Option<Notification>, NotificationError> {
        let Some(notification) = Self::compose(event) else {
            return Ok(None);
        };

        let stored = self.inbox.append(notification).await?;
        self.deliver(&stored).await;
        Ok(Some(stored))
    }

    async fn deliver(&self, notification: &Notification) {
        let token = match self.tokens.token_for(notification.recipient_id).await {
            Ok(Some(token)) => token,
            Ok(None) => {
                debug!("No push token for {}, skipping push", notification.recipient_id);
                return;
            }
            Err(e) => {
                warn!("Push token lookup failed for {}: {}", notification.recipient_id, e);
                return;
            }
        };

        let message = PushMessage::for_notification(&token, notification);
        match self.push.send(&message).await {
            Ok(()) => debug!("Push delivered for notification {}", notification.id),
            Err(e) => warn!("Push delivery failed for notification {}: {}", notification.id, e),
        }
    }

    pub fn spawn(self, events: &EventBus) -> TaskHandle {
        let receiver = events.subscribe();
        let (tx, rx) = shutdown_channel();
        let join = tokio::spawn(async move { self.run(receiver, rx).await });
        TaskHandle::new("notification-dispatcher", tx, join)
    }

    async fn run(self, mut receiver: broadcast::Receiver<LifecycleEvent>, mut shutdown: watch::Receiver<bool>) {
        info!("Notification dispatcher started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = receiver.recv() => match received {
                    Ok(event) => {
                        if let Err(e) = self.handle(&event).await {
                            error!("Failed to record notification for {}: {}", event.request_id, e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Notification dispatcher lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        info!("Notification dispatcher stopped");
    }
}
