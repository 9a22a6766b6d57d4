use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::{LifecycleError, RefundTicket, ServiceRequest};

/// External refund collaborator. The provider later calls back into
/// `LifecycleEngine::complete_refund`.
#[async_trait]
pub trait RefundWorkflow: Send + Sync {
    /// Idempotent per request: a second call returns the open ticket.
    async fn begin_refund(
        &self,
        request: &ServiceRequest,
        reason: &str,
    ) -> Result<RefundTicket, LifecycleError>;

    /// Closes the ticket once the provider reports the refund as paid out.
    async fn settle(&self, request_id: Uuid) -> Result<Option<RefundTicket>, LifecycleError>;

    async fn open_ticket(&self, request_id: Uuid) -> Result<Option<RefundTicket>, LifecycleError>;
}

/// Keeps refund tickets in memory until an operator or provider settles them.
#[derive(Default)]
pub struct InMemoryRefundDesk {
    open: RwLock<HashMap<Uuid, RefundTicket>>,
}

impl InMemoryRefundDesk {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RefundWorkflow for InMemoryRefundDesk {
    async fn begin_refund(
        &self,
        request: &ServiceRequest,
        reason: &str,
    ) -> Result<RefundTicket, LifecycleError> {
        let mut open = self.open.write().await;
        if let Some(ticket) = open.get(&request.id) {
            return Ok(ticket.clone());
        }

        let ticket = RefundTicket {
            id: Uuid::new_v4(),
            request_id: request.id,
            amount: request.advance_payment.amount,
            reason: reason.to_string(),
            requested_at: Utc::now(),
        };
        open.insert(request.id, ticket.clone());

        info!(
            "Refund ticket {} opened for request {} ({})",
            ticket.id, request.id, ticket.amount
        );
        Ok(ticket)
    }

    async fn settle(&self, request_id: Uuid) -> Result<Option<RefundTicket>, LifecycleError> {
        Ok(self.open.write().await.remove(&request_id))
    }

    async fn open_ticket(&self, request_id: Uuid) -> Result<Option<RefundTicket>, LifecycleError> {
        Ok(self.open.read().await.get(&request_id).cloned())
    }
}
