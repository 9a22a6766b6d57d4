use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use shared_models::error::AppError;
use shared_utils::signature::{verify_payload, SignatureError};

use crate::services::engine::LifecycleEngine;
use crate::{LifecycleError, StoreError, TransitionOutcome};

pub const PAYMENT_SIGNATURE_HEADER: &str = "X-Payment-Signature";

#[derive(Error, Debug)]
pub enum PaymentError {
    #[error("Invalid webhook signature: {0}")]
    InvalidSignature(#[from] SignatureError),

    #[error("Missing webhook signature")]
    MissingSignature,

    #[error("Malformed webhook payload: {0}")]
    MalformedPayload(String),

    #[error("Payment amount {received} does not match advance of {expected}")]
    AmountMismatch { expected: i64, received: i64 },

    #[error("Simulated payments are disabled")]
    SimulationDisabled,

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

impl From<PaymentError> for AppError {
    fn from(err: PaymentError) -> Self {
        match err {
            PaymentError::InvalidSignature(_) | PaymentError::MissingSignature => {
                AppError::Auth(err.to_string())
            }
            PaymentError::MalformedPayload(_) | PaymentError::AmountMismatch { .. } => {
                AppError::BadRequest(err.to_string())
            }
            PaymentError::SimulationDisabled => AppError::Forbidden(err.to_string()),
            PaymentError::Lifecycle(e) => e.into(),
        }
    }
}

/// Provider webhook body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentWebhook {
    pub request_id: Uuid,
    pub amount: i64,
    pub status: String,
    #[serde(default)]
    pub provider_reference: Option<String>,
}

impl PaymentWebhook {
    pub fn is_success(&self) -> bool {
        matches!(
            self.status.trim().to_ascii_lowercase().as_str(),
            "completed" | "succeeded" | "captured" | "paid"
        )
    }
}

/// Turns external payment signals into the `ConfirmPayment` transition.
#[derive(Clone)]
pub struct PaymentConfirmationAdapter {
    engine: Arc<LifecycleEngine>,
    webhook_secret: String,
    simulation_enabled: bool,
}

impl PaymentConfirmationAdapter {
    pub fn new(engine: Arc<LifecycleEngine>, webhook_secret: String, simulation_enabled: bool) -> Self {
        Self {
            engine,
            webhook_secret,
            simulation_enabled,
        }
    }

    pub fn simulation_enabled(&self) -> bool {
        self.simulation_enabled
    }

    pub async fn on_payment_confirmed(&self, request_id: Uuid) -> Result<TransitionOutcome, PaymentError> {
        let outcome = self.engine.confirm_payment(request_id).await?;
        if outcome.changed {
            info!("Advance payment confirmed for request {}", request_id);
        } else {
            debug!("Duplicate payment confirmation for request {}", request_id);
        }
        Ok(outcome)
    }

    /// Verifies and applies a signed provider webhook. Returns `None` when the
    /// webhook reports a non-success status.
    pub async fn handle_webhook(
        &self,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<Option<TransitionOutcome>, PaymentError> {
        let signature = signature.ok_or(PaymentError::MissingSignature)?;
        verify_payload(&self.webhook_secret, body, signature).map_err(|e| {
            warn!("Rejected payment webhook: {}", e);
            PaymentError::from(e)
        })?;

        let webhook: PaymentWebhook = serde_json::from_slice(body)
            .map_err(|e| PaymentError::MalformedPayload(e.to_string()))?;

        if !webhook.is_success() {
            info!(
                "Ignoring payment webhook for {} with status {}",
                webhook.request_id, webhook.status
            );
            return Ok(None);
        }

        let request = match self.engine.store().get(webhook.request_id).await {
            Ok(request) => request,
            Err(StoreError::NotFound(id)) => return Err(LifecycleError::NotFound(id).into()),
            Err(e) => return Err(LifecycleError::from(e).into()),
        };
        if request.advance_payment.amount != webhook.amount {
            return Err(PaymentError::AmountMismatch {
                expected: request.advance_payment.amount,
                received: webhook.amount,
            });
        }

        self.on_payment_confirmed(webhook.request_id).await.map(Some)
    }

    /// Dev/test trigger that confirms payment after `delay`.
    pub fn simulate(&self, request_id: Uuid, delay: Duration) -> Result<JoinHandle<()>, PaymentError> {
        if !self.simulation_enabled {
            return Err(PaymentError::SimulationDisabled);
        }

        let adapter = self.clone();
        Ok(tokio::spawn(async move {
            sleep(delay).await;
            match adapter.on_payment_confirmed(request_id).await {
                Ok(_) => debug!("Simulated payment applied to {}", request_id),
                Err(e) => error!("Simulated payment for {} failed: {}", request_id, e),
            }
        }))
    }
}
