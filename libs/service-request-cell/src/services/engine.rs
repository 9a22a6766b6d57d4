use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use shared_config::LifecycleSettings;
use shared_models::auth::{Identity, Role};
use shared_realtime::Subscription;

use crate::services::codes::CodeGenerator;
use crate::services::events::EventBus;
use crate::services::feed::request_topic;
use crate::services::lifecycle::{LifecycleCommand, RequestLifecycleService, Transition};
use crate::services::refund::RefundWorkflow;
use crate::services::store::RequestStore;
use crate::{
    AtomicOp, CompletionOutcome, LifecycleError, LifecycleEvent, LifecycleEventKind,
    NewServiceRequest, Prescription, RefundTicket, RequestQuery, RequestSnapshot, RequestStatus,
    Review, ServiceRequest, StoreError, TransitionOutcome, VisitRecord,
};

/// Drives service requests through their lifecycle against a `RequestStore`.
///
/// Every write is a compare-and-set on the version read just before; on a lost
/// race the engine re-reads and re-evaluates the guards.
pub struct LifecycleEngine {
    store: Arc<dyn RequestStore>,
    rules: RequestLifecycleService,
    events: EventBus,
    refunds: Arc<dyn RefundWorkflow>,
    settings: LifecycleSettings,
}

impl LifecycleEngine {
    pub fn new(
        store: Arc<dyn RequestStore>,
        settings: LifecycleSettings,
        codes: Arc<dyn CodeGenerator>,
        events: EventBus,
        refunds: Arc<dyn RefundWorkflow>,
    ) -> Self {
        Self {
            store,
            rules: RequestLifecycleService::new(settings.clone(), codes),
            events,
            refunds,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn RequestStore> {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn rules(&self) -> &RequestLifecycleService {
        &self.rules
    }

    // ==========================================================================
    // INTAKE & QUERIES
    // ==========================================================================

    #[instrument(skip(self, intake), fields(doctor_id = %intake.doctor_id))]
    pub async fn create_request(
        &self,
        identity: &Identity,
        intake: NewServiceRequest,
    ) -> Result<ServiceRequest, LifecycleError> {
        let patient_id = match identity.role {
            Role::Patient => identity.user_id,
            Role::System => intake.patient_id.ok_or_else(|| {
                LifecycleError::ValidationError("patientId is required".to_string())
            })?,
            Role::Doctor => {
                return Err(LifecycleError::Forbidden(
                    "only patients can request a visit".to_string(),
                ))
            }
        };

        if intake.doctor_id.is_nil() {
            return Err(LifecycleError::ValidationError("doctorId is required".to_string()));
        }
        if intake.patient_name.trim().is_empty() || intake.health_issue.trim().is_empty() {
            return Err(LifecycleError::ValidationError(
                "patientName and healthIssue are required".to_string(),
            ));
        }
        if intake.advance_payment_amount < 0 {
            return Err(LifecycleError::ValidationError(
                "advancePaymentAmount cannot be negative".to_string(),
            ));
        }

        let request = self
            .store
            .insert(ServiceRequest::new(patient_id, intake))
            .await?;
        self.events.publish(LifecycleEvent::from_request(
            LifecycleEventKind::RequestCreated,
            &request,
        ));

        info!("Service request {} created for doctor {}", request.id, request.doctor_id);
        Ok(request)
    }

    pub async fn get_request(
        &self,
        identity: &Identity,
        id: Uuid,
    ) -> Result<ServiceRequest, LifecycleError> {
        let request = self.load(id).await?;
        Self::ensure_party(identity, &request)?;
        Ok(request)
    }

    pub async fn list_requests(
        &self,
        identity: &Identity,
        status: Option<RequestStatus>,
    ) -> Result<Vec<ServiceRequest>, LifecycleError> {
        let mut query = match identity.role {
            Role::Doctor => RequestQuery::for_doctor(identity.user_id),
            Role::Patient => RequestQuery::for_patient(identity.user_id),
            Role::System => RequestQuery::default(),
        };
        query.status = status;
        Ok(self.store.list(&query).await?)
    }

    /// Live snapshots of one request, starting with its current state.
    pub async fn subscribe_request(
        &self,
        identity: &Identity,
        id: Uuid,
    ) -> Result<Subscription<RequestSnapshot>, LifecycleError> {
        let request = self.get_request(identity, id).await?;
        Ok(self
            .store
            .feeds()
            .requests
            .subscribe(request_topic(id), vec![RequestSnapshot::of(&request)])
            .await)
    }

    /// Snapshot stream for one request that ends once the request is deleted
    /// or terminal, and unsubscribes when dropped.
    pub async fn watch_request(
        &self,
        identity: &Identity,
        id: Uuid,
    ) -> Result<BoxStream<'static, RequestSnapshot>, LifecycleError> {
        let subscription = self.subscribe_request(identity, id).await?;
        Ok(self
            .store
            .feeds()
            .requests
            .stream_until(subscription, RequestSnapshot::is_final)
            .boxed())
    }

    pub async fn unsubscribe(&self, subscription: Subscription<RequestSnapshot>) {
        self.store.feeds().requests.unsubscribe(subscription).await;
    }

    // ==========================================================================
    // DOCTOR ACTIONS
    // ==========================================================================

    pub async fn accept(&self, identity: &Identity, id: Uuid) -> Result<TransitionOutcome, LifecycleError> {
        self.apply(identity, id, LifecycleCommand::Accept).await
    }

    pub async fn reject(&self, identity: &Identity, id: Uuid) -> Result<TransitionOutcome, LifecycleError> {
        self.apply(identity, id, LifecycleCommand::Reject).await
    }

    pub async fn mark_arrived(
        &self,
        identity: &Identity,
        id: Uuid,
    ) -> Result<TransitionOutcome, LifecycleError> {
        self.apply(identity, id, LifecycleCommand::MarkArrived).await
    }

    pub async fn start_service(
        &self,
        identity: &Identity,
        id: Uuid,
        code: &str,
    ) -> Result<TransitionOutcome, LifecycleError> {
        self.apply(
            identity,
            id,
            LifecycleCommand::StartService {
                code: code.to_string(),
            },
        )
        .await
    }

    pub async fn save_prescription(
        &self,
        identity: &Identity,
        id: Uuid,
        prescription: Prescription,
    ) -> Result<TransitionOutcome, LifecycleError> {
        self.apply(identity, id, LifecycleCommand::SavePrescription { prescription })
            .await
    }

    // ==========================================================================
    // PATIENT & SYSTEM SIGNALS
    // ==========================================================================

    /// Payment adapter entry point; repeated confirmations are no-ops.
    pub async fn confirm_payment(&self, id: Uuid) -> Result<TransitionOutcome, LifecycleError> {
        self.apply(&Identity::system(), id, LifecycleCommand::ConfirmPayment)
            .await
    }

    /// Patient enters the completion code; on success the visit is finalized.
    #[instrument(skip(self, identity, code))]
    pub async fn verify_completion(
        &self,
        identity: &Identity,
        id: Uuid,
        code: &str,
    ) -> Result<CompletionOutcome, LifecycleError> {
        let command = LifecycleCommand::VerifyCompletion {
            code: code.to_string(),
        };
        match self.apply(identity, id, command).await {
            Ok(outcome) => match self.finalize(id).await? {
                // The completion watcher may have committed first.
                CompletionOutcome::AlreadyCompleted if outcome.changed => {
                    match self.store.record_for_request(id).await? {
                        Some(record) => Ok(CompletionOutcome::Completed { record }),
                        None => Ok(CompletionOutcome::AlreadyCompleted),
                    }
                }
                other => Ok(other),
            },
            Err(LifecycleError::NotFound(_)) => match self.store.record_for_request(id).await? {
                Some(record) if record.patient_id == identity.user_id => {
                    debug!("Request {} already completed as record {}", id, record.id);
                    Ok(CompletionOutcome::AlreadyCompleted)
                }
                Some(_) => Err(LifecycleError::Forbidden(
                    "not permitted to verify this request".to_string(),
                )),
                None => Err(LifecycleError::NotFound(id)),
            },
            Err(e) => Err(e),
        }
    }

    /// Marks a paid, not yet started request for refund and hands it to the
    /// refund workflow. The request keeps its stage until the refund
    /// completes, but can no longer be started.
    #[instrument(skip(self, identity, reason))]
    pub async fn request_cancellation(
        &self,
        identity: &Identity,
        id: Uuid,
        reason: &str,
    ) -> Result<RefundTicket, LifecycleError> {
        let command = LifecycleCommand::RequestCancellation {
            reason: reason.to_string(),
        };
        let outcome = self.apply(identity, id, command).await?;
        if !outcome.changed {
            debug!("Request {} is already awaiting a refund", id);
        }

        // begin_refund returns the open ticket when the hand-off is repeated.
        Ok(self.refunds.begin_refund(&outcome.request, reason).await?)
    }

    /// Refund provider callback: the request becomes `Cancelled`.
    #[instrument(skip(self))]
    pub async fn complete_refund(&self, id: Uuid) -> Result<TransitionOutcome, LifecycleError> {
        let outcome = self
            .apply(&Identity::system(), id, LifecycleCommand::CompleteRefund)
            .await?;
        if let Some(ticket) = self.refunds.settle(id).await? {
            info!("Refund ticket {} settled for request {}", ticket.id, id);
        }
        Ok(outcome)
    }

    /// Re-issues completion codes left unverified past the timeout. Returns the
    /// number of requests that received a fresh code.
    #[instrument(skip(self))]
    pub async fn reissue_stale_codes(&self, now: DateTime<Utc>) -> Result<usize, LifecycleError> {
        let candidates = self
            .store
            .list(&RequestQuery::default().with_status(RequestStatus::InProgress))
            .await?;

        let mut reissued = 0;
        for request in candidates
            .iter()
            .filter(|r| self.rules.is_verification_stale(r, now))
        {
            match self
                .apply(&Identity::system(), request.id, LifecycleCommand::ReissueCompletionCode)
                .await
            {
                Ok(outcome) if outcome.changed => reissued += 1,
                Ok(_) => {}
                Err(LifecycleError::NotFound(_)) => {}
                Err(e) => warn!("Could not reissue code for request {}: {}", request.id, e),
            }
        }

        if reissued > 0 {
            info!("Reissued {} stale completion codes", reissued);
        }
        Ok(reissued)
    }

    // ==========================================================================
    // COMPLETION
    // ==========================================================================

    /// Promotes a verified request into a visit record and deletes it, as one
    /// atomic batch.
    #[instrument(skip(self))]
    pub async fn finalize(&self, id: Uuid) -> Result<CompletionOutcome, LifecycleError> {
        let max_aborts = self.settings.completion_max_attempts.max(1);
        let max_conflicts = self.settings.max_write_attempts.max(1);
        let mut aborts = 0u32;
        let mut conflicts = 0u32;

        loop {
            let request = match self.store.get(id).await {
                Ok(request) => request,
                Err(StoreError::NotFound(_)) => return Ok(CompletionOutcome::AlreadyCompleted),
                Err(e) => return Err(e.into()),
            };
            let prescription = match request.prescription() {
                Some(prescription) if request.is_patient_verified() => prescription.clone(),
                _ => return Ok(CompletionOutcome::Pending),
            };

            let ops = vec![
                AtomicOp::CreateRecord(VisitRecord::from_completed(&request, prescription)),
                AtomicOp::DeleteRequest {
                    id,
                    expected_version: request.version,
                },
            ];

            // Once issued, the batch must not be dropped with the caller.
            let store = Arc::clone(&self.store);
            let result = tokio::spawn(async move { store.run_atomic(ops).await })
                .await
                .map_err(|e| StoreError::Backend(format!("completion task failed: {}", e)))?;

            match result {
                Ok(committed) => {
                    let record = committed.records.into_iter().next().ok_or_else(|| {
                        StoreError::Backend("completion committed without a record".to_string())
                    })?;
                    self.events
                        .publish(LifecycleEvent::completed(&request, &record));
                    info!("Request {} completed as record {}", id, record.id);
                    return Ok(CompletionOutcome::Completed { record });
                }
                Err(StoreError::NotFound(_)) | Err(StoreError::DuplicateRecord(_)) => {
                    debug!("Request {} was completed concurrently", id);
                    return Ok(CompletionOutcome::AlreadyCompleted);
                }
                Err(StoreError::Conflict { expected, actual }) => {
                    conflicts += 1;
                    debug!(
                        "Completion of {} saw version {} instead of {}, re-reading",
                        id, actual, expected
                    );
                    if conflicts >= max_conflicts {
                        return Err(LifecycleError::Conflict(id));
                    }
                }
                Err(StoreError::Aborted(reason)) => {
                    aborts += 1;
                    if aborts >= max_aborts {
                        error!(
                            "Completion of {} aborted {} times, giving up: {}",
                            id, aborts, reason
                        );
                        return Err(LifecycleError::TransactionAborted {
                            request_id: id,
                            attempts: aborts,
                        });
                    }
                    let backoff = self.completion_backoff(aborts);
                    warn!(
                        "Completion of {} aborted ({}), retrying in {:?}",
                        id, reason, backoff
                    );
                    sleep(backoff).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    // ==========================================================================
    // RECORDS
    // ==========================================================================

    pub async fn records_for_doctor(&self, identity: &Identity) -> Result<Vec<VisitRecord>, LifecycleError> {
        if identity.role != Role::Doctor {
            return Err(LifecycleError::Forbidden(
                "only doctors have a visit history".to_string(),
            ));
        }
        Ok(self.store.records_for_doctor(identity.user_id).await?)
    }

    pub async fn get_record(&self, identity: &Identity, id: Uuid) -> Result<VisitRecord, LifecycleError> {
        let record = match self.store.get_record(id).await {
            Ok(record) => record,
            Err(StoreError::NotFound(_)) => return Err(LifecycleError::RecordNotFound(id)),
            Err(e) => return Err(e.into()),
        };
        if !identity.is_system()
            && record.doctor_id != identity.user_id
            && record.patient_id != identity.user_id
        {
            return Err(LifecycleError::Forbidden(
                "not permitted to view this record".to_string(),
            ));
        }
        Ok(record)
    }

    #[instrument(skip(self, identity, comment))]
    pub async fn submit_review(
        &self,
        identity: &Identity,
        record_id: Uuid,
        rating: u8,
        comment: String,
    ) -> Result<VisitRecord, LifecycleError> {
        if !(1..=5).contains(&rating) {
            return Err(LifecycleError::ValidationError(
                "rating must be between 1 and 5".to_string(),
            ));
        }
        let record = self.get_record(identity, record_id).await?;
        if identity.role != Role::Patient || record.patient_id != identity.user_id {
            return Err(LifecycleError::Forbidden(
                "only the patient can review this visit".to_string(),
            ));
        }

        let review = Review {
            rating,
            comment,
            created_at: Utc::now(),
        };
        Ok(self.store.attach_review(record_id, review).await?)
    }

    // ==========================================================================
    // INTERNALS
    // ==========================================================================

    #[instrument(skip(self, identity, command), fields(command = command.name()))]
    async fn apply(
        &self,
        identity: &Identity,
        id: Uuid,
        command: LifecycleCommand,
    ) -> Result<TransitionOutcome, LifecycleError> {
        let attempts = self.settings.max_write_attempts.max(1);

        for attempt in 1..=attempts {
            let request = self.load(id).await?;
            self.rules.authorize(&request, identity, &command)?;

            let (patch, kind) = match self.rules.plan(&request, &command, Utc::now())? {
                Transition::Apply { patch, event } => (patch, event),
                Transition::Unchanged | Transition::HandOff { .. } => {
                    debug!("{} on request {} is a no-op", command.name(), id);
                    return Ok(TransitionOutcome {
                        request,
                        changed: false,
                    });
                }
            };

            match self.store.update(id, patch, Some(request.version)).await {
                Ok(updated) => {
                    self.events
                        .publish(LifecycleEvent::from_request(kind, &updated));
                    info!(
                        "Request {} moved to {} by {}",
                        id,
                        updated.stage.name(),
                        command.name()
                    );
                    return Ok(TransitionOutcome {
                        request: updated,
                        changed: true,
                    });
                }
                Err(StoreError::Conflict { expected, actual }) => {
                    debug!(
                        "Write conflict on {} (attempt {}/{}): expected {}, found {}",
                        id, attempt, attempts, expected, actual
                    );
                }
                Err(StoreError::NotFound(_)) => return Err(LifecycleError::NotFound(id)),
                Err(e) => return Err(e.into()),
            }
        }

        warn!("Giving up on {} for request {} after {} conflicts", command.name(), id, attempts);
        Err(LifecycleError::Conflict(id))
    }

    async fn load(&self, id: Uuid) -> Result<ServiceRequest, LifecycleError> {
        match self.store.get(id).await {
            Ok(request) => Ok(request),
            Err(StoreError::NotFound(_)) => Err(LifecycleError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    fn ensure_party(identity: &Identity, request: &ServiceRequest) -> Result<(), LifecycleError> {
        if identity.is_system() || request.involves(identity.user_id) {
            Ok(())
        } else {
            Err(LifecycleError::Forbidden(
                "not a party to this request".to_string(),
            ))
        }
    }

    fn completion_backoff(&self, aborts: u32) -> Duration {
        let factor = 1u64 << aborts.saturating_sub(1).min(10);
        Duration::from_millis(self.settings.completion_backoff_ms.saturating_mul(factor))
    }
}
