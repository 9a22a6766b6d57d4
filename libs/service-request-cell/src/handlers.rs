use std::convert::Infallible;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
    Extension,
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use shared_models::{
    auth::{Identity, Role},
    error::AppError,
};
use shared_utils::signature::verify_payload;

use crate::router::LifecycleState;
use crate::services::payment::PAYMENT_SIGNATURE_HEADER;
use crate::{
    CancellationRequest, CodeEntry, CompletionOutcome, NewServiceRequest, Prescription,
    RequestListQuery, RequestSnapshot, ServiceRequest, SubmitReviewRequest, TransitionOutcome,
};

pub const REFUND_SIGNATURE_HEADER: &str = "X-Refund-Signature";

/// Request document as the caller may see it. Doctors never see the
/// outstanding code; they have to get it from the patient.
fn request_view(identity: &Identity, request: &ServiceRequest) -> Result<Value, AppError> {
    let mut value = serde_json::to_value(request)
        .map_err(|e| AppError::Internal(format!("Failed to serialize request: {}", e)))?;
    if identity.role == Role::Doctor {
        if let Some(doc) = value.as_object_mut() {
            doc.remove("completionOtp");
        }
    }
    Ok(value)
}

fn snapshot_view(identity: &Identity, snapshot: &RequestSnapshot) -> Result<Value, AppError> {
    let request = match &snapshot.request {
        Some(request) => request_view(identity, request)?,
        None => Value::Null,
    };
    Ok(json!({
        "requestId": snapshot.request_id,
        "version": snapshot.version,
        "deleted": snapshot.is_deleted(),
        "request": request,
    }))
}

fn transition_response(
    state: &LifecycleState,
    identity: &Identity,
    outcome: TransitionOutcome,
) -> Result<Json<Value>, AppError> {
    Ok(Json(json!({
        "success": true,
        "changed": outcome.changed,
        "status": outcome.request.status(),
        "validCommands": state.engine.rules().valid_commands(&outcome.request),
        "request": request_view(identity, &outcome.request)?,
    })))
}

// ==============================================================================
// REQUESTS
// ==============================================================================

pub async fn create_request(
    State(state): State<LifecycleState>,
    Extension(identity): Extension<Identity>,
    Json(intake): Json<NewServiceRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    info!("Service request intake from {} for doctor {}", identity.user_id, intake.doctor_id);

    let request = state.engine.create_request(&identity, intake).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "request": request_view(&identity, &request)?,
        })),
    ))
}

pub async fn list_requests(
    State(state): State<LifecycleState>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<RequestListQuery>,
) -> Result<Json<Value>, AppError> {
    let requests = state.engine.list_requests(&identity, query.status).await?;
    let views = requests
        .iter()
        .map(|request| request_view(&identity, request))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Json(json!({
        "requests": views,
        "total": views.len(),
    })))
}

pub async fn get_request(
    State(state): State<LifecycleState>,
    Extension(identity): Extension<Identity>,
    Path(request_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let request = state.engine.get_request(&identity, request_id).await?;
    Ok(Json(json!({
        "request": request_view(&identity, &request)?,
        "validCommands": state.engine.rules().valid_commands(&request),
    })))
}

/// Server-sent stream of request snapshots; the first event is the current
/// state and the stream closes after the request is deleted or terminal.
pub async fn request_events(
    State(state): State<LifecycleState>,
    Extension(identity): Extension<Identity>,
    Path(request_id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let snapshots = state.engine.watch_request(&identity, request_id).await?;
    info!("Streaming request {} to {}", request_id, identity.user_id);

    let stream = snapshots.map(move |snapshot| {
        let event = match snapshot_view(&identity, &snapshot) {
            Ok(view) => Event::default()
                .event("snapshot")
                .id(snapshot.version.to_string())
                .data(view.to_string()),
            Err(e) => Event::default().event("error").data(e.to_string()),
        };
        Ok(event)
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

pub async fn accept_request(
    State(state): State<LifecycleState>,
    Extension(identity): Extension<Identity>,
    Path(request_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let outcome = state.engine.accept(&identity, request_id).await?;
    transition_response(&state, &identity, outcome)
}

pub async fn reject_request(
    State(state): State<LifecycleState>,
    Extension(identity): Extension<Identity>,
    Path(request_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let outcome = state.engine.reject(&identity, request_id).await?;
    transition_response(&state, &identity, outcome)
}

pub async fn mark_arrived(
    State(state): State<LifecycleState>,
    Extension(identity): Extension<Identity>,
    Path(request_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let outcome = state.engine.mark_arrived(&identity, request_id).await?;
    transition_response(&state, &identity, outcome)
}

pub async fn start_service(
    State(state): State<LifecycleState>,
    Extension(identity): Extension<Identity>,
    Path(request_id): Path<Uuid>,
    Json(entry): Json<CodeEntry>,
) -> Result<Json<Value>, AppError> {
    let outcome = state
        .engine
        .start_service(&identity, request_id, &entry.code)
        .await?;
    transition_response(&state, &identity, outcome)
}

pub async fn save_prescription(
    State(state): State<LifecycleState>,
    Extension(identity): Extension<Identity>,
    Path(request_id): Path<Uuid>,
    Json(prescription): Json<Prescription>,
) -> Result<Json<Value>, AppError> {
    let outcome = state
        .engine
        .save_prescription(&identity, request_id, prescription)
        .await?;
    transition_response(&state, &identity, outcome)
}

pub async fn verify_completion(
    State(state): State<LifecycleState>,
    Extension(identity): Extension<Identity>,
    Path(request_id): Path<Uuid>,
    Json(entry): Json<CodeEntry>,
) -> Result<Json<Value>, AppError> {
    let outcome = state
        .engine
        .verify_completion(&identity, request_id, &entry.code)
        .await?;

    let record_id = match &outcome {
        CompletionOutcome::Completed { record } => Some(record.id),
        _ => None,
    };
    Ok(Json(json!({
        "success": true,
        "recordId": record_id,
        "result": outcome,
    })))
}

pub async fn cancel_request(
    State(state): State<LifecycleState>,
    Extension(identity): Extension<Identity>,
    Path(request_id): Path<Uuid>,
    Json(body): Json<CancellationRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let ticket = state
        .engine
        .request_cancellation(&identity, request_id, &body.reason)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "success": true,
            "message": "Refund requested; the request is cancelled once the refund completes",
            "refund": ticket,
        })),
    ))
}

// ==============================================================================
// RECORDS
// ==============================================================================

pub async fn list_records(
    State(state): State<LifecycleState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<Value>, AppError> {
    let records = state.engine.records_for_doctor(&identity).await?;
    Ok(Json(json!({
        "total": records.len(),
        "records": records,
    })))
}

pub async fn get_record(
    State(state): State<LifecycleState>,
    Extension(identity): Extension<Identity>,
    Path(record_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let record = state.engine.get_record(&identity, record_id).await?;
    Ok(Json(json!({ "record": record })))
}

pub async fn submit_review(
    State(state): State<LifecycleState>,
    Extension(identity): Extension<Identity>,
    Path(record_id): Path<Uuid>,
    Json(review): Json<SubmitReviewRequest>,
) -> Result<Json<Value>, AppError> {
    let record = state
        .engine
        .submit_review(&identity, record_id, review.rating, review.comment)
        .await?;
    Ok(Json(json!({
        "success": true,
        "record": record,
    })))
}

// ==============================================================================
// PAYMENT & REFUND PROVIDERS
// ==============================================================================

pub async fn payment_webhook(
    State(state): State<LifecycleState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let signature = headers
        .get(PAYMENT_SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    let outcome = state.payments.handle_webhook(&body, signature).await?;
    Ok(Json(json!({
        "received": true,
        "applied": outcome.as_ref().map(|o| o.changed).unwrap_or(false),
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulateQuery {
    #[serde(default)]
    pub delay_ms: u64,
}

pub async fn simulate_payment(
    State(state): State<LifecycleState>,
    Extension(identity): Extension<Identity>,
    Path(request_id): Path<Uuid>,
    Query(query): Query<SimulateQuery>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    // Party check before scheduling anything.
    state.engine.get_request(&identity, request_id).await?;
    state
        .payments
        .simulate(request_id, Duration::from_millis(query.delay_ms))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "success": true,
            "message": format!("Payment will be confirmed in {} ms", query.delay_ms),
        })),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundCompletedPayload {
    pub request_id: Uuid,
    #[serde(default)]
    pub refund_reference: Option<String>,
}

pub async fn refund_completed(
    State(state): State<LifecycleState>,
    Path(request_id): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let signature = headers
        .get(REFUND_SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError::Auth("Missing refund signature".to_string()))?;

    verify_payload(&state.config.refund_webhook_secret, &body, signature).map_err(|e| {
        warn!("Rejected refund callback for {}: {}", request_id, e);
        AppError::Auth(format!("Invalid refund signature: {}", e))
    })?;

    let payload: RefundCompletedPayload = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("Malformed refund payload: {}", e)))?;
    if payload.request_id != request_id {
        return Err(AppError::BadRequest(
            "Refund payload does not match the request".to_string(),
        ));
    }

    let outcome = state.engine.complete_refund(request_id).await?;
    info!(
        "Refund {} completed for request {}",
        payload.refund_reference.as_deref().unwrap_or("-"),
        request_id
    );

    Ok(Json(json!({
        "success": true,
        "changed": outcome.changed,
        "status": outcome.request.status(),
    })))
}
