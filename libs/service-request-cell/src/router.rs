use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};

use shared_config::AppConfig;
use shared_utils::extractor::auth_middleware;

use crate::handlers::{
    accept_request, cancel_request, create_request, get_record, get_request, list_records,
    list_requests, mark_arrived, payment_webhook, refund_completed, reject_request,
    request_events, save_prescription, simulate_payment, start_service, submit_review,
    verify_completion,
};
use crate::services::{engine::LifecycleEngine, payment::PaymentConfirmationAdapter};

#[derive(Clone)]
pub struct LifecycleState {
    pub config: Arc<AppConfig>,
    pub engine: Arc<LifecycleEngine>,
    pub payments: PaymentConfirmationAdapter,
}

impl LifecycleState {
    pub fn new(config: Arc<AppConfig>, engine: Arc<LifecycleEngine>) -> Self {
        let payments = PaymentConfirmationAdapter::new(
            Arc::clone(&engine),
            config.payment_webhook_secret.clone(),
            config.payment_simulation_enabled,
        );
        Self {
            config,
            engine,
            payments,
        }
    }
}

pub fn service_request_routes(state: LifecycleState) -> Router {
    let protected_routes = Router::new()
        .route("/requests", post(create_request).get(list_requests))
        .route("/requests/{request_id}", get(get_request))
        .route("/requests/{request_id}/events", get(request_events))
        .route("/requests/{request_id}/accept", post(accept_request))
        .route("/requests/{request_id}/reject", post(reject_request))
        .route("/requests/{request_id}/arrive", post(mark_arrived))
        .route("/requests/{request_id}/start", post(start_service))
        .route("/requests/{request_id}/prescription", put(save_prescription))
        .route("/requests/{request_id}/verify", post(verify_completion))
        .route("/requests/{request_id}/cancel", post(cancel_request))
        .route("/records", get(list_records))
        .route("/records/{record_id}", get(get_record))
        .route("/records/{record_id}/review", post(submit_review))
        .route("/payments/{request_id}/simulate", post(simulate_payment))
        .layer(middleware::from_fn_with_state(
            state.config.clone(),
            auth_middleware,
        ));

    // Provider callbacks authenticate by signature.
    let provider_routes = Router::new()
        .route("/payments/webhook", post(payment_webhook))
        .route("/refunds/{request_id}/completed", post(refund_completed));

    Router::new()
        .merge(protected_routes)
        .merge(provider_routes)
        .with_state(state)
}
