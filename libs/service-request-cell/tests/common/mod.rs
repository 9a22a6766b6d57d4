#![allow(dead_code)]

use std::sync::Arc;

use uuid::Uuid;

use service_request_cell::{
    Dosage, DoseTiming, EventBus, InMemoryRefundDesk, InMemoryRequestStore, LifecycleEngine,
    Location, Medicine, NewServiceRequest, Prescription, RequestFeeds, RequestStore,
    ScriptedCodeGenerator, ServiceRequest,
};
use shared_config::LifecycleSettings;
use shared_models::auth::Identity;
use shared_utils::test_utils::TestConfig;

// ==============================================================================
// TEST FIXTURES AND UTILITIES
// ==============================================================================

pub struct TestSetup {
    pub store: Arc<InMemoryRequestStore>,
    pub codes: Arc<ScriptedCodeGenerator>,
    pub events: EventBus,
    pub refunds: Arc<InMemoryRefundDesk>,
    pub engine: Arc<LifecycleEngine>,
    pub doctor: Identity,
    pub patient: Identity,
}

impl TestSetup {
    pub fn new() -> Self {
        Self::with_settings(TestConfig::default().lifecycle)
    }

    pub fn with_settings(settings: LifecycleSettings) -> Self {
        let store = Arc::new(InMemoryRequestStore::new(RequestFeeds::new(
            settings.feed_channel_capacity,
        )));
        let codes = Arc::new(ScriptedCodeGenerator::default());
        let events = EventBus::new(settings.event_bus_capacity);
        let refunds = Arc::new(InMemoryRefundDesk::new());

        let engine = Arc::new(LifecycleEngine::new(
            store.clone() as Arc<dyn RequestStore>,
            settings,
            codes.clone(),
            events.clone(),
            refunds.clone(),
        ));

        Self {
            store,
            codes,
            events,
            refunds,
            engine,
            doctor: Identity::doctor(Uuid::new_v4()),
            patient: Identity::patient(Uuid::new_v4()),
        }
    }

    pub fn intake(&self) -> NewServiceRequest {
        NewServiceRequest {
            doctor_id: self.doctor.user_id,
            patient_id: None,
            patient_name: "Meera Nair".to_string(),
            health_issue: "High fever".to_string(),
            symptoms: vec!["fever".to_string(), "headache".to_string()],
            location: Location::Coordinates {
                latitude: 9.93,
                longitude: 76.26,
            },
            distance: Some(4.5),
            patient_image: Some("https://cdn.example.com/p/meera.jpg".to_string()),
            advance_payment_amount: 500,
        }
    }

    pub async fn new_request(&self) -> ServiceRequest {
        self.engine
            .create_request(&self.patient, self.intake())
            .await
            .expect("intake succeeds")
    }

    /// Accepted with the given start code and payment confirmed.
    pub async fn paid_request(&self, start_code: &str) -> ServiceRequest {
        let request = self.new_request().await;
        self.codes.push(start_code);
        self.engine.accept(&self.doctor, request.id).await.expect("accept");
        self.engine
            .confirm_payment(request.id)
            .await
            .expect("payment")
            .request
    }

    pub async fn started_request(&self) -> ServiceRequest {
        let request = self.paid_request("54321").await;
        self.engine
            .start_service(&self.doctor, request.id, "54321")
            .await
            .expect("start")
            .request
    }

    /// Prescription saved; returns the request and its completion code.
    pub async fn awaiting_verification(&self, completion_code: &str) -> ServiceRequest {
        let request = self.started_request().await;
        self.codes.push(completion_code);
        self.engine
            .save_prescription(&self.doctor, request.id, prescription())
            .await
            .expect("prescription")
            .request
    }
}

pub fn prescription() -> Prescription {
    Prescription {
        patient_name: "Meera Nair".to_string(),
        age: "29".to_string(),
        gender: "female".to_string(),
        patient_type: "home visit".to_string(),
        diagnosis: "Viral fever".to_string(),
        medicines: vec![Medicine {
            name: "Paracetamol".to_string(),
            dosage: Dosage {
                breakfast: DoseTiming::After,
                lunch: DoseTiming::No,
                dinner: DoseTiming::After,
            },
        }],
        instructions: "Plenty of fluids".to_string(),
        date: "2024-07-14".to_string(),
    }
}
