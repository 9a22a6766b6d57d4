use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ==============================================================================
// REQUEST STATUS & STAGE
// ==============================================================================

/// Status as stored on the wire. `Completed` is never stored: a completed
/// request is deleted and survives only as a `VisitRecord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestStatus {
    #[serde(rename = "New")]
    New,
    #[serde(rename = "Partially Accepted")]
    PartiallyAccepted,
    #[serde(rename = "Rejected")]
    Rejected,
    #[serde(rename = "In Progress")]
    InProgress,
    #[serde(rename = "Cancelled")]
    Cancelled,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Rejected | RequestStatus::Cancelled)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestStatus::New => write!(f, "New"),
            RequestStatus::PartiallyAccepted => write!(f, "Partially Accepted"),
            RequestStatus::Rejected => write!(f, "Rejected"),
            RequestStatus::InProgress => write!(f, "In Progress"),
            RequestStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Where a request sits in the visit handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceStage {
    New,
    Rejected,
    /// Doctor accepted; the patient app shows `start_code` for the doctor to enter on arrival.
    Accepted { start_code: String },
    InProgress { started_at: DateTime<Utc> },
    /// Prescription saved, waiting for the patient to confirm with `completion_code`.
    AwaitingVerification {
        prescription: Prescription,
        completion_code: String,
        issued_at: DateTime<Utc>,
        patient_verified: bool,
    },
    Cancelled,
}

impl ServiceStage {
    pub fn status(&self) -> RequestStatus {
        match self {
            ServiceStage::New => RequestStatus::New,
            ServiceStage::Rejected => RequestStatus::Rejected,
            ServiceStage::Accepted { .. } => RequestStatus::PartiallyAccepted,
            ServiceStage::InProgress { .. } | ServiceStage::AwaitingVerification { .. } => {
                RequestStatus::InProgress
            }
            ServiceStage::Cancelled => RequestStatus::Cancelled,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServiceStage::New => "new",
            ServiceStage::Rejected => "rejected",
            ServiceStage::Accepted { .. } => "accepted",
            ServiceStage::InProgress { .. } => "in_progress",
            ServiceStage::AwaitingVerification { .. } => "awaiting_verification",
            ServiceStage::Cancelled => "cancelled",
        }
    }

    pub fn outstanding_code(&self) -> Option<&str> {
        match self {
            ServiceStage::Accepted { start_code } => Some(start_code),
            ServiceStage::AwaitingVerification { completion_code, .. } => Some(completion_code),
            _ => None,
        }
    }
}

// ==============================================================================
// PAYMENT
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Completed,
    /// Paid, and a cancellation has been handed to the refund workflow.
    RefundPending,
}

impl PaymentStatus {
    fn from_legacy(advance_paid: bool, is_payment_received: bool, status: Option<&str>) -> Self {
        if status.is_some_and(|s| s.trim().eq_ignore_ascii_case("refund pending")) {
            return PaymentStatus::RefundPending;
        }
        let status_paid = status
            .map(|s| s.trim().eq_ignore_ascii_case("completed"))
            .unwrap_or(false);
        if advance_paid || is_payment_received || status_paid {
            PaymentStatus::Completed
        } else {
            PaymentStatus::Pending
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaymentStatus::Pending => write!(f, "Pending"),
            PaymentStatus::Completed => write!(f, "Completed"),
            PaymentStatus::RefundPending => write!(f, "Refund Pending"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdvancePayment {
    pub amount: i64,
    pub status: PaymentStatus,
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl AdvancePayment {
    pub fn pending(amount: i64) -> Self {
        Self {
            amount,
            status: PaymentStatus::Pending,
            confirmed_at: None,
        }
    }

    pub fn confirmed(&self, at: DateTime<Utc>) -> Self {
        Self {
            amount: self.amount,
            status: PaymentStatus::Completed,
            confirmed_at: Some(at),
        }
    }

    pub fn refund_requested(&self) -> Self {
        Self {
            status: PaymentStatus::RefundPending,
            ..self.clone()
        }
    }

    /// The advance was received, whether or not it is being refunded.
    pub fn is_paid(&self) -> bool {
        matches!(self.status, PaymentStatus::Completed | PaymentStatus::RefundPending)
    }

    pub fn is_refund_pending(&self) -> bool {
        self.status == PaymentStatus::RefundPending
    }
}

// ==============================================================================
// PRESCRIPTION
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DoseTiming {
    Before,
    After,
    No,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dosage {
    pub breakfast: DoseTiming,
    pub lunch: DoseTiming,
    pub dinner: DoseTiming,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Medicine {
    pub name: String,
    pub dosage: Dosage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prescription {
    pub patient_name: String,
    pub age: String,
    pub gender: String,
    pub patient_type: String,
    pub diagnosis: String,
    pub medicines: Vec<Medicine>,
    pub instructions: String,
    pub date: String,
}

impl Prescription {
    /// Names of required fields that are blank.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        [
            ("patientName", &self.patient_name),
            ("age", &self.age),
            ("gender", &self.gender),
            ("patientType", &self.patient_type),
            ("diagnosis", &self.diagnosis),
            ("instructions", &self.instructions),
            ("date", &self.date),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
        .collect()
    }
}

// ==============================================================================
// SERVICE REQUEST
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Location {
    Coordinates { latitude: f64, longitude: f64 },
    Address(String),
}

/// One patient care request assigned to one doctor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "RequestDocument", try_from = "RequestDocument")]
pub struct ServiceRequest {
    pub id: Uuid,
    pub doctor_id: Uuid,
    pub patient_id: Uuid,
    pub patient_name: String,
    pub health_issue: String,
    pub symptoms: Vec<String>,
    pub location: Location,
    pub distance_km: Option<f64>,
    pub patient_image: Option<String>,
    pub advance_payment: AdvancePayment,
    pub doctor_reached: bool,
    pub stage: ServiceStage,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServiceRequest {
    pub fn new(patient_id: Uuid, intake: NewServiceRequest) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            doctor_id: intake.doctor_id,
            patient_id,
            patient_name: intake.patient_name,
            health_issue: intake.health_issue,
            symptoms: intake.symptoms,
            location: intake.location,
            distance_km: intake.distance,
            patient_image: intake.patient_image,
            advance_payment: AdvancePayment::pending(intake.advance_payment_amount),
            doctor_reached: false,
            stage: ServiceStage::New,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> RequestStatus {
        self.stage.status()
    }

    pub fn is_paid(&self) -> bool {
        self.advance_payment.is_paid()
    }

    pub fn is_refund_pending(&self) -> bool {
        self.advance_payment.is_refund_pending()
    }

    pub fn completion_otp(&self) -> Option<&str> {
        self.stage.outstanding_code()
    }

    pub fn is_patient_verified(&self) -> bool {
        matches!(
            self.stage,
            ServiceStage::AwaitingVerification { patient_verified: true, .. }
        )
    }

    pub fn prescription(&self) -> Option<&Prescription> {
        match &self.stage {
            ServiceStage::AwaitingVerification { prescription, .. } => Some(prescription),
            _ => None,
        }
    }

    pub fn involves(&self, user_id: Uuid) -> bool {
        self.doctor_id == user_id || self.patient_id == user_id
    }
}

/// Intake payload for a new request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewServiceRequest {
    pub doctor_id: Uuid,
    #[serde(default)]
    pub patient_id: Option<Uuid>,
    pub patient_name: String,
    pub health_issue: String,
    #[serde(default)]
    pub symptoms: Vec<String>,
    pub location: Location,
    #[serde(default)]
    pub distance: Option<f64>,
    #[serde(default)]
    pub patient_image: Option<String>,
    pub advance_payment_amount: i64,
}

/// Wire shape of a request, keeping the legacy field names of the mobile apps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestDocument {
    pub id: Uuid,
    pub doctor_id: Uuid,
    pub patient_id: Uuid,
    pub status: RequestStatus,
    pub patient_name: String,
    pub health_issue: String,
    #[serde(default)]
    pub symptoms: Vec<String>,
    pub location: Location,
    #[serde(default)]
    pub distance: Option<f64>,
    #[serde(default)]
    pub patient_image: Option<String>,
    #[serde(default)]
    pub advance_payment_amount: i64,
    #[serde(default)]
    pub advance_paid: bool,
    #[serde(default)]
    pub advance_payment_status: Option<String>,
    #[serde(default)]
    pub is_payment_received: bool,
    #[serde(default)]
    pub payment_confirmed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub doctor_reached: bool,
    #[serde(default)]
    pub completion_otp: Option<String>,
    #[serde(default)]
    pub otp_issued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_patient_verified: bool,
    #[serde(default)]
    pub prescription: Option<Prescription>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ServiceRequest> for RequestDocument {
    fn from(request: ServiceRequest) -> Self {
        let status = request.status();
        let paid = request.is_paid();
        let (completion_otp, otp_issued_at, is_patient_verified, prescription, started_at) =
            match request.stage {
                ServiceStage::Accepted { start_code } => (Some(start_code), None, false, None, None),
                ServiceStage::InProgress { started_at } => (None, None, false, None, Some(started_at)),
                ServiceStage::AwaitingVerification {
                    prescription,
                    completion_code,
                    issued_at,
                    patient_verified,
                } => (
                    Some(completion_code),
                    Some(issued_at),
                    patient_verified,
                    Some(prescription),
                    None,
                ),
                ServiceStage::New | ServiceStage::Rejected | ServiceStage::Cancelled => {
                    (None, None, false, None, None)
                }
            };

        Self {
            id: request.id,
            doctor_id: request.doctor_id,
            patient_id: request.patient_id,
            status,
            patient_name: request.patient_name,
            health_issue: request.health_issue,
            symptoms: request.symptoms,
            location: request.location,
            distance: request.distance_km,
            patient_image: request.patient_image,
            advance_payment_amount: request.advance_payment.amount,
            advance_paid: paid,
            advance_payment_status: Some(request.advance_payment.status.to_string()),
            is_payment_received: paid,
            payment_confirmed_at: request.advance_payment.confirmed_at,
            doctor_reached: request.doctor_reached,
            completion_otp,
            otp_issued_at,
            is_patient_verified,
            prescription,
            started_at,
            version: request.version,
            created_at: request.created_at,
            updated_at: request.updated_at,
        }
    }
}

impl TryFrom<RequestDocument> for ServiceRequest {
    type Error = String;

    fn try_from(doc: RequestDocument) -> Result<Self, Self::Error> {
        let stage = match doc.status {
            RequestStatus::New => ServiceStage::New,
            RequestStatus::Rejected => ServiceStage::Rejected,
            RequestStatus::Cancelled => ServiceStage::Cancelled,
            RequestStatus::PartiallyAccepted => ServiceStage::Accepted {
                start_code: doc
                    .completion_otp
                    .clone()
                    .ok_or_else(|| format!("request {} is accepted but has no start code", doc.id))?,
            },
            RequestStatus::InProgress => match (doc.prescription.clone(), doc.completion_otp.clone()) {
                (Some(prescription), Some(completion_code)) => ServiceStage::AwaitingVerification {
                    prescription,
                    completion_code,
                    issued_at: doc.otp_issued_at.unwrap_or(doc.updated_at),
                    patient_verified: doc.is_patient_verified,
                },
                _ => ServiceStage::InProgress {
                    started_at: doc.started_at.unwrap_or(doc.updated_at),
                },
            },
        };

        let status = PaymentStatus::from_legacy(
            doc.advance_paid,
            doc.is_payment_received,
            doc.advance_payment_status.as_deref(),
        );

        Ok(Self {
            id: doc.id,
            doctor_id: doc.doctor_id,
            patient_id: doc.patient_id,
            patient_name: doc.patient_name,
            health_issue: doc.health_issue,
            symptoms: doc.symptoms,
            location: doc.location,
            distance_km: doc.distance,
            patient_image: doc.patient_image,
            advance_payment: AdvancePayment {
                amount: doc.advance_payment_amount,
                status,
                confirmed_at: doc.payment_confirmed_at,
            },
            doctor_reached: doc.doctor_reached,
            stage,
            version: doc.version,
            created_at: doc.created_at,
            updated_at: doc.updated_at,
        })
    }
}

// ==============================================================================
// STORE CONTRACT TYPES
// ==============================================================================

/// Partial update applied by `RequestStore::update`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestPatch {
    pub stage: Option<ServiceStage>,
    pub advance_payment: Option<AdvancePayment>,
    pub doctor_reached: Option<bool>,
}

impl RequestPatch {
    pub fn stage(stage: ServiceStage) -> Self {
        Self {
            stage: Some(stage),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.stage.is_none() && self.advance_payment.is_none() && self.doctor_reached.is_none()
    }

    pub fn apply_to(self, request: &mut ServiceRequest) {
        if let Some(stage) = self.stage {
            request.stage = stage;
        }
        if let Some(payment) = self.advance_payment {
            request.advance_payment = payment;
        }
        if let Some(reached) = self.doctor_reached {
            request.doctor_reached = reached;
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RequestQuery {
    pub doctor_id: Option<Uuid>,
    pub patient_id: Option<Uuid>,
    pub status: Option<RequestStatus>,
}

impl RequestQuery {
    pub fn for_doctor(doctor_id: Uuid) -> Self {
        Self {
            doctor_id: Some(doctor_id),
            ..Self::default()
        }
    }

    pub fn for_patient(patient_id: Uuid) -> Self {
        Self {
            patient_id: Some(patient_id),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: RequestStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, request: &ServiceRequest) -> bool {
        self.doctor_id.map_or(true, |id| request.doctor_id == id)
            && self.patient_id.map_or(true, |id| request.patient_id == id)
            && self.status.map_or(true, |status| request.status() == status)
    }
}

/// Operations accepted by `RequestStore::run_atomic`.
#[derive(Debug, Clone)]
pub enum AtomicOp {
    CreateRecord(VisitRecord),
    DeleteRequest { id: Uuid, expected_version: u64 },
}

#[derive(Debug, Clone, Default)]
pub struct Committed {
    pub records: Vec<VisitRecord>,
    pub deleted: Vec<Uuid>,
}

/// Full snapshot of one request as delivered by the change feed. A `None`
/// request is a tombstone for a deleted document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSnapshot {
    pub request_id: Uuid,
    pub doctor_id: Uuid,
    pub patient_id: Uuid,
    pub version: u64,
    pub request: Option<ServiceRequest>,
}

impl RequestSnapshot {
    pub fn of(request: &ServiceRequest) -> Self {
        Self {
            request_id: request.id,
            doctor_id: request.doctor_id,
            patient_id: request.patient_id,
            version: request.version,
            request: Some(request.clone()),
        }
    }

    pub fn tombstone(request: &ServiceRequest) -> Self {
        Self {
            request_id: request.id,
            doctor_id: request.doctor_id,
            patient_id: request.patient_id,
            version: request.version + 1,
            request: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.request.is_none()
    }

    /// Deleted or in a terminal status: nothing further will be published.
    pub fn is_final(&self) -> bool {
        self.request
            .as_ref()
            .map(|request| request.status().is_terminal())
            .unwrap_or(true)
    }

    pub fn ready_for_completion(&self) -> bool {
        self.request
            .as_ref()
            .map(ServiceRequest::is_patient_verified)
            .unwrap_or(false)
    }
}

// ==============================================================================
// VISIT RECORD
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Review {
    pub rating: u8,
    pub comment: String,
    pub created_at: DateTime<Utc>,
}

/// Permanent artifact of a completed visit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitRecord {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub doctor_id: Uuid,
    pub request_id: Uuid,
    pub health_issue: String,
    pub patient_image: Option<String>,
    pub report_prescription: Prescription,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub review: Option<Review>,
}

impl VisitRecord {
    /// `completed_at` is provisional; the store assigns the final value on commit.
    pub fn from_completed(request: &ServiceRequest, prescription: Prescription) -> Self {
        Self {
            id: Uuid::new_v4(),
            patient_id: request.patient_id,
            doctor_id: request.doctor_id,
            request_id: request.id,
            health_issue: request.health_issue.clone(),
            patient_image: request.patient_image.clone(),
            report_prescription: prescription,
            completed_at: Utc::now(),
            review: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitReviewRequest {
    pub rating: u8,
    #[serde(default)]
    pub comment: String,
}

// ==============================================================================
// LIFECYCLE EVENTS & OUTCOMES
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEventKind {
    RequestCreated,
    Accepted,
    Rejected,
    PaymentConfirmed,
    DoctorArrived,
    ServiceStarted,
    PrescriptionSaved,
    CompletionCodeReissued,
    PatientVerified,
    Completed,
    CancellationRequested,
    Cancelled,
}

/// Published on the event bus after a transition commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    pub kind: LifecycleEventKind,
    pub request_id: Uuid,
    pub doctor_id: Uuid,
    pub patient_id: Uuid,
    pub patient_name: String,
    pub health_issue: String,
    pub amount: i64,
    pub record_id: Option<Uuid>,
    pub occurred_at: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn from_request(kind: LifecycleEventKind, request: &ServiceRequest) -> Self {
        Self {
            kind,
            request_id: request.id,
            doctor_id: request.doctor_id,
            patient_id: request.patient_id,
            patient_name: request.patient_name.clone(),
            health_issue: request.health_issue.clone(),
            amount: request.advance_payment.amount,
            record_id: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn completed(request: &ServiceRequest, record: &VisitRecord) -> Self {
        Self {
            record_id: Some(record.id),
            ..Self::from_request(LifecycleEventKind::Completed, request)
        }
    }
}

/// Result of a single-document transition, rendered by the apps.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionOutcome {
    pub request: ServiceRequest,
    /// False when the command was a duplicate of an already-applied transition.
    pub changed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CompletionOutcome {
    Completed { record: VisitRecord },
    /// The request was already promoted into a record.
    AlreadyCompleted,
    /// The request exists but is not yet verified by the patient.
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundTicket {
    pub id: Uuid,
    pub request_id: Uuid,
    pub amount: i64,
    pub reason: String,
    pub requested_at: DateTime<Utc>,
}

// ==============================================================================
// HTTP BODIES
// ==============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct CodeEntry {
    pub code: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CancellationRequest {
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestListQuery {
    pub status: Option<RequestStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_prescription() -> Prescription {
        Prescription {
            patient_name: "Asha".to_string(),
            age: "34".to_string(),
            gender: "female".to_string(),
            patient_type: "outpatient".to_string(),
            diagnosis: "Viral fever".to_string(),
            medicines: vec![Medicine {
                name: "Paracetamol".to_string(),
                dosage: Dosage {
                    breakfast: DoseTiming::After,
                    lunch: DoseTiming::No,
                    dinner: DoseTiming::After,
                },
            }],
            instructions: "Rest and fluids".to_string(),
            date: "2024-05-01".to_string(),
        }
    }

    fn sample_request() -> ServiceRequest {
        ServiceRequest::new(
            Uuid::new_v4(),
            NewServiceRequest {
                doctor_id: Uuid::new_v4(),
                patient_id: None,
                patient_name: "Asha".to_string(),
                health_issue: "Fever".to_string(),
                symptoms: vec!["chills".to_string()],
                location: Location::Coordinates { latitude: 12.97, longitude: 77.59 },
                distance: Some(3.2),
                patient_image: None,
                advance_payment_amount: 500,
            },
        )
    }

    #[test]
    fn legacy_payment_fields_are_derived_from_canonical_status() {
        let mut request = sample_request();
        request.advance_payment = request.advance_payment.confirmed(Utc::now());

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["advancePaid"], json!(true));
        assert_eq!(value["isPaymentReceived"], json!(true));
        assert_eq!(value["advancePaymentStatus"], json!("Completed"));
    }

    #[test]
    fn any_legacy_paid_field_reads_as_paid() {
        let mut value = serde_json::to_value(sample_request()).unwrap();
        value["advancePaid"] = json!(false);
        value["isPaymentReceived"] = json!(false);
        value["advancePaymentStatus"] = json!("completed");

        let request: ServiceRequest = serde_json::from_value(value).unwrap();
        assert!(request.is_paid());
    }

    #[test]
    fn awaiting_verification_projects_onto_legacy_fields() {
        let mut request = sample_request();
        request.stage = ServiceStage::AwaitingVerification {
            prescription: sample_prescription(),
            completion_code: "123456".to_string(),
            issued_at: Utc::now(),
            patient_verified: false,
        };

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["status"], json!("In Progress"));
        assert_eq!(value["completionOtp"], json!("123456"));
        assert_eq!(value["isPatientVerified"], json!(false));

        let back: ServiceRequest = serde_json::from_value(value).unwrap();
        assert_eq!(back.stage, request.stage);
    }

    #[test]
    fn accepted_document_without_start_code_is_rejected() {
        let mut value = serde_json::to_value(sample_request()).unwrap();
        value["status"] = json!("Partially Accepted");
        assert!(serde_json::from_value::<ServiceRequest>(value).is_err());
    }

    #[test]
    fn free_text_location_is_accepted() {
        let mut value = serde_json::to_value(sample_request()).unwrap();
        value["location"] = json!("12 Lake Road");
        let request: ServiceRequest = serde_json::from_value(value).unwrap();
        assert_eq!(request.location, Location::Address("12 Lake Road".to_string()));
    }

    #[test]
    fn prescription_reports_blank_fields() {
        let mut prescription = sample_prescription();
        prescription.diagnosis = "  ".to_string();
        prescription.date.clear();
        assert_eq!(prescription.missing_fields(), vec!["diagnosis", "date"]);
    }
}
