use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use shared_config::LifecycleSettings;
use shared_models::auth::{Identity, Role};

use crate::services::codes::{is_numeric_code, CodeGenerator};
use crate::{
    LifecycleError, LifecycleEventKind, Prescription, RequestPatch, ServiceRequest, ServiceStage,
};

/// A single actor intent against one request.
#[derive(Debug, Clone)]
pub enum LifecycleCommand {
    Accept,
    Reject,
    ConfirmPayment,
    MarkArrived,
    StartService { code: String },
    SavePrescription { prescription: Prescription },
    VerifyCompletion { code: String },
    RequestCancellation { reason: String },
    CompleteRefund,
    ReissueCompletionCode,
}

impl LifecycleCommand {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleCommand::Accept => "accept",
            LifecycleCommand::Reject => "reject",
            LifecycleCommand::ConfirmPayment => "confirm payment",
            LifecycleCommand::MarkArrived => "mark arrived",
            LifecycleCommand::StartService { .. } => "start service",
            LifecycleCommand::SavePrescription { .. } => "save prescription",
            LifecycleCommand::VerifyCompletion { .. } => "verify completion",
            LifecycleCommand::RequestCancellation { .. } => "cancel",
            LifecycleCommand::CompleteRefund => "complete refund",
            LifecycleCommand::ReissueCompletionCode => "reissue completion code",
        }
    }
}

/// What the engine should do with a command after the guards ran.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Apply {
        patch: RequestPatch,
        event: LifecycleEventKind,
    },
    /// Already applied; repeat deliveries are no-ops.
    Unchanged,
    /// Already marked for refund; the refund workflow owns the request.
    HandOff { reason: String },
}

/// Transition table and guards for service requests. Pure: no I/O.
pub struct RequestLifecycleService {
    settings: LifecycleSettings,
    codes: Arc<dyn CodeGenerator>,
}

impl RequestLifecycleService {
    pub fn new(settings: LifecycleSettings, codes: Arc<dyn CodeGenerator>) -> Self {
        Self { settings, codes }
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    /// Checks that `identity` may issue `command` against `request`.
    pub fn authorize(
        &self,
        request: &ServiceRequest,
        identity: &Identity,
        command: &LifecycleCommand,
    ) -> Result<(), LifecycleError> {
        let allowed = match command {
            LifecycleCommand::Accept
            | LifecycleCommand::Reject
            | LifecycleCommand::MarkArrived
            | LifecycleCommand::StartService { .. }
            | LifecycleCommand::SavePrescription { .. } => {
                identity.role == Role::Doctor && identity.user_id == request.doctor_id
            }
            LifecycleCommand::VerifyCompletion { .. } => {
                identity.role == Role::Patient && identity.user_id == request.patient_id
            }
            LifecycleCommand::RequestCancellation { .. } => {
                identity.is_system() || request.involves(identity.user_id)
            }
            LifecycleCommand::ConfirmPayment
            | LifecycleCommand::CompleteRefund
            | LifecycleCommand::ReissueCompletionCode => identity.is_system(),
        };

        if allowed {
            Ok(())
        } else {
            warn!(
                "User {} ({}) may not {} request {}",
                identity.user_id,
                identity.role,
                command.name(),
                request.id
            );
            Err(LifecycleError::Forbidden(format!(
                "not permitted to {} this request",
                command.name()
            )))
        }
    }

    /// Evaluates guards against the latest snapshot.
    pub fn plan(
        &self,
        request: &ServiceRequest,
        command: &LifecycleCommand,
        now: DateTime<Utc>,
    ) -> Result<Transition, LifecycleError> {
        debug!(
            "Planning {} for request {} in stage {}",
            command.name(),
            request.id,
            request.stage.name()
        );

        let status = request.status();
        let invalid = |reason: &str| LifecycleError::invalid(status, command.name(), reason);

        match command {
            LifecycleCommand::Accept => match &request.stage {
                ServiceStage::New => Ok(Transition::Apply {
                    patch: RequestPatch::stage(ServiceStage::Accepted {
                        start_code: self.codes.generate(self.settings.start_code_length),
                    }),
                    event: LifecycleEventKind::Accepted,
                }),
                ServiceStage::Accepted { .. } => Ok(Transition::Unchanged),
                _ => Err(invalid("only new requests can be accepted")),
            },

            LifecycleCommand::Reject => match &request.stage {
                ServiceStage::New => Ok(Transition::Apply {
                    patch: RequestPatch::stage(ServiceStage::Rejected),
                    event: LifecycleEventKind::Rejected,
                }),
                ServiceStage::Rejected => Ok(Transition::Unchanged),
                _ => Err(invalid("only new requests can be rejected")),
            },

            LifecycleCommand::ConfirmPayment => {
                if request.is_paid() {
                    return Ok(Transition::Unchanged);
                }
                match &request.stage {
                    ServiceStage::Accepted { .. } => Ok(Transition::Apply {
                        patch: RequestPatch {
                            advance_payment: Some(request.advance_payment.confirmed(now)),
                            ..RequestPatch::default()
                        },
                        event: LifecycleEventKind::PaymentConfirmed,
                    }),
                    _ => Err(invalid("payment is only taken on accepted requests")),
                }
            }

            LifecycleCommand::MarkArrived => match &request.stage {
                ServiceStage::Accepted { .. } if request.doctor_reached => Ok(Transition::Unchanged),
                ServiceStage::Accepted { .. } => Ok(Transition::Apply {
                    patch: RequestPatch {
                        doctor_reached: Some(true),
                        ..RequestPatch::default()
                    },
                    event: LifecycleEventKind::DoctorArrived,
                }),
                _ => Err(invalid("arrival is only recorded before the service starts")),
            },

            LifecycleCommand::StartService { code } => {
                let start_code = match &request.stage {
                    ServiceStage::Accepted { start_code } => start_code,
                    _ => return Err(invalid("request has not been accepted")),
                };
                if !request.is_paid() {
                    return Err(LifecycleError::PaymentNotConfirmed(request.id));
                }
                if request.is_refund_pending() {
                    return Err(invalid("a refund is pending for this request"));
                }
                let code = code.trim();
                if !is_numeric_code(code, self.settings.start_code_length) || code != start_code {
                    return Err(invalid("invalid code"));
                }
                Ok(Transition::Apply {
                    patch: RequestPatch::stage(ServiceStage::InProgress { started_at: now }),
                    event: LifecycleEventKind::ServiceStarted,
                })
            }

            LifecycleCommand::SavePrescription { prescription } => {
                match &request.stage {
                    ServiceStage::InProgress { .. } => {}
                    ServiceStage::AwaitingVerification { patient_verified: false, .. } => {}
                    ServiceStage::AwaitingVerification { .. } => {
                        return Err(invalid("patient has already verified the visit"))
                    }
                    _ => return Err(invalid("service has not started")),
                }
                Self::validate_prescription(prescription)?;
                Ok(Transition::Apply {
                    patch: RequestPatch::stage(self.awaiting_verification(prescription.clone(), now)),
                    event: LifecycleEventKind::PrescriptionSaved,
                })
            }

            LifecycleCommand::VerifyCompletion { code } => match &request.stage {
                ServiceStage::AwaitingVerification { patient_verified: true, .. } => {
                    Ok(Transition::Unchanged)
                }
                ServiceStage::AwaitingVerification {
                    prescription,
                    completion_code,
                    issued_at,
                    ..
                } => {
                    if code.trim() != completion_code {
                        return Err(invalid("invalid code"));
                    }
                    Ok(Transition::Apply {
                        patch: RequestPatch::stage(ServiceStage::AwaitingVerification {
                            prescription: prescription.clone(),
                            completion_code: completion_code.clone(),
                            issued_at: *issued_at,
                            patient_verified: true,
                        }),
                        event: LifecycleEventKind::PatientVerified,
                    })
                }
                _ => Err(invalid("no completion code has been issued")),
            },

            LifecycleCommand::RequestCancellation { reason } => match &request.stage {
                ServiceStage::Accepted { .. } if !request.is_paid() => {
                    Err(LifecycleError::PaymentNotConfirmed(request.id))
                }
                ServiceStage::Accepted { .. } if request.is_refund_pending() => {
                    Ok(Transition::HandOff {
                        reason: reason.clone(),
                    })
                }
                ServiceStage::Accepted { .. } => Ok(Transition::Apply {
                    patch: RequestPatch {
                        advance_payment: Some(request.advance_payment.refund_requested()),
                        ..RequestPatch::default()
                    },
                    event: LifecycleEventKind::CancellationRequested,
                }),
                _ => Err(invalid("only paid requests that have not started can be cancelled")),
            },

            LifecycleCommand::CompleteRefund => match &request.stage {
                ServiceStage::Cancelled => Ok(Transition::Unchanged),
                ServiceStage::Accepted { .. } if request.is_refund_pending() => Ok(Transition::Apply {
                    patch: RequestPatch::stage(ServiceStage::Cancelled),
                    event: LifecycleEventKind::Cancelled,
                }),
                _ => Err(invalid("no refund is pending for this request")),
            },

            LifecycleCommand::ReissueCompletionCode => match &request.stage {
                ServiceStage::AwaitingVerification {
                    prescription,
                    patient_verified: false,
                    ..
                } => Ok(Transition::Apply {
                    patch: RequestPatch::stage(self.awaiting_verification(prescription.clone(), now)),
                    event: LifecycleEventKind::CompletionCodeReissued,
                }),
                _ => Ok(Transition::Unchanged),
            },
        }
    }

    /// Commands that would pass the stage guards right now, for UI hints.
    pub fn valid_commands(&self, request: &ServiceRequest) -> Vec<&'static str> {
        match &request.stage {
            ServiceStage::New => vec!["accept", "reject"],
            ServiceStage::Accepted { .. } => {
                let mut commands = Vec::new();
                if !request.doctor_reached {
                    commands.push("mark arrived");
                }
                if request.is_paid() && !request.is_refund_pending() {
                    commands.push("start service");
                    commands.push("cancel");
                }
                commands
            }
            ServiceStage::InProgress { .. } => vec!["save prescription"],
            ServiceStage::AwaitingVerification { patient_verified: false, .. } => {
                vec!["save prescription", "verify completion"]
            }
            ServiceStage::AwaitingVerification { .. } => vec![],
            ServiceStage::Rejected | ServiceStage::Cancelled => vec![],
        }
    }

    pub fn validate_prescription(prescription: &Prescription) -> Result<(), LifecycleError> {
        let missing = prescription.missing_fields();
        if !missing.is_empty() {
            return Err(LifecycleError::ValidationError(format!(
                "prescription is missing: {}",
                missing.join(", ")
            )));
        }
        if prescription.medicines.is_empty() {
            return Err(LifecycleError::ValidationError(
                "prescription needs at least one medicine".to_string(),
            ));
        }
        if prescription.medicines.iter().any(|m| m.name.trim().is_empty()) {
            return Err(LifecycleError::ValidationError(
                "every medicine needs a name".to_string(),
            ));
        }
        Ok(())
    }

    /// Unverified completion code older than the configured timeout.
    pub fn is_verification_stale(&self, request: &ServiceRequest, now: DateTime<Utc>) -> bool {
        match &request.stage {
            ServiceStage::AwaitingVerification {
                issued_at,
                patient_verified: false,
                ..
            } => now - *issued_at >= Duration::minutes(self.settings.verification_timeout_minutes),
            _ => false,
        }
    }

    fn awaiting_verification(&self, prescription: Prescription, now: DateTime<Utc>) -> ServiceStage {
        ServiceStage::AwaitingVerification {
            prescription,
            completion_code: self.codes.generate(self.settings.completion_code_length),
            issued_at: now,
            patient_verified: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::codes::ScriptedCodeGenerator;
    use crate::{Dosage, DoseTiming, Location, Medicine, NewServiceRequest, RequestStatus};
    use assert_matches::assert_matches;
    use uuid::Uuid;

    fn rules(codes: &[&str]) -> RequestLifecycleService {
        RequestLifecycleService::new(
            LifecycleSettings::default(),
            Arc::new(ScriptedCodeGenerator::new(codes.iter().copied())),
        )
    }

    fn request() -> ServiceRequest {
        ServiceRequest::new(
            Uuid::new_v4(),
            NewServiceRequest {
                doctor_id: Uuid::new_v4(),
                patient_id: None,
                patient_name: "Ravi".to_string(),
                health_issue: "Back pain".to_string(),
                symptoms: vec![],
                location: Location::Address("Flat 4".to_string()),
                distance: None,
                patient_image: None,
                advance_payment_amount: 300,
            },
        )
    }

    fn prescription() -> Prescription {
        Prescription {
            patient_name: "Ravi".to_string(),
            age: "52".to_string(),
            gender: "male".to_string(),
            patient_type: "home visit".to_string(),
            diagnosis: "Muscle strain".to_string(),
            medicines: vec![Medicine {
                name: "Ibuprofen".to_string(),
                dosage: Dosage {
                    breakfast: DoseTiming::After,
                    lunch: DoseTiming::No,
                    dinner: DoseTiming::After,
                },
            }],
            instructions: "Warm compress".to_string(),
            date: "2024-06-02".to_string(),
        }
    }

    fn apply(request: &mut ServiceRequest, transition: Transition) {
        if let Transition::Apply { patch, .. } = transition {
            patch.apply_to(request);
        }
    }

    #[test]
    fn accept_issues_a_five_digit_start_code() {
        let rules = rules(&["54321"]);
        let mut req = request();
        let transition = rules.plan(&req, &LifecycleCommand::Accept, Utc::now()).unwrap();
        apply(&mut req, transition);

        assert_eq!(req.status(), RequestStatus::PartiallyAccepted);
        assert_eq!(req.completion_otp(), Some("54321"));
        assert!(!req.is_paid());
    }

    #[test]
    fn start_requires_payment_even_with_correct_code() {
        let rules = rules(&["54321"]);
        let mut req = request();
        let transition = rules.plan(&req, &LifecycleCommand::Accept, Utc::now()).unwrap();
        apply(&mut req, transition);

        let result = rules.plan(
            &req,
            &LifecycleCommand::StartService { code: "54321".to_string() },
            Utc::now(),
        );
        assert_matches!(result, Err(LifecycleError::PaymentNotConfirmed(_)));
    }

    #[test]
    fn start_rejects_wrong_code() {
        let rules = rules(&["54321"]);
        let mut req = request();
        let transition = rules.plan(&req, &LifecycleCommand::Accept, Utc::now()).unwrap();
        apply(&mut req, transition);
        let transition = rules.plan(&req, &LifecycleCommand::ConfirmPayment, Utc::now()).unwrap();
        apply(&mut req, transition);

        let result = rules.plan(
            &req,
            &LifecycleCommand::StartService { code: "00000".to_string() },
            Utc::now(),
        );
        assert_matches!(result, Err(LifecycleError::InvalidTransition { reason, .. }) if reason == "invalid code");
    }

    #[test]
    fn start_is_blocked_once_a_refund_is_pending() {
        let rules = rules(&["54321"]);
        let mut req = request();
        let transition = rules.plan(&req, &LifecycleCommand::Accept, Utc::now()).unwrap();
        apply(&mut req, transition);
        let transition = rules.plan(&req, &LifecycleCommand::ConfirmPayment, Utc::now()).unwrap();
        apply(&mut req, transition);

        let cancel = LifecycleCommand::RequestCancellation {
            reason: "travelling".to_string(),
        };
        let transition = rules.plan(&req, &cancel, Utc::now()).unwrap();
        apply(&mut req, transition);
        assert!(req.is_refund_pending());
        assert!(req.is_paid());
        assert_eq!(req.status(), RequestStatus::PartiallyAccepted);

        assert_matches!(rules.plan(&req, &cancel, Utc::now()), Ok(Transition::HandOff { .. }));
        assert_matches!(
            rules.plan(
                &req,
                &LifecycleCommand::StartService { code: "54321".to_string() },
                Utc::now()
            ),
            Err(LifecycleError::InvalidTransition { .. })
        );
        assert!(!rules.valid_commands(&req).contains(&"start service"));
    }

    #[test]
    fn rejected_is_terminal() {
        let rules = rules(&[]);
        let mut req = request();
        let transition = rules.plan(&req, &LifecycleCommand::Reject, Utc::now()).unwrap();
        apply(&mut req, transition);

        for command in [
            LifecycleCommand::Accept,
            LifecycleCommand::ConfirmPayment,
            LifecycleCommand::MarkArrived,
            LifecycleCommand::StartService { code: "12345".to_string() },
            LifecycleCommand::CompleteRefund,
        ] {
            assert_matches!(
                rules.plan(&req, &command, Utc::now()),
                Err(LifecycleError::InvalidTransition { .. })
            );
        }
        assert!(rules.valid_commands(&req).is_empty());
    }

    #[test]
    fn prescription_needs_named_medicines() {
        let mut p = prescription();
        p.medicines.clear();
        assert_matches!(
            RequestLifecycleService::validate_prescription(&p),
            Err(LifecycleError::ValidationError(_))
        );

        let mut p = prescription();
        p.medicines[0].name = " ".to_string();
        assert_matches!(
            RequestLifecycleService::validate_prescription(&p),
            Err(LifecycleError::ValidationError(_))
        );
        assert!(RequestLifecycleService::validate_prescription(&prescription()).is_ok());
    }

    #[test]
    fn resaving_prescription_reissues_code() {
        let rules = rules(&["54321", "111111", "222222"]);
        let mut req = request();
        req.advance_payment = req.advance_payment.confirmed(Utc::now());
        let transition = rules.plan(&req, &LifecycleCommand::Accept, Utc::now()).unwrap();
        apply(&mut req, transition);
        let transition = rules
            .plan(&req, &LifecycleCommand::StartService { code: "54321".into() }, Utc::now())
            .unwrap();
        apply(&mut req, transition);

        let save = LifecycleCommand::SavePrescription { prescription: prescription() };
        let transition = rules.plan(&req, &save, Utc::now()).unwrap();
        apply(&mut req, transition);
        assert_eq!(req.completion_otp(), Some("111111"));

        let transition = rules.plan(&req, &save, Utc::now()).unwrap();

        apply(&mut req, transition);
        assert_eq!(req.completion_otp(), Some("222222"));
        assert!(!req.is_patient_verified());
    }

    #[test]
    fn only_assigned_doctor_may_accept() {
        let rules = rules(&[]);
        let req = request();
        let stranger = Identity::doctor(Uuid::new_v4());
        assert_matches!(
            rules.authorize(&req, &stranger, &LifecycleCommand::Accept),
            Err(LifecycleError::Forbidden(_))
        );
        assert!(rules
            .authorize(&req, &Identity::doctor(req.doctor_id), &LifecycleCommand::Accept)
            .is_ok());
        assert_matches!(
            rules.authorize(&req, &Identity::patient(req.patient_id), &LifecycleCommand::Accept),
            Err(LifecycleError::Forbidden(_))
        );
    }

    #[test]
    fn stale_verification_is_detected_after_timeout() {
        let rules = rules(&[]);
        let mut req = request();
        let issued = Utc::now() - Duration::minutes(45);
        req.stage = ServiceStage::AwaitingVerification {
            prescription: prescription(),
            completion_code: "123456".to_string(),
            issued_at: issued,
            patient_verified: false,
        };
        assert!(rules.is_verification_stale(&req, Utc::now()));
        assert!(!rules.is_verification_stale(&req, issued + Duration::minutes(5)));
    }
}
