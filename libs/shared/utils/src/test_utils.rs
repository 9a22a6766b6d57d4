use std::sync::Arc;

use base64::{engine::general_purpose, Engine as _};
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use uuid::Uuid;

use shared_config::{AppConfig, LifecycleSettings};
use shared_models::auth::{Identity, Role, User};

pub struct TestConfig {
    pub jwt_secret: String,
    pub payment_webhook_secret: String,
    pub refund_webhook_secret: String,
    pub push_api_url: String,
    pub lifecycle: LifecycleSettings,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "test-secret-key-for-jwt-validation-must-be-long-enough".to_string(),
            payment_webhook_secret: "test-payment-webhook-secret".to_string(),
            refund_webhook_secret: "test-refund-webhook-secret".to_string(),
            push_api_url: "http://localhost:9/push".to_string(),
            lifecycle: LifecycleSettings {
                completion_backoff_ms: 1,
                verification_sweep_interval_secs: 1,
                ..LifecycleSettings::default()
            },
        }
    }
}

impl TestConfig {
    pub fn to_app_config(&self) -> AppConfig {
        AppConfig {
            auth_jwt_secret: self.jwt_secret.clone(),
            redis_url: None,
            push_api_url: self.push_api_url.clone(),
            push_access_token: None,
            payment_webhook_secret: self.payment_webhook_secret.clone(),
            payment_simulation_enabled: true,
            refund_webhook_secret: self.refund_webhook_secret.clone(),
            server_port: 0,
            lifecycle: self.lifecycle.clone(),
        }
    }

    pub fn to_arc(&self) -> Arc<AppConfig> {
        Arc::new(self.to_app_config())
    }
}

pub struct TestUser {
    pub id: String,
    pub phone: String,
    pub role: String,
}

impl Default for TestUser {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            phone: "+15550000000".to_string(),
            role: "patient".to_string(),
        }
    }
}

impl TestUser {
    pub fn new(phone: &str, role: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            phone: phone.to_string(),
            role: role.to_string(),
        }
    }

    pub fn doctor(phone: &str) -> Self {
        Self::new(phone, "doctor")
    }

    pub fn patient(phone: &str) -> Self {
        Self::new(phone, "patient")
    }

    pub fn admin(phone: &str) -> Self {
        Self::new(phone, "admin")
    }

    pub fn uuid(&self) -> Uuid {
        Uuid::parse_str(&self.id).expect("test users always carry uuid ids")
    }

    pub fn identity(&self) -> Identity {
        let role = match self.role.as_str() {
            "doctor" => Role::Doctor,
            "patient" => Role::Patient,
            _ => Role::System,
        };
        Identity { user_id: self.uuid(), role }
    }

    pub fn to_user(&self) -> User {
        User {
            id: self.id.clone(),
            phone: Some(self.phone.clone()),
            role: Some(self.role.clone()),
            metadata: None,
            created_at: Some(Utc::now()),
        }
    }
}

pub struct JwtTestUtils;

impl JwtTestUtils {
    pub fn create_test_token(user: &TestUser, secret: &str, exp_hours: Option<i64>) -> String {
        let now = Utc::now();
        let exp = now + Duration::hours(exp_hours.unwrap_or(24));

        let header = json!({
            "alg": "HS256",
            "typ": "JWT"
        });

        let payload = json!({
            "sub": user.id,
            "phone": user.phone,
            "role": user.role,
            "iat": now.timestamp(),
            "exp": exp.timestamp()
        });

        let header_encoded = general_purpose::URL_SAFE_NO_PAD.encode(header.to_string());
        let payload_encoded = general_purpose::URL_SAFE_NO_PAD.encode(payload.to_string());

        let signing_input = format!("{}.{}", header_encoded, payload_encoded);

        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(signing_input.as_bytes());
        let signature = mac.finalize().into_bytes();
        let signature_encoded = general_purpose::URL_SAFE_NO_PAD.encode(signature);

        format!("{}.{}", signing_input, signature_encoded)
    }

    pub fn create_expired_token(user: &TestUser, secret: &str) -> String {
        Self::create_test_token(user, secret, Some(-1))
    }

    pub fn create_invalid_signature_token(user: &TestUser) -> String {
        Self::create_test_token(user, "wrong-secret", Some(24))
    }

    pub fn bearer(user: &TestUser, config: &TestConfig) -> String {
        format!("Bearer {}", Self::create_test_token(user, &config.jwt_secret, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_creation() {
        let config = TestConfig::default();
        let app_config = config.to_app_config();

        assert!(!app_config.auth_jwt_secret.is_empty());
        assert!(app_config.redis_url.is_none());
        assert!(app_config.is_configured());
    }

    #[test]
    fn test_user_creation() {
        let user = TestUser::doctor("+15550001111");
        assert_eq!(user.role, "doctor");
        assert_eq!(user.identity().role, Role::Doctor);

        let user_model = user.to_user();
        assert_eq!(user_model.phone, Some(user.phone.clone()));
        assert_eq!(user_model.id, user.id);
    }

    #[test]
    fn test_jwt_token_creation() {
        let user = TestUser::default();
        let token = JwtTestUtils::create_test_token(&user, "test-secret", Some(1));

        assert_eq!(token.split('.').count(), 3);
    }
}
