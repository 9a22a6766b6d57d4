use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

#[derive(Debug, Serialize, Deserialize)]
pub struct JwtHeader {
    pub alg: String,
    pub typ: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JwtClaims {
    pub sub: String,
    pub exp: Option<u64>,
    pub phone: Option<String>,
    pub role: Option<String>,
    pub user_metadata: Option<serde_json::Value>,
    pub aud: Option<String>,
    pub iat: Option<u64>,
}

/// Authenticated caller as decoded from the auth provider's token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub phone: Option<String>,
    pub role: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Doctor,
    Patient,
    /// Adapters and background tasks acting on behalf of the platform.
    System,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Doctor => write!(f, "doctor"),
            Role::Patient => write!(f, "patient"),
            Role::System => write!(f, "system"),
        }
    }
}

/// Explicit actor identity threaded into every lifecycle call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: Uuid,
    pub role: Role,
}

impl Identity {
    pub fn doctor(user_id: Uuid) -> Self {
        Self { user_id, role: Role::Doctor }
    }

    pub fn patient(user_id: Uuid) -> Self {
        Self { user_id, role: Role::Patient }
    }

    pub fn system() -> Self {
        Self { user_id: Uuid::nil(), role: Role::System }
    }

    pub fn is_system(&self) -> bool {
        self.role == Role::System
    }
}

impl TryFrom<&User> for Identity {
    type Error = AppError;

    fn try_from(user: &User) -> Result<Self, Self::Error> {
        let user_id = Uuid::parse_str(&user.id)
            .map_err(|_| AppError::BadRequest("Invalid user ID format".to_string()))?;

        let role = match user.role.as_deref() {
            Some("doctor") => Role::Doctor,
            Some("patient") => Role::Patient,
            Some("admin") | Some("service_role") => Role::System,
            other => {
                return Err(AppError::Auth(format!(
                    "Unsupported role: {}",
                    other.unwrap_or("none")
                )))
            }
        };

        Ok(Self { user_id, role })
    }
}
