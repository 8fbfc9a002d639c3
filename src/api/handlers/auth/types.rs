//! Request/response types for auth endpoints.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Stored account role. Never grants elevated access by itself; administrator
/// privilege is session-scoped only.
#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Unassigned,
    Attendee,
    Researcher,
    AdminCandidate,
}

impl Role {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Unassigned => "unassigned",
            Self::Attendee => "attendee",
            Self::Researcher => "researcher",
            Self::AdminCandidate => "admin_candidate",
        }
    }

    pub(crate) fn from_db(value: &str) -> Self {
        match value {
            "attendee" => Self::Attendee,
            "researcher" => Self::Researcher,
            "admin_candidate" => Self::AdminCandidate,
            _ => Self::Unassigned,
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct SignupRequest {
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub password: String,
    pub confirm_password: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct LoginRequest {
    /// Username or email address.
    pub identifier: String,
    pub password: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct TokenRequest {
    pub token: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct FinalizeResponse {
    pub role: Role,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ConfirmLoginResponse {
    pub is_admin: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ForgotPasswordRequest {
    pub email: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ResetPasswordRequest {
    pub password: String,
    pub confirm_password: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct UpdatePasswordRequest {
    pub current_password: String,
    pub new_password: String,
    pub confirm_new_password: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct SessionResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub is_admin: bool,
    /// Transient message; cleared by this read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notice: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, Result};

    #[test]
    fn role_round_trips_through_db_strings() {
        for role in [
            Role::Unassigned,
            Role::Attendee,
            Role::Researcher,
            Role::AdminCandidate,
        ] {
            assert_eq!(Role::from_db(role.as_str()), role);
        }
        assert_eq!(Role::from_db("chair"), Role::Unassigned);
    }

    #[test]
    fn signup_request_round_trips() -> Result<()> {
        let request = SignupRequest {
            username: "alice".to_string(),
            email: "alice@example.com".to_string(),
            first_name: "Alice".to_string(),
            last_name: "Cooper".to_string(),
            password: "hunter22".to_string(),
            confirm_password: "hunter22".to_string(),
        };
        let value = serde_json::to_value(&request)?;
        let email = value
            .get("email")
            .and_then(serde_json::Value::as_str)
            .context("missing email")?;
        assert_eq!(email, "alice@example.com");
        let decoded: SignupRequest = serde_json::from_value(value)?;
        assert_eq!(decoded.username, "alice");
        Ok(())
    }

    #[test]
    fn confirm_login_response_omits_null_role() -> Result<()> {
        let response = ConfirmLoginResponse {
            is_admin: true,
            role: None,
        };
        let value = serde_json::to_value(&response)?;
        assert!(value.get("role").is_none());
        Ok(())
    }

    #[test]
    fn role_serializes_snake_case() -> Result<()> {
        let value = serde_json::to_value(Role::AdminCandidate)?;
        assert_eq!(value, serde_json::json!("admin_candidate"));
        Ok(())
    }
}
