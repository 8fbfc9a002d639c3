//! Password reset and authenticated password change.
//!
//! Reset links are built from the origin that served the request, so they
//! match whatever host the user was on. Validity is re-checked by every step
//! that consumes the token; nothing is trusted from the view step.

use axum::{
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::error;

use crate::api::mail::TEMPLATE_RESET_PASSWORD;

use super::state::AuthState;
use super::storage;
use super::types::{ForgotPasswordRequest, ResetPasswordRequest, UpdatePasswordRequest};
use super::utils::{
    build_reset_url, generate_token, hash_password, hash_token, normalize_email, request_origin,
    valid_email, verify_password,
};

#[utoipa::path(
    post,
    path = "/v1/auth/forgot-password",
    request_body = ForgotPasswordRequest,
    responses(
        (status = 200, description = "Reset mail sent", body = String),
        (status = 404, description = "No account found", body = String)
    ),
    tag = "auth"
)]
pub async fn forgot_password(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<ForgotPasswordRequest>>,
) -> impl IntoResponse {
    let request: ForgotPasswordRequest = match payload {
        Some(Json(payload)) => payload,
        None => return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response(),
    };

    let email = normalize_email(&request.email);
    if !valid_email(&email) {
        return (StatusCode::BAD_REQUEST, "Invalid email".to_string()).into_response();
    }

    // No credential was supplied here, so a miss is reported as-is instead of
    // being merged into the invalid-credentials message.
    let (account_id, account_email) = match storage::find_account_by_email(&pool, &email).await {
        Ok(Some(pair)) => pair,
        Ok(None) => {
            return (StatusCode::NOT_FOUND, "No account found".to_string()).into_response();
        }
        Err(err) => {
            error!("Reset lookup failed: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Password reset failed".to_string(),
            )
                .into_response();
        }
    };

    let token = match generate_token() {
        Ok(token) => token,
        Err(err) => {
            error!("Token generation failed: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Password reset failed".to_string(),
            )
                .into_response();
        }
    };
    let token_hash = hash_token(&token);

    let mut tx = match pool.begin().await {
        Ok(tx) => tx,
        Err(err) => {
            error!("Failed to start reset transaction: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Password reset failed".to_string(),
            )
                .into_response();
        }
    };

    let ttl = auth_state.config().reset_token_ttl_seconds();
    // Supersedes any earlier pair; the old link stops validating.
    if let Err(err) = storage::set_reset_token(&mut tx, account_id, &token_hash, ttl).await {
        error!("Failed to set reset token: {err}");
        let _ = tx.rollback().await;
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Password reset failed".to_string(),
        )
            .into_response();
    }

    // Built from the request's own origin so the link matches whatever host
    // served the form; the configured base URL is only a fallback.
    let origin = request_origin(&headers)
        .unwrap_or_else(|| auth_state.config().public_base_url().to_string());
    let reset_url = build_reset_url(&origin, &token);
    let payload = json!({
        "email": account_email,
        "reset_url": reset_url,
    });
    if let Err(err) =
        storage::enqueue_mail(&mut tx, &account_email, TEMPLATE_RESET_PASSWORD, &payload).await
    {
        error!("Failed to enqueue reset mail: {err}");
        let _ = tx.rollback().await;
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Password reset failed".to_string(),
        )
            .into_response();
    }

    if let Err(err) = tx.commit().await {
        error!("Failed to commit reset transaction: {err}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Password reset failed".to_string(),
        )
            .into_response();
    }

    (StatusCode::OK, "Reset email sent".to_string()).into_response()
}

#[utoipa::path(
    get,
    path = "/v1/auth/reset-password/{token}",
    params(
        ("token" = String, Path, description = "Reset token from the mailed link")
    ),
    responses(
        (status = 204, description = "Link is valid"),
        (status = 400, description = "Invalid or expired link", body = String)
    ),
    tag = "auth"
)]
pub async fn reset_form(Path(token): Path<String>, pool: Extension<PgPool>) -> impl IntoResponse {
    let token = token.trim();
    if token.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            "Password reset link is invalid or expired".to_string(),
        )
            .into_response();
    }

    let token_hash = hash_token(token);
    match storage::reset_token_valid(&pool, &token_hash).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        // Not-found and expired are deliberately indistinguishable.
        Ok(false) => (
            StatusCode::BAD_REQUEST,
            "Password reset link is invalid or expired".to_string(),
        )
            .into_response(),
        Err(err) => {
            error!("Reset token check failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Password reset failed".to_string(),
            )
                .into_response()
        }
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/reset-password/{token}",
    request_body = ResetPasswordRequest,
    params(
        ("token" = String, Path, description = "Reset token from the mailed link")
    ),
    responses(
        (status = 200, description = "Password updated", body = String),
        (status = 400, description = "Validation error or invalid link", body = String)
    ),
    tag = "auth"
)]
pub async fn reset_submit(
    Path(token): Path<String>,
    pool: Extension<PgPool>,
    payload: Option<Json<ResetPasswordRequest>>,
) -> impl IntoResponse {
    let request: ResetPasswordRequest = match payload {
        Some(Json(payload)) => payload,
        None => return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response(),
    };

    if request.password != request.confirm_password {
        return (StatusCode::BAD_REQUEST, "Passwords do not match".to_string()).into_response();
    }
    if request.password.is_empty() {
        return (StatusCode::BAD_REQUEST, "Missing password".to_string()).into_response();
    }

    let new_hash = match hash_password(&request.password) {
        Ok(hash) => hash,
        Err(err) => {
            error!("Password hashing failed: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Password reset failed".to_string(),
            )
                .into_response();
        }
    };

    // Token and expiry are re-validated inside the update itself; time may
    // have passed since the form was viewed.
    let token_hash = hash_token(token.trim());
    match storage::update_password_by_reset_token(&pool, &token_hash, &new_hash).await {
        Ok(true) => (
            StatusCode::OK,
            "Password successfully updated. You may now log in".to_string(),
        )
            .into_response(),
        Ok(false) => (
            StatusCode::BAD_REQUEST,
            "Password reset link is invalid or expired".to_string(),
        )
            .into_response(),
        Err(err) => {
            error!("Password reset failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Password reset failed".to_string(),
            )
                .into_response()
        }
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/update-password",
    request_body = UpdatePasswordRequest,
    responses(
        (status = 200, description = "Password updated", body = String),
        (status = 400, description = "Validation error", body = String),
        (status = 401, description = "Not authenticated", body = String)
    ),
    tag = "auth"
)]
pub async fn update_password(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    payload: Option<Json<UpdatePasswordRequest>>,
) -> impl IntoResponse {
    let request: UpdatePasswordRequest = match payload {
        Some(Json(payload)) => payload,
        None => return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response(),
    };

    let (_, account_id) = match super::session::require_account(&headers, &pool).await {
        Ok(pair) => pair,
        Err(status) => return status.into_response(),
    };

    if request.new_password != request.confirm_new_password {
        return (StatusCode::BAD_REQUEST, "Passwords do not match".to_string()).into_response();
    }
    if request.new_password.is_empty() {
        return (StatusCode::BAD_REQUEST, "Missing password".to_string()).into_response();
    }

    let stored_hash = match storage::password_hash_for_account(&pool, account_id).await {
        Ok(Some(hash)) => hash,
        Ok(None) => {
            return (StatusCode::UNAUTHORIZED, "Session expired".to_string()).into_response();
        }
        Err(err) => {
            error!("Password lookup failed: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Password update failed".to_string(),
            )
                .into_response();
        }
    };

    if !verify_password(&request.current_password, &stored_hash) {
        return (
            StatusCode::BAD_REQUEST,
            "Current password is incorrect".to_string(),
        )
            .into_response();
    }

    let new_hash = match hash_password(&request.new_password) {
        Ok(hash) => hash,
        Err(err) => {
            error!("Password hashing failed: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Password update failed".to_string(),
            )
                .into_response();
        }
    };

    if let Err(err) = storage::update_password(&pool, account_id, &new_hash).await {
        error!("Password update failed: {err}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Password update failed".to_string(),
        )
            .into_response();
    }

    (StatusCode::OK, "Password successfully updated".to_string()).into_response()
}

#[cfg(test)]
mod tests {
    use super::super::state::{AuthConfig, AuthState};
    use super::{forgot_password, reset_submit, update_password};
    use anyhow::Result;
    use axum::extract::{Extension, Path};
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::Json;
    use secrecy::SecretString;
    use sqlx::postgres::PgPoolOptions;
    use std::sync::Arc;

    fn auth_state() -> Arc<AuthState> {
        let config = AuthConfig::new(
            "https://symposia.dev".to_string(),
            SecretString::from("sesame".to_string()),
        );
        Arc::new(AuthState::new(config))
    }

    #[tokio::test]
    async fn forgot_password_missing_payload() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = forgot_password(
            HeaderMap::new(),
            Extension(pool),
            Extension(auth_state()),
            None,
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn forgot_password_rejects_invalid_email() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = forgot_password(
            HeaderMap::new(),
            Extension(pool),
            Extension(auth_state()),
            Some(Json(super::ForgotPasswordRequest {
                email: "not-an-email".to_string(),
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn reset_submit_rejects_mismatch() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = reset_submit(
            Path("token".to_string()),
            Extension(pool),
            Some(Json(super::ResetPasswordRequest {
                password: "one".to_string(),
                confirm_password: "two".to_string(),
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn update_password_requires_session() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = update_password(
            HeaderMap::new(),
            Extension(pool),
            Some(Json(super::UpdatePasswordRequest {
                current_password: "old".to_string(),
                new_password: "new".to_string(),
                confirm_new_password: "new".to_string(),
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        Ok(())
    }
}
