//! Signup and verification endpoints.
//!
//! Verification is deliberately two-step on the account side: following the
//! mailed link only parks the account on the browsing session, and a second
//! request finalizes it. Link-prefetching agents and forwarded mail can
//! therefore never verify an account on their own.

use axum::{
    extract::Extension,
    http::{header::SET_COOKIE, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::error;

use crate::api::mail::TEMPLATE_VERIFY_SIGNUP;

use super::state::AuthState;
use super::storage::{self, ChallengeKind, NewAccount, SignupOutcome};
use super::types::{FinalizeResponse, Role, SignupRequest, TokenRequest};
use super::utils::{build_verify_url, generate_token, hash_token, normalize_email, valid_email};

#[utoipa::path(
    post,
    path = "/v1/auth/signup",
    request_body = SignupRequest,
    responses(
        (status = 201, description = "Account created, verification mail sent", body = String),
        (status = 400, description = "Validation error", body = String),
        (status = 409, description = "Account already exists", body = String)
    ),
    tag = "auth"
)]
pub async fn signup(
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<SignupRequest>>,
) -> impl IntoResponse {
    let request: SignupRequest = match payload {
        Some(Json(payload)) => payload,
        None => return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response(),
    };

    if request.password != request.confirm_password {
        return (StatusCode::BAD_REQUEST, "Passwords do not match".to_string()).into_response();
    }

    let username = request.username.trim().to_string();
    let first_name = request.first_name.trim().to_string();
    let last_name = request.last_name.trim().to_string();
    let email = normalize_email(&request.email);
    if username.is_empty() || first_name.is_empty() || last_name.is_empty() {
        return (StatusCode::BAD_REQUEST, "Missing required fields".to_string()).into_response();
    }
    if !valid_email(&email) {
        return (StatusCode::BAD_REQUEST, "Invalid email".to_string()).into_response();
    }
    if request.password.is_empty() {
        return (StatusCode::BAD_REQUEST, "Missing password".to_string()).into_response();
    }

    // Advisory pre-check; concurrent signups can still both pass it, and the
    // UNIQUE constraints decide the winner below.
    match storage::account_exists(&pool, &username, &email).await {
        Ok(true) => {
            return (StatusCode::CONFLICT, "Account already exists".to_string()).into_response();
        }
        Ok(false) => {}
        Err(err) => {
            error!("Signup pre-check failed: {err}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Signup failed".to_string())
                .into_response();
        }
    }

    let password_hash = match super::utils::hash_password(&request.password) {
        Ok(hash) => hash,
        Err(err) => {
            error!("Password hashing failed: {err}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Signup failed".to_string())
                .into_response();
        }
    };

    let token = match generate_token() {
        Ok(token) => token,
        Err(err) => {
            error!("Token generation failed: {err}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Signup failed".to_string())
                .into_response();
        }
    };
    let token_hash = hash_token(&token);

    // One transaction: the account, its signup challenge, and the outbox row
    // commit together, so a delivered link always references a findable token.
    let mut tx = match pool.begin().await {
        Ok(tx) => tx,
        Err(err) => {
            error!("Failed to start signup transaction: {err}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Signup failed".to_string())
                .into_response();
        }
    };

    let account = NewAccount {
        username: &username,
        email: &email,
        first_name: &first_name,
        last_name: &last_name,
        password_hash: &password_hash,
    };
    let outcome = match storage::insert_account(&mut tx, &account, &token_hash).await {
        Ok(outcome) => outcome,
        Err(err) => {
            error!("Failed to insert account: {err}");
            let _ = tx.rollback().await;
            return (StatusCode::INTERNAL_SERVER_ERROR, "Signup failed".to_string())
                .into_response();
        }
    };

    match outcome {
        SignupOutcome::Created(_) => {}
        SignupOutcome::Conflict => {
            let _ = tx.rollback().await;
            return (StatusCode::CONFLICT, "Account already exists".to_string()).into_response();
        }
    }

    let verify_url = build_verify_url(auth_state.config().public_base_url(), &token);
    let payload = json!({
        "email": email,
        "verify_url": verify_url,
    });
    if let Err(err) = storage::enqueue_mail(&mut tx, &email, TEMPLATE_VERIFY_SIGNUP, &payload).await
    {
        error!("Failed to enqueue verification mail: {err}");
        let _ = tx.rollback().await;
        return (StatusCode::INTERNAL_SERVER_ERROR, "Signup failed".to_string()).into_response();
    }

    if let Err(err) = tx.commit().await {
        error!("Failed to commit signup transaction: {err}");
        return (StatusCode::INTERNAL_SERVER_ERROR, "Signup failed".to_string()).into_response();
    }

    (
        StatusCode::CREATED,
        "Account created. Check your email for a verification link".to_string(),
    )
        .into_response()
}

#[utoipa::path(
    post,
    path = "/v1/auth/verify",
    request_body = TokenRequest,
    responses(
        (status = 204, description = "Link accepted; finalize to complete verification"),
        (status = 400, description = "Invalid or expired link", body = String),
        (status = 409, description = "Already verified", body = String)
    ),
    tag = "auth"
)]
pub async fn verify_link(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<TokenRequest>>,
) -> impl IntoResponse {
    let request: TokenRequest = match payload {
        Some(Json(payload)) => payload,
        None => return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response(),
    };

    let token = request.token.trim();
    if token.is_empty() {
        return (StatusCode::BAD_REQUEST, "Missing token".to_string()).into_response();
    }

    let token_hash = hash_token(token);
    let account =
        match storage::find_account_by_challenge(&pool, ChallengeKind::Signup, &token_hash).await {
            Ok(Some(account)) => account,
            Ok(None) => {
                return (
                    StatusCode::BAD_REQUEST,
                    "Invalid or expired verification link".to_string(),
                )
                    .into_response();
            }
            Err(err) => {
                error!("Verification lookup failed: {err}");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Verification failed".to_string(),
                )
                    .into_response();
            }
        };

    if account.is_verified {
        return (
            StatusCode::CONFLICT,
            "Account already verified".to_string(),
        )
            .into_response();
    }

    // Park the account on this session only; verification is finalized by a
    // second request from the same browser.
    let (session, cookie) = match super::session::ensure_session(&headers, &pool, &auth_state).await
    {
        Ok(pair) => pair,
        Err(status) => return status.into_response(),
    };
    if let Err(err) = storage::set_pending_account(&pool, session.id, account.id).await {
        error!("Failed to set pending account: {err}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Verification failed".to_string(),
        )
            .into_response();
    }

    let mut response_headers = HeaderMap::new();
    if let Some(cookie) = cookie {
        response_headers.insert(SET_COOKIE, cookie);
    }
    (StatusCode::NO_CONTENT, response_headers).into_response()
}

#[utoipa::path(
    post,
    path = "/v1/auth/verify/finalize",
    responses(
        (status = 200, description = "Account verified and session authenticated", body = FinalizeResponse),
        (status = 401, description = "Session expired", body = String),
        (status = 409, description = "Already verified", body = String)
    ),
    tag = "auth"
)]
pub async fn finalize(headers: HeaderMap, pool: Extension<PgPool>) -> impl IntoResponse {
    let session = match super::session::current_session(&headers, &pool).await {
        Ok(Some(session)) => session,
        Ok(None) => {
            return (StatusCode::UNAUTHORIZED, "Session expired".to_string()).into_response();
        }
        Err(status) => return status.into_response(),
    };

    let Some(account_id) = session.pending_account_id else {
        return (StatusCode::UNAUTHORIZED, "Session expired".to_string()).into_response();
    };

    // Guarded update: if verification raced ahead in another session, no row
    // comes back and nothing is mutated.
    let role = match storage::finalize_verification(&pool, account_id).await {
        Ok(Some(role)) => role,
        Ok(None) => {
            return (
                StatusCode::CONFLICT,
                "Account already verified".to_string(),
            )
                .into_response();
        }
        Err(err) => {
            error!("Failed to finalize verification: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Verification failed".to_string(),
            )
                .into_response();
        }
    };

    if let Err(err) = storage::promote_session(&pool, session.id, account_id).await {
        error!("Failed to promote session: {err}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Verification failed".to_string(),
        )
            .into_response();
    }

    // The stored role only drives client-side routing.
    let response = FinalizeResponse {
        role: Role::from_db(&role),
    };
    (StatusCode::OK, Json(response)).into_response()
}

#[cfg(test)]
mod tests {
    use super::super::state::{AuthConfig, AuthState};
    use super::{signup, verify_link};
    use anyhow::Result;
    use axum::extract::Extension;
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
    async fn signup_missing_payload() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = signup(Extension(pool), Extension(auth_state()), None)
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn signup_rejects_password_mismatch() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = signup(
            Extension(pool),
            Extension(auth_state()),
            Some(Json(super::SignupRequest {
                username: "alice".to_string(),
                email: "alice@example.com".to_string(),
                first_name: "Alice".to_string(),
                last_name: "Cooper".to_string(),
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
    async fn signup_rejects_invalid_email() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = signup(
            Extension(pool),
            Extension(auth_state()),
            Some(Json(super::SignupRequest {
                username: "alice".to_string(),
                email: "not-an-email".to_string(),
                first_name: "Alice".to_string(),
                last_name: "Cooper".to_string(),
                password: "hunter22".to_string(),
                confirm_password: "hunter22".to_string(),
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn verify_link_rejects_empty_token() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = verify_link(
            HeaderMap::new(),
            Extension(pool),
            Extension(auth_state()),
            Some(Json(super::TokenRequest {
                token: " ".to_string(),
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }
}
