//! Login endpoints: credential check, then a mailed confirmation link.
//!
//! Every login is two-step. A correct password only issues a fresh challenge
//! token; the session is authenticated when the mailed link is followed.
//! Presenting the administrator shared secret is special-cased before any
//! account lookup and never touches the accounts table.

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

use crate::api::mail::{TEMPLATE_ADMIN_LOGIN, TEMPLATE_VERIFY_LOGIN};

use super::state::AuthState;
use super::storage;
use super::types::{ConfirmLoginResponse, LoginRequest, Role, TokenRequest};
use super::utils::{
    admin_secret_matches, build_login_confirm_url, generate_token, hash_password, hash_token,
    normalize_email, valid_email, verify_password,
};

#[utoipa::path(
    post,
    path = "/v1/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Confirmation link sent", body = String),
        (status = 400, description = "Validation error", body = String),
        (status = 401, description = "Invalid credentials", body = String)
    ),
    tag = "auth"
)]
pub async fn login(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<LoginRequest>>,
) -> impl IntoResponse {
    let request: LoginRequest = match payload {
        Some(Json(payload)) => payload,
        None => return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response(),
    };

    let identifier = request.identifier.trim().to_string();
    if identifier.is_empty() || request.password.is_empty() {
        return (StatusCode::BAD_REQUEST, "Missing credentials".to_string()).into_response();
    }

    // Administrator challenge comes before any account lookup: the supplied
    // address does not need to belong to an account.
    if admin_secret_matches(&request.password, auth_state.config().admin_secret()) {
        return start_admin_challenge(&headers, &pool, &auth_state, &identifier)
            .await
            .into_response();
    }

    let email_normalized = normalize_email(&identifier);
    let account = match storage::find_account_for_login(&pool, &identifier, &email_normalized).await
    {
        Ok(account) => account,
        Err(err) => {
            error!("Login lookup failed: {err}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Login failed".to_string())
                .into_response();
        }
    };

    let Some(account) = account else {
        // Burn a hash so unknown identifiers cost as much as a wrong password.
        let _ = hash_password(&request.password);
        return (
            StatusCode::UNAUTHORIZED,
            "Invalid email or password".to_string(),
        )
            .into_response();
    };

    if !verify_password(&request.password, &account.password_hash) {
        return (
            StatusCode::UNAUTHORIZED,
            "Invalid email or password".to_string(),
        )
            .into_response();
    }

    let token = match generate_token() {
        Ok(token) => token,
        Err(err) => {
            error!("Token generation failed: {err}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Login failed".to_string())
                .into_response();
        }
    };
    let token_hash = hash_token(&token);

    let mut tx = match pool.begin().await {
        Ok(tx) => tx,
        Err(err) => {
            error!("Failed to start login transaction: {err}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Login failed".to_string())
                .into_response();
        }
    };

    // Overwrites any pending challenge for this account, including an
    // unconsumed signup token; the older link stops validating.
    if let Err(err) = storage::set_login_challenge(&mut tx, account.id, &token_hash).await {
        error!("Failed to set login challenge: {err}");
        let _ = tx.rollback().await;
        return (StatusCode::INTERNAL_SERVER_ERROR, "Login failed".to_string()).into_response();
    }

    let confirm_url = build_login_confirm_url(auth_state.config().public_base_url(), &token);
    let payload = json!({
        "email": account.email,
        "confirm_url": confirm_url,
    });
    if let Err(err) =
        storage::enqueue_mail(&mut tx, &account.email, TEMPLATE_VERIFY_LOGIN, &payload).await
    {
        error!("Failed to enqueue login mail: {err}");
        let _ = tx.rollback().await;
        return (StatusCode::INTERNAL_SERVER_ERROR, "Login failed".to_string()).into_response();
    }

    if let Err(err) = tx.commit().await {
        error!("Failed to commit login transaction: {err}");
        return (StatusCode::INTERNAL_SERVER_ERROR, "Login failed".to_string()).into_response();
    }

    (
        StatusCode::OK,
        "Check your email for a login confirmation link".to_string(),
    )
        .into_response()
}

async fn start_admin_challenge(
    headers: &HeaderMap,
    pool: &PgPool,
    auth_state: &AuthState,
    address: &str,
) -> axum::response::Response {
    let email = normalize_email(address);
    if !valid_email(&email) {
        return (StatusCode::BAD_REQUEST, "Invalid email".to_string()).into_response();
    }

    let token = match generate_token() {
        Ok(token) => token,
        Err(err) => {
            error!("Token generation failed: {err}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Login failed".to_string())
                .into_response();
        }
    };
    let token_hash = hash_token(&token);

    let (session, cookie) = match super::session::ensure_session(headers, pool, auth_state).await {
        Ok(pair) => pair,
        Err(status) => return status.into_response(),
    };

    let mut tx = match pool.begin().await {
        Ok(tx) => tx,
        Err(err) => {
            error!("Failed to start admin challenge transaction: {err}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Login failed".to_string())
                .into_response();
        }
    };

    let ttl = auth_state.config().admin_challenge_ttl_seconds();
    if let Err(err) =
        storage::set_admin_challenge(&mut tx, session.id, &email, &token_hash, ttl).await
    {
        error!("Failed to set admin challenge: {err}");
        let _ = tx.rollback().await;
        return (StatusCode::INTERNAL_SERVER_ERROR, "Login failed".to_string()).into_response();
    }

    let confirm_url = build_login_confirm_url(auth_state.config().public_base_url(), &token);
    let payload = json!({
        "email": email,
        "confirm_url": confirm_url,
    });
    if let Err(err) = storage::enqueue_mail(&mut tx, &email, TEMPLATE_ADMIN_LOGIN, &payload).await {
        error!("Failed to enqueue admin mail: {err}");
        let _ = tx.rollback().await;
        return (StatusCode::INTERNAL_SERVER_ERROR, "Login failed".to_string()).into_response();
    }

    if let Err(err) = tx.commit().await {
        error!("Failed to commit admin challenge transaction: {err}");
        return (StatusCode::INTERNAL_SERVER_ERROR, "Login failed".to_string()).into_response();
    }

    let mut response_headers = HeaderMap::new();
    if let Some(cookie) = cookie {
        response_headers.insert(SET_COOKIE, cookie);
    }
    (
        StatusCode::OK,
        response_headers,
        "Check your email for a login confirmation link".to_string(),
    )
        .into_response()
}

#[utoipa::path(
    post,
    path = "/v1/auth/confirm-login",
    request_body = TokenRequest,
    responses(
        (status = 200, description = "Session authenticated", body = ConfirmLoginResponse),
        (status = 400, description = "Invalid or expired link", body = String)
    ),
    tag = "auth"
)]
pub async fn confirm_login(
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

    // Administrator challenge is checked first: the two flows share one link
    // shape, disambiguated by session state rather than by the token itself.
    let session = match super::session::current_session(&headers, &pool).await {
        Ok(session) => session,
        Err(status) => return status.into_response(),
    };
    if let Some(session) = &session {
        match storage::grant_admin(&pool, session.id, &token_hash).await {
            Ok(true) => {
                let response = ConfirmLoginResponse {
                    is_admin: true,
                    role: None,
                };
                return (StatusCode::OK, Json(response)).into_response();
            }
            Ok(false) => {}
            Err(err) => {
                error!("Admin grant failed: {err}");
                return (StatusCode::INTERNAL_SERVER_ERROR, "Login failed".to_string())
                    .into_response();
            }
        }
    }

    // Ordinary login: consume the challenge exactly once.
    let (account_id, role) = match storage::consume_login_challenge(&pool, &token_hash).await {
        Ok(Some(pair)) => pair,
        Ok(None) => {
            return (
                StatusCode::BAD_REQUEST,
                "Invalid or expired login link".to_string(),
            )
                .into_response();
        }
        Err(err) => {
            error!("Login confirmation failed: {err}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Login failed".to_string())
                .into_response();
        }
    };

    let (session, cookie) = match super::session::ensure_session(&headers, &pool, &auth_state).await
    {
        Ok(pair) => pair,
        Err(status) => return status.into_response(),
    };
    if let Err(err) = storage::promote_session(&pool, session.id, account_id).await {
        error!("Failed to promote session: {err}");
        return (StatusCode::INTERNAL_SERVER_ERROR, "Login failed".to_string()).into_response();
    }

    let mut response_headers = HeaderMap::new();
    if let Some(cookie) = cookie {
        response_headers.insert(SET_COOKIE, cookie);
    }
    let response = ConfirmLoginResponse {
        is_admin: false,
        role: Some(Role::from_db(&role)),
    };
    (StatusCode::OK, response_headers, Json(response)).into_response()
}

#[cfg(test)]
mod tests {
    use super::super::state::{AuthConfig, AuthState};
    use super::{confirm_login, login};
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
    async fn login_missing_payload() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = login(
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
    async fn login_rejects_empty_credentials() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = login(
            HeaderMap::new(),
            Extension(pool),
            Extension(auth_state()),
            Some(Json(super::LoginRequest {
                identifier: " ".to_string(),
                password: String::new(),
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn admin_challenge_requires_valid_address() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        // The shared secret is special-cased before any account lookup, so an
        // invalid address fails fast without touching the database.
        let response = login(
            HeaderMap::new(),
            Extension(pool),
            Extension(auth_state()),
            Some(Json(super::LoginRequest {
                identifier: "not-an-email".to_string(),
                password: "sesame".to_string(),
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn confirm_login_rejects_empty_token() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = confirm_login(
            HeaderMap::new(),
            Extension(pool),
            Extension(auth_state()),
            Some(Json(super::TokenRequest {
                token: String::new(),
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }
}
