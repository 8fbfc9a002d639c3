//! Session endpoints and cookie plumbing.

use axum::{
    extract::Extension,
    http::{
        header::{InvalidHeaderValue, AUTHORIZATION, SET_COOKIE},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::IntoResponse,
    Json,
};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

use super::{
    state::{AuthConfig, AuthState},
    storage::{self, SessionRecord},
    types::SessionResponse,
    utils::hash_token,
};

const SESSION_COOKIE_NAME: &str = "symposia_session";

#[utoipa::path(
    get,
    path = "/v1/auth/session",
    responses(
        (status = 200, description = "Session is active", body = SessionResponse),
        (status = 204, description = "No active session")
    ),
    tag = "auth"
)]
pub async fn session(headers: HeaderMap, pool: Extension<PgPool>) -> impl IntoResponse {
    let record = match current_session(&headers, &pool).await {
        Ok(Some(record)) => record,
        Ok(None) => return StatusCode::NO_CONTENT.into_response(),
        Err(status) => return status.into_response(),
    };

    // The notice is a single-read message; this read clears it.
    let notice = match storage::take_notice(&pool, record.id).await {
        Ok(notice) => notice,
        Err(err) => {
            error!("Failed to take session notice: {err}");
            None
        }
    };

    let response = SessionResponse {
        account_id: record.account_id.map(|id| id.to_string()),
        email: record.email,
        is_admin: record.is_admin,
        notice,
    };
    (StatusCode::OK, Json(response)).into_response()
}

#[utoipa::path(
    post,
    path = "/v1/auth/logout",
    responses(
        (status = 204, description = "Session cleared")
    ),
    tag = "auth"
)]
pub async fn logout(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
) -> impl IntoResponse {
    if let Some(token) = extract_session_token(&headers) {
        let token_hash = hash_token(&token);
        if let Err(err) = storage::delete_session(&pool, &token_hash).await {
            error!("Failed to delete session: {err}");
        }
    }

    // Always clear the cookie, even if the session record was missing.
    let mut response_headers = HeaderMap::new();
    if let Ok(cookie) = clear_session_cookie(auth_state.config()) {
        response_headers.insert(SET_COOKIE, cookie);
    }
    (StatusCode::NO_CONTENT, response_headers).into_response()
}

/// Resolve the request's cookie into a session record, if present.
///
/// Returns `Ok(None)` when the cookie is missing or the session expired.
pub(crate) async fn current_session(
    headers: &HeaderMap,
    pool: &PgPool,
) -> Result<Option<SessionRecord>, StatusCode> {
    let Some(token) = extract_session_token(headers) else {
        return Ok(None);
    };
    let token_hash = hash_token(&token);
    match storage::lookup_session(pool, &token_hash).await {
        Ok(record) => Ok(record),
        Err(err) => {
            error!("Failed to lookup session: {err}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Resolve the request's session or create a fresh anonymous one.
///
/// Returns the record plus a `Set-Cookie` value when a session was created.
pub(crate) async fn ensure_session(
    headers: &HeaderMap,
    pool: &PgPool,
    auth_state: &AuthState,
) -> Result<(SessionRecord, Option<HeaderValue>), StatusCode> {
    if let Some(record) = current_session(headers, pool).await? {
        return Ok((record, None));
    }

    let ttl = auth_state.config().session_ttl_seconds();
    match storage::insert_session(pool, ttl).await {
        Ok((record, token)) => {
            let cookie = session_cookie(auth_state.config(), &token).map_err(|err| {
                error!("Failed to build session cookie: {err}");
                StatusCode::INTERNAL_SERVER_ERROR
            })?;
            Ok((record, Some(cookie)))
        }
        Err(err) => {
            error!("Failed to create session: {err}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Require an authenticated session; 401 otherwise.
pub(crate) async fn require_account(
    headers: &HeaderMap,
    pool: &PgPool,
) -> Result<(SessionRecord, Uuid), StatusCode> {
    let record = current_session(headers, pool)
        .await?
        .ok_or(StatusCode::UNAUTHORIZED)?;
    let account_id = record.account_id.ok_or(StatusCode::UNAUTHORIZED)?;
    Ok((record, account_id))
}

/// Require a session holding the administrator grant; 403 otherwise.
pub(crate) async fn require_admin(
    headers: &HeaderMap,
    pool: &PgPool,
) -> Result<SessionRecord, StatusCode> {
    let record = current_session(headers, pool)
        .await?
        .ok_or(StatusCode::UNAUTHORIZED)?;
    if record.is_admin {
        Ok(record)
    } else {
        Err(StatusCode::FORBIDDEN)
    }
}

/// Build a secure `HttpOnly` cookie for the session token.
pub(crate) fn session_cookie(
    auth_config: &AuthConfig,
    token: &str,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let ttl_seconds = auth_config.session_ttl_seconds();
    // Only mark cookies secure when the portal is served over HTTPS.
    let secure = auth_config.session_cookie_secure();
    let mut cookie = format!(
        "{SESSION_COOKIE_NAME}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={ttl_seconds}"
    );
    if secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

fn clear_session_cookie(auth_config: &AuthConfig) -> Result<HeaderValue, InvalidHeaderValue> {
    let secure = auth_config.session_cookie_secure();
    let mut cookie = format!("{SESSION_COOKIE_NAME}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0");
    if secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

fn extract_session_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = extract_bearer_token(headers) {
        return Some(token);
    }
    let header = headers.get(axum::http::header::COOKIE)?;
    let value = header.to_str().ok()?;
    for pair in value.split(';') {
        let trimmed = pair.trim();
        let mut parts = trimmed.splitn(2, '=');
        let key = parts.next()?.trim();
        let val = parts.next()?.trim();
        if key == SESSION_COOKIE_NAME {
            return Some(val.to_string());
        }
    }
    None
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn config() -> AuthConfig {
        AuthConfig::new(
            "https://symposia.dev".to_string(),
            SecretString::from("sesame".to_string()),
        )
    }

    #[test]
    fn session_cookie_is_http_only_and_secure() {
        let cookie = session_cookie(&config(), "tok").unwrap();
        let cookie = cookie.to_str().unwrap();
        assert!(cookie.starts_with("symposia_session=tok"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("Secure"));
    }

    #[test]
    fn clear_cookie_zeroes_max_age() {
        let cookie = clear_session_cookie(&config()).unwrap();
        assert!(cookie.to_str().unwrap().contains("Max-Age=0"));
    }

    #[test]
    fn extract_session_token_from_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::COOKIE,
            HeaderValue::from_static("other=1; symposia_session=abc; theme=dark"),
        );
        assert_eq!(extract_session_token(&headers), Some("abc".to_string()));
    }

    #[test]
    fn extract_session_token_prefers_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer xyz"));
        headers.insert(
            axum::http::header::COOKIE,
            HeaderValue::from_static("symposia_session=abc"),
        );
        assert_eq!(extract_session_token(&headers), Some("xyz".to_string()));
    }

    #[test]
    fn extract_session_token_none_when_missing() {
        let headers = HeaderMap::new();
        assert_eq!(extract_session_token(&headers), None);
    }
}
