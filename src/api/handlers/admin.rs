//! Administrator views, gated on the session-scoped grant.

use anyhow::{Context, Result};
use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tracing::{error, Instrument};
use utoipa::ToSchema;
use uuid::Uuid;

use super::auth::types::Role;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct AccountSummary {
    pub id: String,
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub role: Role,
    pub is_verified: bool,
    pub has_research: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_preference: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[utoipa::path(
    get,
    path = "/v1/admin/accounts",
    responses(
        (status = 200, description = "All accounts", body = [AccountSummary]),
        (status = 401, description = "No session"),
        (status = 403, description = "Session lacks the administrator grant")
    ),
    tag = "admin"
)]
pub async fn list_accounts(headers: HeaderMap, pool: Extension<PgPool>) -> impl IntoResponse {
    // Administrator privilege is session-only; no account role is consulted.
    if let Err(status) = super::auth::session::require_admin(&headers, &pool).await {
        return status.into_response();
    }

    match load_accounts(&pool).await {
        Ok(accounts) => (StatusCode::OK, Json(accounts)).into_response(),
        Err(err) => {
            error!("Failed to list accounts: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn load_accounts(pool: &PgPool) -> Result<Vec<AccountSummary>> {
    let query = r"
        SELECT id, username, email, first_name, last_name, role, is_verified,
               has_research, session_preference, created_at
        FROM accounts
        ORDER BY created_at DESC
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let rows = sqlx::query(query)
        .fetch_all(pool)
        .instrument(span)
        .await
        .context("failed to list accounts")?;

    Ok(rows
        .iter()
        .map(|row| {
            let id: Uuid = row.get("id");
            let role: String = row.get("role");
            AccountSummary {
                id: id.to_string(),
                username: row.get("username"),
                email: row.get("email"),
                first_name: row.get("first_name"),
                last_name: row.get("last_name"),
                role: Role::from_db(&role),
                is_verified: row.get("is_verified"),
                has_research: row.get("has_research"),
                session_preference: row.get("session_preference"),
                created_at: row.get("created_at"),
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;

    #[tokio::test]
    async fn list_accounts_requires_session() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = list_accounts(HeaderMap::new(), Extension(pool))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        Ok(())
    }
}
