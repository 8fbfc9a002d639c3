//! Research abstract submissions.

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

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct SubmitResearchRequest {
    pub title: String,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    #[serde(default)]
    pub session_preference: Option<String>,
    #[serde(default)]
    pub co_authors: Vec<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct SubmissionResponse {
    pub id: String,
    pub title: String,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_preference: Option<String>,
    pub co_authors: Vec<String>,
    pub submitted_at: DateTime<Utc>,
}

#[utoipa::path(
    post,
    path = "/v1/research",
    request_body = SubmitResearchRequest,
    responses(
        (status = 201, description = "Submission recorded", body = SubmissionResponse),
        (status = 400, description = "Validation error", body = String),
        (status = 401, description = "Not authenticated")
    ),
    tag = "research"
)]
pub async fn submit_research(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    payload: Option<Json<SubmitResearchRequest>>,
) -> impl IntoResponse {
    let request: SubmitResearchRequest = match payload {
        Some(Json(payload)) => payload,
        None => return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response(),
    };

    let (_, account_id) = match super::auth::session::require_account(&headers, &pool).await {
        Ok(pair) => pair,
        Err(status) => return status.into_response(),
    };

    let title = request.title.trim();
    if title.is_empty() || request.abstract_text.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            "Title and abstract are required".to_string(),
        )
            .into_response();
    }

    match insert_submission(&pool, account_id, &request).await {
        Ok(submission) => (StatusCode::CREATED, Json(submission)).into_response(),
        Err(err) => {
            error!("Failed to record submission: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Submission failed".to_string(),
            )
                .into_response()
        }
    }
}

#[utoipa::path(
    get,
    path = "/v1/research",
    responses(
        (status = 200, description = "Caller's submissions, newest first", body = [SubmissionResponse]),
        (status = 401, description = "Not authenticated")
    ),
    tag = "research"
)]
pub async fn list_research(headers: HeaderMap, pool: Extension<PgPool>) -> impl IntoResponse {
    let (_, account_id) = match super::auth::session::require_account(&headers, &pool).await {
        Ok(pair) => pair,
        Err(status) => return status.into_response(),
    };

    match list_submissions(&pool, account_id).await {
        Ok(submissions) => (StatusCode::OK, Json(submissions)).into_response(),
        Err(err) => {
            error!("Failed to list submissions: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn insert_submission(
    pool: &PgPool,
    account_id: Uuid,
    request: &SubmitResearchRequest,
) -> Result<SubmissionResponse> {
    let mut tx = pool.begin().await.context("begin submission transaction")?;

    let query = r"
        INSERT INTO research_submissions
            (account_id, title, abstract, session_preference, co_authors)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id, title, abstract, session_preference, co_authors, submitted_at
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(account_id)
        .bind(request.title.trim())
        .bind(request.abstract_text.trim())
        .bind(request.session_preference.as_deref())
        .bind(&request.co_authors)
        .fetch_one(&mut *tx)
        .instrument(span)
        .await
        .context("failed to insert research submission")?;

    let query = r"
        UPDATE accounts
        SET has_research = TRUE, updated_at = NOW()
        WHERE id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(account_id)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to flag account research")?;

    tx.commit().await.context("commit submission transaction")?;

    Ok(submission_from_row(&row))
}

async fn list_submissions(pool: &PgPool, account_id: Uuid) -> Result<Vec<SubmissionResponse>> {
    let query = r"
        SELECT id, title, abstract, session_preference, co_authors, submitted_at
        FROM research_submissions
        WHERE account_id = $1
        ORDER BY submitted_at DESC
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let rows = sqlx::query(query)
        .bind(account_id)
        .fetch_all(pool)
        .instrument(span)
        .await
        .context("failed to list research submissions")?;

    Ok(rows.iter().map(submission_from_row).collect())
}

fn submission_from_row(row: &sqlx::postgres::PgRow) -> SubmissionResponse {
    let id: Uuid = row.get("id");
    SubmissionResponse {
        id: id.to_string(),
        title: row.get("title"),
        abstract_text: row.get("abstract"),
        session_preference: row.get("session_preference"),
        co_authors: row.get("co_authors"),
        submitted_at: row.get("submitted_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;

    #[test]
    fn submit_request_round_trips_with_abstract_rename() -> Result<()> {
        let value = serde_json::json!({
            "title": "On Widgets",
            "abstract": "Widgets, considered harmful.",
            "co_authors": []
        });
        let request: SubmitResearchRequest = serde_json::from_value(value)?;
        assert_eq!(request.abstract_text, "Widgets, considered harmful.");
        assert!(request.session_preference.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn submit_requires_session() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = submit_research(
            HeaderMap::new(),
            Extension(pool),
            Some(Json(SubmitResearchRequest {
                title: "On Widgets".to_string(),
                abstract_text: "Widgets, considered harmful.".to_string(),
                session_preference: None,
                co_authors: Vec::new(),
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        Ok(())
    }
}
