//! Conference registration profile.
//!
//! The update body is a tagged variant per role: each role carries exactly
//! the fields that apply to it, and persisting one variant clears the
//! other's columns. There is no flat field bag to blank at runtime.

use anyhow::{Context, Result};
use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{PgPool, Row};
use tracing::{error, Instrument};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::api::mail::TEMPLATE_REGISTRATION_CONFIRMATION;

use super::auth::storage::{enqueue_mail, set_notice};
use super::auth::types::Role;

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone)]
pub struct ResearchDetails {
    pub title: String,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    #[serde(default)]
    pub session_preference: Option<String>,
    #[serde(default)]
    pub co_authors: Vec<String>,
}

/// Student or faculty affiliation; each kind has its own required fields.
#[derive(ToSchema, Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Affiliation {
    Student {
        affiliation: String,
        program: String,
        class_year: String,
    },
    Faculty {
        affiliation: String,
        title: String,
    },
}

/// Registration update, tagged by role.
#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum RegistrationUpdate {
    Attendee {
        affiliation: Affiliation,
        #[serde(default)]
        hotel_agree: bool,
    },
    Researcher {
        affiliation: Affiliation,
        #[serde(default)]
        hotel_agree: bool,
        #[serde(default)]
        research: Option<ResearchDetails>,
    },
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ProfileResponse {
    pub id: String,
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub role: Role,
    pub is_verified: bool,
    pub hotel_agree: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_student: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub student_affiliation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub student_program: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub student_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub faculty_affiliation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub faculty_title: Option<String>,
    pub has_research: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub research_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub research_abstract: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_preference: Option<String>,
    pub co_authors: Vec<String>,
}

#[utoipa::path(
    get,
    path = "/v1/me/profile",
    responses(
        (status = 200, description = "Profile for the authenticated account", body = ProfileResponse),
        (status = 401, description = "Not authenticated")
    ),
    tag = "me"
)]
pub async fn get_profile(headers: HeaderMap, pool: Extension<PgPool>) -> impl IntoResponse {
    let (_, account_id) = match super::auth::session::require_account(&headers, &pool).await {
        Ok(pair) => pair,
        Err(status) => return status.into_response(),
    };

    match load_profile(&pool, account_id).await {
        Ok(Some(profile)) => (StatusCode::OK, Json(profile)).into_response(),
        Ok(None) => StatusCode::UNAUTHORIZED.into_response(),
        Err(err) => {
            error!("Failed to load profile: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[utoipa::path(
    put,
    path = "/v1/me/profile",
    request_body = RegistrationUpdate,
    responses(
        (status = 200, description = "Registration saved", body = String),
        (status = 400, description = "Validation error", body = String),
        (status = 401, description = "Not authenticated")
    ),
    tag = "me"
)]
pub async fn update_profile(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    payload: Option<Json<RegistrationUpdate>>,
) -> impl IntoResponse {
    let request: RegistrationUpdate = match payload {
        Some(Json(payload)) => payload,
        None => return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response(),
    };

    let (session, account_id) = match super::auth::session::require_account(&headers, &pool).await
    {
        Ok(pair) => pair,
        Err(status) => return status.into_response(),
    };

    match apply_registration(&pool, account_id, &request).await {
        Ok(()) => {}
        Err(err) => {
            error!("Failed to save registration: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Registration failed".to_string(),
            )
                .into_response();
        }
    }

    if let Err(err) = set_notice(
        &pool,
        session.id,
        "Conference registration submitted successfully!",
    )
    .await
    {
        error!("Failed to set registration notice: {err}");
    }

    (
        StatusCode::OK,
        "Conference registration submitted successfully!".to_string(),
    )
        .into_response()
}

struct RegistrationColumns<'a> {
    role: Role,
    hotel_agree: bool,
    is_student: bool,
    student_affiliation: Option<&'a str>,
    student_program: Option<&'a str>,
    student_class: Option<&'a str>,
    faculty_affiliation: Option<&'a str>,
    faculty_title: Option<&'a str>,
    research: Option<&'a ResearchDetails>,
}

fn registration_columns(update: &RegistrationUpdate) -> RegistrationColumns<'_> {
    let (role, affiliation, hotel_agree, research) = match update {
        RegistrationUpdate::Attendee {
            affiliation,
            hotel_agree,
        } => (Role::Attendee, affiliation, *hotel_agree, None),
        RegistrationUpdate::Researcher {
            affiliation,
            hotel_agree,
            research,
        } => (
            Role::Researcher,
            affiliation,
            *hotel_agree,
            research.as_ref(),
        ),
    };

    match affiliation {
        Affiliation::Student {
            affiliation,
            program,
            class_year,
        } => RegistrationColumns {
            role,
            hotel_agree,
            is_student: true,
            student_affiliation: Some(affiliation),
            student_program: Some(program),
            student_class: Some(class_year),
            faculty_affiliation: None,
            faculty_title: None,
            research,
        },
        Affiliation::Faculty { affiliation, title } => RegistrationColumns {
            role,
            hotel_agree,
            is_student: false,
            student_affiliation: None,
            student_program: None,
            student_class: None,
            faculty_affiliation: Some(affiliation),
            faculty_title: Some(title),
            research,
        },
    }
}

async fn apply_registration(
    pool: &PgPool,
    account_id: Uuid,
    update: &RegistrationUpdate,
) -> Result<()> {
    let columns = registration_columns(update);
    let mut tx = pool.begin().await.context("begin registration transaction")?;

    let query = r"
        UPDATE accounts
        SET role = $2,
            hotel_agree = $3,
            is_student = $4,
            student_affiliation = $5,
            student_program = $6,
            student_class = $7,
            faculty_affiliation = $8,
            faculty_title = $9,
            has_research = $10,
            research_title = $11,
            research_abstract = $12,
            session_preference = $13,
            co_authors = $14,
            updated_at = NOW()
        WHERE id = $1
        RETURNING email, first_name
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let empty: Vec<String> = Vec::new();
    let row = sqlx::query(query)
        .bind(account_id)
        .bind(columns.role.as_str())
        .bind(columns.hotel_agree)
        .bind(columns.is_student)
        .bind(columns.student_affiliation)
        .bind(columns.student_program)
        .bind(columns.student_class)
        .bind(columns.faculty_affiliation)
        .bind(columns.faculty_title)
        .bind(columns.research.is_some())
        .bind(columns.research.map(|research| research.title.as_str()))
        .bind(
            columns
                .research
                .map(|research| research.abstract_text.as_str()),
        )
        .bind(
            columns
                .research
                .and_then(|research| research.session_preference.as_deref()),
        )
        .bind(
            columns
                .research
                .map_or(&empty, |research| &research.co_authors),
        )
        .fetch_one(&mut *tx)
        .instrument(span)
        .await
        .context("failed to update registration")?;

    let email: String = row.get("email");
    let first_name: String = row.get("first_name");

    // Researchers with a fresh title also get a submission row, once.
    if let Some(research) = columns.research {
        insert_submission_if_new(&mut tx, account_id, research).await?;
    }

    let payload = json!({
        "email": email,
        "first_name": first_name,
    });
    enqueue_mail(&mut tx, &email, TEMPLATE_REGISTRATION_CONFIRMATION, &payload).await?;

    tx.commit().await.context("commit registration transaction")
}

async fn insert_submission_if_new(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    account_id: Uuid,
    research: &ResearchDetails,
) -> Result<()> {
    let query = r"
        SELECT 1 FROM research_submissions
        WHERE account_id = $1 AND title = $2
        LIMIT 1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let existing = sqlx::query(query)
        .bind(account_id)
        .bind(&research.title)
        .fetch_optional(&mut **tx)
        .instrument(span)
        .await
        .context("failed to check for existing submission")?;

    if existing.is_some() {
        return Ok(());
    }

    let query = r"
        INSERT INTO research_submissions
            (account_id, title, abstract, session_preference, co_authors)
        VALUES ($1, $2, $3, $4, $5)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(account_id)
        .bind(&research.title)
        .bind(&research.abstract_text)
        .bind(research.session_preference.as_deref())
        .bind(&research.co_authors)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to insert research submission")?;
    Ok(())
}

async fn load_profile(pool: &PgPool, account_id: Uuid) -> Result<Option<ProfileResponse>> {
    let query = r"
        SELECT id, username, email, first_name, last_name, role, is_verified,
               hotel_agree, is_student, student_affiliation, student_program,
               student_class, faculty_affiliation, faculty_title, has_research,
               research_title, research_abstract, session_preference, co_authors
        FROM accounts
        WHERE id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(account_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to load profile")?;

    Ok(row.map(|row| {
        let role: String = row.get("role");
        let id: Uuid = row.get("id");
        ProfileResponse {
            id: id.to_string(),
            username: row.get("username"),
            email: row.get("email"),
            first_name: row.get("first_name"),
            last_name: row.get("last_name"),
            role: Role::from_db(&role),
            is_verified: row.get("is_verified"),
            hotel_agree: row.get("hotel_agree"),
            is_student: row.get("is_student"),
            student_affiliation: row.get("student_affiliation"),
            student_program: row.get("student_program"),
            student_class: row.get("student_class"),
            faculty_affiliation: row.get("faculty_affiliation"),
            faculty_title: row.get("faculty_title"),
            has_research: row.get("has_research"),
            research_title: row.get("research_title"),
            research_abstract: row.get("research_abstract"),
            session_preference: row.get("session_preference"),
            co_authors: row.get("co_authors"),
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_update_tags_by_role() -> Result<()> {
        let value = json!({
            "role": "researcher",
            "affiliation": {"kind": "faculty", "affiliation": "State U", "title": "Professor"},
            "hotel_agree": true,
            "research": {
                "title": "On Widgets",
                "abstract": "Widgets, considered harmful.",
                "co_authors": ["B. Coauthor"]
            }
        });
        let update: RegistrationUpdate = serde_json::from_value(value)?;
        let columns = registration_columns(&update);
        assert_eq!(columns.role, Role::Researcher);
        assert!(!columns.is_student);
        assert_eq!(columns.faculty_affiliation, Some("State U"));
        assert_eq!(columns.student_affiliation, None);
        let research = columns.research.context("research details")?;
        assert_eq!(research.title, "On Widgets");
        Ok(())
    }

    #[test]
    fn attendee_variant_clears_research() -> Result<()> {
        let value = json!({
            "role": "attendee",
            "affiliation": {
                "kind": "student",
                "affiliation": "State U",
                "program": "Economics",
                "class_year": "Senior"
            }
        });
        let update: RegistrationUpdate = serde_json::from_value(value)?;
        let columns = registration_columns(&update);
        assert_eq!(columns.role, Role::Attendee);
        assert!(columns.is_student);
        assert!(columns.research.is_none());
        assert!(!columns.hotel_agree);
        Ok(())
    }

    #[test]
    fn registration_update_rejects_unknown_role() {
        let value = json!({
            "role": "chair",
            "affiliation": {"kind": "faculty", "affiliation": "State U", "title": "Professor"}
        });
        let result: std::result::Result<RegistrationUpdate, _> = serde_json::from_value(value);
        assert!(result.is_err());
    }
}
