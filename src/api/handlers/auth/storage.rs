//! Database helpers for accounts, challenges, sessions, and the reset flow.
//!
//! This module is the only place that mutates verification-related fields.
//! Consuming updates are guarded in SQL (`is_verified = FALSE`,
//! `challenge_token_hash = $n`, `reset_expires_at > NOW()`) with `RETURNING`,
//! so concurrent attempts resolve to exactly one winner per record.

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use sqlx::{PgPool, Row};
use tracing::Instrument;
use uuid::Uuid;

use super::utils::{generate_token, hash_token, is_unique_violation};

/// Out-of-band challenge kind. An account has at most one pending challenge;
/// each consumer only accepts its own kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChallengeKind {
    Signup,
    Login,
}

impl ChallengeKind {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Signup => "signup",
            Self::Login => "login",
        }
    }
}

/// Outcome when attempting to create a new account.
#[derive(Debug)]
pub(crate) enum SignupOutcome {
    Created(Uuid),
    Conflict,
}

/// Fields required to create an account.
pub(crate) struct NewAccount<'a> {
    pub(crate) username: &'a str,
    pub(crate) email: &'a str,
    pub(crate) first_name: &'a str,
    pub(crate) last_name: &'a str,
    pub(crate) password_hash: &'a str,
}

/// Minimal fields needed to check credentials at login.
pub(crate) struct LoginAccount {
    pub(crate) id: Uuid,
    pub(crate) email: String,
    pub(crate) password_hash: String,
}

/// Minimal data behind a valid session cookie.
pub(crate) struct SessionRecord {
    pub(crate) id: Uuid,
    pub(crate) account_id: Option<Uuid>,
    pub(crate) email: Option<String>,
    pub(crate) is_admin: bool,
    pub(crate) pending_account_id: Option<Uuid>,
}

/// Advisory duplicate pre-check; the UNIQUE constraints are the backstop.
pub(crate) async fn account_exists(pool: &PgPool, username: &str, email: &str) -> Result<bool> {
    let query = "SELECT 1 FROM accounts WHERE username = $1 OR email = $2 LIMIT 1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(username)
        .bind(email)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to check for existing account")?;
    Ok(row.is_some())
}

/// Insert an account with a pending signup challenge.
///
/// A unique violation maps to `Conflict`: concurrent signups can both pass
/// the pre-check, and the constraint decides the winner.
pub(crate) async fn insert_account(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    account: &NewAccount<'_>,
    challenge_token_hash: &[u8],
) -> Result<SignupOutcome> {
    let query = r"
        INSERT INTO accounts
            (username, email, first_name, last_name, password_hash,
             is_verified, challenge_kind, challenge_token_hash)
        VALUES ($1, $2, $3, $4, $5, FALSE, 'signup', $6)
        RETURNING id
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(account.username)
        .bind(account.email)
        .bind(account.first_name)
        .bind(account.last_name)
        .bind(account.password_hash)
        .bind(challenge_token_hash)
        .fetch_one(&mut **tx)
        .instrument(span)
        .await;

    match row {
        Ok(row) => Ok(SignupOutcome::Created(row.get("id"))),
        Err(err) if is_unique_violation(&err) => Ok(SignupOutcome::Conflict),
        Err(err) => Err(err).context("failed to insert account"),
    }
}

/// Enqueue an outbox row in the caller's transaction, so mail only becomes
/// visible to the worker once the state change it announces has committed.
pub(crate) async fn enqueue_mail(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    to_email: &str,
    template: &str,
    payload: &Value,
) -> Result<()> {
    let payload_text = serde_json::to_string(payload).context("failed to serialize mail payload")?;
    let query = r"
        INSERT INTO mail_outbox (to_email, template, payload_json)
        VALUES ($1, $2, $3::jsonb)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(to_email)
        .bind(template)
        .bind(payload_text)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to insert mail outbox row")?;
    Ok(())
}

/// Look up an account by username or email for a credential check.
pub(crate) async fn find_account_for_login(
    pool: &PgPool,
    identifier: &str,
    email_normalized: &str,
) -> Result<Option<LoginAccount>> {
    let query = r"
        SELECT id, email, password_hash
        FROM accounts
        WHERE username = $1 OR email = $2
        LIMIT 1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(identifier)
        .bind(email_normalized)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup account for login")?;

    Ok(row.map(|row| LoginAccount {
        id: row.get("id"),
        email: row.get("email"),
        password_hash: row.get("password_hash"),
    }))
}

/// Overwrite the account's pending challenge with a fresh login challenge.
///
/// This supersedes an unconsumed signup challenge: at most one out-of-band
/// challenge exists per account, and the older link stops validating.
pub(crate) async fn set_login_challenge(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    account_id: Uuid,
    challenge_token_hash: &[u8],
) -> Result<()> {
    let query = r"
        UPDATE accounts
        SET challenge_kind = 'login',
            challenge_token_hash = $2,
            updated_at = NOW()
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
        .bind(challenge_token_hash)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to set login challenge")?;
    Ok(())
}

pub(crate) struct ChallengeAccount {
    pub(crate) id: Uuid,
    pub(crate) is_verified: bool,
}

/// Find the account holding a pending challenge of the given kind.
pub(crate) async fn find_account_by_challenge(
    pool: &PgPool,
    kind: ChallengeKind,
    token_hash: &[u8],
) -> Result<Option<ChallengeAccount>> {
    let query = r"
        SELECT id, is_verified
        FROM accounts
        WHERE challenge_kind = $1 AND challenge_token_hash = $2
        LIMIT 1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(kind.as_str())
        .bind(token_hash)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup account by challenge")?;

    Ok(row.map(|row| ChallengeAccount {
        id: row.get("id"),
        is_verified: row.get("is_verified"),
    }))
}

/// Mark an account verified and clear its challenge.
///
/// Guarded on `is_verified = FALSE`: if verification raced ahead, no row
/// comes back and the caller reports the account as already verified.
pub(crate) async fn finalize_verification(
    pool: &PgPool,
    account_id: Uuid,
) -> Result<Option<String>> {
    let query = r"
        UPDATE accounts
        SET is_verified = TRUE,
            challenge_kind = NULL,
            challenge_token_hash = NULL,
            updated_at = NOW()
        WHERE id = $1 AND is_verified = FALSE
        RETURNING role
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(account_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to finalize verification")?;
    Ok(row.map(|row| row.get("role")))
}

/// Atomically consume a login challenge, returning the account it belonged to.
pub(crate) async fn consume_login_challenge(
    pool: &PgPool,
    token_hash: &[u8],
) -> Result<Option<(Uuid, String)>> {
    let query = r"
        UPDATE accounts
        SET challenge_kind = NULL,
            challenge_token_hash = NULL,
            updated_at = NOW()
        WHERE challenge_kind = $2 AND challenge_token_hash = $1
        RETURNING id, role
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(token_hash)
        .bind(ChallengeKind::Login.as_str())
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to consume login challenge")?;
    Ok(row.map(|row| (row.get("id"), row.get("role"))))
}

/// Look up an account id by contact address (reset requests only).
pub(crate) async fn find_account_by_email(
    pool: &PgPool,
    email: &str,
) -> Result<Option<(Uuid, String)>> {
    let query = "SELECT id, email FROM accounts WHERE email = $1 LIMIT 1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(email)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup account by email")?;
    Ok(row.map(|row| (row.get("id"), row.get("email"))))
}

/// Issue a reset token pair, superseding any previous pair for the account.
pub(crate) async fn set_reset_token(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    account_id: Uuid,
    token_hash: &[u8],
    ttl_seconds: i64,
) -> Result<()> {
    let query = r"
        UPDATE accounts
        SET reset_token_hash = $2,
            reset_expires_at = NOW() + ($3 * INTERVAL '1 second'),
            updated_at = NOW()
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
        .bind(token_hash)
        .bind(ttl_seconds)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to set reset token")?;
    Ok(())
}

/// Check a reset token without consuming it (the view step).
///
/// An expired pair is treated as absent; it is not cleared eagerly.
pub(crate) async fn reset_token_valid(pool: &PgPool, token_hash: &[u8]) -> Result<bool> {
    let query = r"
        SELECT 1
        FROM accounts
        WHERE reset_token_hash = $1 AND reset_expires_at > NOW()
        LIMIT 1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(token_hash)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to check reset token")?;
    Ok(row.is_some())
}

/// Replace the password and clear the reset pair in one guarded update.
///
/// Token and expiry are re-validated here, never trusted from the view step.
pub(crate) async fn update_password_by_reset_token(
    pool: &PgPool,
    token_hash: &[u8],
    new_password_hash: &str,
) -> Result<bool> {
    let query = r"
        UPDATE accounts
        SET password_hash = $2,
            reset_token_hash = NULL,
            reset_expires_at = NULL,
            updated_at = NOW()
        WHERE reset_token_hash = $1 AND reset_expires_at > NOW()
        RETURNING id
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(token_hash)
        .bind(new_password_hash)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to update password by reset token")?;
    Ok(row.is_some())
}

pub(crate) async fn password_hash_for_account(
    pool: &PgPool,
    account_id: Uuid,
) -> Result<Option<String>> {
    let query = "SELECT password_hash FROM accounts WHERE id = $1";
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
        .context("failed to lookup password hash")?;
    Ok(row.map(|row| row.get("password_hash")))
}

pub(crate) async fn update_password(
    pool: &PgPool,
    account_id: Uuid,
    new_password_hash: &str,
) -> Result<()> {
    let query = r"
        UPDATE accounts
        SET password_hash = $2, updated_at = NOW()
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
        .bind(new_password_hash)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to update password")?;
    Ok(())
}

/// Create a fresh anonymous session, returning the record and the raw cookie
/// value. Only the digest is stored.
pub(crate) async fn insert_session(
    pool: &PgPool,
    ttl_seconds: i64,
) -> Result<(SessionRecord, String)> {
    let query = r"
        INSERT INTO sessions (token_hash, expires_at)
        VALUES ($1, NOW() + ($2 * INTERVAL '1 second'))
        RETURNING id
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );

    for _ in 0..3 {
        let token = generate_token()?;
        let token_hash = hash_token(&token);
        let result = sqlx::query(query)
            .bind(token_hash)
            .bind(ttl_seconds)
            .fetch_one(pool)
            .instrument(span.clone())
            .await;

        match result {
            Ok(row) => {
                let record = SessionRecord {
                    id: row.get("id"),
                    account_id: None,
                    email: None,
                    is_admin: false,
                    pending_account_id: None,
                };
                return Ok((record, token));
            }
            Err(err) if is_unique_violation(&err) => {}
            Err(err) => return Err(err).context("failed to insert session"),
        }
    }

    Err(anyhow!("failed to generate unique session token"))
}

/// Resolve an unexpired session by cookie digest.
pub(crate) async fn lookup_session(
    pool: &PgPool,
    token_hash: &[u8],
) -> Result<Option<SessionRecord>> {
    let query = r"
        SELECT sessions.id, sessions.account_id, sessions.is_admin,
               sessions.pending_account_id, accounts.email
        FROM sessions
        LEFT JOIN accounts ON accounts.id = sessions.account_id
        WHERE sessions.token_hash = $1
          AND sessions.expires_at > NOW()
        LIMIT 1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(token_hash)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup session")?;

    let Some(row) = row else {
        return Ok(None);
    };

    // Record activity for audit/visibility without extending the session TTL.
    let query = r"
        UPDATE sessions
        SET last_seen_at = NOW()
        WHERE token_hash = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(token_hash)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to update session last_seen_at")?;

    Ok(Some(SessionRecord {
        id: row.get("id"),
        account_id: row.get("account_id"),
        email: row.get("email"),
        is_admin: row.get("is_admin"),
        pending_account_id: row.get("pending_account_id"),
    }))
}

/// Record the narrow window between a followed signup link and finalization.
pub(crate) async fn set_pending_account(
    pool: &PgPool,
    session_id: Uuid,
    account_id: Uuid,
) -> Result<()> {
    let query = "UPDATE sessions SET pending_account_id = $2 WHERE id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(session_id)
        .bind(account_id)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to set pending account")?;
    Ok(())
}

/// Authenticate the session and clear any pending marker.
pub(crate) async fn promote_session(
    pool: &PgPool,
    session_id: Uuid,
    account_id: Uuid,
) -> Result<()> {
    let query = r"
        UPDATE sessions
        SET account_id = $2, pending_account_id = NULL
        WHERE id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(session_id)
        .bind(account_id)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to promote session")?;
    Ok(())
}

/// Store administrator challenge material on the session only.
pub(crate) async fn set_admin_challenge(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    session_id: Uuid,
    email: &str,
    token_hash: &[u8],
    ttl_seconds: i64,
) -> Result<()> {
    let query = r"
        UPDATE sessions
        SET admin_email = $2,
            admin_token_hash = $3,
            admin_expires_at = NOW() + ($4 * INTERVAL '1 second')
        WHERE id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(session_id)
        .bind(email)
        .bind(token_hash)
        .bind(ttl_seconds)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to set admin challenge")?;
    Ok(())
}

/// Grant the session administrator privilege if its challenge matches and has
/// not expired; the challenge is cleared in the same update.
pub(crate) async fn grant_admin(
    pool: &PgPool,
    session_id: Uuid,
    token_hash: &[u8],
) -> Result<bool> {
    let query = r"
        UPDATE sessions
        SET is_admin = TRUE,
            admin_email = NULL,
            admin_token_hash = NULL,
            admin_expires_at = NULL
        WHERE id = $1
          AND admin_token_hash = $2
          AND admin_expires_at > NOW()
        RETURNING id
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(session_id)
        .bind(token_hash)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to grant admin")?;
    Ok(row.is_some())
}

pub(crate) async fn set_notice(pool: &PgPool, session_id: Uuid, notice: &str) -> Result<()> {
    let query = "UPDATE sessions SET notice = $2 WHERE id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(session_id)
        .bind(notice)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to set notice")?;
    Ok(())
}

/// Read and clear the transient notice in one update.
pub(crate) async fn take_notice(pool: &PgPool, session_id: Uuid) -> Result<Option<String>> {
    let query = r"
        UPDATE sessions
        SET notice = NULL
        WHERE id = $1 AND notice IS NOT NULL
        RETURNING notice
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(session_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to take notice")?;
    Ok(row.map(|row| row.get("notice")))
}

/// Logout is idempotent; it's fine if no rows are deleted.
pub(crate) async fn delete_session(pool: &PgPool, token_hash: &[u8]) -> Result<()> {
    let query = "DELETE FROM sessions WHERE token_hash = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(token_hash)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to delete session")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{ChallengeKind, LoginAccount, SessionRecord, SignupOutcome};
    use uuid::Uuid;

    #[test]
    fn challenge_kind_db_names() {
        assert_eq!(ChallengeKind::Signup.as_str(), "signup");
        assert_eq!(ChallengeKind::Login.as_str(), "login");
    }

    #[test]
    fn signup_outcome_debug_names() {
        assert_eq!(
            format!("{:?}", SignupOutcome::Created(Uuid::nil())),
            format!("Created({})", Uuid::nil())
        );
        assert_eq!(format!("{:?}", SignupOutcome::Conflict), "Conflict");
    }

    #[test]
    fn login_account_holds_values() {
        let record = LoginAccount {
            id: Uuid::nil(),
            email: "alice@example.com".to_string(),
            password_hash: "$argon2id$stub".to_string(),
        };
        assert_eq!(record.id, Uuid::nil());
        assert_eq!(record.email, "alice@example.com");
    }

    #[test]
    fn session_record_defaults_are_anonymous() {
        let record = SessionRecord {
            id: Uuid::nil(),
            account_id: None,
            email: None,
            is_admin: false,
            pending_account_id: None,
        };
        assert!(record.account_id.is_none());
        assert!(!record.is_admin);
    }
}
