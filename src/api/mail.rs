//! Mail outbox worker and delivery abstractions.
//!
//! Verification, login, administrator, and reset flows enqueue rows in
//! `mail_outbox` inside the same transaction as the state change they
//! announce, so a mailed link always references a token the reader can find.
//! A background task periodically polls that table, locks a batch via
//! `FOR UPDATE SKIP LOCKED`, renders the message, and hands it to a
//! `MailSender`. The worker then updates the outbox row to `sent` or
//! `failed`.
//!
//! Delivery is best-effort from the flows' perspective: a failed send never
//! rolls back the state transition that preceded it. Failed rows are retried
//! with exponential backoff and jitter until a max attempt threshold is
//! reached, then marked `failed` and surfaced to the operator through logs.
//!
//! The default sender when no SMTP relay is configured is `LogMailSender`,
//! which logs the rendered message and returns `Ok(())`.

use anyhow::{anyhow, Context, Result};
use lettre::{
    message::header::ContentType,
    transport::smtp::{
        authentication::Credentials,
        client::{Tls, TlsParameters},
        PoolConfig,
    },
    Message, SmtpTransport, Transport,
};
use rand::Rng;
use secrecy::ExposeSecret;
use serde_json::Value;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::cli::commands::mail::SmtpOptions;

pub(crate) const TEMPLATE_VERIFY_SIGNUP: &str = "verify_signup";
pub(crate) const TEMPLATE_VERIFY_LOGIN: &str = "verify_login";
pub(crate) const TEMPLATE_ADMIN_LOGIN: &str = "admin_login";
pub(crate) const TEMPLATE_RESET_PASSWORD: &str = "reset_password";
pub(crate) const TEMPLATE_REGISTRATION_CONFIRMATION: &str = "registration_confirmation";

#[derive(Clone, Debug)]
pub struct MailMessage {
    pub to_email: String,
    pub template: String,
    pub payload_json: String,
}

/// Mail delivery abstraction used by the outbox worker.
pub trait MailSender: Send + Sync {
    /// Deliver a message or return an error to mark it as failed.
    fn send(&self, message: &MailMessage) -> Result<()>;
}

/// Render an outbox row into a subject and a plain-text body.
pub(crate) fn render(message: &MailMessage) -> Result<(String, String)> {
    let payload: Value =
        serde_json::from_str(&message.payload_json).context("invalid mail payload JSON")?;
    let field = |name: &str| -> Result<&str> {
        payload
            .get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("mail payload missing field: {name}"))
    };

    match message.template.as_str() {
        TEMPLATE_VERIFY_SIGNUP => {
            let verify_url = field("verify_url")?;
            Ok((
                "Verify your Symposia account".to_string(),
                format!(
                    "Welcome to Symposia!\n\n\
                     Click this link to verify your account:\n\n{verify_url}\n\n\
                     If you did not create this account, you can ignore this message.\n\n\
                     The Symposia Team"
                ),
            ))
        }
        TEMPLATE_VERIFY_LOGIN => {
            let confirm_url = field("confirm_url")?;
            Ok((
                "Confirm your Symposia login".to_string(),
                format!(
                    "A login to your Symposia account was requested.\n\n\
                     Click the link to confirm your login:\n\n{confirm_url}\n\n\
                     If this was not you, change your password.\n\n\
                     The Symposia Team"
                ),
            ))
        }
        TEMPLATE_ADMIN_LOGIN => {
            let confirm_url = field("confirm_url")?;
            Ok((
                "Confirm Symposia administrator login".to_string(),
                format!(
                    "An administrator login was requested for this address.\n\n\
                     Click the link to confirm:\n\n{confirm_url}\n\n\
                     If this was not you, ignore this message.\n\n\
                     The Symposia Team"
                ),
            ))
        }
        TEMPLATE_RESET_PASSWORD => {
            let reset_url = field("reset_url")?;
            Ok((
                "Symposia password reset".to_string(),
                format!(
                    "A password reset was requested for your Symposia account.\n\n\
                     Click the link to choose a new password:\n\n{reset_url}\n\n\
                     The link expires in one hour. If you did not request this\n\
                     reset, ignore this message and your password stays unchanged.\n\n\
                     The Symposia Team"
                ),
            ))
        }
        TEMPLATE_REGISTRATION_CONFIRMATION => {
            let first_name = field("first_name")?;
            Ok((
                "Symposia registration confirmation".to_string(),
                format!(
                    "Dear {first_name},\n\n\
                     Thank you for registering for the Symposia conference.\n\n\
                     Your registration details are available any time from your\n\
                     dashboard. Hotel accommodations must be arranged separately.\n\n\
                     We look forward to seeing you there!\n\n\
                     The Symposia Team"
                ),
            ))
        }
        other => Err(anyhow!("unknown mail template: {other}")),
    }
}

/// Sender used when no SMTP relay is configured: logs and reports success.
#[derive(Clone, Debug)]
pub struct LogMailSender {
    from_address: String,
}

impl LogMailSender {
    #[must_use]
    pub fn new(from_address: String) -> Self {
        Self { from_address }
    }
}

impl MailSender for LogMailSender {
    fn send(&self, message: &MailMessage) -> Result<()> {
        let (subject, _body) = render(message)?;
        info!(
            from = %self.from_address,
            to_email = %message.to_email,
            template = %message.template,
            subject = %subject,
            payload = %message.payload_json,
            "mail outbox send stub"
        );
        Ok(())
    }
}

/// Sender that delivers through an SMTP relay over TLS.
pub struct SmtpMailSender {
    transport: SmtpTransport,
    from_address: String,
}

impl SmtpMailSender {
    /// # Errors
    /// Returns an error if the relay host or TLS parameters are invalid.
    pub fn new(options: &SmtpOptions, from_address: String) -> Result<Self> {
        let tls_parameters = TlsParameters::new(options.host.clone())
            .context("failed to build SMTP TLS parameters")?;

        let mut builder = SmtpTransport::relay(&options.host)
            .context("failed to create SMTP transport")?
            .port(options.port)
            .tls(Tls::Required(tls_parameters))
            .pool_config(PoolConfig::new().max_size(1))
            .timeout(Some(Duration::from_secs(10)));

        if let (Some(username), Some(password)) = (&options.username, &options.password) {
            builder = builder.credentials(Credentials::new(
                username.clone(),
                password.expose_secret().to_string(),
            ));
        }

        Ok(Self {
            transport: builder.build(),
            from_address,
        })
    }
}

impl MailSender for SmtpMailSender {
    fn send(&self, message: &MailMessage) -> Result<()> {
        let (subject, body) = render(message)?;
        let email = Message::builder()
            .from(
                self.from_address
                    .parse()
                    .context("invalid from address")?,
            )
            .to(message.to_email.parse().context("invalid to address")?)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body)
            .context("failed to build mail message")?;

        self.transport
            .send(&email)
            .context("failed to send mail through SMTP relay")?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct MailWorkerConfig {
    poll_interval: Duration,
    batch_size: usize,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl MailWorkerConfig {
    /// Default worker config: 5s poll interval, 10 messages per batch,
    /// 5 max attempts, and 5s->5m exponential backoff with jitter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 10,
            max_attempts: 5,
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
        }
    }

    #[must_use]
    pub fn with_poll_interval_seconds(mut self, seconds: u64) -> Self {
        self.poll_interval = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_backoff_base_seconds(mut self, seconds: u64) -> Self {
        self.backoff_base = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn with_backoff_max_seconds(mut self, seconds: u64) -> Self {
        self.backoff_max = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn normalize(self) -> Self {
        let poll_interval = if self.poll_interval.is_zero() {
            Duration::from_secs(1)
        } else {
            self.poll_interval
        };
        let batch_size = if self.batch_size == 0 {
            1
        } else {
            self.batch_size
        };
        let max_attempts = self.max_attempts.max(1);
        let backoff_base = if self.backoff_base.is_zero() {
            Duration::from_secs(1)
        } else {
            self.backoff_base
        };
        let backoff_max = if self.backoff_max < backoff_base {
            backoff_base
        } else {
            self.backoff_max
        };
        Self {
            poll_interval,
            batch_size,
            max_attempts,
            backoff_base,
            backoff_max,
        }
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn backoff_base(&self) -> Duration {
        self.backoff_base
    }

    #[must_use]
    pub fn backoff_max(&self) -> Duration {
        self.backoff_max
    }
}

impl Default for MailWorkerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn a background task that polls and processes the mail outbox.
pub fn spawn_outbox_worker(
    pool: PgPool,
    sender: Arc<dyn MailSender>,
    config: MailWorkerConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let config = config.normalize();
        let poll_interval = config.poll_interval();

        loop {
            let batch_result = process_outbox_batch(&pool, sender.as_ref(), &config).await;
            if let Err(err) = batch_result {
                error!("mail outbox batch failed: {err}");
            }

            sleep(poll_interval).await;
        }
    })
}

async fn process_outbox_batch(
    pool: &PgPool,
    sender: &dyn MailSender,
    config: &MailWorkerConfig,
) -> Result<usize> {
    let mut tx = pool
        .begin()
        .await
        .context("failed to start mail outbox transaction")?;

    // Grab a locked batch so multiple workers can run without double-sending.
    let query = r"
        SELECT id, to_email, template, payload_json::text AS payload_json, attempts
        FROM mail_outbox
        WHERE status = 'pending'
          AND next_attempt_at <= NOW()
        ORDER BY next_attempt_at ASC, created_at ASC
        LIMIT $1
        FOR UPDATE SKIP LOCKED
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let rows = sqlx::query(query)
        .bind(i64::try_from(config.batch_size()).unwrap_or(0))
        .fetch_all(&mut *tx)
        .instrument(span)
        .await
        .context("failed to load mail outbox batch")?;

    if rows.is_empty() {
        // Commit even on empty to release locks and keep the poll loop consistent.
        tx.commit()
            .await
            .context("failed to commit empty outbox batch")?;
        return Ok(0);
    }

    let row_count = rows.len();
    for row in rows {
        let id: Uuid = row.get("id");
        let attempts: i32 = row.get("attempts");
        let attempts = u32::try_from(attempts).unwrap_or(0);
        let message = MailMessage {
            to_email: row.get("to_email"),
            template: row.get("template"),
            payload_json: row.get("payload_json"),
        };

        let send_result = sender.send(&message);
        update_outbox_status(&mut tx, id, attempts, send_result, config).await?;
    }

    tx.commit()
        .await
        .context("failed to commit mail outbox batch")?;

    Ok(row_count)
}

async fn update_outbox_status(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    id: Uuid,
    attempts: u32,
    send_result: Result<()>,
    config: &MailWorkerConfig,
) -> Result<()> {
    // Retry failures with exponential backoff and jitter until max_attempts.
    let next_attempt = attempts.saturating_add(1);
    let next_attempts_i32 = i32::try_from(next_attempt).unwrap_or(i32::MAX);
    match send_result {
        Ok(()) => {
            let query = r"
                UPDATE mail_outbox
                SET status = 'sent',
                    attempts = $2,
                    last_error = NULL,
                    sent_at = NOW(),
                    next_attempt_at = NOW()
                WHERE id = $1
            ";
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "UPDATE",
                db.statement = query
            );
            sqlx::query(query)
                .bind(id)
                .bind(next_attempts_i32)
                .execute(&mut **tx)
                .instrument(span)
                .await
                .context("failed to update outbox status to sent")?;
        }
        Err(err) => {
            let max_attempts = config.max_attempts();
            if next_attempt >= max_attempts {
                let query = r"
                    UPDATE mail_outbox
                    SET status = 'failed',
                        attempts = $2,
                        last_error = $3,
                        next_attempt_at = NOW()
                    WHERE id = $1
                ";
                let span = info_span!(
                    "db.query",
                    db.system = "postgresql",
                    db.operation = "UPDATE",
                    db.statement = query
                );
                sqlx::query(query)
                    .bind(id)
                    .bind(next_attempts_i32)
                    .bind(err.to_string())
                    .execute(&mut **tx)
                    .instrument(span)
                    .await
                    .context("failed to update outbox status to failed")?;
            } else {
                let delay =
                    backoff_delay(next_attempt, config.backoff_base(), config.backoff_max());
                let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
                let query = r"
                    UPDATE mail_outbox
                    SET status = 'pending',
                        attempts = $2,
                        last_error = $3,
                        next_attempt_at = NOW() + ($4 * INTERVAL '1 millisecond')
                    WHERE id = $1
                ";
                let span = info_span!(
                    "db.query",
                    db.system = "postgresql",
                    db.operation = "UPDATE",
                    db.statement = query
                );
                sqlx::query(query)
                    .bind(id)
                    .bind(next_attempts_i32)
                    .bind(err.to_string())
                    .bind(delay_ms)
                    .execute(&mut **tx)
                    .instrument(span)
                    .await
                    .context("failed to update outbox retry schedule")?;
            }
        }
    }

    Ok(())
}

fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    let factor = 1u32 << shift;
    let delay = base.checked_mul(factor).unwrap_or(max);
    let capped = if delay > max { max } else { delay };
    jitter_delay(capped)
}

fn jitter_delay(delay: Duration) -> Duration {
    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    if delay_ms < 2 {
        return delay;
    }
    let half = delay_ms / 2;
    let jitter = rand::thread_rng().gen_range(0..=half);
    Duration::from_millis(half + jitter)
}
