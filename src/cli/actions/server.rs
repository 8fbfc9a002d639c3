use crate::api::{
    self,
    handlers::auth::AuthConfig,
    mail::{LogMailSender, MailSender, MailWorkerConfig, SmtpMailSender},
};
use crate::cli::actions::Action;
use anyhow::{Context, Result};
use secrecy::SecretString;
use std::sync::Arc;

/// Everything the server action needs, parsed and validated by the CLI layer.
#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub public_base_url: String,
    pub admin_secret: SecretString,
    pub session_ttl_seconds: i64,
    pub reset_token_ttl_seconds: i64,
    pub admin_challenge_ttl_seconds: i64,
    pub mail_outbox_poll_seconds: u64,
    pub mail_outbox_batch_size: usize,
    pub mail_outbox_max_attempts: u32,
    pub mail_outbox_backoff_base_seconds: u64,
    pub mail_outbox_backoff_max_seconds: u64,
    pub mail_from_address: String,
    pub smtp: Option<crate::cli::commands::mail::SmtpOptions>,
}

/// Handle the server action
pub async fn handle(action: Action) -> Result<()> {
    let Action::Server(args) = action;

    let auth_config = AuthConfig::new(args.public_base_url.clone(), args.admin_secret.clone())
        .with_session_ttl_seconds(args.session_ttl_seconds)
        .with_reset_token_ttl_seconds(args.reset_token_ttl_seconds)
        .with_admin_challenge_ttl_seconds(args.admin_challenge_ttl_seconds);

    let mail_config = MailWorkerConfig::new()
        .with_poll_interval_seconds(args.mail_outbox_poll_seconds)
        .with_batch_size(args.mail_outbox_batch_size)
        .with_max_attempts(args.mail_outbox_max_attempts)
        .with_backoff_base_seconds(args.mail_outbox_backoff_base_seconds)
        .with_backoff_max_seconds(args.mail_outbox_backoff_max_seconds);

    let mail_sender: Arc<dyn MailSender> = match &args.smtp {
        Some(smtp) => Arc::new(
            SmtpMailSender::new(smtp, args.mail_from_address.clone())
                .context("Failed to build SMTP mail sender")?,
        ),
        None => Arc::new(LogMailSender::new(args.mail_from_address.clone())),
    };

    api::new(args.port, args.dsn, auth_config, mail_config, mail_sender).await
}
