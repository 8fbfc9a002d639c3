//! Command-line argument dispatch and server initialization.
//!
//! This module maps validated CLI arguments to the appropriate action, such
//! as starting the API server with its full configuration state.

use crate::cli::actions::{server::Args, Action};
use crate::cli::commands::{auth, mail};
use anyhow::{Context, Result};

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>("dsn")
        .cloned()
        .context("missing required argument: --dsn")?;

    let auth_opts = auth::Options::parse(matches)?;
    let mail_opts = mail::Options::parse(matches);

    Ok(Action::Server(Box::new(Args {
        port,
        dsn,
        public_base_url: auth_opts.public_base_url,
        admin_secret: auth_opts.admin_secret,
        session_ttl_seconds: auth_opts.session_ttl_seconds,
        reset_token_ttl_seconds: auth_opts.reset_token_ttl_seconds,
        admin_challenge_ttl_seconds: auth_opts.admin_challenge_ttl_seconds,
        mail_outbox_poll_seconds: mail_opts.poll_seconds,
        mail_outbox_batch_size: mail_opts.batch_size,
        mail_outbox_max_attempts: mail_opts.max_attempts,
        mail_outbox_backoff_base_seconds: mail_opts.backoff_base_seconds,
        mail_outbox_backoff_max_seconds: mail_opts.backoff_max_seconds,
        mail_from_address: mail_opts.from_address,
        smtp: mail_opts.smtp,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_secret_required() {
        temp_env::with_vars(
            [
                ("SYMPOSIA_ADMIN_SECRET", None::<&str>),
                ("SYMPOSIA_DSN", Some("postgres://localhost/symposia")),
            ],
            || {
                let command = crate::cli::commands::new();
                let result = command.try_get_matches_from(vec!["symposia"]);
                assert!(result.is_err());
            },
        );
    }

    #[test]
    fn handler_builds_server_action() -> Result<()> {
        temp_env::with_vars(
            [
                ("SYMPOSIA_DSN", Some("postgres://localhost/symposia")),
                ("SYMPOSIA_ADMIN_SECRET", Some("sesame")),
            ],
            || -> Result<()> {
                let command = crate::cli::commands::new();
                let matches = command.get_matches_from(vec!["symposia", "--port", "9090"]);
                let Action::Server(args) = handler(&matches)?;
                assert_eq!(args.port, 9090);
                assert_eq!(args.dsn, "postgres://localhost/symposia");
                assert!(args.smtp.is_none());
                Ok(())
            },
        )
    }
}
