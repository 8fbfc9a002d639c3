//! Auth, session, and administrator-challenge arguments.

use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("public-base-url")
                .long("public-base-url")
                .help("Public base URL used for verification and login links")
                .env("SYMPOSIA_PUBLIC_BASE_URL")
                .default_value("https://symposia.dev"),
        )
        .arg(
            Arg::new("admin-secret")
                .long("admin-secret")
                .help("Shared secret that starts an administrator challenge at login")
                .env("SYMPOSIA_ADMIN_SECRET")
                .required(true),
        )
        .arg(
            Arg::new("session-ttl-seconds")
                .long("session-ttl-seconds")
                .help("Session cookie TTL in seconds")
                .env("SYMPOSIA_SESSION_TTL_SECONDS")
                .default_value("604800")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("reset-token-ttl-seconds")
                .long("reset-token-ttl-seconds")
                .help("Password reset token TTL in seconds")
                .env("SYMPOSIA_RESET_TOKEN_TTL_SECONDS")
                .default_value("3600")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("admin-challenge-ttl-seconds")
                .long("admin-challenge-ttl-seconds")
                .help("Administrator challenge TTL in seconds")
                .env("SYMPOSIA_ADMIN_CHALLENGE_TTL_SECONDS")
                .default_value("900")
                .value_parser(clap::value_parser!(i64)),
        )
}

#[derive(Debug)]
pub struct Options {
    pub public_base_url: String,
    pub admin_secret: SecretString,
    pub session_ttl_seconds: i64,
    pub reset_token_ttl_seconds: i64,
    pub admin_challenge_ttl_seconds: i64,
}

impl Options {
    /// # Errors
    /// Returns an error if a required argument is missing.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        Ok(Self {
            public_base_url: matches
                .get_one::<String>("public-base-url")
                .cloned()
                .context("missing required argument: --public-base-url")?,
            admin_secret: matches
                .get_one::<String>("admin-secret")
                .cloned()
                .map(SecretString::from)
                .context("missing required argument: --admin-secret")?,
            session_ttl_seconds: matches
                .get_one::<i64>("session-ttl-seconds")
                .copied()
                .unwrap_or(604_800),
            reset_token_ttl_seconds: matches
                .get_one::<i64>("reset-token-ttl-seconds")
                .copied()
                .unwrap_or(3600),
            admin_challenge_ttl_seconds: matches
                .get_one::<i64>("admin-challenge-ttl-seconds")
                .copied()
                .unwrap_or(900),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn parse_defaults() -> Result<()> {
        temp_env::with_vars(
            [
                ("SYMPOSIA_DSN", Some("postgres://localhost/symposia")),
                ("SYMPOSIA_ADMIN_SECRET", Some("sesame")),
            ],
            || -> Result<()> {
                let command = crate::cli::commands::new();
                let matches = command.get_matches_from(vec!["symposia"]);
                let options = Options::parse(&matches)?;
                assert_eq!(options.public_base_url, "https://symposia.dev");
                assert_eq!(options.admin_secret.expose_secret(), "sesame");
                assert_eq!(options.session_ttl_seconds, 604_800);
                assert_eq!(options.reset_token_ttl_seconds, 3600);
                assert_eq!(options.admin_challenge_ttl_seconds, 900);
                Ok(())
            },
        )
    }
}
