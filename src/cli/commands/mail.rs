//! Mail outbox and SMTP relay arguments.

use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_outbox_args(command);
    with_smtp_args(command)
}

fn with_outbox_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("mail-outbox-poll-seconds")
                .long("mail-outbox-poll-seconds")
                .help("Mail outbox poll interval in seconds")
                .env("SYMPOSIA_MAIL_OUTBOX_POLL_SECONDS")
                .default_value("5")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("mail-outbox-batch-size")
                .long("mail-outbox-batch-size")
                .help("Mail outbox batch size per poll")
                .env("SYMPOSIA_MAIL_OUTBOX_BATCH_SIZE")
                .default_value("10")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("mail-outbox-max-attempts")
                .long("mail-outbox-max-attempts")
                .help("Max attempts before marking a message as failed")
                .env("SYMPOSIA_MAIL_OUTBOX_MAX_ATTEMPTS")
                .default_value("5")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("mail-outbox-backoff-base-seconds")
                .long("mail-outbox-backoff-base-seconds")
                .help("Base delay for mail outbox retry backoff")
                .env("SYMPOSIA_MAIL_OUTBOX_BACKOFF_BASE_SECONDS")
                .default_value("5")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("mail-outbox-backoff-max-seconds")
                .long("mail-outbox-backoff-max-seconds")
                .help("Max delay for mail outbox retry backoff")
                .env("SYMPOSIA_MAIL_OUTBOX_BACKOFF_MAX_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(u64)),
        )
}

fn with_smtp_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("smtp-host")
                .long("smtp-host")
                .help("SMTP relay host; outbound mail is logged when unset")
                .env("SYMPOSIA_SMTP_HOST"),
        )
        .arg(
            Arg::new("smtp-port")
                .long("smtp-port")
                .help("SMTP relay port")
                .env("SYMPOSIA_SMTP_PORT")
                .default_value("587")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("smtp-username")
                .long("smtp-username")
                .help("SMTP relay username")
                .env("SYMPOSIA_SMTP_USERNAME"),
        )
        .arg(
            Arg::new("smtp-password")
                .long("smtp-password")
                .help("SMTP relay password")
                .env("SYMPOSIA_SMTP_PASSWORD"),
        )
        .arg(
            Arg::new("mail-from")
                .long("mail-from")
                .help("From address for outbound mail")
                .env("SYMPOSIA_MAIL_FROM")
                .default_value("Symposia <no-reply@symposia.dev>"),
        )
}

#[derive(Debug, Clone)]
pub struct SmtpOptions {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<SecretString>,
}

#[derive(Debug)]
pub struct Options {
    pub poll_seconds: u64,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub backoff_base_seconds: u64,
    pub backoff_max_seconds: u64,
    pub from_address: String,
    pub smtp: Option<SmtpOptions>,
}

impl Options {
    #[must_use]
    pub fn parse(matches: &ArgMatches) -> Self {
        let smtp = matches
            .get_one::<String>("smtp-host")
            .cloned()
            .map(|host| SmtpOptions {
                host,
                port: matches.get_one::<u16>("smtp-port").copied().unwrap_or(587),
                username: matches.get_one::<String>("smtp-username").cloned(),
                password: matches
                    .get_one::<String>("smtp-password")
                    .cloned()
                    .map(SecretString::from),
            });

        Self {
            poll_seconds: matches
                .get_one::<u64>("mail-outbox-poll-seconds")
                .copied()
                .unwrap_or(5),
            batch_size: matches
                .get_one::<usize>("mail-outbox-batch-size")
                .copied()
                .unwrap_or(10),
            max_attempts: matches
                .get_one::<u32>("mail-outbox-max-attempts")
                .copied()
                .unwrap_or(5),
            backoff_base_seconds: matches
                .get_one::<u64>("mail-outbox-backoff-base-seconds")
                .copied()
                .unwrap_or(5),
            backoff_max_seconds: matches
                .get_one::<u64>("mail-outbox-backoff-max-seconds")
                .copied()
                .unwrap_or(300),
            from_address: matches
                .get_one::<String>("mail-from")
                .cloned()
                .unwrap_or_else(|| "Symposia <no-reply@symposia.dev>".to_string()),
            smtp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_without_smtp() {
        temp_env::with_vars(
            [
                ("SYMPOSIA_DSN", Some("postgres://localhost/symposia")),
                ("SYMPOSIA_ADMIN_SECRET", Some("sesame")),
                ("SYMPOSIA_SMTP_HOST", None),
            ],
            || {
                let command = crate::cli::commands::new();
                let matches = command.get_matches_from(vec!["symposia"]);
                let options = Options::parse(&matches);
                assert!(options.smtp.is_none());
                assert_eq!(options.poll_seconds, 5);
                assert_eq!(options.batch_size, 10);
                assert_eq!(options.max_attempts, 5);
            },
        );
    }

    #[test]
    fn parse_with_smtp() {
        temp_env::with_vars(
            [
                ("SYMPOSIA_DSN", Some("postgres://localhost/symposia")),
                ("SYMPOSIA_ADMIN_SECRET", Some("sesame")),
                ("SYMPOSIA_SMTP_HOST", Some("smtp.example.com")),
                ("SYMPOSIA_SMTP_PORT", Some("465")),
            ],
            || {
                let command = crate::cli::commands::new();
                let matches = command.get_matches_from(vec!["symposia"]);
                let options = Options::parse(&matches);
                let smtp = options.smtp.expect("smtp options");
                assert_eq!(smtp.host, "smtp.example.com");
                assert_eq!(smtp.port, 465);
            },
        );
    }
}
