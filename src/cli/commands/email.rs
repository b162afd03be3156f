use anyhow::Result;
use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

pub const ARG_SMTP_SERVER: &str = "smtp-server";
pub const ARG_SMTP_PORT: &str = "smtp-port";
pub const ARG_SMTP_USER: &str = "smtp-user";
pub const ARG_SMTP_PASSWORD: &str = "smtp-password";
pub const ARG_MAIL_FROM_NAME: &str = "mail-from-name";
pub const ARG_CONTACT_ADMIN_EMAIL: &str = "contact-admin-email";

#[derive(Debug, Clone)]
pub struct Smtp {
    pub server: String,
    pub port: u16,
    pub user: String,
    pub password: SecretString,
}

#[derive(Debug, Clone)]
pub struct Outbox {
    pub poll_seconds: u64,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub backoff_base_seconds: u64,
    pub backoff_max_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct Options {
    /// `None` when no SMTP credentials were given; mail is then only logged.
    pub smtp: Option<Smtp>,
    pub from_name: String,
    pub contact_admin_email: String,
    pub outbox: Outbox,
}

impl Options {
    /// # Errors
    /// Returns an error if only one of the SMTP user and password is set.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let get_non_empty = |id: &str| {
            matches
                .get_one::<String>(id)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let smtp = match (get_non_empty(ARG_SMTP_USER), get_non_empty(ARG_SMTP_PASSWORD)) {
            (Some(user), Some(password)) => Some(Smtp {
                server: get_non_empty(ARG_SMTP_SERVER)
                    .unwrap_or_else(|| "smtp.gmail.com".to_string()),
                port: matches.get_one::<u16>(ARG_SMTP_PORT).copied().unwrap_or(587),
                user,
                password: SecretString::from(password),
            }),
            (None, None) => None,
            (Some(_), None) => anyhow::bail!("--{ARG_SMTP_USER} requires --{ARG_SMTP_PASSWORD}"),
            (None, Some(_)) => anyhow::bail!("--{ARG_SMTP_PASSWORD} requires --{ARG_SMTP_USER}"),
        };

        let get_u64 =
            |id: &str, default: u64| matches.get_one::<u64>(id).copied().unwrap_or(default);

        Ok(Self {
            smtp,
            from_name: get_non_empty(ARG_MAIL_FROM_NAME).unwrap_or_else(|| "ZeroWork".to_string()),
            contact_admin_email: get_non_empty(ARG_CONTACT_ADMIN_EMAIL)
                .unwrap_or_else(|| "zeroworkia@gmail.com".to_string()),
            outbox: Outbox {
                poll_seconds: get_u64("email-outbox-poll-seconds", 5),
                batch_size: matches
                    .get_one::<usize>("email-outbox-batch-size")
                    .copied()
                    .unwrap_or(10),
                max_attempts: matches
                    .get_one::<u32>("email-outbox-max-attempts")
                    .copied()
                    .unwrap_or(5),
                backoff_base_seconds: get_u64("email-outbox-backoff-base-seconds", 5),
                backoff_max_seconds: get_u64("email-outbox-backoff-max-seconds", 300),
            },
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_smtp_args(command);
    with_outbox_args(command)
}

fn with_smtp_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_SMTP_SERVER)
                .long(ARG_SMTP_SERVER)
                .help("SMTP relay host (STARTTLS)")
                .env("SMTP_SERVER")
                .default_value("smtp.gmail.com"),
        )
        .arg(
            Arg::new(ARG_SMTP_PORT)
                .long(ARG_SMTP_PORT)
                .help("SMTP relay port")
                .env("SMTP_PORT")
                .default_value("587")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new(ARG_SMTP_USER)
                .long(ARG_SMTP_USER)
                .help("SMTP username, also used as the sender address")
                .env("SMTP_USER"),
        )
        .arg(
            Arg::new(ARG_SMTP_PASSWORD)
                .long(ARG_SMTP_PASSWORD)
                .help("SMTP password")
                .env("SMTP_PASSWORD")
                .hide_env_values(true),
        )
        .arg(
            Arg::new(ARG_MAIL_FROM_NAME)
                .long(ARG_MAIL_FROM_NAME)
                .help("Display name of outgoing emails")
                .env("ZEROWORK_MAIL_FROM_NAME")
                .default_value("ZeroWork"),
        )
        .arg(
            Arg::new(ARG_CONTACT_ADMIN_EMAIL)
                .long(ARG_CONTACT_ADMIN_EMAIL)
                .help("Address notified of new contact form submissions")
                .env("ZEROWORK_CONTACT_ADMIN_EMAIL")
                .default_value("zeroworkia@gmail.com"),
        )
}

fn with_outbox_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("email-outbox-poll-seconds")
                .long("email-outbox-poll-seconds")
                .help("Email outbox poll interval in seconds")
                .env("ZEROWORK_EMAIL_OUTBOX_POLL_SECONDS")
                .default_value("5")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("email-outbox-batch-size")
                .long("email-outbox-batch-size")
                .help("Email outbox batch size per poll")
                .env("ZEROWORK_EMAIL_OUTBOX_BATCH_SIZE")
                .default_value("10")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("email-outbox-max-attempts")
                .long("email-outbox-max-attempts")
                .help("Max attempts before marking an email as failed")
                .env("ZEROWORK_EMAIL_OUTBOX_MAX_ATTEMPTS")
                .default_value("5")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("email-outbox-backoff-base-seconds")
                .long("email-outbox-backoff-base-seconds")
                .help("Base delay for email outbox retry backoff")
                .env("ZEROWORK_EMAIL_OUTBOX_BACKOFF_BASE_SECONDS")
                .default_value("5")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("email-outbox-backoff-max-seconds")
                .long("email-outbox-backoff-max-seconds")
                .help("Max delay for email outbox retry backoff")
                .env("ZEROWORK_EMAIL_OUTBOX_BACKOFF_MAX_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(u64)),
        )
}
