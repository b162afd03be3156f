use anyhow::{Result, bail};
use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

pub const ARG_API_AUTH_TOKEN: &str = "api-auth-token";
pub const ARG_BASE_URL: &str = "base-url";
pub const ARG_EMAIL_RESEND_COOLDOWN_SECONDS: &str = "email-resend-cooldown-seconds";

#[derive(Debug, Clone)]
pub struct Options {
    pub api_token: SecretString,
    pub base_url: String,
    pub resend_cooldown_seconds: u64,
}

impl Options {
    /// # Errors
    /// Returns an error if the API token is missing or blank.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let api_token = match matches.get_one::<String>(ARG_API_AUTH_TOKEN) {
            Some(token) if !token.trim().is_empty() => SecretString::from(token.trim().to_string()),
            _ => bail!("missing required argument: --{ARG_API_AUTH_TOKEN}"),
        };

        Ok(Self {
            api_token,
            base_url: matches
                .get_one::<String>(ARG_BASE_URL)
                .cloned()
                .unwrap_or_else(|| "http://localhost:8080".to_string()),
            resend_cooldown_seconds: matches
                .get_one::<u64>(ARG_EMAIL_RESEND_COOLDOWN_SECONDS)
                .copied()
                .unwrap_or(60),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_API_AUTH_TOKEN)
                .long(ARG_API_AUTH_TOKEN)
                .help("Static bearer token required on /api routes")
                .env("API_AUTH_TOKEN")
                .hide_env_values(true),
        )
        .arg(
            Arg::new(ARG_BASE_URL)
                .long(ARG_BASE_URL)
                .help("Public base URL used to build verification links")
                .env("ZEROWORK_BASE_URL")
                .default_value("http://localhost:8080"),
        )
        .arg(
            Arg::new(ARG_EMAIL_RESEND_COOLDOWN_SECONDS)
                .long(ARG_EMAIL_RESEND_COOLDOWN_SECONDS)
                .help("Cooldown before resending verification emails")
                .env("ZEROWORK_EMAIL_RESEND_COOLDOWN_SECONDS")
                .default_value("60")
                .value_parser(clap::value_parser!(u64)),
        )
}
