use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command, builder::PossibleValuesParser};

use crate::verification::{MAX_TOKEN_TTL, TokenStoreKind};

pub const ARG_TOKEN_STORE: &str = "token-store";
pub const ARG_EMAIL_TOKEN_TTL_SECONDS: &str = "email-token-ttl-seconds";
pub const ARG_TOKEN_SWEEP_SECONDS: &str = "token-sweep-seconds";

#[derive(Debug, Clone)]
pub struct Options {
    pub kind: TokenStoreKind,
    pub ttl_seconds: u64,
    pub sweep_seconds: u64,
}

impl Options {
    /// # Errors
    /// Returns an error if the store kind is unknown.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let kind = matches
            .get_one::<String>(ARG_TOKEN_STORE)
            .map_or("memory", String::as_str);
        let kind = TokenStoreKind::parse(kind)
            .with_context(|| format!("invalid --{ARG_TOKEN_STORE}: {kind}"))?;

        Ok(Self {
            kind,
            ttl_seconds: matches
                .get_one::<u64>(ARG_EMAIL_TOKEN_TTL_SECONDS)
                .copied()
                .unwrap_or(1800),
            sweep_seconds: matches
                .get_one::<u64>(ARG_TOKEN_SWEEP_SECONDS)
                .copied()
                .unwrap_or(60),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_TOKEN_STORE)
                .long(ARG_TOKEN_STORE)
                .help("Where pending registrations are kept")
                .long_help(
                    "Where pending registrations are kept.\n\n`memory` is process-local and loses pending sign-ups on restart; `postgres` uses the pending_registrations table and can be shared by several instances.",
                )
                .env("ZEROWORK_TOKEN_STORE")
                .default_value("memory")
                .value_parser(PossibleValuesParser::new(["memory", "postgres"])),
        )
        .arg(
            Arg::new(ARG_EMAIL_TOKEN_TTL_SECONDS)
                .long(ARG_EMAIL_TOKEN_TTL_SECONDS)
                .help("Email verification token TTL in seconds (at most 7 days)")
                .env("ZEROWORK_EMAIL_TOKEN_TTL_SECONDS")
                .default_value("1800")
                .value_parser(
                    clap::value_parser!(u64).range(1..=MAX_TOKEN_TTL.as_secs()),
                ),
        )
        .arg(
            Arg::new(ARG_TOKEN_SWEEP_SECONDS)
                .long(ARG_TOKEN_SWEEP_SECONDS)
                .help("Interval between sweeps of expired verification tokens")
                .env("ZEROWORK_TOKEN_SWEEP_SECONDS")
                .default_value("60")
                .value_parser(clap::value_parser!(u64)),
        )
}
