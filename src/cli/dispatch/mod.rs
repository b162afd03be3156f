//! Maps validated CLI matches to the action the binary runs.

use crate::cli::actions::{Action, server::Args};
use crate::cli::commands::{ARG_DSN, ARG_PORT, agent, auth, email, token_store};
use anyhow::{Context, Result};

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>(ARG_PORT).copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>(ARG_DSN)
        .cloned()
        .context("missing required argument: --dsn")?;

    Ok(Action::Server(Args {
        port,
        dsn,
        auth: auth::Options::parse(matches)?,
        token_store: token_store::Options::parse(matches)?,
        email: email::Options::parse(matches)?,
        agent: agent::Options::parse(matches)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verification::TokenStoreKind;

    const DSN: &str = "postgres://zerowork@localhost:5432/zerowork";

    #[test]
    fn api_auth_token_required() {
        temp_env::with_vars(
            [
                ("ZEROWORK_DSN", Some(DSN)),
                ("API_AUTH_TOKEN", None::<&str>),
                ("OPENAI_API_KEY", Some("sk-test")),
            ],
            || {
                let matches = crate::cli::commands::new().get_matches_from(vec!["zerowork"]);
                let result = handler(&matches);
                assert!(result.is_err());
                if let Err(err) = result {
                    assert!(
                        err.to_string()
                            .contains("missing required argument: --api-auth-token")
                    );
                }
            },
        );
    }

    #[test]
    fn openai_api_key_required() {
        temp_env::with_vars(
            [
                ("ZEROWORK_DSN", Some(DSN)),
                ("API_AUTH_TOKEN", Some("secret-token")),
                ("OPENAI_API_KEY", None::<&str>),
            ],
            || {
                let matches = crate::cli::commands::new().get_matches_from(vec!["zerowork"]);
                let result = handler(&matches);
                assert!(result.is_err());
                if let Err(err) = result {
                    assert!(
                        err.to_string()
                            .contains("missing required argument: --openai-api-key")
                    );
                }
            },
        );
    }

    #[test]
    fn builds_server_action() {
        temp_env::with_vars(
            [
                ("ZEROWORK_DSN", Some(DSN)),
                ("ZEROWORK_PORT", Some("3000")),
                ("API_AUTH_TOKEN", Some("secret-token")),
                ("OPENAI_API_KEY", Some("sk-test")),
                ("ZEROWORK_TOKEN_STORE", Some("postgres")),
                ("SMTP_USER", None),
                ("SMTP_PASSWORD", None),
            ],
            || {
                let matches = crate::cli::commands::new().get_matches_from(vec!["zerowork"]);
                let result = handler(&matches);
                assert!(result.is_ok());
                if let Ok(Action::Server(args)) = result {
                    assert_eq!(args.port, 3000);
                    assert_eq!(args.dsn, DSN);
                    assert_eq!(args.token_store.kind, TokenStoreKind::Postgres);
                    assert!(args.email.smtp.is_none());
                }
            },
        );
    }
}
