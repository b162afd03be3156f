use crate::{
    agent::AgentConfig,
    api::{
        self,
        email::{EmailWorkerConfig, SmtpConfig},
        handlers::{auth::AuthConfig, contacts::ContactConfig},
    },
    cli::commands::{agent, auth, email, token_store},
    verification::TokenStoreConfig,
};
use anyhow::Result;
use tracing::info;
use url::Url;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub auth: auth::Options,
    pub token_store: token_store::Options,
    pub email: email::Options,
    pub agent: agent::Options,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the database is unreachable or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);

    let auth_config = AuthConfig::new(args.auth.api_token)
        .with_base_url(args.auth.base_url)
        .with_resend_cooldown_seconds(args.auth.resend_cooldown_seconds);

    let token_store_config = TokenStoreConfig::new()
        .with_kind(args.token_store.kind)
        .with_ttl_seconds(args.token_store.ttl_seconds)
        .with_sweep_interval_seconds(args.token_store.sweep_seconds);

    let outbox = &args.email.outbox;
    let email_config = EmailWorkerConfig::new()
        .with_poll_interval_seconds(outbox.poll_seconds)
        .with_batch_size(outbox.batch_size)
        .with_max_attempts(outbox.max_attempts)
        .with_backoff_base_seconds(outbox.backoff_base_seconds)
        .with_backoff_max_seconds(outbox.backoff_max_seconds);

    let smtp_config = args.email.smtp.map(|smtp| {
        SmtpConfig::new(smtp.server, smtp.user, smtp.password)
            .with_port(smtp.port)
            .with_from_name(args.email.from_name.clone())
    });

    let contact_config = ContactConfig::new(args.email.contact_admin_email);

    let agent_config = AgentConfig::new(args.agent.api_key)
        .with_base_url(args.agent.base_url)
        .with_model(args.agent.model)
        .with_name(args.agent.name)
        .with_instructions(args.agent.instructions)
        .with_vector_store_id(args.agent.vector_store_id);

    api::new(
        args.port,
        args.dsn,
        auth_config,
        token_store_config,
        email_config,
        smtp_config,
        contact_config,
        agent_config,
    )
    .await
}

fn log_startup_args(args: &Args) {
    info!(
        port = args.port,
        dsn = %redact_dsn(&args.dsn),
        base_url = %args.auth.base_url,
        token_store = args.token_store.kind.as_str(),
        smtp = args.email.smtp.as_ref().map_or("disabled", |smtp| smtp.server.as_str()),
        agent_model = %args.agent.model,
        "starting zerowork"
    );
}

/// Replace the DSN password with `***`; unparsable input is hidden entirely.
fn redact_dsn(dsn: &str) -> String {
    match Url::parse(dsn) {
        Ok(mut url) => {
            if url.password().is_some() && url.set_password(Some("***")).is_err() {
                return "***".to_string();
            }
            url.to_string()
        }
        Err(_) => "***".to_string(),
    }
}
