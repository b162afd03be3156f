use crate::{
    agent::{AgentClient, AgentConfig},
    api::{
        email::{EmailSender, EmailWorkerConfig, LogEmailSender, SmtpConfig, SmtpEmailSender},
        handlers::{auth::AuthConfig, contacts::ContactConfig},
    },
    verification::{TokenStoreConfig, VerificationTokenStore, spawn_sweeper},
};
use anyhow::{Context, Result};
use axum::{
    Extension, Json, Router,
    body::Body,
    extract::MatchedPath,
    http::{HeaderName, HeaderValue, Request},
    routing::get,
};
use sqlx::postgres::PgPoolOptions;
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{Span, info, info_span, warn};
use ulid::Ulid;
use utoipa_axum::router::OpenApiRouter;

pub mod email;
pub mod handlers;
mod openapi;

pub use openapi::openapi;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Build the API router with all documented routes registered.
#[must_use]
pub fn router() -> OpenApiRouter {
    openapi::api_router()
}

/// Start the server
/// # Errors
/// Return error if failed to start the server
#[allow(clippy::too_many_arguments)]
pub async fn new(
    port: u16,
    dsn: String,
    auth_config: AuthConfig,
    token_store_config: TokenStoreConfig,
    email_config: EmailWorkerConfig,
    smtp_config: Option<SmtpConfig>,
    contact_config: ContactConfig,
    agent_config: AgentConfig,
) -> Result<()> {
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(&dsn)
        .await
        .context("Failed to connect to database")?;

    let token_store = Arc::new(VerificationTokenStore::from_config(
        &token_store_config,
        &pool,
    ));
    info!(
        "Verification tokens kept in {} store (ttl {}s)",
        token_store.kind().as_str(),
        token_store.ttl().as_secs()
    );
    spawn_sweeper(token_store.clone(), token_store_config.sweep_interval());

    let sender: Arc<dyn EmailSender> = match &smtp_config {
        Some(smtp_config) => Arc::new(
            SmtpEmailSender::new(smtp_config).context("Failed to configure SMTP sender")?,
        ),
        None => {
            warn!("SMTP credentials not set, outgoing emails are only logged");
            Arc::new(LogEmailSender)
        }
    };
    email::spawn_outbox_worker(pool.clone(), sender, email_config);

    let agent = Arc::new(AgentClient::new(agent_config)?);

    let app = app(
        pool,
        Arc::new(auth_config),
        token_store,
        Arc::new(contact_config),
        agent,
    );

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Documented routes plus `/openapi.json`, with the shared layers and state.
#[must_use]
pub fn app(
    pool: sqlx::PgPool,
    auth_config: Arc<AuthConfig>,
    token_store: Arc<VerificationTokenStore>,
    contact_config: Arc<ContactConfig>,
    agent: Arc<AgentClient>,
) -> Router {
    let (router, spec) = router().split_for_parts();

    router
        .route(
            "/openapi.json",
            get(move || {
                let spec = spec.clone();
                async move { Json(spec) }
            }),
        )
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static(REQUEST_ID_HEADER),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    REQUEST_ID_HEADER,
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(Extension(auth_config))
                .layer(Extension(token_store))
                .layer(Extension(contact_config))
                .layer(Extension(agent))
                .layer(Extension(pool)),
        )
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!("Failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Gracefully shutdown");
}
