//! Sign-up with email verification.
//!
//! Nothing is written to `users` until the emailed link is visited: the
//! validated record waits in the [`VerificationTokenStore`] and is released
//! exactly once by [`verify_email`].

use axum::{
    Json,
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{debug, error, instrument, warn};
use utoipa::ToSchema;

use super::auth::{AuthConfig, require_bearer, unauthorized};
use super::users::{CreateUserRequest, NewUser, ServiceError, User, insert_user, user_exists};
use super::{normalize_email, valid_email};
use crate::{
    api::email::{enqueue, templates},
    verification::{
        PendingRegistration, PgTokenStore, ReissueOutcome, TokenError, VerificationTokenStore,
    },
};

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RegisterResponse {
    pub message: String,
    pub email: String,
    pub expires_in_seconds: u64,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ResendVerificationRequest {
    pub email: String,
}

#[utoipa::path(
    post,
    path = "/api/users/register",
    request_body = CreateUserRequest,
    responses(
        (status = 202, description = "Verification email queued", body = RegisterResponse),
        (status = 400, description = "Invalid input"),
        (status = 401, description = "Missing or invalid bearer token"),
        (status = 409, description = "Email already registered"),
    ),
    security(("bearer" = [])),
    tag = "registration"
)]
#[instrument(skip_all)]
pub async fn register(
    headers: HeaderMap,
    auth: Extension<Arc<AuthConfig>>,
    store: Extension<Arc<VerificationTokenStore>>,
    pool: Extension<PgPool>,
    payload: Option<Json<CreateUserRequest>>,
) -> impl IntoResponse {
    if let Err(err) = require_bearer(&headers, &auth) {
        return unauthorized(&err);
    }
    let Some(Json(request)) = payload else {
        return ServiceError::BadRequest("Missing payload").into_response();
    };

    let new_user = match NewUser::from_request(request) {
        Ok(new_user) => new_user,
        Err(err) => return err.into_response(),
    };

    match user_exists(&pool, &new_user.email).await {
        Ok(true) => return ServiceError::Conflict.into_response(),
        Ok(false) => {}
        Err(err) => return ServiceError::Database(err).into_response(),
    }

    let record = match serde_json::to_value(&new_user) {
        Ok(Value::Object(record)) => record,
        Ok(_) => {
            error!("Registration record did not serialize to a JSON object");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
        Err(err) => {
            error!("Failed to serialize registration record: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let token = match store.issue(&new_user.email, record).await {
        Ok(token) => token,
        Err(err) => {
            error!("Failed to issue verification token: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let ttl = store.ttl();
    queue_verification_email(
        &pool,
        &auth,
        &new_user.email,
        new_user.nombre.as_deref(),
        &token,
        ttl.as_secs(),
    )
    .await;

    let response = RegisterResponse {
        message: "Registro recibido. Revisa tu correo para verificar tu cuenta".to_string(),
        email: new_user.email,
        expires_in_seconds: ttl.as_secs(),
    };
    (StatusCode::ACCEPTED, Json(response)).into_response()
}

#[utoipa::path(
    get,
    path = "/verify-email/{token}",
    params(("token" = String, Path, description = "Token from the verification email")),
    responses(
        (status = 201, description = "Account created", body = User),
        (status = 400, description = "Invalid or expired verification link"),
        (status = 409, description = "Email already registered"),
    ),
    tag = "registration"
)]
#[instrument(skip_all)]
pub async fn verify_email(
    Path(token): Path<String>,
    store: Extension<Arc<VerificationTokenStore>>,
    pool: Extension<PgPool>,
) -> impl IntoResponse {
    match &**store {
        VerificationTokenStore::Postgres(store) => verify_in_transaction(store, &token).await,
        VerificationTokenStore::Memory(_) => {
            let pending = match store.consume(&token).await {
                Ok(pending) => pending,
                Err(err) => return consume_failed(&err),
            };
            let Some(new_user) = new_user_from_pending(pending) else {
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            };

            match insert_user(&*pool, &new_user).await {
                Ok(user) => (StatusCode::CREATED, Json(user)).into_response(),
                Err(err) => {
                    warn!(email = %new_user.email, "Verified registration was not stored: {err}");
                    ServiceError::from(err).into_response()
                }
            }
        }
    }
}

/// The token row is deleted in the same transaction as the user insert, so
/// a failed insert keeps the link usable.
async fn verify_in_transaction(store: &PgTokenStore, token: &str) -> Response {
    let mut tx = match store.pool().begin().await {
        Ok(tx) => tx,
        Err(err) => {
            error!("Failed to begin verification transaction: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let pending = match store.consume_in(&mut tx, token).await {
        Ok(pending) => pending,
        Err(err) => {
            // Expired rows were deleted by the lookup; keep that.
            if err.is_unusable()
                && let Err(commit_err) = tx.commit().await
            {
                warn!("Failed to drop expired verification token: {commit_err}");
            }
            return consume_failed(&err);
        }
    };

    let Some(new_user) = new_user_from_pending(pending) else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };

    let user = match insert_user(&mut *tx, &new_user).await {
        Ok(user) => user,
        Err(err) => {
            warn!(email = %new_user.email, "Verified registration was not stored, link kept: {err}");
            return ServiceError::from(err).into_response();
        }
    };

    if let Err(err) = tx.commit().await {
        error!(email = %new_user.email, "Failed to commit verified registration: {err}");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (StatusCode::CREATED, Json(user)).into_response()
}

fn consume_failed(err: &TokenError) -> Response {
    if err.is_unusable() {
        debug!("Rejected verification link: {err}");
        return (
            StatusCode::BAD_REQUEST,
            "Invalid or expired verification link",
        )
            .into_response();
    }

    error!("Failed to consume verification token: {err}");
    StatusCode::INTERNAL_SERVER_ERROR.into_response()
}

fn new_user_from_pending(pending: PendingRegistration) -> Option<NewUser> {
    match serde_json::from_value::<NewUser>(Value::Object(pending.payload)) {
        Ok(mut new_user) => {
            new_user.email = pending.email;
            Some(new_user)
        }
        Err(err) => {
            error!(email = %pending.email, "Stored registration record is unreadable: {err}");
            None
        }
    }
}

#[utoipa::path(
    post,
    path = "/api/users/resend-verification",
    request_body = ResendVerificationRequest,
    responses(
        (status = 204, description = "Request accepted"),
        (status = 400, description = "Missing payload"),
        (status = 401, description = "Missing or invalid bearer token"),
    ),
    security(("bearer" = [])),
    tag = "registration"
)]
#[instrument(skip_all)]
pub async fn resend_verification(
    headers: HeaderMap,
    auth: Extension<Arc<AuthConfig>>,
    store: Extension<Arc<VerificationTokenStore>>,
    pool: Extension<PgPool>,
    payload: Option<Json<ResendVerificationRequest>>,
) -> impl IntoResponse {
    if let Err(err) = require_bearer(&headers, &auth) {
        return unauthorized(&err);
    }
    let Some(Json(request)) = payload else {
        return ServiceError::BadRequest("Missing payload").into_response();
    };

    // Always 204: the response must not reveal pending registrations.
    let email = normalize_email(&request.email);
    if !valid_email(&email) {
        return StatusCode::NO_CONTENT.into_response();
    }

    match store.reissue(&email, auth.resend_cooldown()).await {
        Ok(ReissueOutcome::Reissued(token)) => {
            queue_verification_email(&pool, &auth, &email, None, &token, store.ttl().as_secs())
                .await;
        }
        Ok(ReissueOutcome::Cooldown) => debug!("Resend requested during cooldown"),
        Ok(ReissueOutcome::NoPending) => debug!("Resend requested without a pending registration"),
        Err(err) => error!("Failed to reissue verification token: {err}"),
    }

    StatusCode::NO_CONTENT.into_response()
}

/// Enqueue the verification email. A failure leaves the token valid; the
/// user can ask for a resend.
async fn queue_verification_email(
    pool: &PgPool,
    auth: &AuthConfig,
    email: &str,
    nombre: Option<&str>,
    token: &str,
    ttl_seconds: u64,
) {
    let payload = json!({
        "nombre": nombre,
        "verify_url": auth.verify_url(token),
        "ttl_minutes": ttl_seconds.div_ceil(60),
    });

    if let Err(err) = enqueue(pool, email, templates::VERIFY_EMAIL, &payload).await {
        warn!("Failed to enqueue verification email: {err:#}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::handlers::auth::tests::{TEST_TOKEN, auth_config, bearer_headers};
    use crate::verification::DEFAULT_TOKEN_TTL;
    use anyhow::Result;
    use serde_json::Map;
    use sqlx::postgres::PgPoolOptions;

    fn lazy_pool() -> Result<PgPool> {
        Ok(PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?)
    }

    fn memory_store() -> Arc<VerificationTokenStore> {
        Arc::new(VerificationTokenStore::memory(DEFAULT_TOKEN_TTL))
    }

    #[tokio::test]
    async fn register_requires_bearer() -> Result<()> {
        let response = register(
            HeaderMap::new(),
            Extension(Arc::new(auth_config())),
            Extension(memory_store()),
            Extension(lazy_pool()?),
            None,
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        Ok(())
    }

    #[tokio::test]
    async fn register_rejects_short_password() -> Result<()> {
        let store = memory_store();
        let response = register(
            bearer_headers(TEST_TOKEN),
            Extension(Arc::new(auth_config())),
            Extension(store.clone()),
            Extension(lazy_pool()?),
            Some(Json(CreateUserRequest {
                email: "alice@example.com".to_string(),
                contrasena: "123".to_string(),
                ..CreateUserRequest::default()
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(store.is_empty().await?);
        Ok(())
    }

    #[tokio::test]
    async fn verify_with_unknown_token_is_bad_request() -> Result<()> {
        let response = verify_email(
            Path("does-not-exist".to_string()),
            Extension(memory_store()),
            Extension(lazy_pool()?),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn verify_consumes_token_even_when_record_is_unreadable() -> Result<()> {
        let store = memory_store();
        let mut payload = Map::new();
        payload.insert("nombre".to_string(), Value::String("Alice".to_string()));
        let token = store.issue("alice@example.com", payload).await?;

        let response = verify_email(
            Path(token.clone()),
            Extension(store.clone()),
            Extension(lazy_pool()?),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let response = verify_email(Path(token), Extension(store), Extension(lazy_pool()?))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn resend_without_pending_registration_is_no_content() -> Result<()> {
        let response = resend_verification(
            bearer_headers(TEST_TOKEN),
            Extension(Arc::new(auth_config())),
            Extension(memory_store()),
            Extension(lazy_pool()?),
            Some(Json(ResendVerificationRequest {
                email: "nobody@example.com".to_string(),
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        Ok(())
    }

    #[tokio::test]
    async fn resend_during_cooldown_keeps_token() -> Result<()> {
        let store = memory_store();
        let token = store.issue("alice@example.com", Map::new()).await?;

        let response = resend_verification(
            bearer_headers(TEST_TOKEN),
            Extension(Arc::new(auth_config())),
            Extension(store.clone()),
            Extension(lazy_pool()?),
            Some(Json(ResendVerificationRequest {
                email: " Alice@Example.com ".to_string(),
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let pending = store.consume(&token).await?;
        assert_eq!(pending.email, "alice@example.com");
        Ok(())
    }

    #[tokio::test]
    async fn resend_requires_bearer() -> Result<()> {
        let response = resend_verification(
            bearer_headers("wrong"),
            Extension(Arc::new(auth_config())),
            Extension(memory_store()),
            Extension(lazy_pool()?),
            None,
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        Ok(())
    }
}
