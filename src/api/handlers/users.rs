//! User management endpoints.
//!
//! `POST /api/users` creates a user directly (admin path, no verification);
//! the public sign-up goes through `registration` and ends in [`insert_user`]
//! once the emailed link is visited.

use anyhow::anyhow;
use argon2::{
    Argon2, PasswordHasher,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{
    Json,
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgExecutor, PgPool, Row, postgres::PgRow, types::Json as SqlJson};
use std::sync::Arc;
use tracing::{Instrument, error, info_span, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

use super::auth::{AuthConfig, require_bearer, unauthorized};
use super::{normalize_email, normalize_optional, parse_id, valid_date, valid_email};
use crate::verification::is_unique_violation;

pub(crate) const MIN_PASSWORD_CHARS: usize = 6;

macro_rules! user_columns {
    () => {
        r#"
            id,
            uuid::text AS uuid,
            email,
            nombre,
            avatar,
            tipo,
            to_char(fecha_nacimiento, 'YYYY-MM-DD') AS fecha_nacimiento,
            link_linkedin,
            link_github,
            tema,
            idioma,
            mejorar_agente,
            instrucciones,
            apodo,
            oficio,
            cualidades,
            sobre_ti,
            funciones,
            memoria,
            provider,
            provider_id,
            to_char(created_at AT TIME ZONE 'utc', 'YYYY-MM-DD"T"HH24:MI:SS"Z"') AS created_at,
            to_char(updated_at AT TIME ZONE 'utc', 'YYYY-MM-DD"T"HH24:MI:SS"Z"') AS updated_at
        "#
    };
}

/// User as returned by the API; the password hash never leaves the database.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct User {
    pub id: i64,
    pub uuid: String,
    pub email: String,
    pub nombre: Option<String>,
    pub avatar: Option<String>,
    pub tipo: String,
    pub fecha_nacimiento: Option<String>,
    pub link_linkedin: Option<String>,
    pub link_github: Option<String>,
    pub tema: String,
    pub idioma: String,
    pub mejorar_agente: bool,
    pub instrucciones: Option<String>,
    pub apodo: Option<String>,
    pub oficio: Option<String>,
    #[schema(value_type = Vec<Object>)]
    pub cualidades: Vec<Value>,
    pub sobre_ti: Option<String>,
    #[schema(value_type = Vec<Object>)]
    pub funciones: Vec<Value>,
    pub memoria: bool,
    pub provider: Option<String>,
    pub provider_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UsersResponse {
    pub usuarios: Vec<User>,
    pub total: usize,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DeletedUserResponse {
    pub message: String,
    pub deleted_user_id: i64,
    pub deleted_user_email: String,
    pub deleted_user_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct CreateUserRequest {
    pub email: String,
    pub contrasena: String,
    pub uuid: Option<Uuid>,
    pub nombre: Option<String>,
    pub avatar: Option<String>,
    pub tipo: Option<String>,
    pub fecha_nacimiento: Option<String>,
    pub link_linkedin: Option<String>,
    pub link_github: Option<String>,
    pub tema: Option<String>,
    pub idioma: Option<String>,
    pub mejorar_agente: Option<bool>,
    pub instrucciones: Option<String>,
    pub apodo: Option<String>,
    pub oficio: Option<String>,
    #[schema(value_type = Option<Vec<Object>>)]
    pub cualidades: Option<Vec<Value>>,
    pub sobre_ti: Option<String>,
    #[schema(value_type = Option<Vec<Object>>)]
    pub funciones: Option<Vec<Value>>,
    pub memoria: Option<bool>,
    pub provider: Option<String>,
    pub provider_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct UpdateUserRequest {
    pub email: Option<String>,
    pub contrasena: Option<String>,
    pub nombre: Option<String>,
    pub avatar: Option<String>,
    pub tipo: Option<String>,
    pub fecha_nacimiento: Option<String>,
    pub link_linkedin: Option<String>,
    pub link_github: Option<String>,
    pub tema: Option<String>,
    pub idioma: Option<String>,
    pub mejorar_agente: Option<bool>,
    pub instrucciones: Option<String>,
    pub apodo: Option<String>,
    pub oficio: Option<String>,
    #[schema(value_type = Option<Vec<Object>>)]
    pub cualidades: Option<Vec<Value>>,
    pub sobre_ti: Option<String>,
    #[schema(value_type = Option<Vec<Object>>)]
    pub funciones: Option<Vec<Value>>,
    pub memoria: Option<bool>,
    pub provider: Option<String>,
    pub provider_id: Option<String>,
}

impl UpdateUserRequest {
    fn is_empty(&self) -> bool {
        self.email.is_none()
            && self.contrasena.is_none()
            && self.nombre.is_none()
            && self.avatar.is_none()
            && self.tipo.is_none()
            && self.fecha_nacimiento.is_none()
            && self.link_linkedin.is_none()
            && self.link_github.is_none()
            && self.tema.is_none()
            && self.idioma.is_none()
            && self.mejorar_agente.is_none()
            && self.instrucciones.is_none()
            && self.apodo.is_none()
            && self.oficio.is_none()
            && self.cualidades.is_none()
            && self.sobre_ti.is_none()
            && self.funciones.is_none()
            && self.memoria.is_none()
            && self.provider.is_none()
            && self.provider_id.is_none()
    }
}

/// A validated user ready to be inserted, password already hashed.
///
/// This is also the registration payload parked in the verification token
/// store until the emailed link is visited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewUser {
    pub uuid: Uuid,
    pub email: String,
    pub password_hash: String,
    pub nombre: Option<String>,
    pub avatar: Option<String>,
    pub tipo: String,
    pub fecha_nacimiento: Option<String>,
    pub link_linkedin: Option<String>,
    pub link_github: Option<String>,
    pub tema: String,
    pub idioma: String,
    pub mejorar_agente: bool,
    pub instrucciones: Option<String>,
    pub apodo: Option<String>,
    pub oficio: Option<String>,
    pub cualidades: Vec<Value>,
    pub sobre_ti: Option<String>,
    pub funciones: Vec<Value>,
    pub memoria: bool,
    pub provider: Option<String>,
    pub provider_id: Option<String>,
}

impl NewUser {
    /// Validate a creation request and hash its password.
    ///
    /// # Errors
    /// `BadRequest` on invalid input, `Internal` if hashing fails.
    pub fn from_request(request: CreateUserRequest) -> Result<Self, ServiceError> {
        let email = validate_create(&request)?;
        let password_hash = hash_password(&request.contrasena)?;

        Ok(Self {
            uuid: request.uuid.unwrap_or_else(Uuid::new_v4),
            email,
            password_hash,
            nombre: normalize_optional(request.nombre),
            avatar: normalize_optional(request.avatar),
            tipo: normalize_optional(request.tipo).unwrap_or_else(|| "USUARIO".to_string()),
            fecha_nacimiento: normalize_optional(request.fecha_nacimiento),
            link_linkedin: normalize_optional(request.link_linkedin),
            link_github: normalize_optional(request.link_github),
            tema: normalize_optional(request.tema).unwrap_or_else(|| "DEFAULT".to_string()),
            idioma: normalize_optional(request.idioma).unwrap_or_else(|| "ES".to_string()),
            mejorar_agente: request.mejorar_agente.unwrap_or(false),
            instrucciones: normalize_optional(request.instrucciones),
            apodo: normalize_optional(request.apodo),
            oficio: normalize_optional(request.oficio),
            cualidades: request.cualidades.unwrap_or_default(),
            sobre_ti: normalize_optional(request.sobre_ti),
            funciones: request.funciones.unwrap_or_default(),
            memoria: request.memoria.unwrap_or(false),
            provider: normalize_optional(request.provider),
            provider_id: normalize_optional(request.provider_id),
        })
    }
}

#[derive(Debug)]
pub enum ServiceError {
    BadRequest(&'static str),
    NotFound,
    Conflict,
    Database(sqlx::Error),
    Internal(anyhow::Error),
}

impl From<sqlx::Error> for ServiceError {
    fn from(err: sqlx::Error) -> Self {
        if is_unique_violation(&err) {
            Self::Conflict
        } else {
            Self::Database(err)
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message).into_response(),
            Self::NotFound => (StatusCode::NOT_FOUND, "User not found").into_response(),
            Self::Conflict => (StatusCode::CONFLICT, "User already exists").into_response(),
            Self::Database(err) => {
                error!("Failed to handle user request: {err}");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
            Self::Internal(err) => {
                error!("Failed to handle user request: {err:#}");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

#[utoipa::path(
    get,
    path = "/api/users",
    responses(
        (status = 200, description = "All users ordered by id", body = UsersResponse),
        (status = 401, description = "Missing or invalid bearer token"),
    ),
    security(("bearer" = [])),
    tag = "users"
)]
pub async fn list_users(
    headers: HeaderMap,
    auth: Extension<Arc<AuthConfig>>,
    pool: Extension<PgPool>,
) -> impl IntoResponse {
    if let Err(err) = require_bearer(&headers, &auth) {
        return unauthorized(&err);
    }

    match fetch_users(&pool).await {
        Ok(usuarios) => {
            let total = usuarios.len();
            (StatusCode::OK, Json(UsersResponse { usuarios, total })).into_response()
        }
        Err(err) => ServiceError::Database(err).into_response(),
    }
}

#[utoipa::path(
    get,
    path = "/api/users/{id}",
    params(("id" = i64, Path, description = "User id")),
    responses(
        (status = 200, description = "User detail", body = User),
        (status = 400, description = "Invalid user id"),
        (status = 401, description = "Missing or invalid bearer token"),
        (status = 404, description = "User not found"),
    ),
    security(("bearer" = [])),
    tag = "users"
)]
pub async fn get_user(
    Path(id): Path<String>,
    headers: HeaderMap,
    auth: Extension<Arc<AuthConfig>>,
    pool: Extension<PgPool>,
) -> impl IntoResponse {
    if let Err(err) = require_bearer(&headers, &auth) {
        return unauthorized(&err);
    }
    let Some(id) = parse_id(&id) else {
        return ServiceError::BadRequest("Invalid user id").into_response();
    };

    match fetch_user(&pool, id).await {
        Ok(Some(user)) => (StatusCode::OK, Json(user)).into_response(),
        Ok(None) => ServiceError::NotFound.into_response(),
        Err(err) => ServiceError::Database(err).into_response(),
    }
}

#[utoipa::path(
    post,
    path = "/api/users",
    request_body = CreateUserRequest,
    responses(
        (status = 201, description = "User created without email verification", body = User),
        (status = 400, description = "Invalid input"),
        (status = 401, description = "Missing or invalid bearer token"),
        (status = 409, description = "Email already registered"),
    ),
    security(("bearer" = [])),
    tag = "users"
)]
#[instrument(skip_all)]
pub async fn create_user(
    headers: HeaderMap,
    auth: Extension<Arc<AuthConfig>>,
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

    match insert_user(&*pool, &new_user).await {
        Ok(user) => (StatusCode::CREATED, Json(user)).into_response(),
        Err(err) => ServiceError::from(err).into_response(),
    }
}

#[utoipa::path(
    put,
    path = "/api/users/{id}",
    params(("id" = i64, Path, description = "User id")),
    request_body = UpdateUserRequest,
    responses(
        (status = 200, description = "User updated", body = User),
        (status = 400, description = "Invalid input or nothing to update"),
        (status = 401, description = "Missing or invalid bearer token"),
        (status = 404, description = "User not found"),
        (status = 409, description = "Email already registered"),
    ),
    security(("bearer" = [])),
    tag = "users"
)]
#[instrument(skip_all)]
pub async fn update_user(
    Path(id): Path<String>,
    headers: HeaderMap,
    auth: Extension<Arc<AuthConfig>>,
    pool: Extension<PgPool>,
    payload: Option<Json<UpdateUserRequest>>,
) -> impl IntoResponse {
    if let Err(err) = require_bearer(&headers, &auth) {
        return unauthorized(&err);
    }
    let Some(id) = parse_id(&id) else {
        return ServiceError::BadRequest("Invalid user id").into_response();
    };
    let Some(Json(request)) = payload else {
        return ServiceError::BadRequest("Missing payload").into_response();
    };

    match update_user_record(&pool, id, request).await {
        Ok(user) => (StatusCode::OK, Json(user)).into_response(),
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    delete,
    path = "/api/users/{id}",
    params(("id" = i64, Path, description = "User id")),
    responses(
        (status = 200, description = "User deleted", body = DeletedUserResponse),
        (status = 400, description = "Invalid user id"),
        (status = 401, description = "Missing or invalid bearer token"),
        (status = 404, description = "User not found"),
    ),
    security(("bearer" = [])),
    tag = "users"
)]
pub async fn delete_user(
    Path(id): Path<String>,
    headers: HeaderMap,
    auth: Extension<Arc<AuthConfig>>,
    pool: Extension<PgPool>,
) -> impl IntoResponse {
    if let Err(err) = require_bearer(&headers, &auth) {
        return unauthorized(&err);
    }
    let Some(id) = parse_id(&id) else {
        return ServiceError::BadRequest("Invalid user id").into_response();
    };

    let query = "DELETE FROM users WHERE id = $1 RETURNING id, email, nombre";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(id)
        .fetch_optional(&*pool)
        .instrument(span)
        .await;

    match row {
        Ok(Some(row)) => {
            let response = DeletedUserResponse {
                message: "Usuario eliminado exitosamente".to_string(),
                deleted_user_id: row.get("id"),
                deleted_user_email: row.get("email"),
                deleted_user_name: row.get("nombre"),
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Ok(None) => ServiceError::NotFound.into_response(),
        Err(err) => ServiceError::Database(err).into_response(),
    }
}

/// Validate the fields of a creation request, returning the normalized email.
fn validate_create(request: &CreateUserRequest) -> Result<String, ServiceError> {
    let email = normalize_email(&request.email);
    if !valid_email(&email) {
        return Err(ServiceError::BadRequest("Invalid email"));
    }
    if request.contrasena.chars().count() < MIN_PASSWORD_CHARS {
        return Err(ServiceError::BadRequest(
            "Password must be at least 6 characters",
        ));
    }
    if let Some(date) = request.fecha_nacimiento.as_deref().map(str::trim)
        && !date.is_empty()
        && !valid_date(date)
    {
        return Err(ServiceError::BadRequest(
            "fecha_nacimiento must be YYYY-MM-DD",
        ));
    }
    Ok(email)
}

/// Hash a password into an argon2 PHC string.
pub(crate) fn hash_password(password: &str) -> Result<String, ServiceError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| ServiceError::Internal(anyhow!("failed to hash password: {err}")))
}

pub(crate) async fn user_exists(pool: &PgPool, email: &str) -> Result<bool, sqlx::Error> {
    let query = "SELECT EXISTS(SELECT 1 FROM users WHERE email = $1) AS exists";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(email)
        .fetch_one(pool)
        .instrument(span)
        .await?;
    row.try_get("exists")
}

/// Insert a validated user; a duplicate email surfaces as a unique violation.
pub(crate) async fn insert_user<'e, E>(executor: E, user: &NewUser) -> Result<User, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let query = concat!(
        r"
        INSERT INTO users (
            uuid, email, contrasena, nombre, avatar, tipo, fecha_nacimiento,
            link_linkedin, link_github, tema, idioma, mejorar_agente,
            instrucciones, apodo, oficio, cualidades, sobre_ti, funciones,
            memoria, provider, provider_id
        ) VALUES (
            $1, $2, $3, $4, $5, $6, $7::date, $8, $9, $10, $11, $12,
            $13, $14, $15, $16, $17, $18, $19, $20, $21
        )
        RETURNING ",
        user_columns!()
    );
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(user.uuid)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.nombre)
        .bind(&user.avatar)
        .bind(&user.tipo)
        .bind(&user.fecha_nacimiento)
        .bind(&user.link_linkedin)
        .bind(&user.link_github)
        .bind(&user.tema)
        .bind(&user.idioma)
        .bind(user.mejorar_agente)
        .bind(&user.instrucciones)
        .bind(&user.apodo)
        .bind(&user.oficio)
        .bind(SqlJson(&user.cualidades))
        .bind(&user.sobre_ti)
        .bind(SqlJson(&user.funciones))
        .bind(user.memoria)
        .bind(&user.provider)
        .bind(&user.provider_id)
        .fetch_one(executor)
        .instrument(span)
        .await?;

    user_from_row(&row)
}

async fn fetch_users(pool: &PgPool) -> Result<Vec<User>, sqlx::Error> {
    let query = concat!("SELECT ", user_columns!(), " FROM users ORDER BY id");
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let rows = sqlx::query(query)
        .fetch_all(pool)
        .instrument(span)
        .await?;
    rows.iter().map(user_from_row).collect()
}

async fn fetch_user(pool: &PgPool, id: i64) -> Result<Option<User>, sqlx::Error> {
    let query = concat!("SELECT ", user_columns!(), " FROM users WHERE id = $1");
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(id)
        .fetch_optional(pool)
        .instrument(span)
        .await?;
    row.as_ref().map(user_from_row).transpose()
}

async fn update_user_record(
    pool: &PgPool,
    id: i64,
    request: UpdateUserRequest,
) -> Result<User, ServiceError> {
    if request.is_empty() {
        return Err(ServiceError::BadRequest("No fields to update"));
    }

    let email = match request.email.as_deref().map(normalize_email) {
        Some(email) if !valid_email(&email) => {
            return Err(ServiceError::BadRequest("Invalid email"));
        }
        email => email,
    };
    if let Some(date) = request.fecha_nacimiento.as_deref()
        && !valid_date(date.trim())
    {
        return Err(ServiceError::BadRequest(
            "fecha_nacimiento must be YYYY-MM-DD",
        ));
    }
    let password_hash = match request.contrasena.as_deref() {
        Some(password) if password.chars().count() < MIN_PASSWORD_CHARS => {
            return Err(ServiceError::BadRequest(
                "Password must be at least 6 characters",
            ));
        }
        Some(password) => Some(hash_password(password)?),
        None => None,
    };

    let query = concat!(
        r"
        UPDATE users
        SET
            email = COALESCE($1, email),
            contrasena = COALESCE($2, contrasena),
            nombre = COALESCE($3, nombre),
            avatar = COALESCE($4, avatar),
            tipo = COALESCE($5, tipo),
            fecha_nacimiento = COALESCE($6::date, fecha_nacimiento),
            link_linkedin = COALESCE($7, link_linkedin),
            link_github = COALESCE($8, link_github),
            tema = COALESCE($9, tema),
            idioma = COALESCE($10, idioma),
            mejorar_agente = COALESCE($11, mejorar_agente),
            instrucciones = COALESCE($12, instrucciones),
            apodo = COALESCE($13, apodo),
            oficio = COALESCE($14, oficio),
            cualidades = COALESCE($15, cualidades),
            sobre_ti = COALESCE($16, sobre_ti),
            funciones = COALESCE($17, funciones),
            memoria = COALESCE($18, memoria),
            provider = COALESCE($19, provider),
            provider_id = COALESCE($20, provider_id),
            updated_at = NOW()
        WHERE id = $21
        RETURNING ",
        user_columns!()
    );
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(email)
        .bind(password_hash)
        .bind(request.nombre)
        .bind(request.avatar)
        .bind(request.tipo)
        .bind(request.fecha_nacimiento.map(|date| date.trim().to_string()))
        .bind(request.link_linkedin)
        .bind(request.link_github)
        .bind(request.tema)
        .bind(request.idioma)
        .bind(request.mejorar_agente)
        .bind(request.instrucciones)
        .bind(request.apodo)
        .bind(request.oficio)
        .bind(request.cualidades.map(SqlJson))
        .bind(request.sobre_ti)
        .bind(request.funciones.map(SqlJson))
        .bind(request.memoria)
        .bind(request.provider)
        .bind(request.provider_id)
        .bind(id)
        .fetch_optional(pool)
        .instrument(span)
        .await?;

    match row {
        Some(row) => Ok(user_from_row(&row)?),
        None => Err(ServiceError::NotFound),
    }
}

fn user_from_row(row: &PgRow) -> Result<User, sqlx::Error> {
    let SqlJson(cualidades): SqlJson<Vec<Value>> = row.try_get("cualidades")?;
    let SqlJson(funciones): SqlJson<Vec<Value>> = row.try_get("funciones")?;

    Ok(User {
        id: row.try_get("id")?,
        uuid: row.try_get("uuid")?,
        email: row.try_get("email")?,
        nombre: row.try_get("nombre")?,
        avatar: row.try_get("avatar")?,
        tipo: row.try_get("tipo")?,
        fecha_nacimiento: row.try_get("fecha_nacimiento")?,
        link_linkedin: row.try_get("link_linkedin")?,
        link_github: row.try_get("link_github")?,
        tema: row.try_get("tema")?,
        idioma: row.try_get("idioma")?,
        mejorar_agente: row.try_get("mejorar_agente")?,
        instrucciones: row.try_get("instrucciones")?,
        apodo: row.try_get("apodo")?,
        oficio: row.try_get("oficio")?,
        cualidades,
        sobre_ti: row.try_get("sobre_ti")?,
        funciones,
        memoria: row.try_get("memoria")?,
        provider: row.try_get("provider")?,
        provider_id: row.try_get("provider_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
