//! Contact form submissions and their follow-up state.

use axum::{
    Json,
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{PgPool, Row, postgres::PgRow};
use std::sync::Arc;
use tracing::{Instrument, error, info_span, instrument};
use utoipa::ToSchema;

use super::auth::{AuthConfig, require_bearer, unauthorized};
use super::{normalize_email, normalize_optional, parse_id, valid_email};
use crate::api::email::{enqueue, templates};

pub const DEFAULT_CONTACT_ADMIN_EMAIL: &str = "zeroworkia@gmail.com";

const ESTADOS: [&str; 3] = ["PENDIENTE", "CONTACTADO", "CERRADO"];

macro_rules! contact_columns {
    () => {
        r#"
            id,
            uuid::text AS uuid,
            nombre,
            email,
            telefono,
            mensaje,
            estado,
            to_char(created_at AT TIME ZONE 'utc', 'YYYY-MM-DD"T"HH24:MI:SS"Z"') AS created_at,
            to_char(updated_at AT TIME ZONE 'utc', 'YYYY-MM-DD"T"HH24:MI:SS"Z"') AS updated_at
        "#
    };
}

/// Where new contact notifications go.
#[derive(Clone, Debug)]
pub struct ContactConfig {
    admin_email: String,
}

impl ContactConfig {
    #[must_use]
    pub fn new(admin_email: String) -> Self {
        Self { admin_email }
    }

    #[must_use]
    pub fn admin_email(&self) -> &str {
        &self.admin_email
    }
}

impl Default for ContactConfig {
    fn default() -> Self {
        Self::new(DEFAULT_CONTACT_ADMIN_EMAIL.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Contact {
    pub id: i64,
    pub uuid: String,
    pub nombre: String,
    pub email: String,
    pub telefono: Option<String>,
    pub mensaje: String,
    pub estado: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ContactResponse {
    pub message: String,
    pub contacto: Contact,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ContactsResponse {
    pub message: String,
    pub contactos: Vec<Contact>,
    pub total: usize,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DeletedContactResponse {
    pub message: String,
    pub deleted_contact_id: i64,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct CreateContactRequest {
    pub nombre: String,
    pub email: String,
    pub telefono: Option<String>,
    pub mensaje: String,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct UpdateContactRequest {
    pub nombre: Option<String>,
    pub email: Option<String>,
    pub telefono: Option<String>,
    pub mensaje: Option<String>,
    pub estado: Option<String>,
}

#[derive(Debug)]
pub enum ServiceError {
    BadRequest(&'static str),
    NotFound,
    Database(sqlx::Error),
    Internal(anyhow::Error),
}

impl From<sqlx::Error> for ServiceError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err)
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message).into_response(),
            Self::NotFound => (StatusCode::NOT_FOUND, "Contact not found").into_response(),
            Self::Database(err) => {
                error!("Failed to handle contact request: {err}");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
            Self::Internal(err) => {
                error!("Failed to handle contact request: {err:#}");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

/// Fields of a contact after validation.
#[derive(Debug, PartialEq, Eq)]
struct ValidContact {
    nombre: String,
    email: String,
    telefono: Option<String>,
    mensaje: String,
}

fn validate_nombre(nombre: &str) -> Result<String, ServiceError> {
    let nombre = nombre.trim();
    if (2..=255).contains(&nombre.chars().count()) {
        Ok(nombre.to_string())
    } else {
        Err(ServiceError::BadRequest(
            "nombre must be between 2 and 255 characters",
        ))
    }
}

fn validate_email(email: &str) -> Result<String, ServiceError> {
    let email = normalize_email(email);
    if valid_email(&email) {
        Ok(email)
    } else {
        Err(ServiceError::BadRequest("Invalid email"))
    }
}

fn validate_telefono(telefono: Option<String>) -> Result<Option<String>, ServiceError> {
    match normalize_optional(telefono) {
        Some(telefono) if telefono.chars().count() > 50 => Err(ServiceError::BadRequest(
            "telefono must be at most 50 characters",
        )),
        telefono => Ok(telefono),
    }
}

fn validate_mensaje(mensaje: &str) -> Result<String, ServiceError> {
    let mensaje = mensaje.trim();
    if mensaje.chars().count() >= 10 {
        Ok(mensaje.to_string())
    } else {
        Err(ServiceError::BadRequest(
            "mensaje must be at least 10 characters",
        ))
    }
}

fn validate_estado(estado: &str) -> Result<String, ServiceError> {
    let estado = estado.trim().to_uppercase();
    if ESTADOS.contains(&estado.as_str()) {
        Ok(estado)
    } else {
        Err(ServiceError::BadRequest(
            "estado must be PENDIENTE, CONTACTADO or CERRADO",
        ))
    }
}

fn validate_create(request: CreateContactRequest) -> Result<ValidContact, ServiceError> {
    Ok(ValidContact {
        nombre: validate_nombre(&request.nombre)?,
        email: validate_email(&request.email)?,
        telefono: validate_telefono(request.telefono)?,
        mensaje: validate_mensaje(&request.mensaje)?,
    })
}

#[utoipa::path(
    post,
    path = "/api/contacts",
    request_body = CreateContactRequest,
    responses(
        (status = 201, description = "Contact stored and notifications queued", body = ContactResponse),
        (status = 400, description = "Invalid input"),
        (status = 401, description = "Missing or invalid bearer token"),
    ),
    security(("bearer" = [])),
    tag = "contacts"
)]
#[instrument(skip_all)]
pub async fn create_contact(
    headers: HeaderMap,
    auth: Extension<Arc<AuthConfig>>,
    contact_config: Extension<Arc<ContactConfig>>,
    pool: Extension<PgPool>,
    payload: Option<Json<CreateContactRequest>>,
) -> impl IntoResponse {
    if let Err(err) = require_bearer(&headers, &auth) {
        return unauthorized(&err);
    }
    let Some(Json(request)) = payload else {
        return ServiceError::BadRequest("Missing payload").into_response();
    };
    let contact = match validate_create(request) {
        Ok(contact) => contact,
        Err(err) => return err.into_response(),
    };

    match insert_contact(&pool, &contact_config, &contact).await {
        Ok(contacto) => {
            let response = ContactResponse {
                message: "Contacto recibido exitosamente".to_string(),
                contacto,
            };
            (StatusCode::CREATED, Json(response)).into_response()
        }
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    get,
    path = "/api/contacts",
    responses(
        (status = 200, description = "Contacts, newest first", body = ContactsResponse),
        (status = 401, description = "Missing or invalid bearer token"),
    ),
    security(("bearer" = [])),
    tag = "contacts"
)]
pub async fn list_contacts(
    headers: HeaderMap,
    auth: Extension<Arc<AuthConfig>>,
    pool: Extension<PgPool>,
) -> impl IntoResponse {
    if let Err(err) = require_bearer(&headers, &auth) {
        return unauthorized(&err);
    }

    let query = concat!(
        "SELECT ",
        contact_columns!(),
        " FROM contacts ORDER BY created_at DESC, id DESC"
    );
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let rows = sqlx::query(query)
        .fetch_all(&*pool)
        .instrument(span)
        .await;

    let contactos: Result<Vec<Contact>, sqlx::Error> =
        rows.and_then(|rows| rows.iter().map(contact_from_row).collect());
    let contactos = match contactos {
        Ok(contactos) => contactos,
        Err(err) => return ServiceError::Database(err).into_response(),
    };

    let message = if contactos.is_empty() {
        "No hay contactos registrados"
    } else {
        "Contactos obtenidos"
    };
    let response = ContactsResponse {
        message: message.to_string(),
        total: contactos.len(),
        contactos,
    };
    (StatusCode::OK, Json(response)).into_response()
}

#[utoipa::path(
    get,
    path = "/api/contacts/{id}",
    params(("id" = i64, Path, description = "Contact id")),
    responses(
        (status = 200, description = "Contact detail", body = ContactResponse),
        (status = 400, description = "Invalid contact id"),
        (status = 401, description = "Missing or invalid bearer token"),
        (status = 404, description = "Contact not found"),
    ),
    security(("bearer" = [])),
    tag = "contacts"
)]
pub async fn get_contact(
    Path(id): Path<String>,
    headers: HeaderMap,
    auth: Extension<Arc<AuthConfig>>,
    pool: Extension<PgPool>,
) -> impl IntoResponse {
    if let Err(err) = require_bearer(&headers, &auth) {
        return unauthorized(&err);
    }
    let Some(id) = parse_id(&id) else {
        return ServiceError::BadRequest("Invalid contact id").into_response();
    };

    let query = concat!("SELECT ", contact_columns!(), " FROM contacts WHERE id = $1");
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(id)
        .fetch_optional(&*pool)
        .instrument(span)
        .await;

    match row.and_then(|row| row.as_ref().map(contact_from_row).transpose()) {
        Ok(Some(contacto)) => {
            let response = ContactResponse {
                message: "Contacto encontrado".to_string(),
                contacto,
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Ok(None) => ServiceError::NotFound.into_response(),
        Err(err) => ServiceError::Database(err).into_response(),
    }
}

#[utoipa::path(
    put,
    path = "/api/contacts/{id}",
    params(("id" = i64, Path, description = "Contact id")),
    request_body = UpdateContactRequest,
    responses(
        (status = 200, description = "Contact updated", body = ContactResponse),
        (status = 400, description = "Invalid input or nothing to update"),
        (status = 401, description = "Missing or invalid bearer token"),
        (status = 404, description = "Contact not found"),
    ),
    security(("bearer" = [])),
    tag = "contacts"
)]
#[instrument(skip_all)]
pub async fn update_contact(
    Path(id): Path<String>,
    headers: HeaderMap,
    auth: Extension<Arc<AuthConfig>>,
    pool: Extension<PgPool>,
    payload: Option<Json<UpdateContactRequest>>,
) -> impl IntoResponse {
    if let Err(err) = require_bearer(&headers, &auth) {
        return unauthorized(&err);
    }
    let Some(id) = parse_id(&id) else {
        return ServiceError::BadRequest("Invalid contact id").into_response();
    };
    let Some(Json(request)) = payload else {
        return ServiceError::BadRequest("Missing payload").into_response();
    };

    match update_contact_record(&pool, id, request).await {
        Ok(contacto) => {
            let response = ContactResponse {
                message: "Contacto actualizado".to_string(),
                contacto,
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    delete,
    path = "/api/contacts/{id}",
    params(("id" = i64, Path, description = "Contact id")),
    responses(
        (status = 200, description = "Contact deleted", body = DeletedContactResponse),
        (status = 400, description = "Invalid contact id"),
        (status = 401, description = "Missing or invalid bearer token"),
        (status = 404, description = "Contact not found"),
    ),
    security(("bearer" = [])),
    tag = "contacts"
)]
pub async fn delete_contact(
    Path(id): Path<String>,
    headers: HeaderMap,
    auth: Extension<Arc<AuthConfig>>,
    pool: Extension<PgPool>,
) -> impl IntoResponse {
    if let Err(err) = require_bearer(&headers, &auth) {
        return unauthorized(&err);
    }
    let Some(id) = parse_id(&id) else {
        return ServiceError::BadRequest("Invalid contact id").into_response();
    };

    let query = "DELETE FROM contacts WHERE id = $1";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(id)
        .execute(&*pool)
        .instrument(span)
        .await;

    match result {
        Ok(result) if result.rows_affected() == 0 => ServiceError::NotFound.into_response(),
        Ok(_) => {
            let response = DeletedContactResponse {
                message: "Contacto eliminado".to_string(),
                deleted_contact_id: id,
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(err) => ServiceError::Database(err).into_response(),
    }
}

/// Store the contact and queue both notifications in one transaction.
async fn insert_contact(
    pool: &PgPool,
    config: &ContactConfig,
    contact: &ValidContact,
) -> Result<Contact, ServiceError> {
    let mut tx = pool.begin().await?;

    let query = concat!(
        r"
        INSERT INTO contacts (nombre, email, telefono, mensaje, estado)
        VALUES ($1, $2, $3, $4, 'PENDIENTE')
        RETURNING ",
        contact_columns!()
    );
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(&contact.nombre)
        .bind(&contact.email)
        .bind(&contact.telefono)
        .bind(&contact.mensaje)
        .fetch_one(&mut *tx)
        .instrument(span)
        .await?;
    let stored = contact_from_row(&row)?;

    let admin_payload = json!({
        "nombre": stored.nombre,
        "email": stored.email,
        "telefono": stored.telefono,
        "mensaje": stored.mensaje,
    });
    enqueue(
        &mut *tx,
        config.admin_email(),
        templates::CONTACT_ADMIN,
        &admin_payload,
    )
    .await
    .map_err(ServiceError::Internal)?;

    enqueue(
        &mut *tx,
        &stored.email,
        templates::CONTACT_CONFIRMATION,
        &json!({ "nombre": stored.nombre }),
    )
    .await
    .map_err(ServiceError::Internal)?;

    tx.commit().await?;
    Ok(stored)
}

async fn update_contact_record(
    pool: &PgPool,
    id: i64,
    request: UpdateContactRequest,
) -> Result<Contact, ServiceError> {
    if request.nombre.is_none()
        && request.email.is_none()
        && request.telefono.is_none()
        && request.mensaje.is_none()
        && request.estado.is_none()
    {
        return Err(ServiceError::BadRequest("No fields to update"));
    }

    let nombre = request.nombre.as_deref().map(validate_nombre).transpose()?;
    let email = request.email.as_deref().map(validate_email).transpose()?;
    let telefono = validate_telefono(request.telefono)?;
    let mensaje = request.mensaje.as_deref().map(validate_mensaje).transpose()?;
    let estado = request.estado.as_deref().map(validate_estado).transpose()?;

    let query = concat!(
        r"
        UPDATE contacts
        SET
            nombre = COALESCE($1, nombre),
            email = COALESCE($2, email),
            telefono = COALESCE($3, telefono),
            mensaje = COALESCE($4, mensaje),
            estado = COALESCE($5, estado),
            updated_at = NOW()
        WHERE id = $6
        RETURNING ",
        contact_columns!()
    );
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(nombre)
        .bind(email)
        .bind(telefono)
        .bind(mensaje)
        .bind(estado)
        .bind(id)
        .fetch_optional(pool)
        .instrument(span)
        .await?;

    match row {
        Some(row) => Ok(contact_from_row(&row)?),
        None => Err(ServiceError::NotFound),
    }
}

fn contact_from_row(row: &PgRow) -> Result<Contact, sqlx::Error> {
    Ok(Contact {
        id: row.try_get("id")?,
        uuid: row.try_get("uuid")?,
        nombre: row.try_get("nombre")?,
        email: row.try_get("email")?,
        telefono: row.try_get("telefono")?,
        mensaje: row.try_get("mensaje")?,
        estado: row.try_get("estado")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
