use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::ToSchema;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct Welcome {
    pub message: String,
    pub docs: String,
    pub api_endpoints: BTreeMap<String, String>,
}

#[utoipa::path(
    get,
    path = "/",
    responses((status = 200, description = "Service overview", body = Welcome)),
    tag = "health"
)]
pub async fn root() -> impl IntoResponse {
    let api_endpoints = [
        ("users", "/api/users"),
        ("register", "/api/users/register"),
        ("resend_verification", "/api/users/resend-verification"),
        ("verify_email", "/verify-email/{token}"),
        ("contacts", "/api/contacts"),
        ("chat", "/api/chat"),
        ("agent_info", "/api/agent-info"),
        ("health", "/health"),
    ]
    .into_iter()
    .map(|(name, path)| (name.to_string(), path.to_string()))
    .collect();

    let welcome = Welcome {
        message: "Bienvenido a la API de ZeroWork".to_string(),
        docs: "/openapi.json".to_string(),
        api_endpoints,
    };
    (StatusCode::OK, Json(welcome))
}
