use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, instrument};
use utoipa::ToSchema;

use super::auth::{AuthConfig, require_bearer, unauthorized};
use crate::agent::AgentClient;

#[derive(Debug, Deserialize, ToSchema)]
pub struct ChatRequest {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ChatResponse {
    pub respuesta: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AgentInfo {
    pub name: String,
    pub instructions: String,
    pub model: String,
    pub status: String,
}

#[utoipa::path(
    post,
    path = "/api/chat",
    request_body = ChatRequest,
    responses(
        (status = 200, description = "Agent reply", body = ChatResponse),
        (status = 400, description = "Empty message"),
        (status = 401, description = "Missing or invalid bearer token"),
        (status = 502, description = "Agent call failed"),
    ),
    security(("bearer" = [])),
    tag = "chat"
)]
#[instrument(skip_all)]
pub async fn chat(
    headers: HeaderMap,
    auth: Extension<Arc<AuthConfig>>,
    agent: Extension<Arc<AgentClient>>,
    payload: Option<Json<ChatRequest>>,
) -> impl IntoResponse {
    if let Err(err) = require_bearer(&headers, &auth) {
        return unauthorized(&err);
    }
    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload").into_response();
    };

    let message = request.message.trim();
    if message.is_empty() {
        return (StatusCode::BAD_REQUEST, "Message is required").into_response();
    }

    match agent.reply(message).await {
        Ok(respuesta) => (StatusCode::OK, Json(ChatResponse { respuesta })).into_response(),
        Err(err) => {
            error!("Chat agent error: {err:#}");
            (StatusCode::BAD_GATEWAY, format!("Chat agent error: {err}")).into_response()
        }
    }
}

#[utoipa::path(
    get,
    path = "/api/agent-info",
    responses(
        (status = 200, description = "Configured agent", body = AgentInfo),
        (status = 401, description = "Missing or invalid bearer token"),
    ),
    security(("bearer" = [])),
    tag = "chat"
)]
pub async fn agent_info(
    headers: HeaderMap,
    auth: Extension<Arc<AuthConfig>>,
    agent: Extension<Arc<AgentClient>>,
) -> impl IntoResponse {
    if let Err(err) = require_bearer(&headers, &auth) {
        return unauthorized(&err);
    }

    let config = agent.config();
    let info = AgentInfo {
        name: config.name().to_string(),
        instructions: config.instructions().to_string(),
        model: config.model().to_string(),
        status: "active".to_string(),
    };
    (StatusCode::OK, Json(info)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentConfig, DEFAULT_AGENT_MODEL, DEFAULT_AGENT_NAME};
    use crate::api::handlers::auth::tests::{TEST_TOKEN, auth_config, bearer_headers};
    use anyhow::Result;
    use axum::body::to_bytes;
    use secrecy::SecretString;
    use serde_json::json;
    use std::net::TcpListener;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn can_bind_localhost() -> bool {
        TcpListener::bind("127.0.0.1:0").is_ok()
    }

    fn agent(base_url: &str) -> Result<Arc<AgentClient>> {
        let config = AgentConfig::new(SecretString::from("sk-test".to_string()))
            .with_base_url(base_url.to_string());
        Ok(Arc::new(AgentClient::new(config)?))
    }

    #[tokio::test]
    async fn chat_requires_bearer() -> Result<()> {
        let response = chat(
            HeaderMap::new(),
            Extension(Arc::new(auth_config())),
            Extension(agent("http://127.0.0.1:9")?),
            Some(Json(ChatRequest {
                message: "hola".to_string(),
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        Ok(())
    }

    #[tokio::test]
    async fn chat_rejects_blank_message() -> Result<()> {
        let response = chat(
            bearer_headers(TEST_TOKEN),
            Extension(Arc::new(auth_config())),
            Extension(agent("http://127.0.0.1:9")?),
            Some(Json(ChatRequest {
                message: "   ".to_string(),
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn chat_maps_agent_failure_to_bad_gateway() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return Ok(());
        }
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/responses"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "error": {"message": "upstream down"}
            })))
            .mount(&server)
            .await;

        let response = chat(
            bearer_headers(TEST_TOKEN),
            Extension(Arc::new(auth_config())),
            Extension(agent(&server.uri())?),
            Some(Json(ChatRequest {
                message: "hola".to_string(),
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let body = to_bytes(response.into_body(), usize::MAX).await?;
        let body = String::from_utf8(body.to_vec())?;
        assert!(body.starts_with("Chat agent error: "));
        assert!(body.contains("upstream down"));
        Ok(())
    }

    #[tokio::test]
    async fn chat_returns_reply() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return Ok(());
        }
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/responses"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"output_text": "¡Hola!"})),
            )
            .mount(&server)
            .await;

        let response = chat(
            bearer_headers(TEST_TOKEN),
            Extension(Arc::new(auth_config())),
            Extension(agent(&server.uri())?),
            Some(Json(ChatRequest {
                message: " hola ".to_string(),
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await?;
        let reply: ChatResponse = serde_json::from_slice(&body)?;
        assert_eq!(reply.respuesta, "¡Hola!");
        Ok(())
    }

    #[tokio::test]
    async fn agent_info_reports_config() -> Result<()> {
        let response = agent_info(
            bearer_headers(TEST_TOKEN),
            Extension(Arc::new(auth_config())),
            Extension(agent("http://127.0.0.1:9")?),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await?;
        let info: AgentInfo = serde_json::from_slice(&body)?;
        assert_eq!(info.name, DEFAULT_AGENT_NAME);
        assert_eq!(info.model, DEFAULT_AGENT_MODEL);
        assert_eq!(info.status, "active");
        Ok(())
    }
}
