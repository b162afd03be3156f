//! Client for the hosted language-model agent behind `/api/chat`.
//!
//! The agent is a black box: one message in, one text reply out. Requests go
//! to the Responses API (`POST {base_url}/responses`) with the configured
//! model and instructions; when a vector store is configured the request also
//! enables the `file_search` tool over it.

use crate::APP_USER_AGENT;
use anyhow::{Context, Result, anyhow};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{error, instrument};
use url::Url;

pub const DEFAULT_AGENT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_AGENT_MODEL: &str = "gpt-4.1-nano-2025-04-14";
pub const DEFAULT_AGENT_NAME: &str = "Agente ZeroWork";
pub const DEFAULT_AGENT_INSTRUCTIONS: &str = "Eres el asistente de ZeroWork. Responde en el idioma del usuario, de forma clara y breve, usando la documentación disponible cuando sea relevante.";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct AgentConfig {
    base_url: String,
    api_key: SecretString,
    model: String,
    name: String,
    instructions: String,
    vector_store_id: Option<String>,
    timeout: Duration,
}

impl AgentConfig {
    #[must_use]
    pub fn new(api_key: SecretString) -> Self {
        Self {
            base_url: DEFAULT_AGENT_BASE_URL.to_string(),
            api_key,
            model: DEFAULT_AGENT_MODEL.to_string(),
            name: DEFAULT_AGENT_NAME.to_string(),
            instructions: DEFAULT_AGENT_INSTRUCTIONS.to_string(),
            vector_store_id: None,
            timeout: REQUEST_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    #[must_use]
    pub fn with_model(mut self, model: String) -> Self {
        self.model = model;
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: String) -> Self {
        self.name = name;
        self
    }

    #[must_use]
    pub fn with_instructions(mut self, instructions: String) -> Self {
        self.instructions = instructions;
        self
    }

    #[must_use]
    pub fn with_vector_store_id(mut self, vector_store_id: Option<String>) -> Self {
        self.vector_store_id = vector_store_id.filter(|id| !id.trim().is_empty());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn instructions(&self) -> &str {
        &self.instructions
    }

    #[must_use]
    pub fn vector_store_id(&self) -> Option<&str> {
        self.vector_store_id.as_deref()
    }
}

#[derive(Debug, Serialize)]
struct ResponsesRequest<'a> {
    model: &'a str,
    instructions: &'a str,
    input: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
}

#[derive(Clone, Debug)]
pub struct AgentClient {
    client: Client,
    endpoint: Url,
    config: AgentConfig,
}

impl AgentClient {
    /// # Errors
    /// Returns an error if the base URL is invalid or the HTTP client cannot be built.
    pub fn new(config: AgentConfig) -> Result<Self> {
        let endpoint = responses_endpoint(config.base_url())?;
        let client = Client::builder()
            .user_agent(APP_USER_AGENT)
            .timeout(config.timeout)
            .build()
            .context("failed to build agent HTTP client")?;

        Ok(Self {
            client,
            endpoint,
            config,
        })
    }

    #[must_use]
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Send one user message and return the agent's text reply.
    ///
    /// # Errors
    /// Returns an error on transport failures, non-2xx answers, or replies
    /// without any text output.
    #[instrument(skip(self, message), fields(model = %self.config.model))]
    pub async fn reply(&self, message: &str) -> Result<String> {
        let tools = self
            .config
            .vector_store_id()
            .map(|id| {
                vec![json!({
                    "type": "file_search",
                    "vector_store_ids": [id],
                })]
            })
            .unwrap_or_default();

        let request = ResponsesRequest {
            model: &self.config.model,
            instructions: &self.config.instructions,
            input: message,
            tools,
        };

        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(self.config.api_key.expose_secret())
            .json(&request)
            .send()
            .await
            .context("agent request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body: Value = response.json().await.unwrap_or_default();
            let error_message = body["error"]["message"].as_str().unwrap_or_default();
            error!("agent returned {status}: {error_message}");
            return Err(anyhow!("{status}, {error_message}"));
        }

        let body: Value = response
            .json()
            .await
            .context("agent response is not JSON")?;

        extract_output_text(&body).ok_or_else(|| anyhow!("agent response has no text output"))
    }
}

fn responses_endpoint(base_url: &str) -> Result<Url> {
    let endpoint = format!("{}/responses", base_url.trim_end_matches('/'));
    let url = Url::parse(&endpoint).with_context(|| format!("invalid agent base URL: {base_url}"))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(anyhow!("unsupported agent URL scheme: {scheme}")),
    }
}

/// Pull the reply text out of a Responses API body.
fn extract_output_text(body: &Value) -> Option<String> {
    if let Some(text) = body["output_text"].as_str().filter(|text| !text.is_empty()) {
        return Some(text.to_string());
    }

    let parts: Vec<&str> = body["output"]
        .as_array()?
        .iter()
        .filter_map(|item| item["content"].as_array())
        .flatten()
        .filter(|content| content["type"] == "output_text")
        .filter_map(|content| content["text"].as_str())
        .collect();

    if parts.is_empty() {
        None
    } else {
        Some(parts.concat())
    }
}
