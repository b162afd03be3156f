use anyhow::{Result, bail};
use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

use crate::agent::{
    DEFAULT_AGENT_BASE_URL, DEFAULT_AGENT_INSTRUCTIONS, DEFAULT_AGENT_MODEL, DEFAULT_AGENT_NAME,
};

pub const ARG_OPENAI_API_KEY: &str = "openai-api-key";
pub const ARG_AGENT_BASE_URL: &str = "agent-base-url";
pub const ARG_AGENT_MODEL: &str = "agent-model";
pub const ARG_AGENT_NAME: &str = "agent-name";
pub const ARG_AGENT_INSTRUCTIONS: &str = "agent-instructions";
pub const ARG_VECTOR_STORE_ID: &str = "vector-store-id";

#[derive(Debug, Clone)]
pub struct Options {
    pub api_key: SecretString,
    pub base_url: String,
    pub model: String,
    pub name: String,
    pub instructions: String,
    pub vector_store_id: Option<String>,
}

impl Options {
    /// # Errors
    /// Returns an error if the API key is missing.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let get = |id: &str, default: &str| {
            matches
                .get_one::<String>(id)
                .cloned()
                .unwrap_or_else(|| default.to_string())
        };

        let api_key = match matches.get_one::<String>(ARG_OPENAI_API_KEY) {
            Some(key) if !key.trim().is_empty() => SecretString::from(key.trim().to_string()),
            _ => bail!("missing required argument: --{ARG_OPENAI_API_KEY}"),
        };

        Ok(Self {
            api_key,
            base_url: get(ARG_AGENT_BASE_URL, DEFAULT_AGENT_BASE_URL),
            model: get(ARG_AGENT_MODEL, DEFAULT_AGENT_MODEL),
            name: get(ARG_AGENT_NAME, DEFAULT_AGENT_NAME),
            instructions: get(ARG_AGENT_INSTRUCTIONS, DEFAULT_AGENT_INSTRUCTIONS),
            vector_store_id: matches.get_one::<String>(ARG_VECTOR_STORE_ID).cloned(),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_OPENAI_API_KEY)
                .long(ARG_OPENAI_API_KEY)
                .help("API key for the hosted chat agent")
                .env("OPENAI_API_KEY")
                .hide_env_values(true),
        )
        .arg(
            Arg::new(ARG_AGENT_BASE_URL)
                .long(ARG_AGENT_BASE_URL)
                .help("Base URL of the Responses API")
                .env("ZEROWORK_AGENT_BASE_URL")
                .default_value(DEFAULT_AGENT_BASE_URL),
        )
        .arg(
            Arg::new(ARG_AGENT_MODEL)
                .long(ARG_AGENT_MODEL)
                .help("Model used by the chat agent")
                .env("ZEROWORK_AGENT_MODEL")
                .default_value(DEFAULT_AGENT_MODEL),
        )
        .arg(
            Arg::new(ARG_AGENT_NAME)
                .long(ARG_AGENT_NAME)
                .help("Name reported by /api/agent-info")
                .env("ZEROWORK_AGENT_NAME")
                .default_value(DEFAULT_AGENT_NAME),
        )
        .arg(
            Arg::new(ARG_AGENT_INSTRUCTIONS)
                .long(ARG_AGENT_INSTRUCTIONS)
                .help("System instructions sent with every chat message")
                .env("ZEROWORK_AGENT_INSTRUCTIONS"),
        )
        .arg(
            Arg::new(ARG_VECTOR_STORE_ID)
                .long(ARG_VECTOR_STORE_ID)
                .help("Vector store searched by the agent (file_search tool)")
                .env("VECTOR_STORE_ID"),
        )
}
