//! Configuration management for the strata memory worker.
//!
//! Configuration can be set via environment variables:
//! - `EMBED_API_KEY` - Required. Platform embedding provider key.
//! - `STORE_URI` - Optional. Vector store location. Defaults to `./data/strata`.
//! - `EMBED_ENDPOINT` - Optional. Embedding API endpoint. Defaults to the OpenRouter embeddings URL.
//! - `EMBED_MODEL` - Optional. Embedding model. Defaults to `openai/text-embedding-3-small`.
//! - `EMBED_DIMENSION` - Optional. Embedding dimension. Defaults to `1536`.
//! - `CREDIT_BALANCE` - Optional. Platform embedding credit pool in tokens. Defaults to `5000000`.
//! - `INDEX_TIMEOUT_SECS` - Optional. Global timeout for one document-indexing pass. Defaults to `120`.
//! - `SNIPPET_TARGET_CHARS` - Optional. Target snippet size in characters. Defaults to `1200`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Vector store location (local path or remote URI)
    pub store_uri: String,

    /// Embedding API endpoint
    pub embed_endpoint: String,

    /// Embedding model identifier
    pub embed_model: String,

    /// Embedding dimension (must match model output)
    pub embed_dimension: usize,

    /// Platform embedding provider key (workspaces may override with BYOK)
    pub platform_api_key: String,

    /// Platform embedding credit pool, in tokens
    pub credit_balance: u64,

    /// Global timeout for one document-indexing pass, in seconds
    pub index_timeout_secs: u64,

    /// Target snippet size in characters
    pub snippet_target_chars: usize,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `EMBED_API_KEY` is not set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let platform_api_key = std::env::var("EMBED_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("EMBED_API_KEY".to_string()))?;

        let store_uri = std::env::var("STORE_URI").unwrap_or_else(|_| "./data/strata".to_string());

        let embed_endpoint = std::env::var("EMBED_ENDPOINT")
            .unwrap_or_else(|_| "https://openrouter.ai/api/v1/embeddings".to_string());

        let embed_model = std::env::var("EMBED_MODEL")
            .unwrap_or_else(|_| "openai/text-embedding-3-small".to_string());

        let embed_dimension = parse_var("EMBED_DIMENSION", 1536)?;
        let credit_balance = parse_var("CREDIT_BALANCE", 5_000_000)?;
        let index_timeout_secs = parse_var("INDEX_TIMEOUT_SECS", 120)?;
        let snippet_target_chars = parse_var("SNIPPET_TARGET_CHARS", 1200)?;

        Ok(Self {
            store_uri,
            embed_endpoint,
            embed_model,
            embed_dimension,
            platform_api_key,
            credit_balance,
            index_timeout_secs,
            snippet_target_chars,
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(platform_api_key: String, store_uri: String) -> Self {
        Self {
            store_uri,
            embed_endpoint: "https://openrouter.ai/api/v1/embeddings".to_string(),
            embed_model: "openai/text-embedding-3-small".to_string(),
            embed_dimension: 1536,
            platform_api_key,
            credit_balance: 5_000_000,
            index_timeout_secs: 120,
            snippet_target_chars: 1200,
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        Err(_) => Ok(default),
    }
}
