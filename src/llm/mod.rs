//! Language-model seam.
//!
//! The processor only needs "prompt in, text out, within a deadline".
//! `HttpLanguageModel` talks to a local inference server; tests and
//! embedders can plug in any other `LanguageModel`.

pub mod http;

pub use http::HttpLanguageModel;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::error::{ConfigError, LlmError};

/// Default deadline for a single generation.
pub const DEFAULT_LLM_TIMEOUT: Duration = Duration::from_secs(60);

/// A text-generation backend.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Model identifier for logging.
    fn model_name(&self) -> &str;

    /// Generate a completion for `prompt`, giving up after `timeout`.
    async fn generate(&self, prompt: &str, timeout: Duration) -> Result<String, LlmError>;
}

/// Configuration for creating the language model client.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Base URL of the inference server, e.g. `http://127.0.0.1:11434`.
    pub base_url: String,
    pub model: String,
    /// Optional bearer token for servers that require one.
    pub api_key: Option<SecretString>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:11434".to_string(),
            model: "gemma3:1b".to_string(),
            api_key: None,
        }
    }
}

impl LlmConfig {
    /// Build config from `LLM_BASE_URL`, `LLM_MODEL` and `LLM_API_KEY`,
    /// falling back to defaults. The per-call deadline lives in
    /// `RunnerConfig::llm_timeout`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let base_url = std::env::var("LLM_BASE_URL").unwrap_or(defaults.base_url);
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::invalid(
                "LLM_BASE_URL",
                format!("expected an http(s) URL, got {base_url}"),
            ));
        }

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: std::env::var("LLM_MODEL").unwrap_or(defaults.model),
            api_key: std::env::var("LLM_API_KEY").ok().map(SecretString::from),
        })
    }
}

/// Create the language model client from configuration.
pub fn create_model(config: &LlmConfig) -> Arc<dyn LanguageModel> {
    tracing::info!(model = %config.model, base_url = %config.base_url, "Using local language model");
    Arc::new(HttpLanguageModel::new(config))
}
