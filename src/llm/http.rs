//! Client for a local inference server speaking the `/api/generate` shape.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::llm::{LanguageModel, LlmConfig};

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

/// Non-streaming HTTP model client.
pub struct HttpLanguageModel {
    base_url: String,
    model: String,
    api_key: Option<SecretString>,
    client: reqwest::Client,
}

impl HttpLanguageModel {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            base_url: config.base_url.clone(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/api/generate", self.base_url)
    }

    fn request_failed(&self, reason: impl ToString) -> LlmError {
        LlmError::RequestFailed {
            model: self.model.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl LanguageModel for HttpLanguageModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str, timeout: Duration) -> Result<String, LlmError> {
        let body = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
        };

        let mut request = self.client.post(self.endpoint()).json(&body).timeout(timeout);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let resp = request.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout {
                    model: self.model.clone(),
                    timeout,
                }
            } else {
                self.request_failed(e)
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let err = resp.text().await.unwrap_or_default();
            return Err(self.request_failed(format!("HTTP {status}: {err}")));
        }

        let text = resp.text().await.map_err(|e| self.request_failed(e))?;
        let parsed: GenerateResponse = serde_json::from_str(&text)?;

        let output = parsed.response.trim();
        if output.is_empty() {
            return Err(LlmError::InvalidResponse {
                model: self.model.clone(),
                reason: "empty response".into(),
            });
        }

        tracing::debug!(model = %self.model, chars = output.len(), "Generation complete");
        Ok(output.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_appends_generate_path() {
        let model = HttpLanguageModel::new(&LlmConfig {
            base_url: "http://localhost:11434".into(),
            ..LlmConfig::default()
        });
        assert_eq!(model.endpoint(), "http://localhost:11434/api/generate");
    }

    #[test]
    fn request_serializes_without_streaming() {
        let body = GenerateRequest {
            model: "m",
            prompt: "p",
            stream: false,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["stream"], false);
        assert_eq!(json["prompt"], "p");
    }

    #[test]
    fn response_tolerates_extra_fields() {
        let parsed: GenerateResponse =
            serde_json::from_str(r#"{"model":"m","response":"hi","done":true}"#).unwrap();
        assert_eq!(parsed.response, "hi");
    }
}
