//! Ollama local LLM integration.
//!
//! Implements [`PromptProvider`] for a local Ollama server. Costs nothing per
//! call, so it is a useful low-priority competitor.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{error_from_response, PromptProvider, PromptRequest, ProviderError};

/// Ollama API provider for local LLM.
pub struct OllamaProvider {
    id: String,
    client: Client,
    base_url: String,
    model: String,
}

impl OllamaProvider {
    /// Create a new Ollama provider.
    ///
    /// Honors OLLAMA_HOST and OLLAMA_MODEL, defaulting to localhost:11434.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            client: Client::new(),
            base_url: std::env::var("OLLAMA_HOST")
                .unwrap_or_else(|_| "http://localhost:11434".to_string()),
            model: std::env::var("OLLAMA_MODEL").unwrap_or_else(|_| "llama3.2".to_string()),
        }
    }

    /// Create with a specific base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Create with a specific model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_prompt(request: &PromptRequest) -> String {
        format!("{}\n\n{}\nPrompt:", request.system_prompt(), request.user_message())
    }
}

#[async_trait]
impl PromptProvider for OllamaProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn generate_prompt(&self, request: &PromptRequest) -> Result<String, ProviderError> {
        let body = OllamaRequest {
            model: self.model.clone(),
            prompt: Self::build_prompt(request),
            stream: false,
            options: OllamaOptions { temperature: request.temperature },
        };

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                if err.is_connect() {
                    ProviderError::Unavailable(format!("Ollama not reachable at {}", self.base_url))
                } else {
                    err.into()
                }
            })?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let response: OllamaResponse = response.json().await?;
        let text = response.response.trim();
        if text.is_empty() {
            return Err(ProviderError::InvalidResponse("empty Ollama response".into()));
        }
        Ok(text.to_string())
    }
}

/// Ollama API request structure.
#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    prompt: String,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
}

/// Ollama API response structure.
#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AssetCategory, AssetRequest};

    #[test]
    fn test_builder() {
        let provider = OllamaProvider::new("local")
            .with_base_url("http://gpu-box:11434")
            .with_model("mistral");
        assert_eq!(provider.id(), "local");
        assert_eq!(provider.model(), "mistral");
        assert_eq!(provider.base_url, "http://gpu-box:11434");
    }

    #[test]
    fn test_prompt_includes_asset() {
        let request = PromptRequest {
            asset: AssetRequest::new(AssetCategory::Texture, "moss"),
            persona: "You paint textures.".into(),
            temperature: 0.8,
        };
        let prompt = OllamaProvider::build_prompt(&request);
        assert!(prompt.starts_with("You paint textures."));
        assert!(prompt.contains("Name: moss"));
    }
}
