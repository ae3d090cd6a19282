//! Claude API integration.
//!
//! Implements [`PromptProvider`] over the Anthropic messages API.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{error_from_response, PromptProvider, PromptRequest, ProviderError};

const DEFAULT_ENDPOINT: &str = "https://api.anthropic.com/v1/messages";

/// Claude API provider.
pub struct ClaudeProvider {
    id: String,
    client: Client,
    api_key: String,
    model: String,
    endpoint: String,
}

impl ClaudeProvider {
    /// Create a new Claude provider.
    ///
    /// Reads API key from ANTHROPIC_API_KEY environment variable.
    pub fn new(id: impl Into<String>) -> anyhow::Result<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| anyhow::anyhow!("ANTHROPIC_API_KEY not set"))?;
        Ok(Self::with_key(id, api_key))
    }

    /// Create with an explicit API key.
    pub fn with_key(id: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            client: Client::new(),
            api_key: api_key.into(),
            model: "claude-sonnet-4-20250514".to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
        }
    }

    /// Create with a specific model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Point at a different messages endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl PromptProvider for ClaudeProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn generate_prompt(&self, request: &PromptRequest) -> Result<String, ProviderError> {
        let body = ClaudeRequest {
            model: self.model.clone(),
            max_tokens: 400,
            temperature: request.temperature,
            system: request.system_prompt(),
            messages: vec![Message { role: "user".to_string(), content: request.user_message() }],
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let response: ClaudeResponse = response.json().await?;
        response
            .content
            .into_iter()
            .find_map(|c| c.text)
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or_else(|| ProviderError::InvalidResponse("no text in Claude response".into()))
    }
}

/// Claude API request structure.
#[derive(Debug, Serialize)]
struct ClaudeRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    system: String,
    messages: Vec<Message>,
}

/// Message in a Claude request.
#[derive(Debug, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

/// Claude API response structure.
#[derive(Debug, Deserialize)]
struct ClaudeResponse {
    content: Vec<ContentBlock>,
}

/// Content block in a Claude response.
#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[serial_test::serial]
    fn test_claude_provider_creation_fails_without_key() {
        std::env::remove_var("ANTHROPIC_API_KEY");
        assert!(ClaudeProvider::new("claude").is_err());
    }

    #[test]
    fn test_builder() {
        let provider = ClaudeProvider::with_key("claude-art", "k").with_model("claude-haiku");
        assert_eq!(provider.id(), "claude-art");
        assert_eq!(provider.model(), "claude-haiku");
    }

    #[test]
    fn test_response_parsing_skips_non_text_blocks() {
        let json = r#"{"content":[{"type":"tool_use"},{"type":"text","text":"  a fox  "}]}"#;
        let response: ClaudeResponse = serde_json::from_str(json).unwrap();
        let text = response.content.into_iter().find_map(|c| c.text).unwrap();
        assert_eq!(text.trim(), "a fox");
    }
}
