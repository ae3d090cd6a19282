//! OpenAI API integration.
//!
//! Implements [`PromptProvider`] for OpenAI chat models and any
//! chat-completions compatible API.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{error_from_response, PromptProvider, PromptRequest, ProviderError};

/// OpenAI API provider.
pub struct OpenAIProvider {
    id: String,
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAIProvider {
    /// Create a new OpenAI provider.
    ///
    /// Reads API key from OPENAI_API_KEY environment variable.
    pub fn new(id: impl Into<String>) -> anyhow::Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;
        Ok(Self::with_key(id, api_key))
    }

    /// Create with an explicit API key.
    pub fn with_key(id: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            client: Client::new(),
            api_key: api_key.into(),
            model: "gpt-4o".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }

    /// Create with a specific model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Create with a custom base URL (for compatible APIs).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl PromptProvider for OpenAIProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn generate_prompt(&self, request: &PromptRequest) -> Result<String, ProviderError> {
        let body = OpenAIRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage { role: "system".to_string(), content: request.system_prompt() },
                ChatMessage { role: "user".to_string(), content: request.user_message() },
            ],
            max_tokens: Some(400),
            temperature: Some(request.temperature),
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let response: OpenAIResponse = response.json().await?;
        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or_else(|| ProviderError::InvalidResponse("no choices in OpenAI response".into()))
    }
}

/// OpenAI API request structure.
#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

/// Chat message structure.
#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

/// OpenAI API response structure.
#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[serial_test::serial]
    fn test_openai_provider_creation_fails_without_key() {
        std::env::remove_var("OPENAI_API_KEY");
        assert!(OpenAIProvider::new("openai").is_err());
    }

    #[test]
    fn test_request_serialization_skips_empty_options() {
        let request = OpenAIRequest {
            model: "gpt-4o".to_string(),
            messages: vec![],
            max_tokens: None,
            temperature: Some(0.5),
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(!json.contains("max_tokens"));
        assert!(json.contains("\"temperature\":0.5"));
    }

    #[test]
    fn test_null_content_parses() {
        let json = r#"{"choices":[{"message":{"role":"assistant","content":null}}]}"#;
        let response: OpenAIResponse = serde_json::from_str(json).unwrap();
        assert!(response.choices[0].message.content.is_none());
    }
}
