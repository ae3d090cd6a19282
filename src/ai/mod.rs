//! AI provider integration.
//!
//! Two kinds of external model are used: prompt providers (LLMs that write an
//! image prompt for an asset) and image providers (models that render the
//! chosen prompt). Both report failures through the typed [`ProviderError`]
//! so the retry policy can tell transient trouble from permanent rejection.
//!
//! ## Backends
//!
//! - Claude, OpenAI and Ollama for prompts
//! - OpenAI Images for rendering
//! - Scripted mocks for tests and dry runs

#[cfg(feature = "ai")]
mod claude;
#[cfg(feature = "ai")]
mod images;
mod mock;
#[cfg(feature = "ai")]
mod ollama;
#[cfg(feature = "ai")]
mod openai;
mod orchestrator;
mod registry;
mod scoring;

#[cfg(feature = "ai")]
pub use claude::ClaudeProvider;
#[cfg(feature = "ai")]
pub use images::OpenAIImageProvider;
pub use mock::{MockImageProvider, MockPromptProvider, ScriptedOutcome};
#[cfg(feature = "ai")]
pub use ollama::OllamaProvider;
#[cfg(feature = "ai")]
pub use openai::OpenAIProvider;
pub use orchestrator::{ModelOrchestrator, PromptCandidate, PromptSelection, PromptSelectionError};
pub use registry::{
    validate_descriptors, Backend, Capability, DescriptorError, ProviderDescriptor,
    ProviderRegistry, ProviderRole, RegisteredImage, RegisteredPrompt,
};
pub use scoring::{HeuristicScorer, PromptScorer};

use std::time::Duration;

use async_trait::async_trait;

use crate::core::AssetRequest;

/// Input for one prompt-generation call.
#[derive(Debug, Clone)]
pub struct PromptRequest {
    /// The asset the prompt is for
    pub asset: AssetRequest,
    /// Persona / system voice for this provider
    pub persona: String,
    /// Sampling temperature
    pub temperature: f32,
}

impl PromptRequest {
    /// Instruction text shared by all prompt backends.
    pub fn system_prompt(&self) -> String {
        format!(
            r"{}

You write a single prompt for an image generation model.
Rules:
1. Output ONLY the prompt text, no preamble or explanation
2. Describe subject, composition, palette and lighting
3. No markdown formatting, no quotes
4. Keep it under 80 words",
            self.persona
        )
    }

    /// User message describing the asset.
    pub fn user_message(&self) -> String {
        let mut message = format!(
            "Asset type: {}\nName: {}\nSize: {}x{} {}\n",
            self.asset.category,
            self.asset.name,
            self.asset.width,
            self.asset.height,
            self.asset.format.extension()
        );
        if !self.asset.context.is_empty() {
            message.push_str("\nContext:\n");
            message.push_str(&self.asset.context);
        }
        message
    }
}

/// Input for one image-generation call.
#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub asset: AssetRequest,
    /// The winning prompt
    pub prompt: String,
}

/// Rendered image bytes.
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    /// Provider-side identifier, when the API returns one
    pub remote_id: Option<String>,
}

/// Prompt-writing model.
#[async_trait]
pub trait PromptProvider: Send + Sync {
    /// Stable provider id used for breakers, costs and manifests.
    fn id(&self) -> &str;

    /// Write an image prompt for the request.
    async fn generate_prompt(&self, request: &PromptRequest) -> Result<String, ProviderError>;
}

/// Image-rendering model.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    fn id(&self) -> &str;

    /// Render the prompt into image bytes.
    async fn generate_image(&self, request: &ImageRequest) -> Result<GeneratedImage, ProviderError>;
}

/// Failure of one provider attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited{}", retry_after.map(|s| format!(", retry after {s}s")).unwrap_or_default())]
    RateLimited { retry_after: Option<u64> },

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("authentication failed: {0}")]
    Authentication(String),
}

impl ProviderError {
    /// Whether another attempt could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::RateLimited { .. } | Self::Server { .. } | Self::Unavailable(_)
        )
    }

    /// Map an HTTP error status and body onto an error class.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let message = body.into();
        match status {
            401 | 403 => Self::Authentication(message),
            408 => Self::Timeout(Duration::ZERO),
            429 => Self::RateLimited { retry_after: None },
            500..=599 => Self::Server { status, message },
            _ => Self::InvalidRequest(format!("HTTP {status}: {message}")),
        }
    }

    /// Short class name used in manifests and events.
    pub fn class(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::RateLimited { .. } => "rate_limited",
            Self::Server { .. } => "server_error",
            Self::Unavailable(_) => "unavailable",
            Self::InvalidResponse(_) => "invalid_response",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Authentication(_) => "authentication",
        }
    }
}

#[cfg(feature = "ai")]
impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(Duration::ZERO)
        } else if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else if let Some(status) = err.status() {
            Self::from_status(status.as_u16(), err.to_string())
        } else {
            Self::Unavailable(err.to_string())
        }
    }
}

/// Turn a non-success HTTP response into a [`ProviderError`].
#[cfg(feature = "ai")]
pub(crate) async fn error_from_response(response: reqwest::Response) -> ProviderError {
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let body = response.text().await.unwrap_or_default();
    match ProviderError::from_status(status, body) {
        ProviderError::RateLimited { .. } => ProviderError::RateLimited { retry_after },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::AssetCategory;

    #[test]
    fn test_transient_classification() {
        assert!(ProviderError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(ProviderError::RateLimited { retry_after: Some(3) }.is_transient());
        assert!(ProviderError::from_status(503, "busy").is_transient());
        assert!(!ProviderError::from_status(401, "bad key").is_transient());
        assert!(!ProviderError::from_status(400, "bad prompt").is_transient());
        assert!(!ProviderError::InvalidResponse("empty".into()).is_transient());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(ProviderError::from_status(403, "no").class(), "authentication");
        assert_eq!(ProviderError::from_status(429, "").class(), "rate_limited");
        assert_eq!(ProviderError::from_status(502, "").class(), "server_error");
        assert_eq!(ProviderError::from_status(422, "").class(), "invalid_request");
    }

    #[test]
    fn test_rate_limited_display() {
        let err = ProviderError::RateLimited { retry_after: Some(30) };
        assert_eq!(err.to_string(), "rate limited, retry after 30s");
        assert_eq!(ProviderError::RateLimited { retry_after: None }.to_string(), "rate limited");
    }

    #[test]
    fn test_prompt_request_messages() {
        let request = PromptRequest {
            asset: AssetRequest::new(AssetCategory::Icon, "focus-timer")
                .with_context("calm, encouraging"),
            persona: "You are a minimalist icon designer.".to_string(),
            temperature: 0.4,
        };
        assert!(request.system_prompt().starts_with("You are a minimalist icon designer."));
        let message = request.user_message();
        assert!(message.contains("Name: focus-timer"));
        assert!(message.contains("512x512 png"));
        assert!(message.contains("calm, encouraging"));
    }
}
