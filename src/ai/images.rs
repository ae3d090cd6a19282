//! OpenAI Images integration.
//!
//! Implements [`ImageProvider`] over the images/generations endpoint. The API
//! answers with a short-lived URL which is downloaded immediately.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{error_from_response, GeneratedImage, ImageProvider, ImageRequest, ProviderError};

/// OpenAI image generation provider.
pub struct OpenAIImageProvider {
    id: String,
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAIImageProvider {
    /// Reads API key from OPENAI_API_KEY environment variable.
    pub fn new(id: impl Into<String>) -> anyhow::Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;
        Ok(Self {
            id: id.into(),
            client: Client::new(),
            api_key,
            model: "dall-e-3".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, ProviderError> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Err(ProviderError::InvalidResponse("downloaded image is empty".into()));
        }
        Ok(bytes.to_vec())
    }
}

/// Closest size the API accepts for the requested aspect ratio.
fn api_size(width: u32, height: u32) -> &'static str {
    let ratio = f64::from(width) / f64::from(height.max(1));
    if ratio > 1.3 {
        "1792x1024"
    } else if ratio < 0.77 {
        "1024x1792"
    } else {
        "1024x1024"
    }
}

#[async_trait]
impl ImageProvider for OpenAIImageProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn generate_image(&self, request: &ImageRequest) -> Result<GeneratedImage, ProviderError> {
        let body = ImagesRequest {
            model: self.model.clone(),
            prompt: request.prompt.clone(),
            n: 1,
            size: api_size(request.asset.width, request.asset.height).to_string(),
            response_format: "url".to_string(),
        };

        let response = self
            .client
            .post(format!("{}/images/generations", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let response: ImagesResponse = response.json().await?;
        let url = response
            .data
            .into_iter()
            .find_map(|d| d.url)
            .ok_or_else(|| ProviderError::InvalidResponse("no image url in response".into()))?;

        let bytes = self.download(&url).await?;
        Ok(GeneratedImage { bytes, remote_id: Some(url) })
    }
}

#[derive(Debug, Serialize)]
struct ImagesRequest {
    model: String,
    prompt: String,
    n: u32,
    size: String,
    response_format: String,
}

#[derive(Debug, Deserialize)]
struct ImagesResponse {
    data: Vec<ImageData>,
}

#[derive(Debug, Deserialize)]
struct ImageData {
    #[serde(default)]
    url: Option<String>,
}
