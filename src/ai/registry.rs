//! Typed provider descriptors and the registry built from them.
//!
//! Providers are declared in configuration as a list of descriptors, checked
//! once at startup, then turned into trait objects. Nothing dispatches on
//! provider names after that point.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{ImageProvider, MockImageProvider, MockPromptProvider, PromptProvider};
use crate::core::Cost;

/// What a provider is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderRole {
    Prompt,
    Image,
}

/// API a provider talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    Claude,
    Openai,
    Ollama,
    OpenaiImages,
    Mock,
}

impl Backend {
    fn role(self) -> Option<ProviderRole> {
        match self {
            Self::Claude | Self::Openai | Self::Ollama => Some(ProviderRole::Prompt),
            Self::OpenaiImages => Some(ProviderRole::Image),
            Self::Mock => None,
        }
    }
}

/// Declared provider capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Text,
    Image,
}

/// One `[[providers]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub id: String,
    pub role: ProviderRole,
    pub backend: Backend,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// System voice for prompt providers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Lower values are preferred
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Estimated cost per call in USD
    pub cost: Cost,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_priority() -> u32 {
    100
}

fn default_enabled() -> bool {
    true
}

impl ProviderDescriptor {
    /// Enabled mock descriptor with the capability its role needs.
    pub fn mock(id: impl Into<String>, role: ProviderRole, cost: Cost) -> Self {
        let capability = match role {
            ProviderRole::Prompt => Capability::Text,
            ProviderRole::Image => Capability::Image,
        };
        Self {
            id: id.into(),
            role,
            backend: Backend::Mock,
            model: None,
            base_url: None,
            persona: None,
            temperature: default_temperature(),
            priority: default_priority(),
            cost,
            capabilities: vec![capability],
            enabled: true,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    fn required_capability(&self) -> Capability {
        match self.role {
            ProviderRole::Prompt => Capability::Text,
            ProviderRole::Image => Capability::Image,
        }
    }
}

/// Problems found in the provider list.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DescriptorError {
    #[error("duplicate provider id '{0}'")]
    DuplicateId(String),

    #[error("provider id '{0}' must be non-empty and use only letters, digits, '-' or '_'")]
    InvalidId(String),

    #[error("no enabled {0:?} provider configured")]
    MissingRole(ProviderRole),

    #[error("provider '{id}' uses backend {backend:?}, which cannot serve the {role:?} role")]
    BackendMismatch { id: String, backend: Backend, role: ProviderRole },

    #[error("provider '{id}' must declare the {capability:?} capability")]
    MissingCapability { id: String, capability: Capability },

    #[error("provider '{id}' temperature {temperature} is outside 0.0..=2.0")]
    Temperature { id: String, temperature: f32 },

    #[error("failed to initialize provider '{id}': {message}")]
    Init { id: String, message: String },
}

/// Check a provider list before anything is built from it.
pub fn validate_descriptors(descriptors: &[ProviderDescriptor]) -> Result<(), DescriptorError> {
    let mut seen = HashSet::new();
    for descriptor in descriptors {
        let id = &descriptor.id;
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(DescriptorError::InvalidId(id.clone()));
        }
        if !seen.insert(id.as_str()) {
            return Err(DescriptorError::DuplicateId(id.clone()));
        }
        if descriptor.backend.role().is_some_and(|role| role != descriptor.role) {
            return Err(DescriptorError::BackendMismatch {
                id: id.clone(),
                backend: descriptor.backend,
                role: descriptor.role,
            });
        }
        let capability = descriptor.required_capability();
        if !descriptor.capabilities.contains(&capability) {
            return Err(DescriptorError::MissingCapability { id: id.clone(), capability });
        }
        if !(0.0..=2.0).contains(&descriptor.temperature) {
            return Err(DescriptorError::Temperature {
                id: id.clone(),
                temperature: descriptor.temperature,
            });
        }
    }

    for role in [ProviderRole::Prompt, ProviderRole::Image] {
        if !descriptors.iter().any(|d| d.enabled && d.role == role) {
            return Err(DescriptorError::MissingRole(role));
        }
    }
    Ok(())
}

const DEFAULT_PERSONA: &str = "You are a senior visual designer writing prompts for an image model.";

/// A prompt provider with its selection settings.
#[derive(Clone)]
pub struct RegisteredPrompt {
    pub provider: Arc<dyn PromptProvider>,
    pub priority: u32,
    pub cost: Cost,
    pub persona: String,
    pub temperature: f32,
}

impl RegisteredPrompt {
    pub fn new(provider: Arc<dyn PromptProvider>, cost: Cost) -> Self {
        Self {
            provider,
            priority: default_priority(),
            cost,
            persona: DEFAULT_PERSONA.to_string(),
            temperature: default_temperature(),
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_persona(mut self, persona: impl Into<String>) -> Self {
        self.persona = persona.into();
        self
    }

    pub fn id(&self) -> &str {
        self.provider.id()
    }
}

/// An image provider with its fallback order.
#[derive(Clone)]
pub struct RegisteredImage {
    pub provider: Arc<dyn ImageProvider>,
    pub priority: u32,
    pub cost: Cost,
}

impl RegisteredImage {
    pub fn new(provider: Arc<dyn ImageProvider>, cost: Cost) -> Self {
        Self { provider, priority: default_priority(), cost }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn id(&self) -> &str {
        self.provider.id()
    }
}

/// Enabled providers, kept in priority order.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    prompts: Vec<RegisteredPrompt>,
    images: Vec<RegisteredImage>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("prompts", &self.prompts.iter().map(RegisteredPrompt::id).collect::<Vec<_>>())
            .field("images", &self.images.iter().map(RegisteredImage::id).collect::<Vec<_>>())
            .finish()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prompt(mut self, prompt: RegisteredPrompt) -> Self {
        self.prompts.push(prompt);
        // Stable sort keeps declaration order among equal priorities.
        self.prompts.sort_by_key(|p| p.priority);
        self
    }

    pub fn with_image(mut self, image: RegisteredImage) -> Self {
        self.images.push(image);
        self.images.sort_by_key(|i| i.priority);
        self
    }

    /// Prompt providers, most preferred first.
    pub fn prompts(&self) -> &[RegisteredPrompt] {
        &self.prompts
    }

    /// Image providers in fallback order.
    pub fn images(&self) -> &[RegisteredImage] {
        &self.images
    }

    /// Price of the first-choice image provider, earmarked per asset.
    pub fn primary_image_cost(&self) -> Option<Cost> {
        self.images.first().map(|i| i.cost)
    }

    /// Validate `descriptors` and build every enabled provider.
    ///
    /// With `dry_run` every backend is replaced by a mock carrying the same
    /// id, cost and priority.
    pub fn from_descriptors(
        descriptors: &[ProviderDescriptor],
        dry_run: bool,
    ) -> Result<Self, DescriptorError> {
        validate_descriptors(descriptors)?;

        let mut registry = Self::new();
        for descriptor in descriptors.iter().filter(|d| d.enabled) {
            let backend = if dry_run { Backend::Mock } else { descriptor.backend };
            match descriptor.role {
                ProviderRole::Prompt => {
                    let provider = build_prompt(descriptor, backend)?;
                    let mut prompt = RegisteredPrompt::new(provider, descriptor.cost)
                        .with_priority(descriptor.priority);
                    if let Some(persona) = &descriptor.persona {
                        prompt.persona.clone_from(persona);
                    }
                    prompt.temperature = descriptor.temperature;
                    registry = registry.with_prompt(prompt);
                }
                ProviderRole::Image => {
                    let provider = build_image(descriptor, backend)?;
                    registry = registry.with_image(
                        RegisteredImage::new(provider, descriptor.cost)
                            .with_priority(descriptor.priority),
                    );
                }
            }
            tracing::debug!(provider = %descriptor.id, ?backend, "Provider registered");
        }
        Ok(registry)
    }
}

#[cfg(feature = "ai")]
fn init_error(id: &str) -> impl FnOnce(anyhow::Error) -> DescriptorError + '_ {
    move |err| DescriptorError::Init { id: id.to_string(), message: err.to_string() }
}

fn build_prompt(
    descriptor: &ProviderDescriptor,
    backend: Backend,
) -> Result<Arc<dyn PromptProvider>, DescriptorError> {
    let id = descriptor.id.as_str();
    match backend {
        Backend::Mock => Ok(Arc::new(MockPromptProvider::new(id))),
        #[cfg(feature = "ai")]
        Backend::Claude => {
            let mut provider = super::ClaudeProvider::new(id).map_err(init_error(id))?;
            if let Some(model) = &descriptor.model {
                provider = provider.with_model(model);
            }
            if let Some(url) = &descriptor.base_url {
                provider = provider.with_endpoint(url);
            }
            Ok(Arc::new(provider))
        }
        #[cfg(feature = "ai")]
        Backend::Openai => {
            let mut provider = super::OpenAIProvider::new(id).map_err(init_error(id))?;
            if let Some(model) = &descriptor.model {
                provider = provider.with_model(model);
            }
            if let Some(url) = &descriptor.base_url {
                provider = provider.with_base_url(url);
            }
            Ok(Arc::new(provider))
        }
        #[cfg(feature = "ai")]
        Backend::Ollama => {
            let mut provider = super::OllamaProvider::new(id);
            if let Some(model) = &descriptor.model {
                provider = provider.with_model(model);
            }
            if let Some(url) = &descriptor.base_url {
                provider = provider.with_base_url(url);
            }
            Ok(Arc::new(provider))
        }
        other => Err(unsupported(id, other)),
    }
}

fn build_image(
    descriptor: &ProviderDescriptor,
    backend: Backend,
) -> Result<Arc<dyn ImageProvider>, DescriptorError> {
    let id = descriptor.id.as_str();
    match backend {
        Backend::Mock => Ok(Arc::new(MockImageProvider::new(id))),
        #[cfg(feature = "ai")]
        Backend::OpenaiImages => {
            let mut provider = super::OpenAIImageProvider::new(id).map_err(init_error(id))?;
            if let Some(model) = &descriptor.model {
                provider = provider.with_model(model);
            }
            if let Some(url) = &descriptor.base_url {
                provider = provider.with_base_url(url);
            }
            Ok(Arc::new(provider))
        }
        other => Err(unsupported(id, other)),
    }
}

fn unsupported(id: &str, backend: Backend) -> DescriptorError {
    DescriptorError::Init {
        id: id.to_string(),
        message: format!("backend {backend:?} is not available in this build"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dollars(d: f64) -> Cost {
        Cost::from_dollars(d)
    }

    fn valid() -> Vec<ProviderDescriptor> {
        vec![
            ProviderDescriptor::mock("writer-a", ProviderRole::Prompt, dollars(0.01)).with_priority(2),
            ProviderDescriptor::mock("writer-b", ProviderRole::Prompt, dollars(0.02)).with_priority(1),
            ProviderDescriptor::mock("painter", ProviderRole::Image, dollars(0.04)),
        ]
    }

    #[test]
    fn test_valid_descriptors_build_sorted_registry() {
        let registry = ProviderRegistry::from_descriptors(&valid(), false).unwrap();
        let ids: Vec<_> = registry.prompts().iter().map(RegisteredPrompt::id).collect();
        assert_eq!(ids, vec!["writer-b", "writer-a"]);
        assert_eq!(registry.primary_image_cost(), Some(dollars(0.04)));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut descriptors = valid();
        descriptors.push(ProviderDescriptor::mock("painter", ProviderRole::Image, dollars(0.04)));
        assert_eq!(
            validate_descriptors(&descriptors),
            Err(DescriptorError::DuplicateId("painter".into()))
        );
    }

    #[test]
    fn test_missing_role_rejected() {
        let mut descriptors = valid();
        descriptors[2].enabled = false;
        assert_eq!(
            validate_descriptors(&descriptors),
            Err(DescriptorError::MissingRole(ProviderRole::Image))
        );
    }

    #[test]
    fn test_capability_and_backend_checks() {
        let mut descriptors = valid();
        descriptors[2].capabilities = vec![Capability::Text];
        assert!(matches!(
            validate_descriptors(&descriptors),
            Err(DescriptorError::MissingCapability { .. })
        ));

        let mut descriptors = valid();
        descriptors[0].backend = Backend::OpenaiImages;
        assert!(matches!(
            validate_descriptors(&descriptors),
            Err(DescriptorError::BackendMismatch { .. })
        ));
    }

    #[test]
    fn test_temperature_and_id_checks() {
        let mut descriptors = valid();
        descriptors[0].temperature = 3.5;
        assert!(matches!(validate_descriptors(&descriptors), Err(DescriptorError::Temperature { .. })));

        let mut descriptors = valid();
        descriptors[0].id = "bad id".into();
        assert!(matches!(validate_descriptors(&descriptors), Err(DescriptorError::InvalidId(_))));
    }

    #[test]
    fn test_dry_run_replaces_http_backends() {
        let mut descriptors = valid();
        descriptors[0].backend = Backend::Claude;
        descriptors[2].backend = Backend::OpenaiImages;
        let registry = ProviderRegistry::from_descriptors(&descriptors, true).unwrap();
        assert_eq!(registry.prompts().len(), 2);
        assert_eq!(registry.images()[0].id(), "painter");
    }

    #[test]
    fn test_descriptor_toml_shape() {
        let toml = r#"
            id = "claude-art"
            role = "prompt"
            backend = "claude"
            persona = "You are an art director."
            priority = 1
            cost = 0.01
            capabilities = ["text"]
        "#;
        let descriptor: ProviderDescriptor = toml::from_str(toml).unwrap();
        assert_eq!(descriptor.backend, Backend::Claude);
        assert_eq!(descriptor.cost, dollars(0.01));
        assert!(descriptor.enabled);
        assert!((descriptor.temperature - 0.7).abs() < f32::EPSILON);
    }
}
