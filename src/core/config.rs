//! Configuration management for Assetrun.
//!
//! Handles loading configuration from TOML files and environment overrides.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::circuit::CircuitConfig;
use super::cost::Cost;
use super::pipeline::PipelineSettings;
use super::retry::RetryConfig;
use crate::ai::{validate_descriptors, Backend, Capability, DescriptorError, ProviderDescriptor, ProviderRole};

/// Name of the project-local config file.
pub const LOCAL_CONFIG: &str = "assetrun.toml";

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {var}: '{value}'")]
    Env { var: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Providers(#[from] DescriptorError),
}

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Spending ceilings
    pub budget: BudgetConfig,

    /// Per-call retry behavior
    pub retry: RetryConfig,

    /// Per-provider circuit breakers
    pub circuit: CircuitConfig,

    /// Pipeline tuning and locations
    pub pipeline: PipelineConfig,

    /// Progress event fan-out
    pub broadcast: BroadcastConfig,

    /// Prompt and image providers
    pub providers: Vec<ProviderDescriptor>,
}

/// Spending ceilings in USD, one independent ledger per phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Ceiling for a sample session
    pub sample: Cost,

    /// Ceiling for a production session
    pub production: Cost,
}

/// Pipeline settings plus where things live on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    #[serde(flatten)]
    pub settings: PipelineSettings,

    /// Asset catalog (YAML)
    pub assets: PathBuf,

    /// Root directory for generated images and prompts
    pub output_dir: PathBuf,

    /// Session manifests
    pub manifest_dir: PathBuf,

    /// Approval tokens
    pub approval_dir: PathBuf,
}

/// Status broadcaster settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Events buffered per subscriber before the slowest one starts skipping
    pub capacity: usize,
}

impl Config {
    /// Load configuration.
    ///
    /// Looks for config in:
    /// 1. `explicit`, when given (must exist)
    /// 2. `assetrun.toml` in the current directory
    /// 3. `~/.config/assetrun/config.toml`
    /// 4. Falls back to defaults
    ///
    /// Environment overrides are applied last.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match explicit {
            Some(path) => Self::load_from_file(path)?,
            None => Self::discover()?,
        };
        config.apply_env()?;
        Ok(config)
    }

    fn discover() -> Result<Self, ConfigError> {
        // Try local config first
        let local_config = PathBuf::from(LOCAL_CONFIG);
        if local_config.exists() {
            return Self::load_from_file(&local_config);
        }

        // Try global config
        if let Some(config_dir) = Self::config_dir() {
            let global_config = config_dir.join("config.toml");
            if global_config.exists() {
                return Self::load_from_file(&global_config);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        let mut config: Self = toml::from_str(&content)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        config.pipeline.expand_paths();
        tracing::debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Apply `ASSETRUN_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(dollars) = env_parse::<f64>("ASSETRUN_SAMPLE_BUDGET")? {
            self.budget.sample = Cost::from_dollars(dollars);
        }
        if let Some(dollars) = env_parse::<f64>("ASSETRUN_PRODUCTION_BUDGET")? {
            self.budget.production = Cost::from_dollars(dollars);
        }
        if let Some(concurrency) = env_parse::<usize>("ASSETRUN_CONCURRENCY")? {
            self.pipeline.settings.concurrency = concurrency;
        }
        Ok(())
    }

    /// Check the configuration before any session starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let settings = &self.pipeline.settings;
        if settings.concurrency == 0 {
            return Err(ConfigError::Invalid("pipeline.concurrency must be at least 1".into()));
        }
        if settings.sample_size == 0 {
            return Err(ConfigError::Invalid("pipeline.sample_size must be at least 1".into()));
        }
        if settings.asset_attempts == 0 {
            return Err(ConfigError::Invalid("pipeline.asset_attempts must be at least 1".into()));
        }
        if settings.approval_poll.is_zero() {
            return Err(ConfigError::Invalid("pipeline.approval_poll must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid("retry.multiplier must be at least 1.0".into()));
        }
        if self.circuit.failure_threshold == 0 {
            return Err(ConfigError::Invalid("circuit.failure_threshold must be at least 1".into()));
        }
        if let Some(ratio) = self.circuit.failure_ratio {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(ConfigError::Invalid(format!(
                    "circuit.failure_ratio must be within 0..=1, got {ratio}"
                )));
            }
        }
        if self.broadcast.capacity == 0 {
            return Err(ConfigError::Invalid("broadcast.capacity must be at least 1".into()));
        }
        validate_descriptors(&self.providers)?;
        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Get the config directory path.
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("assetrun"))
    }
}

impl PipelineConfig {
    /// Expand `~` and environment variables in the configured paths.
    fn expand_paths(&mut self) {
        for path in [&mut self.assets, &mut self.output_dir, &mut self.manifest_dir, &mut self.approval_dir] {
            *path = expand_path(path);
        }
    }
}

fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    match shellexpand::full(&raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(err) => {
            tracing::warn!(path = %raw, error = %err, "Could not expand path, using it verbatim");
            path.to_path_buf()
        }
    }
}

fn env_parse<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Env { var, value }),
        Err(_) => Ok(None),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            budget: BudgetConfig::default(),
            retry: RetryConfig::default(),
            circuit: CircuitConfig::default(),
            pipeline: PipelineConfig::default(),
            broadcast: BroadcastConfig::default(),
            providers: default_providers(),
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self { sample: Cost::from_dollars(1.0), production: Cost::from_dollars(10.0) }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            settings: PipelineSettings::default(),
            assets: PathBuf::from("assets.yaml"),
            output_dir: PathBuf::from("generated"),
            manifest_dir: PathBuf::from(".assetrun/manifests"),
            approval_dir: PathBuf::from(".assetrun/approvals"),
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}

/// Claude and GPT compete for prompts; OpenAI Images renders.
fn default_providers() -> Vec<ProviderDescriptor> {
    let descriptor = |id: &str, role, backend, cost: f64, priority, capability| ProviderDescriptor {
        id: id.to_string(),
        role,
        backend,
        model: None,
        base_url: None,
        persona: None,
        temperature: 0.7,
        priority,
        cost: Cost::from_dollars(cost),
        capabilities: vec![capability],
        enabled: true,
    };
    vec![
        descriptor("claude", ProviderRole::Prompt, Backend::Claude, 0.01, 10, Capability::Text),
        descriptor("gpt", ProviderRole::Prompt, Backend::Openai, 0.01, 20, Capability::Text),
        descriptor("dall-e", ProviderRole::Image, Backend::OpenaiImages, 0.04, 10, Capability::Image),
    ]
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serial_test::serial;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.budget.sample, Cost::from_dollars(1.0));
        assert_eq!(config.pipeline.settings.concurrency, 4);
        assert_eq!(config.broadcast.capacity, 256);
        assert_eq!(config.providers.len(), 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = config.to_toml().unwrap();
        assert!(toml_str.contains("[budget]"));
        assert!(toml_str.contains("[pipeline]"));
        assert!(toml_str.contains("[[providers]]"));
    }

    #[test]
    fn test_config_deserialization() {
        let toml_str = r#"
            [budget]
            sample = 0.5
            production = 25.0

            [pipeline]
            concurrency = 2
            sample_size = 5
            approval_poll = 1
            output_dir = "out"

            [circuit]
            failure_threshold = 5

            [[providers]]
            id = "writer"
            role = "prompt"
            backend = "mock"
            cost = 0.02
            capabilities = ["text"]

            [[providers]]
            id = "painter"
            role = "image"
            backend = "mock"
            cost = 0.04
            capabilities = ["image"]
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.budget.production, Cost::from_dollars(25.0));
        assert_eq!(config.pipeline.settings.concurrency, 2);
        assert_eq!(config.pipeline.settings.sample_size, 5);
        assert_eq!(config.pipeline.settings.approval_poll, Duration::from_secs(1));
        assert_eq!(config.pipeline.output_dir, PathBuf::from("out"));
        assert_eq!(config.pipeline.manifest_dir, PathBuf::from(".assetrun/manifests"));
        assert_eq!(config.circuit.failure_threshold, 5);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.providers.len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.pipeline.settings.concurrency = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.circuit.failure_ratio = Some(1.5);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.providers.retain(|p| p.role == ProviderRole::Prompt);
        assert!(matches!(config.validate(), Err(ConfigError::Providers(_))));
    }

    #[test]
    fn test_negative_cost_rejected() {
        let toml_str = "[budget]\nsample = -1.0\n";
        assert!(toml::from_str::<Config>(toml_str).is_err());
    }

    #[test]
    #[serial]
    fn test_load_explicit_file_and_env_overrides() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("custom.toml");
        std::fs::write(&path, "[budget]\nsample = 0.25\n").unwrap();

        std::env::set_var("ASSETRUN_PRODUCTION_BUDGET", "3.5");
        std::env::set_var("ASSETRUN_CONCURRENCY", "7");
        let config = Config::load(Some(&path));
        std::env::remove_var("ASSETRUN_PRODUCTION_BUDGET");
        std::env::remove_var("ASSETRUN_CONCURRENCY");

        let config = config.unwrap();
        assert_eq!(config.budget.sample, Cost::from_dollars(0.25));
        assert_eq!(config.budget.production, Cost::from_dollars(3.5));
        assert_eq!(config.pipeline.settings.concurrency, 7);
    }

    #[test]
    #[serial]
    fn test_invalid_env_override() {
        std::env::set_var("ASSETRUN_CONCURRENCY", "many");
        let result = Config::default().apply_env();
        std::env::remove_var("ASSETRUN_CONCURRENCY");
        assert!(matches!(result, Err(ConfigError::Env { var: "ASSETRUN_CONCURRENCY", .. })));
    }

    #[test]
    fn test_missing_explicit_file() {
        let err = Config::load_from_file(Path::new("/nonexistent/assetrun.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    #[serial]
    fn test_paths_expand_home() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("home.toml");
        std::fs::write(&path, "[pipeline]\noutput_dir = \"~/assets-out\"\n").unwrap();

        let config = Config::load_from_file(&path).unwrap();
        assert!(!config.pipeline.output_dir.to_string_lossy().starts_with('~'));
        assert!(config.pipeline.output_dir.ends_with("assets-out"));
    }
}
