//! Asset discovery.
//!
//! The pipeline treats the content source as a read-only list of asset
//! requests. The YAML source reads a catalog like:
//!
//! ```yaml
//! assets:
//!   - category: icon
//!     name: habit-tracker
//!     context: Morning routine checklist
//!   - category: cover
//!     name: quarterly-review
//!     width: 1500
//!     height: 600
//!     format: jpeg
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::core::{AssetCategory, AssetRequest, ImageFormat};
use crate::security::{PathValidationError, PathValidator};

/// Errors raised while discovering assets.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("failed to read asset catalog {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse asset catalog {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("duplicate asset key: {0}")]
    DuplicateKey(String),

    #[error("invalid asset name '{name}': {source}")]
    InvalidName {
        name: String,
        #[source]
        source: PathValidationError,
    },

    #[error("invalid dimensions for {key}: {width}x{height}")]
    InvalidDimensions { key: String, width: u32, height: u32 },
}

/// Anything that can enumerate asset requests.
pub trait AssetSource: Send + Sync {
    fn discover(&self) -> Result<Vec<AssetRequest>, SourceError>;
}

impl AssetSource for Vec<AssetRequest> {
    fn discover(&self) -> Result<Vec<AssetRequest>, SourceError> {
        Ok(self.clone())
    }
}

/// Reads requests from a YAML catalog file.
#[derive(Debug, Clone)]
pub struct YamlAssetSource {
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct Catalog {
    #[serde(default)]
    assets: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    category: AssetCategory,
    name: String,
    width: Option<u32>,
    height: Option<u32>,
    #[serde(default)]
    format: ImageFormat,
    #[serde(default)]
    context: String,
}

impl From<CatalogEntry> for AssetRequest {
    fn from(entry: CatalogEntry) -> Self {
        let (default_width, default_height) = entry.category.default_dimensions();
        AssetRequest::new(entry.category, entry.name)
            .with_dimensions(entry.width.unwrap_or(default_width), entry.height.unwrap_or(default_height))
            .with_format(entry.format)
            .with_context(entry.context)
    }
}

impl YamlAssetSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse a catalog from a YAML string.
    pub fn parse(path: &Path, content: &str) -> Result<Vec<AssetRequest>, SourceError> {
        let catalog: Catalog = serde_yaml::from_str(content)
            .map_err(|source| SourceError::Parse { path: path.to_path_buf(), source })?;
        Ok(catalog.assets.into_iter().map(AssetRequest::from).collect())
    }
}

impl AssetSource for YamlAssetSource {
    fn discover(&self) -> Result<Vec<AssetRequest>, SourceError> {
        let content = std::fs::read_to_string(&self.path)
            .map_err(|source| SourceError::Io { path: self.path.clone(), source })?;
        let requests = Self::parse(&self.path, &content)?;
        tracing::debug!(path = %self.path.display(), assets = requests.len(), "Loaded asset catalog");
        Ok(requests)
    }
}

/// Reject requests that cannot be turned into unique, safe output paths.
pub fn validate_requests(requests: &[AssetRequest]) -> Result<(), SourceError> {
    let validator = PathValidator::new();
    let mut seen = HashSet::new();
    for request in requests {
        validator
            .validate_segment(&request.name)
            .map_err(|source| SourceError::InvalidName { name: request.name.clone(), source })?;
        if request.width == 0 || request.height == 0 {
            return Err(SourceError::InvalidDimensions {
                key: request.key(),
                width: request.width,
                height: request.height,
            });
        }
        let key = request.key();
        if !seen.insert(key.clone()) {
            return Err(SourceError::DuplicateKey(key));
        }
    }
    Ok(())
}
