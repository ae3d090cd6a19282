//! Asset requests: the unit of work the pipeline generates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of visual asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetCategory {
    Icon,
    Cover,
    Texture,
}

impl fmt::Display for AssetCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Icon => write!(f, "icon"),
            Self::Cover => write!(f, "cover"),
            Self::Texture => write!(f, "texture"),
        }
    }
}

impl AssetCategory {
    /// Default pixel size when a request omits dimensions.
    pub fn default_dimensions(self) -> (u32, u32) {
        match self {
            Self::Icon => (512, 512),
            Self::Cover => (1500, 600),
            Self::Texture => (1024, 1024),
        }
    }
}

/// Output encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Png,
    Jpeg,
    Webp,
}

impl ImageFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::Webp => "webp",
        }
    }
}

/// One asset to generate.
///
/// Created at discovery and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRequest {
    pub category: AssetCategory,
    /// Logical target name, unique within a category
    pub name: String,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub format: ImageFormat,
    /// Free-form authoring context handed to prompt providers
    #[serde(default)]
    pub context: String,
}

impl AssetRequest {
    /// Create a request with the category's default dimensions.
    pub fn new(category: AssetCategory, name: impl Into<String>) -> Self {
        let (width, height) = category.default_dimensions();
        Self {
            category,
            name: name.into(),
            width,
            height,
            format: ImageFormat::default(),
            context: String::new(),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_format(mut self, format: ImageFormat) -> Self {
        self.format = format;
        self
    }

    /// Stable identifier: `category/name`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.category, self.name)
    }

    /// File name of the generated image.
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.name, self.format.extension())
    }
}
