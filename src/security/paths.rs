//! Output path validation.
//!
//! Every artifact path is relative to the storage root. A path is accepted
//! only when each segment is a plain name, so nothing written by the pipeline
//! can land outside the root.

use std::path::{Component, Path, PathBuf};

/// Maximum accepted path length in bytes.
pub const MAX_PATH_LENGTH: usize = 255;

/// Maximum length of a single segment.
pub const MAX_SEGMENT_LENGTH: usize = 96;

/// Reasons a path is refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathValidationError {
    #[error("path is empty")]
    Empty,

    #[error("path contains null bytes")]
    NullBytes,

    #[error("path too long: {length} bytes (max: {max})")]
    TooLong { length: usize, max: usize },

    #[error("absolute paths are not allowed: {0}")]
    Absolute(String),

    #[error("path traversal attempt detected: {0}")]
    Traversal(String),

    #[error("invalid path segment '{segment}': {reason}")]
    InvalidSegment { segment: String, reason: &'static str },
}

/// Validates relative artifact paths.
#[derive(Debug, Clone)]
pub struct PathValidator {
    max_length: usize,
}

impl Default for PathValidator {
    fn default() -> Self {
        Self { max_length: MAX_PATH_LENGTH }
    }
}

impl PathValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the maximum path length.
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    /// Validate `relative` and return it as a normalized `PathBuf`.
    pub fn validate(&self, relative: &str) -> Result<PathBuf, PathValidationError> {
        if relative.is_empty() {
            return Err(PathValidationError::Empty);
        }
        if relative.contains('\0') {
            return Err(PathValidationError::NullBytes);
        }
        if relative.len() > self.max_length {
            return Err(PathValidationError::TooLong {
                length: relative.len(),
                max: self.max_length,
            });
        }
        if relative.starts_with('/') || relative.starts_with('\\') || has_drive_prefix(relative) {
            return Err(PathValidationError::Absolute(relative.to_string()));
        }

        let mut normalized = PathBuf::new();
        // Split on both separators so Windows-style input cannot sneak past.
        for segment in relative.split(['/', '\\']) {
            validate_segment(segment, relative)?;
            normalized.push(segment);
        }

        // The std parser must agree that only normal components remain.
        if !Path::new(&normalized).components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(PathValidationError::Traversal(relative.to_string()));
        }

        Ok(normalized)
    }

    /// Validate a single path segment such as an asset name.
    pub fn validate_segment(&self, segment: &str) -> Result<(), PathValidationError> {
        validate_segment(segment, segment)
    }
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn validate_segment(segment: &str, full: &str) -> Result<(), PathValidationError> {
    if segment.is_empty() {
        return Err(PathValidationError::InvalidSegment {
            segment: segment.to_string(),
            reason: "empty segment",
        });
    }
    if segment == "." || segment == ".." {
        return Err(PathValidationError::Traversal(full.to_string()));
    }
    if segment.starts_with('.') {
        return Err(PathValidationError::InvalidSegment {
            segment: segment.to_string(),
            reason: "hidden names are not allowed",
        });
    }
    if segment.len() > MAX_SEGMENT_LENGTH {
        return Err(PathValidationError::InvalidSegment {
            segment: segment.to_string(),
            reason: "segment too long",
        });
    }
    if let Some(bad) =
        segment.chars().find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        tracing::debug!(segment, character = %bad, "Rejected path segment");
        return Err(PathValidationError::InvalidSegment {
            segment: segment.to_string(),
            reason: "only letters, digits, '-', '_' and '.' are allowed",
        });
    }
    Ok(())
}
