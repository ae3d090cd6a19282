//! Security module for Assetrun.
//!
//! Guards every filesystem write the pipeline performs:
//! - Path traversal prevention
//! - Segment sanitization for asset and session names
//!
//! When in doubt, deny the write.

mod paths;

pub use paths::{PathValidationError, PathValidator, MAX_PATH_LENGTH, MAX_SEGMENT_LENGTH};
