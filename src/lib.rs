//! # Assetrun
//!
//! Budget-safe AI asset generation.
//!
//! Assetrun turns a catalog of asset requests into images. Several prompt
//! models compete for each asset, the best prompt is rendered by an image
//! model, and every paid call runs as a transaction: money is committed only
//! once the artifact is on disk.
//!
//! ## Features
//!
//! - **Hard budget ceilings**: reserve, commit or release; never overspend
//! - **Resilient providers**: retries with backoff and per-provider circuit breakers
//! - **Prompt competition**: concurrent prompt providers, heuristic scoring
//! - **Two-phase runs**: a small sample must be approved before production
//! - **Live progress**: lossy broadcast of status events
//!
//! ## Quick Start
//!
//! ```bash
//! # Generate a sample without calling any paid API
//! assetrun --dry-run sample
//!
//! # Approve it and produce the full set
//! assetrun approve <session-id>
//! assetrun --dry-run produce --after <session-id>
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow common patterns that are intentional in this codebase
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unnecessary_map_or)]

pub mod ai;
pub mod content;
pub mod core;
pub mod security;

pub use ai::{
    HeuristicScorer, ImageProvider, MockImageProvider, MockPromptProvider, PromptProvider,
    PromptScorer, ProviderDescriptor, ProviderError, ProviderRegistry, RegisteredImage,
    RegisteredPrompt,
};
pub use content::{AssetSource, SourceError, YamlAssetSource};

// Re-export commonly used types
pub use core::{
    AssetCategory, AssetRequest, AssetStatus, BudgetLedger, Config, Cost, GenerationPipeline,
    PipelineError, PipelineState, SessionId, SessionManifest, SessionMode, StatusBroadcaster,
    StatusEvent,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "assetrun";
