//! Core types and functionality for Assetrun.
//!
//! This module contains the generation engine: money accounting, provider
//! resilience, transactions, the session state machine and its records.

mod approval;
mod asset;
mod broadcast;
mod budget;
mod circuit;
mod clock;
mod config;
mod cost;
mod manifest;
mod pipeline;
mod retry;
mod session;
pub mod storage;
mod transaction;

pub use approval::{ApprovalError, ApprovalGate, FileApprovalGate, MemoryApprovalGate};
pub use asset::{AssetCategory, AssetRequest, ImageFormat};
pub use broadcast::{EventLevel, ProgressCounters, StatusBroadcaster, StatusEvent};
pub use budget::{
    BudgetError, BudgetLedger, ReservationHandle, SpendKind, SpendLabel, TransactionRecord,
    TransactionState,
};
pub use circuit::{BreakerRegistry, CircuitBreaker, CircuitConfig, CircuitState};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{BroadcastConfig, BudgetConfig, Config, ConfigError, PipelineConfig, LOCAL_CONFIG};
pub use cost::Cost;
pub use manifest::{
    AssetOutcome, AssetStatus, ErrorRecord, ManifestError, ManifestStore, SessionCounters,
    SessionManifest,
};
pub use pipeline::{GenerationPipeline, PipelineError, PipelineSettings, TwoPhaseReport};
pub use retry::{Retried, RetryConfig, RetryError, RetryPolicy};
pub use session::{AbortReason, InvalidSessionId, PipelineState, SessionId, SessionMode};
pub use storage::{FsStorage, MemoryStorage, Storage, StorageError, StoredArtifact};
pub use transaction::{Artifact, Committed, Funding, Held, TransactionError, TransactionManager};
