//! Session manifests.
//!
//! A manifest is the durable audit record of one session: what was asked
//! for, what succeeded, what failed and why, and every transaction the ledger
//! saw. Manifests also drive idempotent re-runs: asset keys committed by an
//! earlier session of the same mode are not generated again.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::budget::{SpendKind, TransactionRecord};
use super::cost::Cost;
use super::session::{AbortReason, PipelineState, SessionId, SessionMode};
use super::transaction::TransactionError;
use super::AssetRequest;

/// Final status of one asset within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetStatus {
    /// Image persisted and paid for
    Committed,
    /// Every provider failed
    Failed,
    /// Could not be funded
    Rejected,
    /// Not produced because the session stopped; never charged
    Skipped,
    /// Committed by an earlier session
    AlreadySatisfied,
}

/// One recorded failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub stage: SpendKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub attempts: u32,
    pub class: String,
    pub message: String,
}

impl ErrorRecord {
    pub fn from_transaction(stage: SpendKind, err: &TransactionError) -> Self {
        Self {
            stage,
            provider: err.provider().map(str::to_string),
            attempts: err.attempts(),
            class: err.class().to_string(),
            message: err.to_string(),
        }
    }
}

/// Outcome of one asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetOutcome {
    pub key: String,
    pub request: AssetRequest,
    pub status: AssetStatus,
    /// Provider whose prompt won
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    /// Provider that rendered the image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    /// Committed spend for this asset, prompts included
    pub cost: Cost,
    /// Asset-level attempts made
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ErrorRecord>,
}

impl AssetOutcome {
    /// Outcome with the given status and nothing else filled in.
    pub fn new(request: &AssetRequest, status: AssetStatus) -> Self {
        Self {
            key: request.key(),
            request: request.clone(),
            status,
            prompt_provider: None,
            prompt: None,
            score: None,
            image_provider: None,
            image_path: None,
            content_hash: None,
            cost: Cost::ZERO,
            attempts: 0,
            errors: Vec::new(),
        }
    }
}

/// Per-status asset counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCounters {
    pub committed: usize,
    pub failed: usize,
    pub rejected: usize,
    pub skipped: usize,
    pub already_satisfied: usize,
}

impl SessionCounters {
    pub fn tally(assets: &[AssetOutcome]) -> Self {
        let mut counters = Self::default();
        for asset in assets {
            match asset.status {
                AssetStatus::Committed => counters.committed += 1,
                AssetStatus::Failed => counters.failed += 1,
                AssetStatus::Rejected => counters.rejected += 1,
                AssetStatus::Skipped => counters.skipped += 1,
                AssetStatus::AlreadySatisfied => counters.already_satisfied += 1,
            }
        }
        counters
    }
}

/// Durable record of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionManifest {
    pub session_id: SessionId,
    pub mode: SessionMode,
    /// Sample session a production run was approved from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session: Option<SessionId>,
    pub status: PipelineState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<AbortReason>,
    pub ceiling: Cost,
    pub total_cost: Cost,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub counters: SessionCounters,
    pub assets: Vec<AssetOutcome>,
    pub transactions: Vec<TransactionRecord>,
}

impl SessionManifest {
    /// Keys of assets this session produced or found already produced.
    pub fn satisfied_keys(&self) -> impl Iterator<Item = &str> {
        self.assets
            .iter()
            .filter(|a| matches!(a.status, AssetStatus::Committed | AssetStatus::AlreadySatisfied))
            .map(|a| a.key.as_str())
    }

    /// Keys worth re-running: failed, rejected or skipped.
    pub fn unfinished_keys(&self) -> Vec<&str> {
        self.assets
            .iter()
            .filter(|a| matches!(a.status, AssetStatus::Failed | AssetStatus::Rejected | AssetStatus::Skipped))
            .map(|a| a.key.as_str())
            .collect()
    }

    pub fn outcome(&self, key: &str) -> Option<&AssetOutcome> {
        self.assets.iter().find(|a| a.key == key)
    }
}

/// Errors raised by the manifest store.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("no manifest for session {0}")]
    NotFound(SessionId),

    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed manifest {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Directory of `<session>.json` manifests.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    dir: PathBuf,
}

impl ManifestStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, session: &SessionId) -> PathBuf {
        self.dir.join(format!("{session}.json"))
    }

    /// Write (or replace) a session's manifest.
    pub async fn save(&self, manifest: &SessionManifest) -> Result<PathBuf, ManifestError> {
        let path = self.path_for(&manifest.session_id);
        let io_err = |source| ManifestError::Io { path: path.clone(), source };

        tokio::fs::create_dir_all(&self.dir).await.map_err(io_err)?;
        let json = serde_json::to_vec_pretty(manifest)
            .map_err(|source| ManifestError::Json { path: path.clone(), source })?;

        let partial = path.with_extension("json.part");
        tokio::fs::write(&partial, json).await.map_err(io_err)?;
        tokio::fs::rename(&partial, &path).await.map_err(io_err)?;

        tracing::debug!(session = %manifest.session_id, path = %path.display(), "Manifest saved");
        Ok(path)
    }

    pub async fn load(&self, session: &SessionId) -> Result<SessionManifest, ManifestError> {
        let path = self.path_for(session);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(ManifestError::NotFound(session.clone()))
            }
            Err(source) => return Err(ManifestError::Io { path, source }),
        };
        serde_json::from_slice(&bytes).map_err(|source| ManifestError::Json { path, source })
    }

    /// Every readable manifest, oldest first. Unreadable files are skipped.
    pub async fn list(&self) -> Result<Vec<SessionManifest>, ManifestError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(ManifestError::Io { path: self.dir.clone(), source }),
        };

        let mut manifests = Vec::new();
        loop {
            let entry = entries
                .next_entry()
                .await
                .map_err(|source| ManifestError::Io { path: self.dir.clone(), source })?;
            let Some(entry) = entry else { break };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::read(&path).await.map(|b| serde_json::from_slice::<SessionManifest>(&b)) {
                Ok(Ok(manifest)) => manifests.push(manifest),
                Ok(Err(err)) => tracing::warn!(path = %path.display(), error = %err, "Skipping malformed manifest"),
                Err(err) => tracing::warn!(path = %path.display(), error = %err, "Skipping unreadable manifest"),
            }
        }

        manifests.sort_by_key(|m| m.started_at);
        Ok(manifests)
    }

    /// Asset keys already produced by sessions of `mode`.
    pub async fn committed_keys(&self, mode: SessionMode) -> Result<HashSet<String>, ManifestError> {
        let manifests = self.list().await?;
        Ok(manifests
            .iter()
            .filter(|m| m.mode == mode)
            .flat_map(|m| m.satisfied_keys().map(str::to_string))
            .collect())
    }
}
