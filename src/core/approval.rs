//! Approval gate between sample and production runs.
//!
//! An approval token is keyed by the sample session id. Absence of a token is
//! the default; production consumes the token exactly once.

use std::collections::HashSet;
use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::session::SessionId;

/// Errors raised by an approval backend.
#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("approval store error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Source of approval tokens.
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    /// Grant approval for `session`.
    async fn approve(&self, session: &SessionId) -> Result<(), ApprovalError>;

    /// Whether an unconsumed token exists.
    async fn is_approved(&self, session: &SessionId) -> Result<bool, ApprovalError>;

    /// Take the token. Returns false when there was none.
    async fn consume(&self, session: &SessionId) -> Result<bool, ApprovalError>;
}

/// Sentinel-file gate: `<dir>/<session>.approved`.
#[derive(Debug, Clone)]
pub struct FileApprovalGate {
    dir: PathBuf,
}

impl FileApprovalGate {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn token_path(&self, session: &SessionId) -> PathBuf {
        self.dir.join(format!("{session}.approved"))
    }
}

#[async_trait]
impl ApprovalGate for FileApprovalGate {
    async fn approve(&self, session: &SessionId) -> Result<(), ApprovalError> {
        let path = self.token_path(session);
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| ApprovalError::Io { path: self.dir.clone(), source })?;
        let stamp = chrono::Utc::now().to_rfc3339();
        tokio::fs::write(&path, stamp).await.map_err(|source| ApprovalError::Io { path, source })?;
        tracing::info!(session = %session, "Sample approved");
        Ok(())
    }

    async fn is_approved(&self, session: &SessionId) -> Result<bool, ApprovalError> {
        let path = self.token_path(session);
        tokio::fs::try_exists(&path).await.map_err(|source| ApprovalError::Io { path, source })
    }

    async fn consume(&self, session: &SessionId) -> Result<bool, ApprovalError> {
        let path = self.token_path(session);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(ApprovalError::Io { path, source }),
        }
    }
}

/// In-process gate.
#[derive(Debug, Default)]
pub struct MemoryApprovalGate {
    tokens: Mutex<HashSet<SessionId>>,
}

impl MemoryApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApprovalGate for MemoryApprovalGate {
    async fn approve(&self, session: &SessionId) -> Result<(), ApprovalError> {
        self.tokens.lock().insert(session.clone());
        Ok(())
    }

    async fn is_approved(&self, session: &SessionId) -> Result<bool, ApprovalError> {
        Ok(self.tokens.lock().contains(session))
    }

    async fn consume(&self, session: &SessionId) -> Result<bool, ApprovalError> {
        Ok(self.tokens.lock().remove(session))
    }
}
