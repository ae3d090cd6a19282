//! Artifact storage.
//!
//! Storage is an append-only sink: the pipeline writes each artifact once to a
//! validated relative path and never reads it back.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::asset::AssetRequest;
use crate::security::{PathValidationError, PathValidator};

/// Errors raised while persisting an artifact.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("rejected path '{path}': {source}")]
    InvalidPath {
        path: String,
        #[source]
        source: PathValidationError,
    },

    #[error("refusing to overwrite existing artifact: {0}")]
    Collision(String),

    #[error("failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Receipt for a persisted artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredArtifact {
    /// Path relative to the storage root
    pub path: String,
    pub bytes: u64,
    /// Content hash (sha256:...)
    pub content_hash: String,
}

impl StoredArtifact {
    fn describe(path: &str, bytes: &[u8]) -> Self {
        Self { path: path.to_string(), bytes: bytes.len() as u64, content_hash: content_hash(bytes) }
    }
}

/// `sha256:<hex>` digest of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("sha256:{hex}")
}

/// Output path of a production image: `<category>/<name>.<ext>`.
pub fn image_path(asset: &AssetRequest) -> String {
    format!("{}/{}", asset.category, asset.file_name())
}

/// Output path of a sample image: `samples/<session>/<category>/<name>.<ext>`.
pub fn sample_image_path(session: &str, asset: &AssetRequest) -> String {
    format!("samples/{session}/{}", image_path(asset))
}

/// Output path of a prompt text: `prompts/<session>/<category>/<name>.<provider>.txt`.
pub fn prompt_path(session: &str, asset: &AssetRequest, provider: &str) -> String {
    format!("prompts/{session}/{}/{}.{provider}.txt", asset.category, asset.name)
}

/// Write-once artifact sink.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Persist `bytes` at the relative `path`. Fails with
    /// [`StorageError::Collision`] when something is already there.
    async fn write(&self, path: &str, bytes: &[u8]) -> Result<StoredArtifact, StorageError>;
}

/// Filesystem storage rooted at an output directory.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
    validator: PathValidator,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), validator: PathValidator::new() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let relative = self
            .validator
            .validate(path)
            .map_err(|source| StorageError::InvalidPath { path: path.to_string(), source })?;
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl Storage for FsStorage {
    async fn write(&self, path: &str, bytes: &[u8]) -> Result<StoredArtifact, StorageError> {
        let target = self.resolve(path)?;
        let io_err = |source| StorageError::Io { path: path.to_string(), source };

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        // Write beside the target, then link it into place. Linking fails if
        // the target exists, so concurrent writers cannot replace each other.
        let partial = target.with_extension(format!("part-{}", uuid::Uuid::new_v4().simple()));
        if let Err(source) = tokio::fs::write(&partial, bytes).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(io_err(source));
        }
        let linked = tokio::fs::hard_link(&partial, &target).await;
        let _ = tokio::fs::remove_file(&partial).await;
        match linked {
            Ok(()) => {}
            Err(source) if source.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(StorageError::Collision(path.to_string()));
            }
            Err(source) => return Err(io_err(source)),
        }

        tracing::debug!(path, bytes = bytes.len(), "Artifact written");
        Ok(StoredArtifact::describe(path, bytes))
    }
}

/// In-memory storage for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    validator: PathValidator,
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    fail_next: AtomicUsize,
    fail_matching: Mutex<Option<String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` writes with an I/O error.
    pub fn fail_next_writes(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Fail every write whose path contains `fragment`.
    pub fn fail_paths_containing(&self, fragment: impl Into<String>) {
        *self.fail_matching.lock() = Some(fragment.into());
    }

    /// Paths written so far, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.files.lock().keys().cloned().collect()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.lock().contains_key(path)
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.files.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn injected_failure(&self, path: &str) -> bool {
        if let Some(fragment) = self.fail_matching.lock().as_deref() {
            if path.contains(fragment) {
                return true;
            }
        }
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn write(&self, path: &str, bytes: &[u8]) -> Result<StoredArtifact, StorageError> {
        self.validator
            .validate(path)
            .map_err(|source| StorageError::InvalidPath { path: path.to_string(), source })?;

        if self.injected_failure(path) {
            return Err(StorageError::Io {
                path: path.to_string(),
                source: io::Error::new(io::ErrorKind::Other, "injected write failure"),
            });
        }

        let mut files = self.files.lock();
        if files.contains_key(path) {
            return Err(StorageError::Collision(path.to_string()));
        }
        files.insert(path.to_string(), bytes.to_vec());
        Ok(StoredArtifact::describe(path, bytes))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_layout_paths() {
        use crate::core::{AssetCategory, ImageFormat};

        let asset = AssetRequest::new(AssetCategory::Cover, "hero").with_format(ImageFormat::Jpeg);
        assert_eq!(image_path(&asset), "cover/hero.jpg");
        assert_eq!(sample_image_path("s1", &asset), "samples/s1/cover/hero.jpg");
        assert_eq!(prompt_path("s1", &asset, "claude"), "prompts/s1/cover/hero.claude.txt");
        assert!(PathValidator::new().validate(&prompt_path("s1", &asset, "claude")).is_ok());
    }

    #[test]
    fn test_content_hash_format() {
        let hash = content_hash(b"hello");
        assert_eq!(
            hash,
            "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[tokio::test]
    async fn test_fs_storage_writes_and_refuses_collision() {
        let temp = TempDir::new().unwrap();
        let storage = FsStorage::new(temp.path());

        let stored = storage.write("icon/focus.png", b"png-bytes").await.unwrap();
        assert_eq!(stored.bytes, 9);
        assert_eq!(std::fs::read(temp.path().join("icon/focus.png")).unwrap(), b"png-bytes");

        let err = storage.write("icon/focus.png", b"other").await.unwrap_err();
        assert!(matches!(err, StorageError::Collision(_)));
        assert_eq!(std::fs::read(temp.path().join("icon/focus.png")).unwrap(), b"png-bytes");
    }

    #[tokio::test]
    async fn test_fs_storage_rejects_traversal() {
        let temp = TempDir::new().unwrap();
        let storage = FsStorage::new(temp.path().join("out"));

        let err = storage.write("../escape.png", b"x").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidPath { .. }));
        assert!(!temp.path().join("escape.png").exists());
    }

    #[tokio::test]
    async fn test_fs_storage_leaves_no_partial_files() {
        let temp = TempDir::new().unwrap();
        let storage = FsStorage::new(temp.path());
        storage.write("cover/a.jpg", b"jpeg").await.unwrap();

        let names: Vec<_> = std::fs::read_dir(temp.path().join("cover"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.jpg".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fs_storage_concurrent_writers_to_one_path() {
        let temp = TempDir::new().unwrap();
        let storage = std::sync::Arc::new(FsStorage::new(temp.path()));

        let writers: Vec<_> = (0..8u8)
            .map(|i| {
                let storage = std::sync::Arc::clone(&storage);
                tokio::spawn(async move { (i, storage.write("icon/race.png", &[i; 64]).await) })
            })
            .collect();

        let mut winners = Vec::new();
        let mut collisions = 0;
        for writer in writers {
            match writer.await.unwrap() {
                (i, Ok(_)) => winners.push(i),
                (_, Err(StorageError::Collision(_))) => collisions += 1,
                (_, Err(other)) => panic!("unexpected error: {other}"),
            }
        }

        assert_eq!(winners.len(), 1);
        assert_eq!(collisions, 7);
        let on_disk = std::fs::read(temp.path().join("icon/race.png")).unwrap();
        assert_eq!(on_disk, vec![winners[0]; 64]);
        assert_eq!(std::fs::read_dir(temp.path().join("icon")).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_memory_storage_failure_injection() {
        let storage = MemoryStorage::new();
        storage.fail_next_writes(1);

        assert!(matches!(storage.write("a/b.png", b"1").await, Err(StorageError::Io { .. })));
        assert!(storage.write("a/b.png", b"1").await.is_ok());
        assert_eq!(storage.paths(), vec!["a/b.png".to_string()]);

        storage.fail_paths_containing("texture/");
        assert!(storage.write("texture/x.png", b"1").await.is_err());
        assert!(storage.write("icon/x.png", b"1").await.is_ok());
    }
}
