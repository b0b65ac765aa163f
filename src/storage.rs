//! Archive storage: the object store holding chunks blobs and precomputed
//! comparison payloads. The engine reads one object per report build.
use std::collections::HashMap;
use std::path::{Component as PathComponent, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{ReportError, Result};

/// Key of a commit's chunks blob.
#[must_use]
pub fn chunks_key(version: &str, repo_hash: &str, commit_sha: &str) -> String {
    format!("{version}/repos/{repo_hash}/commits/{commit_sha}/chunks.txt")
}

/// Key of a precomputed impacted-files payload for a base/head pair.
#[must_use]
pub fn comparison_key(version: &str, repo_hash: &str, base_sha: &str, head_sha: &str) -> String {
    format!("{version}/repos/{repo_hash}/comparisons/{base_sha}...{head_sha}.json")
}

/// The object store interface.
pub trait ArchiveStorage {
    /// Read an object. A missing key is [`ReportError::NotFound`]; any other
    /// failure is [`ReportError::StorageUnavailable`].
    fn read(&self, key: &str) -> Result<Vec<u8>>;

    fn write(&self, key: &str, data: &[u8]) -> Result<()>;

    /// A URL a client can PUT the object to until `ttl` elapses.
    fn presigned_put(&self, key: &str, ttl: Duration) -> Result<String>;

    /// Delete an object. Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Result<()>;
}

/// Objects stored as files under a root directory.
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let safe = relative
            .components()
            .all(|c| matches!(c, PathComponent::Normal(_)));
        if key.is_empty() || !safe {
            return Err(ReportError::Other(format!("invalid storage key: '{key}'")));
        }
        Ok(self.root.join(relative))
    }
}

fn unavailable(key: &str, err: std::io::Error) -> ReportError {
    ReportError::StorageUnavailable(format!("{key}: {err}"))
}

impl ArchiveStorage for FsStorage {
    fn read(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        std::fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ReportError::NotFound(key.to_string()),
            _ => unavailable(key, e),
        })
    }

    fn write(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| unavailable(key, e))?;
        }
        std::fs::write(&path, data).map_err(|e| unavailable(key, e))
    }

    fn presigned_put(&self, key: &str, ttl: Duration) -> Result<String> {
        let path = self.path_for(key)?;
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| ReportError::Other(format!("invalid ttl: {e}")))?;
        let expires = chrono::Utc::now() + ttl;
        Ok(format!(
            "file://{}?expires={}",
            path.display(),
            expires.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        ))
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(unavailable(key, e)),
        }
    }
}

/// Objects kept in process memory.
#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn objects(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>> {
        self.objects
            .lock()
            .map_err(|_| ReportError::StorageUnavailable("memory store poisoned".to_string()))
    }
}

impl ArchiveStorage for MemoryStorage {
    fn read(&self, key: &str) -> Result<Vec<u8>> {
        self.objects()?
            .get(key)
            .cloned()
            .ok_or_else(|| ReportError::NotFound(key.to_string()))
    }

    fn write(&self, key: &str, data: &[u8]) -> Result<()> {
        self.objects()?.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn presigned_put(&self, key: &str, ttl: Duration) -> Result<String> {
        Ok(format!("memory://{key}?ttl={}", ttl.as_secs()))
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.objects()?.remove(key);
        Ok(())
    }
}

/// Caller-owned cancellation flag with an optional deadline.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that trips once `timeout` has elapsed.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// `Err(Cancelled)` once the token has tripped.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ReportError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunks_key_format() {
        assert_eq!(
            chunks_key("v4", "ABC123", "deadbeef"),
            "v4/repos/ABC123/commits/deadbeef/chunks.txt"
        );
    }

    #[test]
    fn test_fs_storage_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        let key = chunks_key("v4", "hash", "sha");

        assert!(storage.read(&key).unwrap_err().is_not_found());
        storage.write(&key, b"{}").unwrap();
        assert_eq!(storage.read(&key).unwrap(), b"{}");
        storage.delete(&key).unwrap();
        storage.delete(&key).unwrap();
        assert!(storage.read(&key).unwrap_err().is_not_found());
    }

    #[test]
    fn test_fs_storage_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        assert!(storage.read("../etc/passwd").is_err());
        assert!(storage.write("/abs/path", b"x").is_err());
        assert!(storage.read("").is_err());
    }

    #[test]
    fn test_fs_presigned_put() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        let url = storage
            .presigned_put("v4/raw/upload.txt", Duration::from_secs(10))
            .unwrap();
        assert!(url.starts_with("file://"));
        assert!(url.contains("upload.txt?expires="));
    }

    #[test]
    fn test_memory_storage() {
        let storage = MemoryStorage::new();
        assert!(matches!(storage.read("k"), Err(ReportError::NotFound(_))));
        storage.write("k", b"v").unwrap();
        assert_eq!(storage.read("k").unwrap(), b"v");
        storage.delete("k").unwrap();
        assert!(storage.read("k").is_err());
    }

    #[test]
    fn test_cancellation_token() {
        let token = CancellationToken::new();
        assert!(token.check().is_ok());
        let clone = token.clone();
        clone.cancel();
        assert!(matches!(token.check(), Err(ReportError::Cancelled)));

        let expired = CancellationToken::with_timeout(Duration::ZERO);
        assert!(expired.is_cancelled());
    }
}
