//! Local file-based state storage backend.
//!
//! This module provides a simple file-based state storage for local use and
//! single-machine automation.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{HalldyllError, Result, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
use super::store::StateStore;
use super::types::StateSnapshot;

/// Default state directory name.
pub const STATE_DIR: &str = ".halldyll";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
    /// Serializes writers inside this process.
    write_guard: Mutex<()>,
}

impl LocalStateStore {
    /// Creates a new local state store under `.halldyll` in the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| HalldyllError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let state_path = base_dir.join(STATE_FILE);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            state_path,
            lock_path,
            write_guard: Mutex::new(()),
        }
    }

    /// Returns the path of the state document.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Ensures the state directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                HalldyllError::State(StateError::backend(format!(
                    "Failed to create state directory: {e}"
                )))
            })?;
        }
        Ok(())
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        let content = match fs::read_to_string(&self.lock_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(HalldyllError::State(StateError::Corrupted {
                    message: format!("Failed to read lock file: {e}"),
                }));
            }
        };

        let lock_info: LockInfo = serde_json::from_str(&content).map_err(|e| {
            HalldyllError::State(StateError::Corrupted {
                message: format!("Failed to parse lock file: {e}"),
            })
        })?;

        Ok(Some(lock_info))
    }

    /// Creates the lock file; fails with `AlreadyExists` if present.
    async fn create_lock_file(&self, lock_info: &LockInfo) -> std::io::Result<()> {
        let content = serde_json::to_string_pretty(lock_info)?;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await?;
        file.write_all(content.as_bytes()).await?;
        file.sync_all().await
    }

    /// Replaces the lock file through a temp file and rename.
    async fn rewrite_lock_file(&self, lock_info: &LockInfo) -> Result<()> {
        let content = serde_json::to_string_pretty(lock_info).map_err(|e| {
            HalldyllError::State(StateError::serialization(format!(
                "Failed to serialize lock: {e}"
            )))
        })?;

        let temp_path = self.lock_path.with_extension("lock.tmp");
        fs::write(&temp_path, content).await.map_err(|e| {
            HalldyllError::State(StateError::LockFailed {
                message: format!("Failed to write lock file: {e}"),
            })
        })?;
        fs::rename(&temp_path, &self.lock_path).await.map_err(|e| {
            HalldyllError::State(StateError::LockFailed {
                message: format!("Failed to rename lock file: {e}"),
            })
        })
    }

    /// Deletes the lock file.
    async fn delete_lock_file(&self) -> Result<()> {
        match fs::remove_file(&self.lock_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(HalldyllError::State(StateError::LockFailed {
                message: format!("Failed to delete lock file: {e}"),
            })),
        }
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn read_snapshot(&self) -> Result<Option<StateSnapshot>> {
        let content = match fs::read_to_string(&self.state_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("State file does not exist: {}", self.state_path.display());
                return Ok(None);
            }
            Err(e) => {
                return Err(HalldyllError::State(StateError::Corrupted {
                    message: format!("Failed to read state file: {e}"),
                }));
            }
        };

        debug!("Loaded state from: {}", self.state_path.display());

        let state: StateSnapshot = serde_json::from_str(&content).map_err(|e| {
            HalldyllError::State(StateError::Corrupted {
                message: format!("Failed to parse state file: {e}"),
            })
        })?;

        Ok(Some(state))
    }

    async fn write_snapshot(&self, snapshot: &StateSnapshot) -> Result<()> {
        self.ensure_dir().await?;

        let content = serde_json::to_string_pretty(snapshot).map_err(|e| {
            HalldyllError::State(StateError::serialization(format!(
                "Failed to serialize state: {e}"
            )))
        })?;

        // Write to a temporary file first, then rename for atomicity
        let temp_path = self.state_path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            HalldyllError::State(StateError::backend(format!(
                "Failed to create temp state file: {e}"
            )))
        })?;

        file.write_all(content.as_bytes()).await.map_err(|e| {
            HalldyllError::State(StateError::backend(format!(
                "Failed to write state file: {e}"
            )))
        })?;

        file.sync_all().await.map_err(|e| {
            HalldyllError::State(StateError::backend(format!(
                "Failed to sync state file: {e}"
            )))
        })?;

        // Atomic rename
        fs::rename(&temp_path, &self.state_path).await.map_err(|e| {
            HalldyllError::State(StateError::backend(format!(
                "Failed to rename state file: {e}"
            )))
        })?;

        debug!("State written at serial {}", snapshot.serial);
        Ok(())
    }

    fn write_guard(&self) -> &Mutex<()> {
        &self.write_guard
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state_path.exists())
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        self.ensure_dir().await?;

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };

        // One retry: the first attempt may find an expired lock to take over
        for _ in 0..2 {
            let lock_info = LockInfo::new(&holder_id);
            match self.create_lock_file(&lock_info).await {
                Ok(()) => {
                    info!(
                        "Acquired state lock: {} (expires in {}s)",
                        lock_info.lock_id, LOCK_EXPIRY_SECS
                    );
                    return Ok(lock_info);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    match self.read_lock_file().await? {
                        Some(existing) if !existing.is_expired() => {
                            return Err(HalldyllError::State(StateError::Locked {
                                holder: existing.holder,
                                since: existing.acquired_at.to_rfc3339(),
                            }));
                        }
                        _ => {
                            debug!("Expired lock found, taking over");
                            self.delete_lock_file().await?;
                        }
                    }
                }
                Err(e) => {
                    return Err(HalldyllError::State(StateError::LockFailed {
                        message: format!("Failed to create lock file: {e}"),
                    }));
                }
            }
        }

        Err(HalldyllError::State(StateError::LockFailed {
            message: String::from("Lock was taken over concurrently"),
        }))
    }

    async fn refresh_lock(&self, lock: &LockInfo) -> Result<LockInfo> {
        match self.read_lock_file().await? {
            Some(existing) if existing.lock_id == lock.lock_id && !existing.is_expired() => {
                let mut refreshed = existing;
                refreshed.refresh();
                self.rewrite_lock_file(&refreshed).await?;
                debug!("Refreshed state lock {} until {}", refreshed.lock_id, refreshed.expires_at);
                Ok(refreshed)
            }
            _ => Err(HalldyllError::State(StateError::LockLost {
                lock_id: lock.lock_id.clone(),
            })),
        }
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn force_unlock(&self) -> Result<Option<LockInfo>> {
        let existing = self.read_lock_file().await.ok().flatten();
        self.delete_lock_file().await?;
        Ok(existing)
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Attributes;
    use crate::state::{Commit, MarkerOperation, ResourceState, WriteAheadMarker};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path().join(STATE_DIR));
        (store, temp_dir)
    }

    fn vpc(id: &str) -> ResourceState {
        ResourceState::new("aws_vpc.main", "aws_vpc", id, Attributes::new())
    }

    #[tokio::test]
    async fn test_load_nonexistent_is_empty() {
        let (store, _temp) = create_test_store();

        let state = store.load().await.expect("Load should not fail");
        assert_eq!(state.serial, 0);
        assert!(state.is_empty());
        assert!(!store.exists().await.expect("exists check failed"));
    }

    #[tokio::test]
    async fn test_commit_and_reload() {
        let (store, _temp) = create_test_store();

        let serial = store
            .commit("aws_vpc.main", Commit::Put(vpc("vpc-1")))
            .await
            .expect("Failed to commit");
        assert_eq!(serial, 1);
        assert!(store.exists().await.expect("exists check failed"));

        let reopened = LocalStateStore::with_base_dir(store.state_path().parent().expect("parent"));
        let loaded = reopened.load().await.expect("Failed to load state");
        assert_eq!(loaded.serial, 1);
        assert_eq!(
            loaded.get("aws_vpc.main").map(|r| r.provider_id.as_str()),
            Some("vpc-1")
        );
        assert!(!store.state_path().with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_commit_clears_marker() {
        let (store, _temp) = create_test_store();

        store
            .record_marker(WriteAheadMarker::new(
                "aws_vpc.main",
                "aws_vpc",
                MarkerOperation::Create,
                "tok",
            ))
            .await
            .expect("Failed to record marker");
        assert_eq!(
            store.load().await.expect("load").marker_addresses(),
            vec!["aws_vpc.main"]
        );

        store
            .commit("aws_vpc.main", Commit::Put(vpc("vpc-1")))
            .await
            .expect("Failed to commit");
        let state = store.load().await.expect("load");
        assert!(state.markers.is_empty());
        assert_eq!(state.serial, 2);
    }

    #[tokio::test]
    async fn test_concurrent_commits_are_serialized() {
        let (store, _temp) = create_test_store();
        let store = Arc::new(store);

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let address = format!("aws_subnet.s{i}");
                let resource =
                    ResourceState::new(&address, "aws_subnet", &format!("subnet-{i}"), Attributes::new());
                store.commit(&address, Commit::Put(resource)).await
            }));
        }
        for handle in handles {
            handle.await.expect("task panicked").expect("commit failed");
        }

        let state = store.load().await.expect("load");
        assert_eq!(state.resources.len(), 8);
        assert_eq!(state.serial, 8);
    }

    #[tokio::test]
    async fn test_version_mismatch_rejected() {
        let (store, _temp) = create_test_store();
        let mut snapshot = StateSnapshot::new();
        snapshot.version = 2;
        store.write_snapshot(&snapshot).await.expect("write");

        assert!(matches!(
            store.load().await,
            Err(HalldyllError::State(StateError::VersionMismatch { found: 2, .. }))
        ));
    }

    #[tokio::test]
    async fn test_corrupted_state_rejected() {
        let (store, _temp) = create_test_store();
        store.ensure_dir().await.expect("dir");
        fs::write(store.state_path(), "{not json").await.expect("write");

        assert!(matches!(
            store.load().await,
            Err(HalldyllError::State(StateError::Corrupted { .. }))
        ));
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();

        let lock = store
            .acquire_lock("test-holder")
            .await
            .expect("Failed to acquire lock");

        assert!(store.is_locked().await.expect("is_locked failed"));

        store
            .release_lock(&lock.lock_id)
            .await
            .expect("Failed to release lock");

        assert!(!store.is_locked().await.expect("is_locked failed"));
    }

    #[tokio::test]
    async fn test_lock_conflict() {
        let (store, _temp) = create_test_store();

        let _lock1 = store
            .acquire_lock("holder-1")
            .await
            .expect("Failed to acquire first lock");

        let result = store.acquire_lock("holder-2").await;
        assert!(matches!(
            result,
            Err(HalldyllError::State(StateError::Locked { ref holder, .. })) if holder == "holder-1"
        ));
    }

    #[tokio::test]
    async fn test_expired_lock_taken_over() {
        let (store, _temp) = create_test_store();
        store.ensure_dir().await.expect("dir");

        let mut stale = LockInfo::new("crashed");
        stale.expires_at = stale.acquired_at - chrono::Duration::seconds(1);
        store.create_lock_file(&stale).await.expect("write stale lock");
        assert!(!store.is_locked().await.expect("is_locked failed"));

        let lock = store.acquire_lock("fresh").await.expect("takeover failed");
        assert_eq!(lock.holder, "fresh");
    }

    #[tokio::test]
    async fn test_force_unlock() {
        let (store, _temp) = create_test_store();
        let lock = store.acquire_lock("holder").await.expect("lock");

        let removed = store.force_unlock().await.expect("force unlock");
        assert_eq!(removed.map(|l| l.lock_id), Some(lock.lock_id));
        assert!(!store.is_locked().await.expect("is_locked failed"));
    }
}
