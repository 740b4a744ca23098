//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.
//! Backends provide whole-document reads and atomic whole-document writes;
//! the per-resource commit protocol is built on top of those here.

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{HalldyllError, Result, StateError};

use super::lock::LockInfo;
use super::types::{Commit, HistoryEntry, STATE_VERSION, StateSnapshot, WriteAheadMarker};

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Reads the raw state document.
    ///
    /// Returns `None` if no state exists yet.
    async fn read_snapshot(&self) -> Result<Option<StateSnapshot>>;

    /// Atomically replaces the state document.
    async fn write_snapshot(&self, snapshot: &StateSnapshot) -> Result<()>;

    /// Mutex serializing read-modify-write cycles inside this process.
    fn write_guard(&self) -> &Mutex<()>;

    /// Checks if state exists.
    async fn exists(&self) -> Result<bool>;

    /// Acquires the exclusive lock.
    ///
    /// Fails fast with `Locked` when another live holder owns it.
    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo>;

    /// Pushes the expiry of a held lock forward.
    ///
    /// Fails with `LockLost` if the lock expired or now belongs to someone else.
    async fn refresh_lock(&self, lock: &LockInfo) -> Result<LockInfo>;

    /// Releases the lock if `lock_id` still owns it.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Removes the lock regardless of holder, returning what was removed.
    async fn force_unlock(&self) -> Result<Option<LockInfo>>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if the state is locked by a live holder.
    async fn is_locked(&self) -> Result<bool> {
        Ok(self
            .get_lock_info()
            .await?
            .is_some_and(|lock| !lock.is_expired()))
    }

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;

    /// Loads the state, returning an empty snapshot if none exists.
    ///
    /// # Errors
    ///
    /// Returns `VersionMismatch` for documents written by another major version.
    async fn load(&self) -> Result<StateSnapshot> {
        let Some(snapshot) = self.read_snapshot().await? else {
            debug!("No state found, starting empty");
            return Ok(StateSnapshot::new());
        };

        if snapshot.version != STATE_VERSION {
            return Err(HalldyllError::State(StateError::VersionMismatch {
                expected: STATE_VERSION,
                found: snapshot.version,
            }));
        }

        Ok(snapshot)
    }

    /// Commits one resource change in a single atomic write.
    ///
    /// Also clears the resource's write-ahead marker. Returns the new serial.
    async fn commit(&self, address: &str, commit: Commit) -> Result<u64> {
        let _guard = self.write_guard().lock().await;
        let mut snapshot = self.load().await?;
        snapshot.apply_commit(address, commit);
        self.write_snapshot(&snapshot).await?;
        debug!("Committed {address} at serial {}", snapshot.serial);
        Ok(snapshot.serial)
    }

    /// Records a write-ahead marker before a provider call.
    async fn record_marker(&self, marker: WriteAheadMarker) -> Result<()> {
        let _guard = self.write_guard().lock().await;
        let mut snapshot = self.load().await?;
        debug!("Recording {} marker for {}", marker.operation, marker.resource);
        snapshot.set_marker(marker);
        self.write_snapshot(&snapshot).await
    }

    /// Clears a write-ahead marker after a definitive failure.
    async fn clear_marker(&self, address: &str) -> Result<()> {
        let _guard = self.write_guard().lock().await;
        let mut snapshot = self.load().await?;
        if snapshot.clear_marker(address) {
            self.write_snapshot(&snapshot).await?;
        }
        Ok(())
    }

    /// Appends a history entry.
    async fn record_history(&self, entry: HistoryEntry) -> Result<()> {
        let _guard = self.write_guard().lock().await;
        let mut snapshot = self.load().await?;
        snapshot.add_history(entry);
        self.write_snapshot(&snapshot).await
    }
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn read_snapshot(&self) -> Result<Option<StateSnapshot>> {
        (**self).read_snapshot().await
    }

    async fn write_snapshot(&self, snapshot: &StateSnapshot) -> Result<()> {
        (**self).write_snapshot(snapshot).await
    }

    fn write_guard(&self) -> &Mutex<()> {
        (**self).write_guard()
    }

    async fn exists(&self) -> Result<bool> {
        (**self).exists().await
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        (**self).acquire_lock(holder).await
    }

    async fn refresh_lock(&self, lock: &LockInfo) -> Result<LockInfo> {
        (**self).refresh_lock(lock).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        (**self).release_lock(lock_id).await
    }

    async fn force_unlock(&self) -> Result<Option<LockInfo>> {
        (**self).force_unlock().await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        (**self).get_lock_info().await
    }

    async fn is_locked(&self) -> Result<bool> {
        (**self).is_locked().await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }

    async fn load(&self) -> Result<StateSnapshot> {
        (**self).load().await
    }

    async fn commit(&self, address: &str, commit: Commit) -> Result<u64> {
        (**self).commit(address, commit).await
    }

    async fn record_marker(&self, marker: WriteAheadMarker) -> Result<()> {
        (**self).record_marker(marker).await
    }

    async fn clear_marker(&self, address: &str) -> Result<()> {
        (**self).clear_marker(address).await
    }

    async fn record_history(&self, entry: HistoryEntry) -> Result<()> {
        (**self).record_history(entry).await
    }
}
