//! State locking for concurrent access protection.
//!
//! This module provides the exclusive lock that keeps two invocations from
//! applying against the same state at once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{HalldyllError, Result, StateError};

use super::store::StateStore;

/// Lock expiry duration in seconds.
pub const LOCK_EXPIRY_SECS: i64 = 300; // 5 minutes

/// Interval between refreshes of a held lock.
pub const LOCK_REFRESH_SECS: u64 = 60;

/// Information about a state lock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Creates a new lock info.
    #[must_use]
    pub fn new(holder: &str) -> Self {
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Extends the expiry to a full period from now.
    pub fn refresh(&mut self) {
        self.expires_at = Utc::now() + chrono::Duration::seconds(LOCK_EXPIRY_SECS);
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get()
        .map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());

    let pid = std::process::id();
    let uuid = Uuid::new_v4().simple().to_string();

    format!("{hostname}-{pid}-{}", &uuid[..8])
}

/// Runs `f` while holding the state lock, releasing it on every exit path.
///
/// The lock is refreshed every [`LOCK_REFRESH_SECS`] while `f` runs. If it is
/// lost anyway, `f` is abandoned at its next await point. A release failure
/// is reported only if `f` itself succeeded.
///
/// # Errors
///
/// Returns `Locked` if another live holder owns the lock, `LockLost` if the
/// lock expired or was taken over mid-run, or whatever `f` returns.
pub async fn with_state_lock<S, T, F, Fut>(store: &S, holder: &str, f: F) -> Result<T>
where
    S: StateStore + ?Sized,
    F: FnOnce(LockInfo) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    with_refreshed_lock(store, holder, Duration::from_secs(LOCK_REFRESH_SECS), f).await
}

async fn with_refreshed_lock<S, T, F, Fut>(
    store: &S,
    holder: &str,
    every: Duration,
    f: F,
) -> Result<T>
where
    S: StateStore + ?Sized,
    F: FnOnce(LockInfo) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let lock = store.acquire_lock(holder).await?;
    let lock_id = lock.lock_id.clone();

    let work = f(lock.clone());
    let heartbeat = keep_alive(store, lock, every);
    tokio::pin!(work, heartbeat);

    let result = tokio::select! {
        result = &mut work => result,
        lost = &mut heartbeat => {
            warn!("State lock {lock_id} lost; abandoning the run");
            return Err(lost);
        }
    };

    match store.release_lock(&lock_id).await {
        Ok(()) => result,
        Err(e) if result.is_ok() => Err(e),
        Err(e) => {
            warn!("Failed to release state lock {lock_id}: {e}");
            result
        }
    }
}

/// Refreshes `lock` on a fixed interval; resolves only once the lock is lost.
async fn keep_alive<S>(store: &S, mut lock: LockInfo, every: Duration) -> HalldyllError
where
    S: StateStore + ?Sized,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match store.refresh_lock(&lock).await {
            Ok(refreshed) => {
                debug!("State lock {} good for {}s", refreshed.lock_id, refreshed.remaining_secs());
                lock = refreshed;
            }
            Err(e @ HalldyllError::State(StateError::LockLost { .. })) => return e,
            // Retried on the next tick; expiry turns persistent failures into a loss
            Err(e) => warn!("Failed to refresh state lock {}: {e}", lock.lock_id),
        }
    }
}
