//! State management module for the Halldyll infrastructure engine.
//!
//! This module provides persistent state storage for tracking applied
//! resources, write-ahead markers for in-flight provider calls, the exclusive
//! state lock, and run history.

mod store;
mod local;
mod s3;
mod lock;
mod types;

pub use store::StateStore;
pub use local::{LocalStateStore, STATE_DIR};
pub use s3::S3StateStore;
pub use lock::{
    LOCK_EXPIRY_SECS, LOCK_REFRESH_SECS, LockInfo, generate_holder_id, with_state_lock,
};
pub use types::{
    Commit, DeposedObject, HistoryEntry, HistoryOperation, MAX_HISTORY, MarkerOperation,
    ResourceState, STATE_VERSION, StateSnapshot, WriteAheadMarker,
};
