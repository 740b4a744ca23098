//! State types for tracking applied resources.
//!
//! These types represent the last-applied state of every managed resource,
//! plus the write-ahead markers guarding provider calls in flight.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::provider::Attributes;

/// Current major version of the state format.
pub const STATE_VERSION: u32 = 1;

/// Number of history entries kept.
pub const MAX_HISTORY: usize = 100;

/// The complete persisted state document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateSnapshot {
    /// State format version.
    pub version: u32,
    /// Incremented on every write.
    pub serial: u64,
    /// Identifies this state's lineage; assigned on first write.
    #[serde(default)]
    pub lineage: String,
    /// Applied resources keyed by address.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceState>,
    /// Write-ahead markers keyed by address.
    #[serde(default)]
    pub markers: BTreeMap<String, WriteAheadMarker>,
    /// Recent apply/destroy/reconcile runs.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    /// When the state was last written.
    pub last_updated: DateTime<Utc>,
}

/// Last-applied record of one resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceState {
    /// Resource address.
    pub address: String,
    /// Resource type tag.
    pub resource_type: String,
    /// Provider-assigned identifier.
    pub provider_id: String,
    /// Concrete attributes as reported by the provider.
    #[serde(default)]
    pub attributes: Attributes,
    /// Fingerprint of the declaration that produced this state.
    #[serde(default)]
    pub fingerprint: String,
    /// Addresses this resource depended on when applied.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Old instance awaiting destruction after a create-before-destroy replacement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deposed: Option<DeposedObject>,
    /// When the resource was first created.
    pub created_at: DateTime<Utc>,
    /// When the resource was last written.
    pub updated_at: DateTime<Utc>,
}

/// A replaced instance still alive at the provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeposedObject {
    /// Provider identifier of the old instance.
    pub provider_id: String,
    /// When it was deposed.
    pub deposed_at: DateTime<Utc>,
}

/// Operation guarded by a write-ahead marker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MarkerOperation {
    /// A create (including replacement creates).
    Create,
    /// An in-place update.
    Update,
    /// A delete of the current instance.
    Delete,
    /// A delete of a deposed instance.
    DestroyDeposed,
}

/// Record of a provider call whose outcome is not yet committed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WriteAheadMarker {
    /// Resource address.
    pub resource: String,
    /// Resource type tag.
    pub resource_type: String,
    /// Guarded operation.
    pub operation: MarkerOperation,
    /// Provider identifier involved, when one exists.
    #[serde(default)]
    pub provider_id: Option<String>,
    /// Idempotency token sent with the call.
    pub token: String,
    /// Fingerprint of the declaration being applied.
    #[serde(default)]
    pub fingerprint: String,
    /// Dependencies to record if the outcome is adopted.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// When the call started.
    pub started_at: DateTime<Utc>,
}

/// A per-resource state change.
#[derive(Debug, Clone, PartialEq)]
pub enum Commit {
    /// Insert or replace the resource's state.
    Put(ResourceState),
    /// Remove the resource from state.
    Tombstone,
}

/// A single entry in the run history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Type of run.
    pub operation: HistoryOperation,
    /// Resources touched.
    pub resources: Vec<String>,
    /// Whether every step succeeded.
    pub success: bool,
    /// Optional error summary.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of recorded runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HistoryOperation {
    /// Apply of a plan.
    Apply,
    /// Apply of a destroy plan.
    Destroy,
    /// Marker reconciliation.
    Reconcile,
}

impl StateSnapshot {
    /// Creates a new empty state. The lineage is assigned on first write.
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: STATE_VERSION,
            serial: 0,
            lineage: String::new(),
            resources: BTreeMap::new(),
            markers: BTreeMap::new(),
            history: Vec::new(),
            last_updated: Utc::now(),
        }
    }

    /// Gets a resource by address.
    #[must_use]
    pub fn get(&self, address: &str) -> Option<&ResourceState> {
        self.resources.get(address)
    }

    /// Applies a commit: writes or removes the resource, clears its marker,
    /// and bumps the serial.
    pub fn apply_commit(&mut self, address: &str, commit: Commit) {
        match commit {
            Commit::Put(resource) => {
                self.resources.insert(address.to_string(), resource);
            }
            Commit::Tombstone => {
                self.resources.remove(address);
            }
        }
        self.markers.remove(address);
        self.touch();
    }

    /// Records a write-ahead marker and bumps the serial.
    pub fn set_marker(&mut self, marker: WriteAheadMarker) {
        self.markers.insert(marker.resource.clone(), marker);
        self.touch();
    }

    /// Removes a marker; bumps the serial only if one existed.
    pub fn clear_marker(&mut self, address: &str) -> bool {
        let removed = self.markers.remove(address).is_some();
        if removed {
            self.touch();
        }
        removed
    }

    /// Adds a history entry, keeping the last [`MAX_HISTORY`].
    pub fn add_history(&mut self, entry: HistoryEntry) {
        while self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
        self.touch();
    }

    /// Returns the addresses holding stale markers.
    #[must_use]
    pub fn marker_addresses(&self) -> Vec<String> {
        self.markers.keys().cloned().collect()
    }

    /// Returns all resource addresses.
    #[must_use]
    pub fn addresses(&self) -> Vec<&str> {
        self.resources.keys().map(String::as_str).collect()
    }

    /// Returns true if no resources are managed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    fn touch(&mut self) {
        if self.lineage.is_empty() {
            self.lineage = uuid::Uuid::new_v4().to_string();
        }
        self.serial += 1;
        self.last_updated = Utc::now();
    }
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceState {
    /// Creates a new resource state.
    #[must_use]
    pub fn new(
        address: &str,
        resource_type: &str,
        provider_id: &str,
        attributes: Attributes,
    ) -> Self {
        let now = Utc::now();
        Self {
            address: address.to_string(),
            resource_type: resource_type.to_string(),
            provider_id: provider_id.to_string(),
            attributes,
            fingerprint: String::new(),
            dependencies: Vec::new(),
            deposed: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the fingerprint.
    #[must_use]
    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = fingerprint.into();
        self
    }

    /// Sets the recorded dependencies.
    #[must_use]
    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

impl WriteAheadMarker {
    /// Creates a marker for an operation starting now.
    #[must_use]
    pub fn new(
        resource: &str,
        resource_type: &str,
        operation: MarkerOperation,
        token: &str,
    ) -> Self {
        Self {
            resource: resource.to_string(),
            resource_type: resource_type.to_string(),
            operation,
            provider_id: None,
            token: token.to_string(),
            fingerprint: String::new(),
            dependencies: Vec::new(),
            started_at: Utc::now(),
        }
    }
}

impl HistoryEntry {
    /// Creates a new history entry.
    #[must_use]
    pub fn new(operation: HistoryOperation, resources: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            resources,
            success: true,
            error: None,
        }
    }

    /// Creates a failed history entry.
    #[must_use]
    pub fn failed(operation: HistoryOperation, resources: Vec<String>, error: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            resources,
            success: false,
            error: Some(error.to_string()),
        }
    }
}

impl std::fmt::Display for MarkerOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::DestroyDeposed => "destroy-deposed",
        };
        write!(f, "{op}")
    }
}

impl std::fmt::Display for HistoryOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
            Self::Reconcile => "reconcile",
        };
        write!(f, "{op}")
    }
}
