//! Engine facade tying graph, state, planning, and providers together.
//!
//! Besides plan and apply, the engine resolves write-ahead markers left by
//! interrupted runs and reports drift between state and providers.

use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, ResourceConfig};
use crate::error::{HalldyllError, ProviderError, Result, StateError};
use crate::graph::{GraphBuilder, ResourceGraph};
use crate::planner::{
    ApplyExecutor, ApplyReport, DEFAULT_CONCURRENCY, DiffEngine, Plan, PlanScheduler, RetryPolicy,
};
use crate::provider::{OperationContext, Provider, ProviderRegistry};
use crate::state::{
    Commit, DeposedObject, HistoryEntry, HistoryOperation, MarkerOperation, ResourceState,
    StateSnapshot, StateStore, WriteAheadMarker,
};

/// Tunables for applying plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    /// Maximum steps in flight.
    pub concurrency: usize,
    /// Retry policy for transient provider errors.
    pub retry: RetryPolicy,
}

impl EngineOptions {
    /// Builds options from configuration.
    #[must_use]
    pub const fn from_config(config: &EngineConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            retry: RetryPolicy::from_config(&config.retry),
        }
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
        }
    }
}

/// Infrastructure reconciliation engine.
pub struct Engine<'a> {
    /// State store.
    store: &'a dyn StateStore,
    /// Providers by resource type.
    registry: &'a ProviderRegistry,
    /// Apply tunables.
    options: EngineOptions,
    /// Cancels running applies.
    cancel: CancellationToken,
}

/// What marker reconciliation did for one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ReconcileAction {
    /// A created object was found by its token and recorded.
    Adopted {
        /// Provider identifier of the adopted object.
        provider_id: String,
    },
    /// The call never took effect; the marker was dropped.
    Dropped,
    /// The object exists; state now holds its observed attributes.
    Refreshed,
    /// The object is gone; it was removed from state.
    Tombstoned,
    /// The deposed object is gone; it was removed from state.
    DeposedCleared,
    /// The deposed object still exists and stays queued for destruction.
    DeposedKept,
    /// The provider could not answer; the marker remains.
    Unresolved {
        /// Error description.
        error: String,
    },
}

/// Resolution of a single marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MarkerResolution {
    /// Resource address.
    pub address: String,
    /// Operation the marker guarded.
    pub operation: MarkerOperation,
    /// What was done.
    #[serde(flatten)]
    pub action: ReconcileAction,
}

/// Result of marker reconciliation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    /// One entry per marker found.
    pub resolutions: Vec<MarkerResolution>,
}

/// Drift status of a stored resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DriftStatus {
    /// Provider matches state.
    InSync,
    /// The remote object no longer exists.
    Missing,
    /// Attributes differ from state.
    Drifted {
        /// Differing attributes.
        attributes: Vec<AttributeDrift>,
    },
    /// The provider could not be read.
    Unknown {
        /// Error description.
        error: String,
    },
}

/// A single attribute that drifted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttributeDrift {
    /// Attribute name.
    pub attribute: String,
    /// Value recorded in state.
    pub expected: Option<Value>,
    /// Value reported by the provider.
    pub actual: Option<Value>,
}

/// Drift of one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceDrift {
    /// Resource address.
    pub address: String,
    /// Resource type tag.
    pub resource_type: String,
    /// Provider identifier.
    pub provider_id: String,
    /// Drift status.
    #[serde(flatten)]
    pub status: DriftStatus,
}

/// Result of drift detection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DriftReport {
    /// One entry per stored resource.
    pub resources: Vec<ResourceDrift>,
}

impl<'a> Engine<'a> {
    /// Creates an engine with default options.
    #[must_use]
    pub fn new(store: &'a dyn StateStore, registry: &'a ProviderRegistry) -> Self {
        Self {
            store,
            registry,
            options: EngineOptions::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Sets the apply options.
    #[must_use]
    pub const fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Uses `cancel` to stop running applies.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Returns the state store.
    #[must_use]
    pub fn store(&self) -> &dyn StateStore {
        self.store
    }

    /// Builds and validates the resource graph.
    ///
    /// # Errors
    ///
    /// Returns a graph error for duplicates, unknown types, bad references,
    /// or cycles.
    pub fn build_graph(&self, resources: &[ResourceConfig]) -> Result<ResourceGraph> {
        let graph = GraphBuilder::with_registry(self.registry).build_from_config(resources)?;
        debug!("Built graph with {} resources", graph.len());
        Ok(graph)
    }

    /// Plans the changes moving stored state to `graph`.
    ///
    /// # Errors
    ///
    /// Returns `ReconciliationRequired` while stale markers exist.
    pub async fn plan(&self, graph: &ResourceGraph) -> Result<Plan> {
        let snapshot = self.load_reconciled().await?;
        let diff = DiffEngine::new(self.registry).compute(graph, &snapshot)?;
        let plan = PlanScheduler::new().schedule(diff, &snapshot, false)?;
        info!("Plan: {}", plan.summary());
        Ok(plan)
    }

    /// Plans the destruction of every stored resource.
    ///
    /// # Errors
    ///
    /// Returns `ReconciliationRequired` while stale markers exist.
    pub async fn plan_destroy(&self) -> Result<Plan> {
        let snapshot = self.load_reconciled().await?;
        let diff = DiffEngine::new(self.registry).compute_destroy(&snapshot);
        let plan = PlanScheduler::new().schedule(diff, &snapshot, true)?;
        info!("Destroy plan: {}", plan.summary());
        Ok(plan)
    }

    /// Applies a plan.
    ///
    /// # Errors
    ///
    /// Returns `StalePlan` or `ReconciliationRequired` before any provider
    /// call; step failures are reported in the [`ApplyReport`].
    pub async fn apply(&self, plan: &Plan) -> Result<ApplyReport> {
        ApplyExecutor::new(self.store, self.registry)
            .with_concurrency(self.options.concurrency)
            .with_retry(self.options.retry)
            .with_cancellation(self.cancel.clone())
            .execute(plan)
            .await
    }

    /// Resolves every stale write-ahead marker by asking its provider what
    /// actually happened.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be read or written.
    pub async fn reconcile_markers(&self) -> Result<ReconcileReport> {
        let snapshot = self.store.load().await?;
        let mut report = ReconcileReport::default();

        if snapshot.markers.is_empty() {
            info!("No stale markers found");
            return Ok(report);
        }

        for marker in snapshot.markers.values() {
            let action = match self.registry.get(&marker.resource_type) {
                Ok(provider) => {
                    self.resolve_marker(&snapshot, marker, provider.as_ref())
                        .await?
                }
                Err(e) => ReconcileAction::Unresolved {
                    error: e.to_string(),
                },
            };
            info!("{} ({} marker): {action}", marker.resource, marker.operation);
            report.resolutions.push(MarkerResolution {
                address: marker.resource.clone(),
                operation: marker.operation,
                action,
            });
        }

        let resources = report.resolutions.iter().map(|r| r.address.clone()).collect();
        let entry = if report.is_complete() {
            HistoryEntry::new(HistoryOperation::Reconcile, resources)
        } else {
            HistoryEntry::failed(
                HistoryOperation::Reconcile,
                resources,
                "some markers could not be resolved",
            )
        };
        self.store.record_history(entry).await?;

        Ok(report)
    }

    async fn resolve_marker(
        &self,
        snapshot: &StateSnapshot,
        marker: &WriteAheadMarker,
        provider: &dyn Provider,
    ) -> Result<ReconcileAction> {
        let address = marker.resource.as_str();
        let ctx = OperationContext::with_token(address, &marker.token);
        let stored = snapshot.get(address);

        match marker.operation {
            MarkerOperation::Create => match provider.find(&ctx).await {
                Ok(Some(object)) => {
                    let mut state = ResourceState::new(
                        address,
                        &marker.resource_type,
                        &object.id,
                        object.attributes,
                    )
                    .with_fingerprint(marker.fingerprint.clone())
                    .with_dependencies(marker.dependencies.clone());
                    // An interrupted create-before-destroy leaves the old instance
                    // behind; it was deposed when the replacement started
                    if let Some(previous) = stored
                        && previous.provider_id != object.id
                    {
                        state.deposed = Some(DeposedObject {
                            provider_id: previous.provider_id.clone(),
                            deposed_at: marker.started_at,
                        });
                    }
                    self.store.commit(address, Commit::Put(state)).await?;
                    Ok(ReconcileAction::Adopted {
                        provider_id: object.id,
                    })
                }
                Ok(None) => {
                    self.store.clear_marker(address).await?;
                    Ok(ReconcileAction::Dropped)
                }
                Err(e) => Ok(unresolved(&e)),
            },
            MarkerOperation::Update | MarkerOperation::Delete => {
                let Some(id) = marker
                    .provider_id
                    .clone()
                    .or_else(|| stored.map(|s| s.provider_id.clone()))
                else {
                    self.store.clear_marker(address).await?;
                    return Ok(ReconcileAction::Dropped);
                };

                match provider.read(&ctx, &id).await {
                    Ok(Some(attributes)) => {
                        let mut state = stored.cloned().unwrap_or_else(|| {
                            ResourceState::new(address, &marker.resource_type, &id, attributes.clone())
                                .with_dependencies(marker.dependencies.clone())
                        });
                        state.attributes = attributes;
                        state.updated_at = chrono::Utc::now();
                        if marker.operation == MarkerOperation::Update {
                            // Forces the next diff to compare attributes
                            state.fingerprint.clear();
                        }
                        self.store.commit(address, Commit::Put(state)).await?;
                        Ok(ReconcileAction::Refreshed)
                    }
                    Ok(None) => {
                        self.store.commit(address, Commit::Tombstone).await?;
                        Ok(ReconcileAction::Tombstoned)
                    }
                    Err(e) => Ok(unresolved(&e)),
                }
            }
            MarkerOperation::DestroyDeposed => {
                let Some(id) = marker.provider_id.clone() else {
                    self.store.clear_marker(address).await?;
                    return Ok(ReconcileAction::Dropped);
                };

                match provider.read(&ctx, &id).await {
                    Ok(None) => match stored {
                        Some(state) if state.deposed.as_ref().is_some_and(|d| d.provider_id == id) => {
                            let mut state = state.clone();
                            state.deposed = None;
                            self.store.commit(address, Commit::Put(state)).await?;
                            Ok(ReconcileAction::DeposedCleared)
                        }
                        _ => {
                            self.store.clear_marker(address).await?;
                            Ok(ReconcileAction::DeposedCleared)
                        }
                    },
                    Ok(Some(_)) => {
                        self.store.clear_marker(address).await?;
                        Ok(ReconcileAction::DeposedKept)
                    }
                    Err(e) => Ok(unresolved(&e)),
                }
            }
        }
    }

    /// Reads every stored resource from its provider and reports differences
    /// on provider-independent attributes.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be read.
    pub async fn detect_drift(&self) -> Result<DriftReport> {
        let snapshot = self.store.load().await?;
        let mut report = DriftReport::default();

        for resource in snapshot.resources.values() {
            let status = match self.registry.get(&resource.resource_type) {
                Ok(provider) => Self::drift_of(resource, provider.as_ref()).await,
                Err(e) => DriftStatus::Unknown {
                    error: e.to_string(),
                },
            };
            if status != DriftStatus::InSync {
                warn!("{}: {status}", resource.address);
            }
            report.resources.push(ResourceDrift {
                address: resource.address.clone(),
                resource_type: resource.resource_type.clone(),
                provider_id: resource.provider_id.clone(),
                status,
            });
        }

        info!(
            "Drift check: {} of {} resources drifted",
            report.drifted().len(),
            report.resources.len()
        );
        Ok(report)
    }

    async fn drift_of(resource: &ResourceState, provider: &dyn Provider) -> DriftStatus {
        let ctx = OperationContext::new(&resource.address);
        let observed = match provider.read(&ctx, &resource.provider_id).await {
            Ok(Some(observed)) => observed,
            Ok(None) => return DriftStatus::Missing,
            Err(e) => {
                return DriftStatus::Unknown {
                    error: e.to_string(),
                };
            }
        };

        let schema = provider.schema();
        let attributes: Vec<AttributeDrift> = resource
            .attributes
            .iter()
            .filter(|(key, _)| !schema.is_computed(key))
            .filter(|(key, expected)| observed.get(*key) != Some(*expected))
            .map(|(key, expected)| AttributeDrift {
                attribute: key.clone(),
                expected: Some(expected.clone()),
                actual: observed.get(key).cloned(),
            })
            .collect();

        if attributes.is_empty() {
            DriftStatus::InSync
        } else {
            DriftStatus::Drifted { attributes }
        }
    }

    async fn load_reconciled(&self) -> Result<StateSnapshot> {
        let snapshot = self.store.load().await?;
        if snapshot.markers.is_empty() {
            Ok(snapshot)
        } else {
            Err(HalldyllError::State(StateError::ReconciliationRequired {
                resources: snapshot.marker_addresses(),
            }))
        }
    }
}

fn unresolved(error: &ProviderError) -> ReconcileAction {
    ReconcileAction::Unresolved {
        error: error.to_string(),
    }
}

impl std::fmt::Debug for Engine<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("backend", &self.store.backend_type())
            .field("registry", self.registry)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl ReconcileReport {
    /// Returns true if every marker was resolved.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self
            .resolutions
            .iter()
            .any(|r| matches!(r.action, ReconcileAction::Unresolved { .. }))
    }
}

impl DriftReport {
    /// Returns the resources that are not in sync.
    #[must_use]
    pub fn drifted(&self) -> Vec<&ResourceDrift> {
        self.resources
            .iter()
            .filter(|r| r.status != DriftStatus::InSync)
            .collect()
    }

    /// Returns true if any resource drifted.
    #[must_use]
    pub fn has_drift(&self) -> bool {
        !self.drifted().is_empty()
    }
}

impl std::fmt::Display for ReconcileAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Adopted { provider_id } => write!(f, "adopted {provider_id}"),
            Self::Dropped => write!(f, "dropped (no effect)"),
            Self::Refreshed => write!(f, "refreshed from provider"),
            Self::Tombstoned => write!(f, "removed from state"),
            Self::DeposedCleared => write!(f, "deposed object gone"),
            Self::DeposedKept => write!(f, "deposed object still exists"),
            Self::Unresolved { error } => write!(f, "unresolved: {error}"),
        }
    }
}

impl std::fmt::Display for DriftStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InSync => write!(f, "in sync"),
            Self::Missing => write!(f, "missing"),
            Self::Drifted { attributes } => {
                let names: Vec<&str> = attributes.iter().map(|a| a.attribute.as_str()).collect();
                write!(f, "drifted ({})", names.join(", "))
            }
            Self::Unknown { error } => write!(f, "unknown: {error}"),
        }
    }
}
