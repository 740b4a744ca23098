//! Diff engine for comparing desired vs stored state.
//!
//! This module resolves every desired resource against the last-applied
//! state and classifies it as a create, update, replacement, deletion, or
//! no-op. Planning is pure: no provider is called.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::error::{HalldyllError, ProviderError, Result};
use crate::graph::{Reference, Resolved, ResourceGraph, ResourceSpec};
use crate::provider::{Attributes, ProviderRegistry, ReplacePolicy};
use crate::state::{ResourceState, StateSnapshot};

/// Engine for computing diffs between desired and stored states.
#[derive(Debug, Clone, Copy)]
pub struct DiffEngine<'a> {
    /// Source of resource schemas.
    registry: &'a ProviderRegistry,
}

/// Type of change detected for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Resource needs to be created.
    Create,
    /// Mutable attributes change in place.
    Update,
    /// An immutable attribute changes; the resource is recreated.
    Replace,
    /// Resource is no longer desired.
    Delete,
    /// Resource is unchanged.
    NoOp,
}

/// Value an attribute will have after apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum PlannedValue {
    /// Known at plan time.
    Known(Value),
    /// Depends on a resource not yet created.
    Unknown,
}

/// Difference on a single attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttributeChange {
    /// Attribute name.
    pub attribute: String,
    /// Stored value, if any.
    pub before: Option<Value>,
    /// Planned value.
    pub after: PlannedValue,
    /// Whether this change forces replacement.
    pub forces_replacement: bool,
}

/// Planned change for a single resource.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceChange {
    /// Resource address.
    pub address: String,
    /// Resource type tag.
    pub resource_type: String,
    /// Type of change.
    pub kind: ChangeKind,
    /// Replacement policy, for replacements only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<ReplacePolicy>,
    /// Attribute-level differences.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<AttributeChange>,
    /// Current provider identifier, if the resource exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    /// Addresses this resource depends on: graph edges for desired
    /// resources, recorded dependencies for deletions.
    pub dependencies: Vec<String>,
    /// Provider identifier of a leftover deposed instance to destroy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deposed: Option<String>,
    /// Human-readable reason.
    pub reason: String,
    /// Desired declaration; absent for deletions.
    #[serde(skip)]
    pub spec: Option<ResourceSpec>,
}

/// Complete diff result.
#[derive(Debug, Clone, Default)]
pub struct DiffResult {
    /// Changes: desired resources in topological order, then deletions.
    pub changes: Vec<ResourceChange>,
    /// Number of resources to create.
    pub creates: usize,
    /// Number of resources to update in place.
    pub updates: usize,
    /// Number of resources to replace.
    pub replaces: usize,
    /// Number of resources to delete.
    pub deletes: usize,
    /// Number of unchanged resources.
    pub unchanged: usize,
}

/// How references to an already-diffed resource resolve.
enum PlannedView {
    /// Created or replaced: nothing is known yet.
    Pending,
    /// Kept: stored attributes overlaid with known desired values.
    Kept {
        provider_id: String,
        attributes: Attributes,
        unknown: BTreeSet<String>,
    },
}

impl<'a> DiffEngine<'a> {
    /// Creates a diff engine reading schemas from `registry`.
    #[must_use]
    pub const fn new(registry: &'a ProviderRegistry) -> Self {
        Self { registry }
    }

    /// Computes the changes needed to move `state` to `graph`.
    ///
    /// # Errors
    ///
    /// Returns `NotRegistered` if a desired resource type has no provider.
    pub fn compute(&self, graph: &ResourceGraph, state: &StateSnapshot) -> Result<DiffResult> {
        let mut views: BTreeMap<String, PlannedView> = BTreeMap::new();
        let mut changes = Vec::with_capacity(graph.len());

        for spec in graph.iter() {
            let schema = self.registry.schema(&spec.resource_type).ok_or_else(|| {
                HalldyllError::Provider(ProviderError::NotRegistered {
                    resource_type: spec.resource_type.clone(),
                })
            })?;

            let resolved: BTreeMap<&str, Resolved> = spec
                .attributes
                .iter()
                .map(|(key, expr)| {
                    (key.as_str(), expr.resolve(&|r: &Reference| resolve_planned(&views, r)))
                })
                .collect();

            let stored = state.get(&spec.address);
            let dependencies: Vec<String> = graph
                .dependencies_of(&spec.address)
                .map(ToString::to_string)
                .collect();

            let change = match stored {
                None => {
                    views.insert(spec.address.clone(), PlannedView::Pending);
                    ResourceChange {
                        address: spec.address.clone(),
                        resource_type: spec.resource_type.clone(),
                        kind: ChangeKind::Create,
                        policy: None,
                        attributes: resolved
                            .iter()
                            .map(|(key, value)| AttributeChange {
                                attribute: (*key).to_string(),
                                before: None,
                                after: planned(value),
                                forces_replacement: false,
                            })
                            .collect(),
                        provider_id: None,
                        dependencies,
                        deposed: None,
                        reason: String::from("not in state"),
                        spec: Some(spec.clone()),
                    }
                }
                Some(stored) => {
                    let attributes: Vec<AttributeChange> = resolved
                        .iter()
                        .filter_map(|(key, value)| {
                            let before = stored.attributes.get(*key);
                            let differs = match value {
                                Resolved::Known(v) => before != Some(v),
                                Resolved::Unknown => true,
                            };
                            differs.then(|| AttributeChange {
                                attribute: (*key).to_string(),
                                before: before.cloned(),
                                after: planned(value),
                                forces_replacement: schema.is_immutable(key),
                            })
                        })
                        .collect();

                    let kind = if attributes.is_empty() {
                        ChangeKind::NoOp
                    } else if attributes.iter().any(|a| a.forces_replacement) {
                        ChangeKind::Replace
                    } else {
                        ChangeKind::Update
                    };

                    let policy = (kind == ChangeKind::Replace).then(|| {
                        spec.create_before_destroy.map_or(schema.replace_policy, |cbd| {
                            if cbd {
                                ReplacePolicy::CreateBeforeDestroy
                            } else {
                                ReplacePolicy::DestroyBeforeCreate
                            }
                        })
                    });

                    views.insert(spec.address.clone(), kept_view(kind, stored, &resolved));

                    ResourceChange {
                        address: spec.address.clone(),
                        resource_type: spec.resource_type.clone(),
                        reason: change_reason(kind, stored, spec, &attributes),
                        kind,
                        policy,
                        attributes,
                        provider_id: Some(stored.provider_id.clone()),
                        dependencies,
                        deposed: stored.deposed.as_ref().map(|d| d.provider_id.clone()),
                        spec: Some(spec.clone()),
                    }
                }
            };

            debug!("{}: {}", change.address, change.kind);
            changes.push(change);
        }

        propagate_create_before_destroy(&mut changes, graph);

        for stored in state.resources.values() {
            if !graph.contains(&stored.address) {
                changes.push(delete_change(stored, "removed from configuration"));
            }
        }

        Ok(DiffResult::from_changes(changes))
    }

    /// Computes a diff deleting every stored resource.
    #[must_use]
    pub fn compute_destroy(&self, state: &StateSnapshot) -> DiffResult {
        let changes = state
            .resources
            .values()
            .map(|stored| delete_change(stored, "destroy requested"))
            .collect();
        DiffResult::from_changes(changes)
    }
}

/// Resolves a reference against resources diffed so far.
fn resolve_planned(views: &BTreeMap<String, PlannedView>, reference: &Reference) -> Resolved {
    match views.get(&reference.resource) {
        Some(PlannedView::Kept {
            provider_id,
            attributes,
            unknown,
        }) => {
            if unknown.contains(reference.root_attribute()) {
                return Resolved::Unknown;
            }
            reference
                .lookup(Some(provider_id), attributes)
                .map_or(Resolved::Unknown, Resolved::Known)
        }
        Some(PlannedView::Pending) | None => Resolved::Unknown,
    }
}

fn planned(value: &Resolved) -> PlannedValue {
    match value {
        Resolved::Known(v) => PlannedValue::Known(v.clone()),
        Resolved::Unknown => PlannedValue::Unknown,
    }
}

fn kept_view(kind: ChangeKind, stored: &ResourceState, resolved: &BTreeMap<&str, Resolved>) -> PlannedView {
    if kind == ChangeKind::Replace {
        return PlannedView::Pending;
    }

    let mut attributes = stored.attributes.clone();
    let mut unknown = BTreeSet::new();
    for (key, value) in resolved {
        match value {
            Resolved::Known(v) => {
                attributes.insert((*key).to_string(), v.clone());
            }
            Resolved::Unknown => {
                unknown.insert((*key).to_string());
            }
        }
    }

    PlannedView::Kept {
        provider_id: stored.provider_id.clone(),
        attributes,
        unknown,
    }
}

fn change_reason(
    kind: ChangeKind,
    stored: &ResourceState,
    spec: &ResourceSpec,
    attributes: &[AttributeChange],
) -> String {
    let names = || {
        attributes
            .iter()
            .map(|a| a.attribute.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };

    match kind {
        ChangeKind::NoOp => String::from("up to date"),
        ChangeKind::Replace => {
            let forcing: Vec<&str> = attributes
                .iter()
                .filter(|a| a.forces_replacement)
                .map(|a| a.attribute.as_str())
                .collect();
            format!("immutable attributes changed: {}", forcing.join(", "))
        }
        _ if stored.fingerprint == spec.fingerprint => {
            format!("attributes differ from state: {}", names())
        }
        _ => format!("declaration changed: {}", names()),
    }
}

fn delete_change(stored: &ResourceState, reason: &str) -> ResourceChange {
    ResourceChange {
        address: stored.address.clone(),
        resource_type: stored.resource_type.clone(),
        kind: ChangeKind::Delete,
        policy: None,
        attributes: Vec::new(),
        provider_id: Some(stored.provider_id.clone()),
        dependencies: stored.dependencies.clone(),
        deposed: stored.deposed.as_ref().map(|d| d.provider_id.clone()),
        reason: reason.to_string(),
        spec: None,
    }
}

/// A replaced dependent that is created before destroying forces the same
/// policy on every replaced dependency.
fn propagate_create_before_destroy(changes: &mut [ResourceChange], graph: &ResourceGraph) {
    let index: BTreeMap<String, usize> = changes
        .iter()
        .enumerate()
        .map(|(i, c)| (c.address.clone(), i))
        .collect();

    for i in (0..changes.len()).rev() {
        if changes[i].policy != Some(ReplacePolicy::CreateBeforeDestroy) {
            continue;
        }
        for dependency in graph.dependencies_of(&changes[i].address) {
            if let Some(&j) = index.get(dependency)
                && changes[j].kind == ChangeKind::Replace
                && changes[j].policy != Some(ReplacePolicy::CreateBeforeDestroy)
            {
                debug!(
                    "{} inherits create-before-destroy from {}",
                    changes[j].address, changes[i].address
                );
                changes[j].policy = Some(ReplacePolicy::CreateBeforeDestroy);
            }
        }
    }
}

impl DiffResult {
    /// Builds a result and its counters.
    #[must_use]
    pub fn from_changes(changes: Vec<ResourceChange>) -> Self {
        let count = |kind: ChangeKind| changes.iter().filter(|c| c.kind == kind).count();
        Self {
            creates: count(ChangeKind::Create),
            updates: count(ChangeKind::Update),
            replaces: count(ChangeKind::Replace),
            deletes: count(ChangeKind::Delete),
            unchanged: count(ChangeKind::NoOp),
            changes,
        }
    }

    /// Returns true if applying would change anything.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.total_changes() > 0 || self.changes.iter().any(|c| c.deposed.is_some())
    }

    /// Returns the number of changed resources.
    #[must_use]
    pub const fn total_changes(&self) -> usize {
        self.creates + self.updates + self.replaces + self.deletes
    }

    /// Gets the change for an address.
    #[must_use]
    pub fn get(&self, address: &str) -> Option<&ResourceChange> {
        self.changes.iter().find(|c| c.address == address)
    }

    /// Filters to changes that require action.
    #[must_use]
    pub fn actionable(&self) -> Vec<&ResourceChange> {
        self.changes
            .iter()
            .filter(|c| c.kind != ChangeKind::NoOp || c.deposed.is_some())
            .collect()
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::NoOp => "no change",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for PlannedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Known(value) => write!(f, "{value}"),
            Self::Unknown => write!(f, "(known after apply)"),
        }
    }
}

impl std::fmt::Display for ResourceChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.address, self.kind)?;
        if let Some(policy) = self.policy {
            write!(f, " [{policy}]")?;
        }
        if !self.attributes.is_empty() {
            write!(f, " (")?;
            for (i, change) in self.attributes.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", change.attribute)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}
