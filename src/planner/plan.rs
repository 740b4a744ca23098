//! Execution plan types.
//!
//! A plan is the immutable output of planning: the per-resource changes and
//! the ordered steps that realize them, stamped with the state serial and
//! lineage it was computed against.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::diff::{ChangeKind, ResourceChange};

/// A complete execution plan.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// State serial the plan was computed against.
    pub state_serial: u64,
    /// State lineage the plan was computed against.
    pub state_lineage: String,
    /// Whether this plan destroys everything.
    pub destroy: bool,
    /// Per-resource changes.
    pub changes: Vec<ResourceChange>,
    /// Steps in execution order.
    pub steps: Vec<PlanStep>,
}

/// A single step of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanStep {
    /// Position in the plan.
    pub index: usize,
    /// Resource address.
    pub address: String,
    /// Resource type tag.
    pub resource_type: String,
    /// What the step does.
    pub kind: StepKind,
    /// Provider identifier targeted by destroy steps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    /// Indices of steps that must complete first.
    pub depends_on: Vec<usize>,
}

/// Types of steps in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Create a new resource.
    Create,
    /// Update a resource in place.
    Update,
    /// Delete a resource no longer desired.
    Delete,
    /// Nothing to do; kept for ordering.
    NoOp,
    /// Create the new instance of a replaced resource.
    CreateReplacement,
    /// Destroy the old instance before creating its replacement.
    DestroyForReplace,
    /// Destroy an old instance left behind by create-before-destroy.
    DestroyDeposed,
}

/// Counts of planned changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    /// Resources to create.
    pub create: usize,
    /// Resources to update in place.
    pub update: usize,
    /// Resources to replace.
    pub replace: usize,
    /// Resources to delete.
    pub delete: usize,
    /// Unchanged resources.
    pub unchanged: usize,
    /// Deposed instances to destroy.
    pub deposed: usize,
}

impl StepKind {
    /// Returns true for steps that call a provider.
    #[must_use]
    pub const fn is_mutating(self) -> bool {
        !matches!(self, Self::NoOp)
    }

    /// Returns true for steps that destroy a remote object.
    #[must_use]
    pub const fn is_destroy(self) -> bool {
        matches!(
            self,
            Self::Delete | Self::DestroyForReplace | Self::DestroyDeposed
        )
    }
}

impl Plan {
    /// Returns true if the plan would change anything.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.steps.iter().any(|s| s.kind.is_mutating())
    }

    /// Gets the change for an address.
    #[must_use]
    pub fn change(&self, address: &str) -> Option<&ResourceChange> {
        self.changes.iter().find(|c| c.address == address)
    }

    /// Returns the steps that call a provider.
    #[must_use]
    pub fn mutating_steps(&self) -> Vec<&PlanStep> {
        self.steps.iter().filter(|s| s.kind.is_mutating()).collect()
    }

    /// Returns the step count per change type.
    #[must_use]
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for change in &self.changes {
            match change.kind {
                ChangeKind::Create => summary.create += 1,
                ChangeKind::Update => summary.update += 1,
                ChangeKind::Replace => summary.replace += 1,
                ChangeKind::Delete => summary.delete += 1,
                ChangeKind::NoOp => summary.unchanged += 1,
            }
            if change.deposed.is_some() {
                summary.deposed += 1;
            }
        }
        summary
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::NoOp => "NOOP",
            Self::CreateReplacement => "CREATE (replacement)",
            Self::DestroyForReplace => "DESTROY (before replacement)",
            Self::DestroyDeposed => "DESTROY (deposed)",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for PlanStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind, self.address)?;
        if let Some(id) = &self.provider_id {
            write!(f, " ({id})")?;
        }
        Ok(())
    }
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to replace, {} to delete",
            self.create, self.update, self.replace, self.delete
        )?;
        if self.deposed > 0 {
            write!(f, ", {} deposed to destroy", self.deposed)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Plan (state serial {}):", self.state_serial)?;

        let steps = self.mutating_steps();
        if steps.is_empty() {
            writeln!(f, "  No changes required")?;
        } else {
            for step in steps {
                write!(f, "  [{}] {step}", step.index)?;
                if let Some(change) = self.change(&step.address)
                    && !step.kind.is_destroy()
                {
                    write!(f, " - {}", change.reason)?;
                }
                writeln!(f)?;
            }
        }

        writeln!(f)?;
        writeln!(f, "Summary: {}", self.summary())
    }
}
