//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::ValidationResult;
use crate::engine::{DriftReport, DriftStatus, ReconcileAction, ReconcileReport};
use crate::graph::{EdgeKind, ResourceGraph};
use crate::planner::{ApplyReport, Plan, StepKind, StepOutcome};
use crate::state::{LockInfo, StateSnapshot};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan step row for table display.
#[derive(Tabled)]
struct PlanStepRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Apply step row for table display.
#[derive(Tabled)]
struct ApplyStepRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Result")]
    result: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
}

/// Stored resource row for table display.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Address")]
    address: String,
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns true when emitting JSON.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Formats an execution plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&serde_json::json!({
                "has_changes": plan.has_changes(),
                "summary": plan.summary(),
                "plan": plan,
            }))
            .unwrap_or_default(),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    fn format_plan_text(plan: &Plan, detailed: bool) -> String {
        if !plan.has_changes() {
            return format!(
                "{} No changes required - infrastructure is up to date.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let title = if plan.destroy { "Destroy Plan" } else { "Execution Plan" };
        let _ = write!(
            output,
            "\n{title}\n   State serial: {}\n\n",
            plan.state_serial
        );

        let rows: Vec<PlanStepRow> = plan
            .mutating_steps()
            .into_iter()
            .map(|step| PlanStepRow {
                index: step.index,
                action: Self::format_step_kind(step.kind),
                resource: step.address.clone(),
                reason: plan
                    .change(&step.address)
                    .filter(|_| !step.kind.is_destroy() || plan.destroy)
                    .map_or_else(String::new, |c| Self::truncate(&c.reason, 40)),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            for change in plan.changes.iter().filter(|c| !c.attributes.is_empty()) {
                let _ = writeln!(output, "\n  {} ({})", change.address.bold(), change.kind);
                for attr in &change.attributes {
                    let before = attr
                        .before
                        .as_ref()
                        .map_or_else(|| String::from("(none)"), ToString::to_string);
                    let marker = if attr.forces_replacement {
                        " # forces replacement".red().to_string()
                    } else {
                        String::new()
                    };
                    let _ = writeln!(
                        output,
                        "      {}: {before} -> {}{marker}",
                        attr.attribute, attr.after
                    );
                }
            }
        }

        let summary = plan.summary();
        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to destroy\n",
            summary.create.to_string().green(),
            summary.update.to_string().yellow(),
            summary.replace.to_string().yellow(),
            (summary.delete + summary.deposed).to_string().red()
        );

        output
    }

    /// Formats the outcome of an apply.
    #[must_use]
    pub fn format_apply(&self, report: &ApplyReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => {
                let status = if report.is_success() {
                    format!("{} Apply complete", "✓".green())
                } else if report.cancelled {
                    format!("{} Apply cancelled", "⚠".yellow())
                } else {
                    format!("{} Apply failed", "✗".red())
                };

                let rows: Vec<ApplyStepRow> = report
                    .steps
                    .iter()
                    .filter(|s| s.kind.is_mutating())
                    .map(|s| ApplyStepRow {
                        index: s.index,
                        action: Self::format_step_kind(s.kind),
                        resource: s.address.clone(),
                        result: Self::format_outcome(&s.outcome),
                        attempts: s.attempts,
                    })
                    .collect();

                let mut output = format!("{status}\n\n");
                if !rows.is_empty() {
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }
                let _ = write!(
                    output,
                    "\n{} completed, {} failed, {} not attempted\n",
                    report.completed(),
                    report.failed(),
                    report.not_attempted()
                );
                output
            }
        }
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => {
                if !report.has_drift() {
                    return format!(
                        "{} No drift detected - {} resources in sync.\n",
                        "✓".green(),
                        report.resources.len()
                    );
                }

                let mut output = format!("{} Drift detected:\n\n", "⚠".yellow());
                for resource in report.drifted() {
                    let _ = writeln!(output, "   - {}: {}", resource.address, resource.status);
                    if let DriftStatus::Drifted { attributes } = &resource.status {
                        for attr in attributes {
                            let show = |v: Option<&serde_json::Value>| {
                                v.map_or_else(|| String::from("(none)"), ToString::to_string)
                            };
                            let _ = writeln!(
                                output,
                                "       {}: expected {}, found {}",
                                attr.attribute,
                                show(attr.expected.as_ref()),
                                show(attr.actual.as_ref())
                            );
                        }
                    }
                }
                let _ = write!(
                    output,
                    "\n{}/{} resources have drifted.\n",
                    report.drifted().len(),
                    report.resources.len()
                );
                output
            }
        }
    }

    /// Formats a marker reconciliation report.
    #[must_use]
    pub fn format_reconcile(&self, report: &ReconcileReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => {
                if report.resolutions.is_empty() {
                    return format!("{} No stale markers - state is consistent.\n", "✓".green());
                }

                let status = if report.is_complete() {
                    format!("{} Reconciliation successful", "✓".green())
                } else {
                    format!("{} Reconciliation incomplete", "✗".red())
                };
                let mut output = format!("{status}\n\n");
                for resolution in &report.resolutions {
                    let action = match &resolution.action {
                        ReconcileAction::Unresolved { .. } => {
                            resolution.action.to_string().red().to_string()
                        }
                        other => other.to_string(),
                    };
                    let _ = writeln!(
                        output,
                        "   {} [{}] {action}",
                        resolution.address, resolution.operation
                    );
                }
                output
            }
        }
    }

    /// Formats the resource graph.
    #[must_use]
    pub fn format_graph(&self, graph: &ResourceGraph) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&serde_json::json!({
                "order": graph.topological_order(),
                "edges": graph.edges(),
            }))
            .unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = format!("\nResource Graph ({} resources)\n\n", graph.len());
                for (position, address) in graph.topological_order().iter().enumerate() {
                    let _ = writeln!(output, "  {:>3}. {address}", position + 1);
                }
                if !graph.edges().is_empty() {
                    output.push_str("\nEdges:\n");
                    for edge in graph.edges() {
                        let via = match &edge.kind {
                            EdgeKind::Reference { attribute } => format!("via {attribute}"),
                            EdgeKind::Explicit => String::from("depends_on"),
                        };
                        let _ = writeln!(output, "   {} -> {} ({via})", edge.from, edge.to);
                    }
                }
                output
            }
        }
    }

    /// Formats a validation result.
    #[must_use]
    pub fn format_validation(&self, result: &ValidationResult, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&serde_json::json!({
                "valid": result.is_valid(),
                "errors": result.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "warnings": result.warnings,
            }))
            .unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = if result.is_valid() {
                    format!("{} Configuration is valid!\n", "✓".green())
                } else {
                    format!(
                        "{} Configuration has {} error(s):\n",
                        "✗".red(),
                        result.error_count()
                    )
                };
                for error in &result.errors {
                    let _ = writeln!(output, "   - {error}");
                }
                if show_warnings && !result.warnings.is_empty() {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }
                output
            }
        }
    }

    /// Formats the state snapshot.
    #[must_use]
    pub fn format_state(&self, state: &StateSnapshot) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(state).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::from("\nState\n\n");
                let lineage = if state.lineage.is_empty() { "-" } else { &state.lineage };

                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Serial: {}", state.serial);
                let _ = writeln!(output, "   Lineage: {lineage}");
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Resources: {}", state.resources.len());

                if !state.resources.is_empty() {
                    let rows: Vec<ResourceRow> = state
                        .resources
                        .values()
                        .map(|r| ResourceRow {
                            address: r.address.clone(),
                            resource_type: r.resource_type.clone(),
                            id: r.deposed.as_ref().map_or_else(
                                || r.provider_id.clone(),
                                |d| format!("{} (deposed {})", r.provider_id, d.provider_id),
                            ),
                            updated: r.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                        })
                        .collect();
                    output.push('\n');
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                if !state.markers.is_empty() {
                    let _ = write!(
                        output,
                        "\n{} Stale markers ({}), run `reconcile`:\n",
                        "⚠".yellow(),
                        state.markers.len()
                    );
                    for marker in state.markers.values() {
                        let _ = writeln!(
                            output,
                            "     {} [{}] since {}",
                            marker.resource,
                            marker.operation,
                            marker.started_at.format("%Y-%m-%d %H:%M:%S")
                        );
                    }
                }

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓" } else { "✗" };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} ({})",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.resources.join(", ")
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats the addresses recorded in state.
    #[must_use]
    pub fn format_state_list(&self, state: &StateSnapshot) -> String {
        match self.format {
            OutputFormat::Json => {
                serde_json::to_string_pretty(&state.addresses()).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = String::new();
                for address in state.addresses() {
                    let _ = writeln!(output, "{address}");
                }
                output
            }
        }
    }

    /// Formats lock information.
    #[must_use]
    pub fn format_lock(&self, lock: &LockInfo) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(lock).unwrap_or_default(),
            OutputFormat::Text => format!(
                "State locked: {} (holder {}, expires in {}s)\n",
                lock.lock_id,
                lock.holder,
                lock.remaining_secs()
            ),
        }
    }

    /// Formats a step kind with color.
    fn format_step_kind(kind: StepKind) -> String {
        match kind {
            StepKind::Create => "+create".green().to_string(),
            StepKind::Update => "~update".yellow().to_string(),
            StepKind::Delete => "-delete".red().to_string(),
            StepKind::CreateReplacement => "+create (replace)".green().to_string(),
            StepKind::DestroyForReplace => "-destroy (replace)".red().to_string(),
            StepKind::DestroyDeposed => "-destroy (deposed)".red().to_string(),
            StepKind::NoOp => "noop".dimmed().to_string(),
        }
    }

    fn format_outcome(outcome: &StepOutcome) -> String {
        match outcome {
            StepOutcome::Completed => "done".green().to_string(),
            StepOutcome::Failed { error } => format!("{} {}", "failed:".red(), Self::truncate(error, 50)),
            StepOutcome::NotAttempted { reason } => format!("skipped ({reason})").dimmed().to_string(),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{head}...")
        }
    }
}
