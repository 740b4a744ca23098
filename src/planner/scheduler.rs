//! Plan scheduling.
//!
//! Expands resource changes into steps, orders them with Kahn's algorithm,
//! and tracks step readiness while a plan is applied.

use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::debug;

use crate::error::{HalldyllError, PlanError, Result};
use crate::provider::ReplacePolicy;
use crate::state::StateSnapshot;

use super::diff::{ChangeKind, DiffResult};
use super::plan::{Plan, PlanStep, StepKind};

/// Turns a diff into an ordered plan.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlanScheduler;

/// A step before ordering.
#[derive(Debug)]
struct Draft {
    address: String,
    resource_type: String,
    kind: StepKind,
    provider_id: Option<String>,
    depends_on: BTreeSet<usize>,
}

/// Step indices per resource, by role.
#[derive(Debug, Default)]
struct Nodes {
    /// Create, update, no-op, or replacement create.
    apply: BTreeMap<String, usize>,
    /// Delete, destroy-for-replace, or replacement destroy-deposed.
    destroy: BTreeMap<String, Vec<usize>>,
    /// Destroy-deposed of a create-before-destroy replacement.
    replacement_deposed: BTreeMap<String, usize>,
    /// Delete of a resource no longer desired.
    delete: BTreeMap<String, usize>,
}

impl PlanScheduler {
    /// Creates a scheduler.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Builds a plan from a diff computed against `state`.
    ///
    /// # Errors
    ///
    /// Returns `ScheduleDeadlock` if the ordering constraints form a cycle.
    pub fn schedule(&self, diff: DiffResult, state: &StateSnapshot, destroy: bool) -> Result<Plan> {
        let mut drafts: Vec<Draft> = Vec::new();
        let mut nodes = Nodes::default();

        for change in &diff.changes {
            let start = drafts.len();
            let mut push = |kind: StepKind, provider_id: Option<String>| {
                drafts.push(Draft {
                    address: change.address.clone(),
                    resource_type: change.resource_type.clone(),
                    kind,
                    provider_id,
                    depends_on: BTreeSet::new(),
                });
                drafts.len() - 1
            };

            let leftover = change
                .deposed
                .clone()
                .map(|id| push(StepKind::DestroyDeposed, Some(id)));
            let first = start + usize::from(leftover.is_some());

            match change.kind {
                ChangeKind::Create | ChangeKind::Update | ChangeKind::NoOp => {
                    let kind = match change.kind {
                        ChangeKind::Create => StepKind::Create,
                        ChangeKind::Update => StepKind::Update,
                        _ => StepKind::NoOp,
                    };
                    let i = push(kind, None);
                    nodes.apply.insert(change.address.clone(), i);
                }
                ChangeKind::Replace => match change.policy.unwrap_or_default() {
                    ReplacePolicy::CreateBeforeDestroy => {
                        let create = push(StepKind::CreateReplacement, None);
                        let old = push(StepKind::DestroyDeposed, change.provider_id.clone());
                        drafts[old].depends_on.insert(create);
                        nodes.apply.insert(change.address.clone(), create);
                        nodes.replacement_deposed.insert(change.address.clone(), old);
                        nodes.destroy.entry(change.address.clone()).or_default().push(old);
                    }
                    ReplacePolicy::DestroyBeforeCreate => {
                        let old = push(StepKind::DestroyForReplace, change.provider_id.clone());
                        let create = push(StepKind::CreateReplacement, None);
                        drafts[create].depends_on.insert(old);
                        nodes.apply.insert(change.address.clone(), create);
                        nodes.destroy.entry(change.address.clone()).or_default().push(old);
                    }
                },
                ChangeKind::Delete => {
                    let i = push(StepKind::Delete, change.provider_id.clone());
                    nodes.destroy.entry(change.address.clone()).or_default().push(i);
                    nodes.delete.insert(change.address.clone(), i);
                }
            }

            if let Some(leftover) = leftover {
                for draft in &mut drafts[first..] {
                    draft.depends_on.insert(leftover);
                }
            }
        }

        Self::add_apply_edges(&mut drafts, &nodes, &diff);
        Self::add_destroy_edges(&mut drafts, &nodes, state);

        let steps = order(drafts)?;
        debug!("Scheduled {} steps", steps.len());

        Ok(Plan {
            created_at: Utc::now(),
            state_serial: state.serial,
            state_lineage: state.lineage.clone(),
            destroy,
            changes: diff.changes,
            steps,
        })
    }

    /// Orders applies along graph edges and holds back deposed destroys
    /// until every dependent is re-pointed.
    fn add_apply_edges(drafts: &mut [Draft], nodes: &Nodes, diff: &DiffResult) {
        for change in diff.changes.iter().filter(|c| c.spec.is_some()) {
            let Some(&dependent) = nodes.apply.get(&change.address) else {
                continue;
            };
            for dependency in &change.dependencies {
                if let Some(&upstream) = nodes.apply.get(dependency) {
                    drafts[dependent].depends_on.insert(upstream);
                }
                if let Some(&old) = nodes.replacement_deposed.get(dependency) {
                    drafts[old].depends_on.insert(dependent);
                }
            }
        }
    }

    /// Destroys dependents before their dependencies using the recorded
    /// dependencies, and deletes a removed resource only after the kept
    /// resources that used it are applied.
    fn add_destroy_edges(drafts: &mut [Draft], nodes: &Nodes, state: &StateSnapshot) {
        for stored in state.resources.values() {
            for dependency in &stored.dependencies {
                if let (Some(upstream), Some(downstream)) = (
                    nodes.destroy.get(dependency),
                    nodes.destroy.get(&stored.address),
                ) {
                    for &u in upstream {
                        drafts[u].depends_on.extend(downstream.iter().copied());
                    }
                }

                if let (Some(&delete), Some(&kept)) = (
                    nodes.delete.get(dependency),
                    nodes.apply.get(&stored.address),
                ) {
                    drafts[delete].depends_on.insert(kept);
                }
            }
        }
    }
}

/// Kahn's algorithm; ties go to the step drafted first.
fn order(drafts: Vec<Draft>) -> Result<Vec<PlanStep>> {
    let mut waiting: Vec<usize> = drafts.iter().map(|d| d.depends_on.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); drafts.len()];
    for (i, draft) in drafts.iter().enumerate() {
        for &dep in &draft.depends_on {
            dependents[dep].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..drafts.len()).filter(|&i| waiting[i] == 0).collect();
    let mut sequence = Vec::with_capacity(drafts.len());

    while let Some(next) = ready.pop_first() {
        sequence.push(next);
        for &dependent in &dependents[next] {
            waiting[dependent] -= 1;
            if waiting[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if sequence.len() < drafts.len() {
        let placed: BTreeSet<usize> = sequence.iter().copied().collect();
        let steps = drafts
            .iter()
            .enumerate()
            .filter(|(i, _)| !placed.contains(i))
            .map(|(_, d)| format!("{} {}", d.kind, d.address))
            .collect();
        return Err(HalldyllError::Plan(PlanError::ScheduleDeadlock { steps }));
    }

    let mut position = vec![0; drafts.len()];
    for (new, &old) in sequence.iter().enumerate() {
        position[old] = new;
    }

    let mut slots: Vec<Option<Draft>> = drafts.into_iter().map(Some).collect();
    let steps = sequence
        .iter()
        .enumerate()
        .filter_map(|(index, &old)| {
            slots[old].take().map(|draft| {
                let mut depends_on: Vec<usize> =
                    draft.depends_on.iter().map(|&d| position[d]).collect();
                depends_on.sort_unstable();
                PlanStep {
                    index,
                    address: draft.address,
                    resource_type: draft.resource_type,
                    kind: draft.kind,
                    provider_id: draft.provider_id,
                    depends_on,
                }
            })
        })
        .collect();

    Ok(steps)
}

/// Run-time status of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// Waiting for dependencies or a free slot.
    Pending,
    /// Handed out by [`Schedule::pop_ready`].
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Will never run because a dependency failed.
    Blocked,
}

/// Tracks which steps of a plan may run.
#[derive(Debug)]
pub struct Schedule {
    status: Vec<StepStatus>,
    waiting: Vec<usize>,
    dependents: Vec<Vec<usize>>,
    ready: BTreeSet<usize>,
    running: usize,
}

impl Schedule {
    /// Creates a schedule for plan steps indexed by position.
    #[must_use]
    pub fn new(steps: &[PlanStep]) -> Self {
        let mut waiting = vec![0; steps.len()];
        let mut dependents = vec![Vec::new(); steps.len()];
        for (i, step) in steps.iter().enumerate() {
            for &dep in step.depends_on.iter().filter(|&&d| d < steps.len()) {
                waiting[i] += 1;
                dependents[dep].push(i);
            }
        }
        let ready = (0..steps.len()).filter(|&i| waiting[i] == 0).collect();

        Self {
            status: vec![StepStatus::Pending; steps.len()],
            waiting,
            dependents,
            ready,
            running: 0,
        }
    }

    /// Takes the lowest-indexed ready step and marks it running.
    pub fn pop_ready(&mut self) -> Option<usize> {
        let next = self.ready.pop_first()?;
        self.status[next] = StepStatus::Running;
        self.running += 1;
        Some(next)
    }

    /// Marks a running step completed, releasing its dependents.
    pub fn complete(&mut self, index: usize) {
        self.finish(index, StepStatus::Completed);
        for &dependent in &self.dependents[index] {
            self.waiting[dependent] -= 1;
            if self.waiting[dependent] == 0 && self.status[dependent] == StepStatus::Pending {
                self.ready.insert(dependent);
            }
        }
    }

    /// Marks a running step failed and blocks its transitive dependents.
    ///
    /// Returns the newly blocked steps.
    pub fn fail(&mut self, index: usize) -> Vec<usize> {
        self.finish(index, StepStatus::Failed);

        let mut blocked = Vec::new();
        let mut queue: VecDeque<usize> = self.dependents[index].iter().copied().collect();
        while let Some(next) = queue.pop_front() {
            if self.status[next] != StepStatus::Pending {
                continue;
            }
            self.status[next] = StepStatus::Blocked;
            self.ready.remove(&next);
            blocked.push(next);
            queue.extend(self.dependents[next].iter().copied());
        }
        blocked.sort_unstable();
        blocked
    }

    /// Returns the status of a step.
    #[must_use]
    pub fn status(&self, index: usize) -> StepStatus {
        self.status[index]
    }

    /// Returns true when nothing is running and nothing can start.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.running == 0 && self.ready.is_empty()
    }

    /// Returns the steps never started and not blocked.
    #[must_use]
    pub fn pending(&self) -> Vec<usize> {
        self.status
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == StepStatus::Pending)
            .map(|(i, _)| i)
            .collect()
    }

    fn finish(&mut self, index: usize, status: StepStatus) {
        if self.status[index] == StepStatus::Running {
            self.running -= 1;
        }
        self.status[index] = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LifecycleConfig, ResourceConfig};
    use crate::graph::GraphBuilder;
    use crate::planner::DiffEngine;
    use crate::provider::{Attributes, MemoryProvider, ProviderRegistry, ResourceSchema};
    use crate::state::{DeposedObject, ResourceState};
    use serde_json::{Value, json};
    use std::sync::Arc;

    fn resource(ty: &str, name: &str, attributes: Value) -> ResourceConfig {
        ResourceConfig {
            resource_type: ty.to_string(),
            name: name.to_string(),
            attributes: serde_json::from_value(attributes).unwrap(),
            depends_on: Vec::new(),
            lifecycle: LifecycleConfig::default(),
        }
    }

    fn registry() -> ProviderRegistry {
        ProviderRegistry::new()
            .with(Arc::new(MemoryProvider::new(
                ResourceSchema::new("aws_vpc").with_immutable(["cidr_block"]),
            )))
            .with(Arc::new(MemoryProvider::new(ResourceSchema::new("aws_subnet"))))
    }

    fn subnet(name: &str) -> ResourceConfig {
        resource(
            "aws_subnet",
            name,
            json!({"vpc_id": "${aws_vpc.main.id}", "cidr_block": "10.0.1.0/24"}),
        )
    }

    fn stored(address: &str, ty: &str, id: &str, attributes: Value, deps: &[&str]) -> ResourceState {
        let attributes: Attributes = serde_json::from_value(attributes).unwrap();
        ResourceState::new(address, ty, id, attributes)
            .with_dependencies(deps.iter().map(ToString::to_string).collect())
    }

    fn applied_state() -> StateSnapshot {
        let mut state = StateSnapshot::new();
        for r in [
            stored("aws_vpc.main", "aws_vpc", "vpc-1", json!({"cidr_block": "10.0.0.0/16"}), &[]),
            stored(
                "aws_subnet.a",
                "aws_subnet",
                "subnet-1",
                json!({"vpc_id": "vpc-1", "cidr_block": "10.0.1.0/24"}),
                &["aws_vpc.main"],
            ),
        ] {
            state.resources.insert(r.address.clone(), r);
        }
        state.serial = 7;
        state.lineage = String::from("lineage-1");
        state
    }

    fn plan(configs: &[ResourceConfig], state: &StateSnapshot) -> Plan {
        let registry = registry();
        let graph = GraphBuilder::with_registry(&registry)
            .build_from_config(configs)
            .expect("graph should build");
        let diff = DiffEngine::new(&registry)
            .compute(&graph, state)
            .expect("diff should succeed");
        PlanScheduler::new()
            .schedule(diff, state, false)
            .expect("schedule should succeed")
    }

    fn position(plan: &Plan, kind: StepKind, address: &str) -> usize {
        plan.steps
            .iter()
            .position(|s| s.kind == kind && s.address == address)
            .unwrap_or_else(|| panic!("no {kind} step for {address}"))
    }

    fn waits_on(plan: &Plan, step: usize, dependency: usize) -> bool {
        plan.steps[step].depends_on.contains(&dependency)
    }

    #[test]
    fn test_subnet_after_vpc() {
        let configs = vec![
            resource("aws_vpc", "main", json!({"cidr_block": "10.0.0.0/16"})),
            subnet("a"),
        ];
        let plan = plan(&configs, &StateSnapshot::new());

        let vpc = position(&plan, StepKind::Create, "aws_vpc.main");
        let subnet = position(&plan, StepKind::Create, "aws_subnet.a");
        assert!(vpc < subnet);
        assert!(waits_on(&plan, subnet, vpc));
        assert!(plan.has_changes());
        assert_eq!(plan.summary().create, 2);
    }

    #[test]
    fn test_plan_is_stamped_with_state_serial() {
        let state = applied_state();
        let configs = vec![
            resource("aws_vpc", "main", json!({"cidr_block": "10.0.0.0/16"})),
            subnet("a"),
        ];
        let plan = plan(&configs, &state);

        assert_eq!(plan.state_serial, 7);
        assert_eq!(plan.state_lineage, "lineage-1");
        assert!(!plan.has_changes());
        assert!(plan.steps.iter().all(|s| s.kind == StepKind::NoOp));
    }

    #[test]
    fn test_destroy_before_create_replacement_order() {
        let configs = vec![
            resource("aws_vpc", "main", json!({"cidr_block": "10.1.0.0/16"})),
            subnet("a"),
        ];
        let plan = plan(&configs, &applied_state());

        let destroy = position(&plan, StepKind::DestroyForReplace, "aws_vpc.main");
        let create = position(&plan, StepKind::CreateReplacement, "aws_vpc.main");
        let update = position(&plan, StepKind::Update, "aws_subnet.a");

        assert_eq!(plan.steps[destroy].provider_id.as_deref(), Some("vpc-1"));
        assert!(waits_on(&plan, create, destroy));
        assert!(waits_on(&plan, update, create));
    }

    #[test]
    fn test_create_before_destroy_replacement_order() {
        let mut vpc = resource("aws_vpc", "main", json!({"cidr_block": "10.1.0.0/16"}));
        vpc.lifecycle.create_before_destroy = Some(true);
        let plan = plan(&[vpc, subnet("a")], &applied_state());

        let create = position(&plan, StepKind::CreateReplacement, "aws_vpc.main");
        let deposed = position(&plan, StepKind::DestroyDeposed, "aws_vpc.main");
        let update = position(&plan, StepKind::Update, "aws_subnet.a");

        assert!(create < update && update < deposed);
        assert!(waits_on(&plan, deposed, create));
        assert!(waits_on(&plan, deposed, update));
        assert_eq!(plan.steps[deposed].provider_id.as_deref(), Some("vpc-1"));
    }

    #[test]
    fn test_deletes_run_dependents_first() {
        let plan = {
            let state = applied_state();
            let diff = DiffEngine::new(&registry()).compute_destroy(&state);
            PlanScheduler::new()
                .schedule(diff, &state, true)
                .expect("schedule should succeed")
        };

        let subnet = position(&plan, StepKind::Delete, "aws_subnet.a");
        let vpc = position(&plan, StepKind::Delete, "aws_vpc.main");
        assert!(subnet < vpc);
        assert!(waits_on(&plan, vpc, subnet));
        assert!(plan.destroy);
    }

    #[test]
    fn test_removed_dependency_waits_for_kept_dependent() {
        // The subnet moves off a VPC that is being removed
        let mut state = applied_state();
        state.resources.insert(
            String::from("aws_vpc.other"),
            stored("aws_vpc.other", "aws_vpc", "vpc-2", json!({"cidr_block": "10.2.0.0/16"}), &[]),
        );
        let configs = vec![
            resource("aws_vpc", "other", json!({"cidr_block": "10.2.0.0/16"})),
            resource(
                "aws_subnet",
                "a",
                json!({"vpc_id": "${aws_vpc.other.id}", "cidr_block": "10.0.1.0/24"}),
            ),
        ];
        let plan = plan(&configs, &state);

        let update = position(&plan, StepKind::Update, "aws_subnet.a");
        let delete = position(&plan, StepKind::Delete, "aws_vpc.main");
        assert!(waits_on(&plan, delete, update));
    }

    #[test]
    fn test_leftover_deposed_runs_first() {
        let mut state = applied_state();
        if let Some(vpc) = state.resources.get_mut("aws_vpc.main") {
            vpc.deposed = Some(DeposedObject {
                provider_id: String::from("vpc-0"),
                deposed_at: Utc::now(),
            });
        }
        let configs = vec![
            resource("aws_vpc", "main", json!({"cidr_block": "10.0.0.0/16"})),
            subnet("a"),
        ];
        let plan = plan(&configs, &state);

        let deposed = position(&plan, StepKind::DestroyDeposed, "aws_vpc.main");
        let noop = position(&plan, StepKind::NoOp, "aws_vpc.main");
        assert!(waits_on(&plan, noop, deposed));
        assert_eq!(plan.steps[deposed].provider_id.as_deref(), Some("vpc-0"));
        assert!(plan.has_changes());
    }

    #[test]
    fn test_dependency_cycle_in_state_deadlocks() {
        let mut state = StateSnapshot::new();
        for r in [
            stored("aws_vpc.a", "aws_vpc", "vpc-a", json!({}), &["aws_vpc.b"]),
            stored("aws_vpc.b", "aws_vpc", "vpc-b", json!({}), &["aws_vpc.a"]),
        ] {
            state.resources.insert(r.address.clone(), r);
        }
        let diff = DiffEngine::new(&registry()).compute_destroy(&state);

        let result = PlanScheduler::new().schedule(diff, &state, true);
        let Err(HalldyllError::Plan(PlanError::ScheduleDeadlock { steps })) = result else {
            panic!("expected a deadlock");
        };
        assert_eq!(steps.len(), 2);
    }

    #[test]
    fn test_schedule_blocks_transitive_dependents() {
        let step = |index: usize, depends_on: Vec<usize>| PlanStep {
            index,
            address: format!("aws_vpc.r{index}"),
            resource_type: String::from("aws_vpc"),
            kind: StepKind::Create,
            provider_id: None,
            depends_on,
        };
        // 0 <- 1 <- 2, and 3 independent
        let steps = vec![step(0, vec![]), step(1, vec![0]), step(2, vec![1]), step(3, vec![])];
        let mut schedule = Schedule::new(&steps);

        assert_eq!(schedule.pop_ready(), Some(0));
        assert_eq!(schedule.pop_ready(), Some(3));
        assert_eq!(schedule.pop_ready(), None);

        schedule.complete(3);
        assert_eq!(schedule.fail(0), vec![1, 2]);
        assert_eq!(schedule.status(2), StepStatus::Blocked);
        assert_eq!(schedule.pop_ready(), None);
        assert!(schedule.is_finished());
        assert!(schedule.pending().is_empty());
    }

    #[test]
    fn test_schedule_releases_in_order() {
        let steps = vec![
            PlanStep {
                index: 0,
                address: String::from("aws_vpc.main"),
                resource_type: String::from("aws_vpc"),
                kind: StepKind::Create,
                provider_id: None,
                depends_on: vec![],
            },
            PlanStep {
                index: 1,
                address: String::from("aws_subnet.a"),
                resource_type: String::from("aws_subnet"),
                kind: StepKind::Create,
                provider_id: None,
                depends_on: vec![0],
            },
        ];
        let mut schedule = Schedule::new(&steps);

        assert_eq!(schedule.pop_ready(), Some(0));
        assert_eq!(schedule.pop_ready(), None);
        assert!(!schedule.is_finished());

        schedule.complete(0);
        assert_eq!(schedule.pop_ready(), Some(1));
        schedule.complete(1);
        assert!(schedule.is_finished());
    }
}
