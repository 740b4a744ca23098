//! Plan executor for applying plans.
//!
//! Steps run on a bounded pool as soon as their dependencies commit. Every
//! provider mutation is bracketed by a write-ahead marker and a
//! per-resource commit, so an interrupted apply leaves a state that is
//! either accurate or explicitly flagged for reconciliation.

use chrono::Utc;
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RetryConfig;
use crate::error::{ApplyError, HalldyllError, PlanError, ProviderError, Result, StateError};
use crate::graph::{Reference, Resolved, ResourceSpec};
use crate::provider::{
    Attributes, OperationContext, Provider, ProviderRegistry, ProviderResult, ReplacePolicy,
};
use crate::state::{
    Commit, DeposedObject, HistoryEntry, HistoryOperation, MarkerOperation, ResourceState,
    StateStore, WriteAheadMarker,
};

use super::diff::ResourceChange;
use super::plan::{Plan, PlanStep, StepKind};
use super::scheduler::Schedule;

/// Default number of steps running at once.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Committed resources as seen by running steps.
type CommittedView = Mutex<BTreeMap<String, ResourceState>>;

/// Bounded exponential backoff for transient provider errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per provider call, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any computed delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Builds a policy from configuration.
    #[must_use]
    pub const fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Returns `base * 2^retries_used`, capped at `max_delay`.
    #[must_use]
    pub fn backoff(&self, retries_used: u32) -> Duration {
        let base_ms = self.base_delay.as_millis();
        if base_ms == 0 {
            return Duration::ZERO;
        }
        let max_ms = self.max_delay.as_millis().max(base_ms);
        let multiplier = 1u128 << retries_used.min(20);
        let backoff_ms = base_ms.saturating_mul(multiplier).min(max_ms);
        Duration::from_millis(u64::try_from(backoff_ms).unwrap_or(u64::MAX))
    }

    /// Returns the delay before the next attempt; a provider hint wins.
    #[must_use]
    pub fn delay_for(&self, retries_used: u32, error: &ProviderError) -> Duration {
        error
            .retry_after_secs()
            .map_or_else(|| self.backoff(retries_used), Duration::from_secs)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Executor for plans.
pub struct ApplyExecutor<'a> {
    /// Where commits and markers go.
    store: &'a dyn StateStore,
    /// Providers by resource type.
    registry: &'a ProviderRegistry,
    /// Maximum steps in flight.
    concurrency: usize,
    /// Retry policy for transient errors.
    retry: RetryPolicy,
    /// Stops dispatching new steps when cancelled.
    cancel: CancellationToken,
}

/// Result of applying a plan.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    /// One entry per plan step, in plan order.
    pub steps: Vec<StepReport>,
    /// Whether dispatch was stopped by cancellation.
    pub cancelled: bool,
}

/// Result of a single step.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    /// Step index in the plan.
    pub index: usize,
    /// Resource address.
    pub address: String,
    /// Step kind.
    pub kind: StepKind,
    /// What happened.
    #[serde(flatten)]
    pub outcome: StepOutcome,
    /// Provider calls made, including retries.
    pub attempts: u32,
}

/// Outcome of a single step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    /// The step committed.
    Completed,
    /// The step failed.
    Failed {
        /// Error description.
        error: String,
    },
    /// The step never started.
    NotAttempted {
        /// Why it was skipped.
        reason: String,
    },
}

impl<'a> ApplyExecutor<'a> {
    /// Creates an executor with default concurrency and retries.
    #[must_use]
    pub fn new(store: &'a dyn StateStore, registry: &'a ProviderRegistry) -> Self {
        Self {
            store,
            registry,
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Sets the maximum number of steps in flight.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Uses `cancel` to stop dispatching steps.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Executes a plan.
    ///
    /// Step failures do not fail the call; they are reported in the
    /// returned [`ApplyReport`].
    ///
    /// # Errors
    ///
    /// Returns `ReconciliationRequired` if stale markers exist, or
    /// `StalePlan` if the state changed since the plan was computed.
    pub async fn execute(&self, plan: &Plan) -> Result<ApplyReport> {
        info!(
            "Executing plan with {} steps ({} mutating)",
            plan.steps.len(),
            plan.mutating_steps().len()
        );

        let snapshot = self.store.load().await?;
        if !snapshot.markers.is_empty() {
            return Err(HalldyllError::State(StateError::ReconciliationRequired {
                resources: snapshot.marker_addresses(),
            }));
        }
        if snapshot.serial != plan.state_serial || snapshot.lineage != plan.state_lineage {
            return Err(HalldyllError::Plan(PlanError::StalePlan {
                planned: plan.state_serial,
                current: snapshot.serial,
            }));
        }

        let view: CommittedView = Mutex::new(snapshot.resources);
        let mut schedule = Schedule::new(&plan.steps);
        let mut outcomes: Vec<Option<(StepOutcome, u32)>> = vec![None; plan.steps.len()];
        let mut running = FuturesUnordered::new();
        let mut cancelled = false;

        loop {
            while !cancelled && running.len() < self.concurrency {
                if self.cancel.is_cancelled() {
                    warn!("Apply cancelled; waiting for {} running steps", running.len());
                    cancelled = true;
                    break;
                }
                let Some(index) = schedule.pop_ready() else {
                    break;
                };
                running.push(self.run_step(plan, index, &view));
            }

            let Some((index, attempts, result)) = running.next().await else {
                break;
            };
            let step = &plan.steps[index];

            match result {
                Ok(()) => {
                    if step.kind.is_mutating() {
                        info!("{step} completed");
                    }
                    schedule.complete(index);
                    outcomes[index] = Some((StepOutcome::Completed, attempts));
                }
                Err(e) => {
                    error!("{step} failed: {e}");
                    for blocked in schedule.fail(index) {
                        warn!("Skipping {} because {} failed", plan.steps[blocked], step.address);
                        outcomes[blocked] = Some((
                            StepOutcome::NotAttempted {
                                reason: format!("dependency {} failed", step.address),
                            },
                            0,
                        ));
                    }
                    outcomes[index] = Some((StepOutcome::Failed { error: e.to_string() }, attempts));
                }
            }
        }

        let steps: Vec<StepReport> = plan
            .steps
            .iter()
            .zip(outcomes)
            .map(|(step, outcome)| {
                let (outcome, attempts) = outcome.unwrap_or_else(|| {
                    let reason = if cancelled { "cancelled" } else { "not reached" };
                    (
                        StepOutcome::NotAttempted {
                            reason: reason.to_string(),
                        },
                        0,
                    )
                });
                StepReport {
                    index: step.index,
                    address: step.address.clone(),
                    kind: step.kind,
                    outcome,
                    attempts,
                }
            })
            .collect();

        let report = ApplyReport { steps, cancelled };
        self.record_history(plan, &report).await;

        info!(
            "Apply finished: {} completed, {} failed, {} not attempted",
            report.completed(),
            report.failed(),
            report.not_attempted()
        );
        Ok(report)
    }

    async fn record_history(&self, plan: &Plan, report: &ApplyReport) {
        if plan.mutating_steps().is_empty() {
            return;
        }

        let operation = if plan.destroy {
            HistoryOperation::Destroy
        } else {
            HistoryOperation::Apply
        };
        let mut resources: Vec<String> = report
            .steps
            .iter()
            .filter(|s| s.kind.is_mutating() && s.outcome == StepOutcome::Completed)
            .map(|s| s.address.clone())
            .collect();
        resources.dedup();

        let entry = match report.error() {
            None => HistoryEntry::new(operation, resources),
            Some(e) => HistoryEntry::failed(operation, resources, &e.to_string()),
        };
        if let Err(e) = self.store.record_history(entry).await {
            warn!("Failed to record history: {e}");
        }
    }

    async fn run_step(
        &self,
        plan: &Plan,
        index: usize,
        view: &CommittedView,
    ) -> (usize, u32, Result<()>) {
        let step = &plan.steps[index];
        let mut attempts = 0;
        let result = self.perform(plan, step, view, &mut attempts).await;
        (index, attempts, result)
    }

    async fn perform(
        &self,
        plan: &Plan,
        step: &PlanStep,
        view: &CommittedView,
        attempts: &mut u32,
    ) -> Result<()> {
        if step.kind == StepKind::NoOp {
            return Ok(());
        }

        debug!("Starting {step}");
        let provider = self.registry.get(&step.resource_type)?;
        let provider = provider.as_ref();

        match step.kind {
            StepKind::Create | StepKind::CreateReplacement => {
                self.create(plan, step, provider, view, attempts).await
            }
            StepKind::Update => self.update(plan, step, provider, view, attempts).await,
            StepKind::Delete | StepKind::DestroyForReplace => {
                self.destroy(step, provider, view, attempts).await
            }
            StepKind::DestroyDeposed => self.destroy_deposed(step, provider, view, attempts).await,
            StepKind::NoOp => Ok(()),
        }
    }

    async fn create(
        &self,
        plan: &Plan,
        step: &PlanStep,
        provider: &dyn Provider,
        view: &CommittedView,
        attempts: &mut u32,
    ) -> Result<()> {
        let (change, spec) = desired(plan, step)?;
        let attributes = resolve_attributes(spec, view)?;

        let ctx = OperationContext::new(&step.address);
        let mut marker = WriteAheadMarker::new(
            &step.address,
            &step.resource_type,
            MarkerOperation::Create,
            &ctx.token,
        );
        marker.fingerprint.clone_from(&spec.fingerprint);
        marker.dependencies.clone_from(&change.dependencies);
        self.store.record_marker(marker).await?;

        let result = self
            .call(&step.address, attempts, || provider.create(&ctx, &attributes))
            .await;
        let object = self.settle(&step.address, result).await?;

        let previous = lock_view(view).get(&step.address).cloned();
        let mut state = ResourceState::new(
            &step.address,
            &step.resource_type,
            &object.id,
            object.attributes,
        )
        .with_fingerprint(spec.fingerprint.clone())
        .with_dependencies(change.dependencies.clone());

        if let Some(previous) = previous {
            state.created_at = previous.created_at;
            if step.kind == StepKind::CreateReplacement
                && change.policy == Some(ReplacePolicy::CreateBeforeDestroy)
            {
                state.created_at = Utc::now();
                state.deposed = Some(DeposedObject {
                    provider_id: previous.provider_id,
                    deposed_at: Utc::now(),
                });
            }
        }

        self.commit(view, &step.address, Commit::Put(state)).await
    }

    async fn update(
        &self,
        plan: &Plan,
        step: &PlanStep,
        provider: &dyn Provider,
        view: &CommittedView,
        attempts: &mut u32,
    ) -> Result<()> {
        let (change, spec) = desired(plan, step)?;
        let attributes = resolve_attributes(spec, view)?;
        let current = committed(view, &step.address)?;

        let ctx = OperationContext::new(&step.address);
        let mut marker = WriteAheadMarker::new(
            &step.address,
            &step.resource_type,
            MarkerOperation::Update,
            &ctx.token,
        );
        marker.provider_id = Some(current.provider_id.clone());
        marker.fingerprint.clone_from(&spec.fingerprint);
        marker.dependencies.clone_from(&change.dependencies);
        self.store.record_marker(marker).await?;

        let result = self
            .call(&step.address, attempts, || {
                provider.update(&ctx, &current.provider_id, &attributes)
            })
            .await;
        let observed = self.settle(&step.address, result).await?;

        let mut state = current;
        state.attributes = observed;
        state.fingerprint.clone_from(&spec.fingerprint);
        state.dependencies.clone_from(&change.dependencies);
        state.updated_at = Utc::now();

        self.commit(view, &step.address, Commit::Put(state)).await
    }

    async fn destroy(
        &self,
        step: &PlanStep,
        provider: &dyn Provider,
        view: &CommittedView,
        attempts: &mut u32,
    ) -> Result<()> {
        let id = match &step.provider_id {
            Some(id) => id.clone(),
            None => committed(view, &step.address)?.provider_id,
        };

        self.delete_remote(step, provider, &id, MarkerOperation::Delete, attempts)
            .await?;
        self.commit(view, &step.address, Commit::Tombstone).await
    }

    async fn destroy_deposed(
        &self,
        step: &PlanStep,
        provider: &dyn Provider,
        view: &CommittedView,
        attempts: &mut u32,
    ) -> Result<()> {
        let id = step.provider_id.clone().ok_or_else(|| {
            HalldyllError::Plan(PlanError::Incomplete {
                message: format!("{step} has no deposed object"),
            })
        })?;

        self.delete_remote(step, provider, &id, MarkerOperation::DestroyDeposed, attempts)
            .await?;

        let current = lock_view(view).get(&step.address).cloned();
        match current {
            Some(mut state) if state.deposed.as_ref().is_some_and(|d| d.provider_id == id) => {
                state.deposed = None;
                self.commit(view, &step.address, Commit::Put(state)).await
            }
            _ => self.store.clear_marker(&step.address).await,
        }
    }

    /// Deletes a remote object under a marker; a missing object counts as deleted.
    async fn delete_remote(
        &self,
        step: &PlanStep,
        provider: &dyn Provider,
        id: &str,
        operation: MarkerOperation,
        attempts: &mut u32,
    ) -> Result<()> {
        let ctx = OperationContext::new(&step.address);
        let mut marker =
            WriteAheadMarker::new(&step.address, &step.resource_type, operation, &ctx.token);
        marker.provider_id = Some(id.to_string());
        self.store.record_marker(marker).await?;

        let result = match self
            .call(&step.address, attempts, || provider.delete(&ctx, id))
            .await
        {
            Err(ProviderError::NotFound { .. }) => {
                debug!("{} ({id}) already gone", step.address);
                Ok(())
            }
            other => other,
        };
        self.settle(&step.address, result).await
    }

    /// Calls the provider, retrying transient errors.
    async fn call<T, F, Fut>(
        &self,
        address: &str,
        attempts: &mut u32,
        mut operation: F,
    ) -> ProviderResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        loop {
            *attempts += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && *attempts < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(*attempts - 1, &e);
                    warn!(
                        address,
                        attempt = *attempts,
                        retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Transient provider error, retrying: {e}"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Clears the marker after a definitive failure; keeps it when the
    /// outcome is unknown.
    async fn settle<T>(&self, address: &str, result: ProviderResult<T>) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e) if e.is_ambiguous() => {
                warn!("{address}: outcome unknown ({e}); marker kept for reconciliation");
                Err(e.into())
            }
            Err(e) => {
                if let Err(clear) = self.store.clear_marker(address).await {
                    warn!("Failed to clear marker for {address}: {clear}");
                }
                Err(e.into())
            }
        }
    }

    async fn commit(&self, view: &CommittedView, address: &str, commit: Commit) -> Result<()> {
        let serial = self.store.commit(address, commit.clone()).await?;
        let mut resources = lock_view(view);
        match commit {
            Commit::Put(state) => {
                resources.insert(address.to_string(), state);
            }
            Commit::Tombstone => {
                resources.remove(address);
            }
        }
        debug!("{address} committed at serial {serial}");
        Ok(())
    }
}

impl std::fmt::Debug for ApplyExecutor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplyExecutor")
            .field("backend", &self.store.backend_type())
            .field("registry", self.registry)
            .field("concurrency", &self.concurrency)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

fn lock_view(view: &CommittedView) -> MutexGuard<'_, BTreeMap<String, ResourceState>> {
    view.lock().unwrap_or_else(PoisonError::into_inner)
}

fn committed(view: &CommittedView, address: &str) -> Result<ResourceState> {
    lock_view(view).get(address).cloned().ok_or_else(|| {
        HalldyllError::Plan(PlanError::Incomplete {
            message: format!("{address} is not in state"),
        })
    })
}

fn desired<'p>(plan: &'p Plan, step: &PlanStep) -> Result<(&'p ResourceChange, &'p ResourceSpec)> {
    plan.change(&step.address)
        .and_then(|change| change.spec.as_ref().map(|spec| (change, spec)))
        .ok_or_else(|| {
            HalldyllError::Plan(PlanError::Incomplete {
                message: format!("no declaration recorded for {}", step.address),
            })
        })
}

/// Resolves a declaration against committed upstream state.
fn resolve_attributes(spec: &ResourceSpec, view: &CommittedView) -> Result<Attributes> {
    let resources = lock_view(view);
    let lookup = |reference: &Reference| {
        resources
            .get(&reference.resource)
            .and_then(|state| reference.lookup(Some(&state.provider_id), &state.attributes))
            .map_or(Resolved::Unknown, Resolved::Known)
    };

    let mut attributes = Attributes::new();
    for (key, expr) in &spec.attributes {
        match expr.resolve(&lookup) {
            Resolved::Known(value) => {
                attributes.insert(key.clone(), value);
            }
            Resolved::Unknown => {
                return Err(HalldyllError::Plan(PlanError::Incomplete {
                    message: format!("{}.{key} is unresolved at apply time", spec.address),
                }));
            }
        }
    }
    Ok(attributes)
}

impl ApplyReport {
    /// Returns the number of mutating steps that committed.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.kind.is_mutating() && s.outcome == StepOutcome::Completed)
            .count()
    }

    /// Returns the number of failed steps.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s.outcome, StepOutcome::Failed { .. }))
            .count()
    }

    /// Returns the number of steps never started.
    #[must_use]
    pub fn not_attempted(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s.outcome, StepOutcome::NotAttempted { .. }))
            .count()
    }

    /// Returns true if every step committed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.failed() == 0 && self.not_attempted() == 0
    }

    /// Returns the report for a step.
    #[must_use]
    pub fn step(&self, kind: StepKind, address: &str) -> Option<&StepReport> {
        self.steps
            .iter()
            .find(|s| s.kind == kind && s.address == address)
    }

    /// Summarizes an unsuccessful apply as an error.
    #[must_use]
    pub fn error(&self) -> Option<ApplyError> {
        if self.cancelled {
            Some(ApplyError::Cancelled {
                completed: self.completed(),
                not_attempted: self.not_attempted(),
            })
        } else if self.is_success() {
            None
        } else {
            Some(ApplyError::Partial {
                completed: self.completed(),
                failed: self.failed(),
                not_attempted: self.not_attempted(),
            })
        }
    }
}

impl std::fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed { error } => write!(f, "failed: {error}"),
            Self::NotAttempted { reason } => write!(f, "not attempted ({reason})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LifecycleConfig, ResourceConfig};
    use crate::graph::GraphBuilder;
    use crate::planner::{DiffEngine, PlanScheduler};
    use crate::provider::{
        Journal, MemoryProvider, MockProvider, Operation, RemoteObject, ResourceSchema,
    };
    use crate::state::LocalStateStore;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        store: LocalStateStore,
        registry: ProviderRegistry,
        vpc: Arc<MemoryProvider>,
        subnet: Arc<MemoryProvider>,
        journal: Arc<Journal>,
    }

    fn fixture() -> Fixture {
        fixture_with_vpc_latency(Duration::ZERO)
    }

    fn fixture_with_vpc_latency(latency: Duration) -> Fixture {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp.path());
        let journal = Journal::new();
        let vpc = Arc::new(
            MemoryProvider::with_journal(
                ResourceSchema::new("aws_vpc")
                    .with_immutable(["cidr_block"])
                    .with_computed(["arn"]),
                Arc::clone(&journal),
            )
            .with_latency(latency),
        );
        let subnet = Arc::new(MemoryProvider::with_journal(
            ResourceSchema::new("aws_subnet").with_immutable(["cidr_block"]),
            Arc::clone(&journal),
        ));
        let registry = ProviderRegistry::new()
            .with(Arc::clone(&vpc) as Arc<dyn Provider>)
            .with(Arc::clone(&subnet) as Arc<dyn Provider>);

        Fixture {
            _temp: temp,
            store,
            registry,
            vpc,
            subnet,
            journal,
        }
    }

    fn resource(ty: &str, name: &str, attributes: Value) -> ResourceConfig {
        ResourceConfig {
            resource_type: ty.to_string(),
            name: name.to_string(),
            attributes: serde_json::from_value(attributes).unwrap(),
            depends_on: Vec::new(),
            lifecycle: LifecycleConfig::default(),
        }
    }

    fn topology(cidr: &str, create_before_destroy: Option<bool>) -> Vec<ResourceConfig> {
        let mut vpc = resource("aws_vpc", "main", json!({"cidr_block": cidr}));
        vpc.lifecycle.create_before_destroy = create_before_destroy;
        vec![
            vpc,
            resource(
                "aws_subnet",
                "a",
                json!({"vpc_id": "${aws_vpc.main.id}", "cidr_block": "10.0.1.0/24"}),
            ),
        ]
    }

    async fn plan(f: &Fixture, configs: &[ResourceConfig]) -> Plan {
        let state = f.store.load().await.expect("load failed");
        let graph = GraphBuilder::with_registry(&f.registry)
            .build_from_config(configs)
            .expect("graph should build");
        let diff = DiffEngine::new(&f.registry)
            .compute(&graph, &state)
            .expect("diff should succeed");
        PlanScheduler::new()
            .schedule(diff, &state, false)
            .expect("schedule should succeed")
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    fn executor(f: &Fixture) -> ApplyExecutor<'_> {
        ApplyExecutor::new(&f.store, &f.registry).with_retry(fast_retry())
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(350));
        assert_eq!(policy.backoff(40), Duration::from_millis(350));

        let hinted = ProviderError::RateLimited {
            retry_after_secs: Some(3),
            message: String::from("slow down"),
        };
        assert_eq!(policy.delay_for(0, &hinted), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_vpc_and_subnet_are_created_in_order() {
        let f = fixture();
        let plan = plan(&f, &topology("10.0.0.0/16", None)).await;

        let report = executor(&f).execute(&plan).await.expect("apply failed");
        assert!(report.is_success());
        assert_eq!(report.completed(), 2);

        let state = f.store.load().await.expect("load failed");
        let vpc = state.get("aws_vpc.main").expect("vpc missing");
        let subnet = state.get("aws_subnet.a").expect("subnet missing");
        assert_eq!(subnet.attributes["vpc_id"], json!(vpc.provider_id));
        assert_eq!(subnet.dependencies, vec![String::from("aws_vpc.main")]);
        assert!(vpc.attributes.contains_key("arn"));
        assert!(state.markers.is_empty());
        assert_eq!(state.history.len(), 1);

        assert!(
            f.journal.position(Operation::Create, "aws_vpc.main")
                < f.journal.position(Operation::Create, "aws_subnet.a")
        );
    }

    #[tokio::test]
    async fn test_second_plan_is_noop() {
        let f = fixture();
        let configs = topology("10.0.0.0/16", None);
        let first = plan(&f, &configs).await;
        executor(&f).execute(&first).await.expect("apply failed");

        let second = plan(&f, &configs).await;
        assert!(!second.has_changes());
        assert_eq!(second.summary().unchanged, 2);

        let mutations = f.journal.mutations().len();
        let report = executor(&f).execute(&second).await.expect("apply failed");
        assert!(report.is_success());
        assert_eq!(f.journal.mutations().len(), mutations);
    }

    #[tokio::test]
    async fn test_failed_subnet_leaves_only_vpc() {
        let f = fixture();
        f.subnet.fail(
            Operation::Create,
            None,
            ProviderError::Validation {
                message: String::from("cidr outside vpc"),
            },
            1,
        );
        let plan = plan(&f, &topology("10.0.0.0/16", None)).await;

        let report = executor(&f).execute(&plan).await.expect("apply failed");
        assert!(!report.is_success());

        let subnet = report.step(StepKind::Create, "aws_subnet.a").unwrap();
        assert!(matches!(subnet.outcome, StepOutcome::Failed { .. }));
        assert_eq!(subnet.attempts, 1);
        assert!(matches!(report.error(), Some(ApplyError::Partial { failed: 1, .. })));

        let state = f.store.load().await.expect("load failed");
        assert_eq!(state.addresses(), vec!["aws_vpc.main"]);
        assert!(state.markers.is_empty());
        assert!(!state.history[0].success);
    }

    #[tokio::test]
    async fn test_failure_blocks_dependents() {
        let f = fixture();
        f.vpc.fail(
            Operation::Create,
            None,
            ProviderError::PermissionDenied {
                message: String::from("no"),
            },
            1,
        );
        let plan = plan(&f, &topology("10.0.0.0/16", None)).await;

        let report = executor(&f).execute(&plan).await.expect("apply failed");

        let subnet = report.step(StepKind::Create, "aws_subnet.a").unwrap();
        assert!(matches!(subnet.outcome, StepOutcome::NotAttempted { .. }));
        assert_eq!(f.journal.position(Operation::Create, "aws_subnet.a"), None);
        assert!(f.subnet.object_ids().is_empty());
        assert!(f.store.load().await.expect("load failed").is_empty());
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let f = fixture();
        f.vpc.fail(
            Operation::Create,
            None,
            ProviderError::Unavailable {
                message: String::from("503"),
            },
            2,
        );
        let plan = plan(&f, &topology("10.0.0.0/16", None)).await;

        let report = executor(&f).execute(&plan).await.expect("apply failed");
        assert!(report.is_success());
        assert_eq!(report.step(StepKind::Create, "aws_vpc.main").unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn test_exhausted_timeout_keeps_marker() {
        let f = fixture();
        f.vpc.fail_after_effect(
            Operation::Create,
            None,
            ProviderError::Timeout {
                message: String::from("deadline exceeded"),
            },
            5,
        );
        let plan = plan(&f, &topology("10.0.0.0/16", None)).await;

        let report = executor(&f).execute(&plan).await.expect("apply failed");
        assert_eq!(report.step(StepKind::Create, "aws_vpc.main").unwrap().attempts, 3);

        // Retries reuse the idempotency token, so only one object exists
        assert_eq!(f.vpc.object_ids().len(), 1);

        let state = f.store.load().await.expect("load failed");
        assert!(state.get("aws_vpc.main").is_none());
        assert_eq!(state.marker_addresses(), vec!["aws_vpc.main"]);

        let result = executor(&f).execute(&plan).await;
        assert!(matches!(
            result,
            Err(HalldyllError::State(StateError::ReconciliationRequired { .. }))
        ));
    }

    #[tokio::test]
    async fn test_exhausted_server_error_keeps_marker() {
        let f = fixture();
        f.vpc.fail_after_effect(
            Operation::Create,
            None,
            ProviderError::unavailable("502 bad gateway"),
            5,
        );
        let plan = plan(&f, &topology("10.0.0.0/16", None)).await;

        let report = executor(&f).execute(&plan).await.expect("apply failed");
        let vpc = report.step(StepKind::Create, "aws_vpc.main").unwrap();
        assert!(matches!(vpc.outcome, StepOutcome::Failed { .. }));
        assert_eq!(vpc.attempts, 3);
        assert_eq!(f.vpc.object_ids().len(), 1);

        let state = f.store.load().await.expect("load failed");
        assert!(state.get("aws_vpc.main").is_none());
        assert_eq!(state.marker_addresses(), vec!["aws_vpc.main"]);

        let result = executor(&f).execute(&plan).await;
        assert!(matches!(
            result,
            Err(HalldyllError::State(StateError::ReconciliationRequired { .. }))
        ));
        assert_eq!(f.vpc.object_ids().len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_provider_clears_marker() {
        let f = fixture();
        f.vpc.fail(
            Operation::Create,
            None,
            ProviderError::unreachable("connection refused"),
            5,
        );
        let plan = plan(&f, &topology("10.0.0.0/16", None)).await;

        let report = executor(&f).execute(&plan).await.expect("apply failed");
        assert_eq!(report.step(StepKind::Create, "aws_vpc.main").unwrap().attempts, 3);
        assert!(f.vpc.object_ids().is_empty());
        assert!(f.store.load().await.expect("load failed").markers.is_empty());
    }

    #[tokio::test]
    async fn test_stale_plan_is_rejected() {
        let f = fixture();
        let plan = plan(&f, &topology("10.0.0.0/16", None)).await;

        f.store
            .commit(
                "aws_vpc.other",
                Commit::Put(ResourceState::new("aws_vpc.other", "aws_vpc", "vpc-9", Attributes::new())),
            )
            .await
            .expect("commit failed");

        let result = executor(&f).execute(&plan).await;
        assert!(matches!(
            result,
            Err(HalldyllError::Plan(PlanError::StalePlan { planned: 0, current: 1 }))
        ));
        assert!(f.journal.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_create_before_destroy_keeps_old_until_dependents_move() {
        let f = fixture();
        let initial = plan(&f, &topology("10.0.0.0/16", Some(true))).await;
        executor(&f).execute(&initial).await.expect("apply failed");
        let old_id = f.store.load().await.unwrap().get("aws_vpc.main").unwrap().provider_id.clone();

        let before = f.journal.mutations().len();
        let replace = plan(&f, &topology("10.1.0.0/16", Some(true))).await;
        let report = executor(&f).execute(&replace).await.expect("apply failed");
        assert!(report.is_success());

        let later: Vec<(Operation, String)> = f.journal.mutations()[before..].to_vec();
        let at = |op: Operation, address: &str| {
            later
                .iter()
                .position(|(o, a)| *o == op && a == address)
                .unwrap_or_else(|| panic!("missing {op:?} {address}"))
        };
        assert!(at(Operation::Create, "aws_vpc.main") < at(Operation::Update, "aws_subnet.a"));
        assert!(at(Operation::Update, "aws_subnet.a") < at(Operation::Delete, "aws_vpc.main"));

        let state = f.store.load().await.expect("load failed");
        let vpc = state.get("aws_vpc.main").unwrap();
        assert_ne!(vpc.provider_id, old_id);
        assert!(vpc.deposed.is_none());
        assert_eq!(f.vpc.object_ids(), vec![vpc.provider_id.clone()]);
        assert_eq!(
            state.get("aws_subnet.a").unwrap().attributes["vpc_id"],
            json!(vpc.provider_id)
        );
    }

    #[tokio::test]
    async fn test_destroy_before_create_replacement() {
        let f = fixture();
        let initial = plan(&f, &topology("10.0.0.0/16", None)).await;
        executor(&f).execute(&initial).await.expect("apply failed");

        let before = f.journal.mutations().len();
        let replace = plan(&f, &topology("10.1.0.0/16", None)).await;
        assert!(replace.steps.iter().any(|s| s.kind == StepKind::DestroyForReplace));
        executor(&f).execute(&replace).await.expect("apply failed");

        let later = &f.journal.mutations()[before..];
        let delete = later
            .iter()
            .position(|(o, a)| *o == Operation::Delete && a == "aws_vpc.main")
            .unwrap();
        let create = later
            .iter()
            .position(|(o, a)| *o == Operation::Create && a == "aws_vpc.main")
            .unwrap();
        assert!(delete < create);
        assert_eq!(f.vpc.object_ids().len(), 1);
    }

    #[tokio::test]
    async fn test_destroy_tolerates_missing_objects() {
        let f = fixture();
        let initial = plan(&f, &topology("10.0.0.0/16", None)).await;
        executor(&f).execute(&initial).await.expect("apply failed");

        let state = f.store.load().await.expect("load failed");
        f.subnet.remove(&state.get("aws_subnet.a").unwrap().provider_id);

        let diff = DiffEngine::new(&f.registry).compute_destroy(&state);
        let destroy = PlanScheduler::new()
            .schedule(diff, &state, true)
            .expect("schedule should succeed");
        let report = executor(&f).execute(&destroy).await.expect("destroy failed");

        assert!(report.is_success());
        let state = f.store.load().await.expect("load failed");
        assert!(state.is_empty());
        assert_eq!(state.history.last().unwrap().operation, HistoryOperation::Destroy);
        assert!(f.vpc.object_ids().is_empty());
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp.path());
        let provider = Arc::new(
            MemoryProvider::new(ResourceSchema::new("aws_vpc"))
                .with_latency(Duration::from_millis(20)),
        );
        let registry = ProviderRegistry::new().with(Arc::clone(&provider) as Arc<dyn Provider>);

        let configs: Vec<ResourceConfig> = (0..6)
            .map(|i| resource("aws_vpc", &format!("v{i}"), json!({"cidr_block": format!("10.{i}.0.0/16")})))
            .collect();
        let graph = GraphBuilder::with_registry(&registry)
            .build_from_config(&configs)
            .unwrap();
        let state = store.load().await.unwrap();
        let diff = DiffEngine::new(&registry).compute(&graph, &state).unwrap();
        let plan = PlanScheduler::new().schedule(diff, &state, false).unwrap();

        let report = ApplyExecutor::new(&store, &registry)
            .with_concurrency(2)
            .execute(&plan)
            .await
            .expect("apply failed");

        assert!(report.is_success());
        assert!(provider.peak_in_flight() <= 2);
        assert!(provider.peak_in_flight() >= 1);
    }

    #[tokio::test]
    async fn test_cancelled_apply_starts_nothing() {
        let f = fixture();
        let plan = plan(&f, &topology("10.0.0.0/16", None)).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = executor(&f)
            .with_cancellation(cancel)
            .execute(&plan)
            .await
            .expect("apply failed");

        assert!(report.cancelled);
        assert_eq!(report.not_attempted(), 2);
        assert!(matches!(report.error(), Some(ApplyError::Cancelled { completed: 0, .. })));
        assert!(f.journal.entries().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_mid_run_finishes_in_flight_step() {
        let f = fixture_with_vpc_latency(Duration::from_millis(100));
        let plan = plan(&f, &topology("10.0.0.0/16", None)).await;
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let report = executor(&f)
            .with_cancellation(cancel)
            .execute(&plan)
            .await
            .expect("apply failed");

        assert!(report.cancelled);
        let vpc = report.step(StepKind::Create, "aws_vpc.main").unwrap();
        assert_eq!(vpc.outcome, StepOutcome::Completed);
        let subnet = report.step(StepKind::Create, "aws_subnet.a").unwrap();
        assert!(matches!(
            subnet.outcome,
            StepOutcome::NotAttempted { ref reason } if reason == "cancelled"
        ));
        assert!(matches!(
            report.error(),
            Some(ApplyError::Cancelled { completed: 1, not_attempted: 1 })
        ));

        let state = f.store.load().await.expect("load failed");
        assert_eq!(state.addresses(), vec!["aws_vpc.main"]);
        assert!(state.markers.is_empty());
        assert_eq!(f.journal.position(Operation::Create, "aws_subnet.a"), None);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp.path());

        let mut mock = MockProvider::new();
        mock.expect_schema()
            .return_const(ResourceSchema::new("aws_vpc"));
        mock.expect_create().times(1).returning(|_, _| {
            Err(ProviderError::Conflict {
                message: String::from("name taken"),
            })
        });
        mock.expect_read().never();
        let registry = ProviderRegistry::new().with(Arc::new(mock));

        let configs = vec![resource("aws_vpc", "main", json!({"cidr_block": "10.0.0.0/16"}))];
        let graph = GraphBuilder::with_registry(&registry)
            .build_from_config(&configs)
            .unwrap();
        let state = store.load().await.unwrap();
        let diff = DiffEngine::new(&registry).compute(&graph, &state).unwrap();
        let plan = PlanScheduler::new().schedule(diff, &state, false).unwrap();

        let report = ApplyExecutor::new(&store, &registry)
            .with_retry(fast_retry())
            .execute(&plan)
            .await
            .expect("apply failed");

        let step = report.step(StepKind::Create, "aws_vpc.main").unwrap();
        assert_eq!(step.attempts, 1);
        assert!(matches!(step.outcome, StepOutcome::Failed { ref error } if error.contains("name taken")));
        assert!(store.load().await.unwrap().markers.is_empty());
    }

    #[tokio::test]
    async fn test_mock_create_result_is_committed() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp.path());

        let mut mock = MockProvider::new();
        mock.expect_schema()
            .return_const(ResourceSchema::new("aws_vpc"));
        mock.expect_create().times(1).returning(|_, attributes| {
            Ok(RemoteObject {
                id: String::from("vpc-42"),
                attributes: attributes.clone(),
            })
        });
        let registry = ProviderRegistry::new().with(Arc::new(mock));

        let configs = vec![resource("aws_vpc", "main", json!({"cidr_block": "10.0.0.0/16"}))];
        let graph = GraphBuilder::with_registry(&registry)
            .build_from_config(&configs)
            .unwrap();
        let state = store.load().await.unwrap();
        let diff = DiffEngine::new(&registry).compute(&graph, &state).unwrap();
        let plan = PlanScheduler::new().schedule(diff, &state, false).unwrap();

        let report = ApplyExecutor::new(&store, &registry)
            .execute(&plan)
            .await
            .expect("apply failed");
        assert!(report.is_success());

        let state = store.load().await.unwrap();
        assert_eq!(state.get("aws_vpc.main").unwrap().provider_id, "vpc-42");
    }
}
