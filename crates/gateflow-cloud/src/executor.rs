//! Plan executor
//!
//! Runs a [`Plan`] against a provider with bounded concurrency.
//!
//! - Pre-delete phase: delete-before-create replacements and everything
//!   still depending on them are deleted, dependents first.
//! - Forward phase: create, update and replace in dependency order. A node
//!   starts once every dependency finished successfully.
//! - Reverse phase: delete removed resources and old copies of replaced
//!   ones, dependents first.
//! - Cancellation (token or apply timeout): nothing new starts, readiness
//!   polls stop, and resources created in this run are deleted again.
//!
//! Workers own a single descriptor each and report back. Only the
//! coordinator touches the state snapshot.

use crate::action::{ActionType, ApplyResult, Plan};
use crate::error::{CloudError, Result};
use crate::provider::{ProviderResource, ResourceProvider, ResourceRequest};
use crate::retry::{RetryConfig, with_retry};
use crate::state::{DeposedCopy, ResourceState, ResourceStatus, StateSnapshot};
use crate::waiter::{PollConfig, wait_until_ready};
use gateflow_core::{FlowError, Reference, ResourceGraph, ResourceKind};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Executor configuration
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum number of provider operations in flight
    pub parallelism: usize,
    pub retry: RetryConfig,
    pub poll: PollConfig,
    /// Cancel the whole run after this long
    pub apply_timeout: Option<Duration>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            parallelism: 10,
            retry: RetryConfig::default(),
            poll: PollConfig::default(),
            apply_timeout: None,
        }
    }
}

/// Final state and per-resource results of a run
///
/// The state is returned even when the run failed, so the next run resumes
/// from what was actually materialized.
#[derive(Debug)]
pub struct ApplyOutcome {
    pub state: StateSnapshot,
    pub result: ApplyResult,
    pub cancelled: bool,
}

impl ApplyOutcome {
    /// Turn failures into [`CloudError::PartialApply`] and cancellation
    /// into [`CloudError::Cancelled`]
    pub fn into_result(self) -> Result<ApplyResult> {
        if self.cancelled {
            return Err(CloudError::Cancelled(format!(
                "{} resource(s) rolled back",
                self.result.rolled_back.len()
            )));
        }
        if self.result.is_success() {
            return Ok(self.result);
        }
        Err(CloudError::PartialApply {
            succeeded: self
                .result
                .succeeded
                .iter()
                .map(|r| r.resource.clone())
                .collect(),
            failed: self
                .result
                .failed
                .iter()
                .map(|r| (r.resource.clone(), r.error.clone().unwrap_or_default()))
                .collect(),
            skipped: self.result.skipped.clone(),
        })
    }
}

/// Runs plans and teardowns against a provider
pub struct Executor {
    provider: Arc<dyn ResourceProvider>,
    config: ExecutorConfig,
    run_id: Uuid,
}

/// Everything a worker needs; cheap to clone into each task
#[derive(Clone)]
struct Worker {
    provider: Arc<dyn ResourceProvider>,
    retry: RetryConfig,
    poll: PollConfig,
    token: CancellationToken,
    permits: Arc<Semaphore>,
}

/// One forward operation, fully resolved before it is handed to a worker
struct ForwardJob {
    request: ResourceRequest,
    action: ActionType,
    changed: Vec<String>,
    /// Existing copy (kind, id), if any
    prior: Option<(ResourceKind, String)>,
    await_ready: bool,
    dependencies: BTreeSet<String>,
}

struct ForwardReport {
    name: String,
    kind: ResourceKind,
    action: ActionType,
    attributes: BTreeMap<String, Value>,
    dependencies: BTreeSet<String>,
    outcome: ForwardOutcome,
}

enum ForwardOutcome {
    Done(ProviderResource),
    /// Exists at the provider but never became ready
    Tainted(ProviderResource, CloudError),
    Failed(CloudError),
}

/// One deletion
#[derive(Debug, Clone)]
struct DeleteJob {
    key: String,
    name: String,
    kind: ResourceKind,
    id: String,
    /// An old copy from a create-before-destroy replacement
    deposed: bool,
    /// Keys that must be deleted first
    waits_on: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeleteMode {
    /// Reverse phase of an apply, or a full destroy
    Teardown,
    /// Undo of resources created in a cancelled run
    Rollback,
}

/// Coordinator-owned bookkeeping
struct Run {
    state: StateSnapshot,
    result: ApplyResult,
    /// Names created in this run, in completion order
    created: Vec<String>,
    /// State before a create-before-destroy replacement
    previous: BTreeMap<String, ResourceState>,
}

impl Executor {
    pub fn new(provider: Arc<dyn ResourceProvider>, config: ExecutorConfig) -> Self {
        Self {
            provider,
            config,
            run_id: Uuid::new_v4(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    fn worker(&self, token: &CancellationToken, permits: &Arc<Semaphore>) -> Worker {
        Worker {
            provider: self.provider.clone(),
            retry: self.config.retry.clone(),
            poll: self.config.poll.clone(),
            token: token.clone(),
            permits: permits.clone(),
        }
    }

    fn permits(&self) -> Arc<Semaphore> {
        Arc::new(Semaphore::new(self.config.parallelism.max(1)))
    }

    /// Cancel `token` once the apply timeout elapses
    fn start_timer(&self, token: &CancellationToken) -> Option<JoinHandle<()>> {
        let timeout = self.config.apply_timeout?;
        let token = token.clone();
        Some(tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    warn!(timeout_secs = timeout.as_secs(), "Apply timeout reached, cancelling");
                    token.cancel();
                }
                _ = token.cancelled() => {}
            }
        }))
    }

    /// Apply a plan
    #[tracing::instrument(skip_all, fields(run_id = %self.run_id))]
    pub async fn apply(
        &self,
        graph: &ResourceGraph,
        plan: &Plan,
        snapshot: StateSnapshot,
        cancel: CancellationToken,
    ) -> ApplyOutcome {
        let started = Instant::now();
        let token = cancel.child_token();
        let timer = self.start_timer(&token);
        let mut run = Run {
            state: snapshot,
            result: ApplyResult::new(),
            created: Vec::new(),
            previous: BTreeMap::new(),
        };

        info!(summary = %plan.summary(), "Starting apply");
        let mut blocked = BTreeSet::new();
        if !plan.pre_deletes.is_empty() {
            let jobs = pre_delete_jobs(plan, graph, &run.state);
            self.delete_all(jobs, &mut run, &token, DeleteMode::Teardown)
                .await;
            // A replacement whose old copy survived cannot start
            blocked.extend(
                plan.pre_deletes
                    .iter()
                    .filter(|name| run.state.get(name).is_some())
                    .cloned(),
            );
        }
        self.forward(graph, plan, &mut run, &token, blocked).await;

        if !token.is_cancelled() {
            let jobs = link_jobs(reverse_jobs(plan, &run.state), |name| {
                depends_on(graph, &run.state, name)
            });
            self.delete_all(jobs, &mut run, &token, DeleteMode::Teardown)
                .await;
        }

        let cancelled = token.is_cancelled();
        if cancelled {
            self.rollback(&mut run).await;
        } else {
            // Dependency metadata follows the graph even for unchanged resources
            for name in graph.topological_order() {
                if let Some(recorded) = run.state.get_mut(name) {
                    recorded.dependencies = graph.dependencies_of(name);
                }
            }
        }

        if let Some(timer) = timer {
            timer.abort();
        }
        run.result.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            succeeded = run.result.succeeded.len(),
            failed = run.result.failed.len(),
            skipped = run.result.skipped.len(),
            rolled_back = run.result.rolled_back.len(),
            duration_ms = run.result.duration_ms,
            "Apply finished"
        );

        ApplyOutcome {
            state: run.state,
            result: run.result,
            cancelled,
        }
    }

    /// Delete every recorded resource, dependents first
    #[tracing::instrument(skip_all, fields(run_id = %self.run_id, resources = snapshot.resources.len()))]
    pub async fn destroy(&self, snapshot: StateSnapshot, cancel: CancellationToken) -> ApplyOutcome {
        let started = Instant::now();
        let token = cancel.child_token();
        let timer = self.start_timer(&token);

        let mut jobs = Vec::new();
        for (name, recorded) in &snapshot.resources {
            jobs.push(DeleteJob::current(name, recorded));
            jobs.extend(recorded.deposed.iter().map(|c| DeleteJob::deposed(name, c)));
        }
        let jobs = link_jobs(jobs, |name| {
            snapshot
                .get(name)
                .map(|r| r.dependencies.clone())
                .unwrap_or_default()
        });

        let mut run = Run {
            state: snapshot,
            result: ApplyResult::new(),
            created: Vec::new(),
            previous: BTreeMap::new(),
        };
        self.delete_all(jobs, &mut run, &token, DeleteMode::Teardown)
            .await;

        if let Some(timer) = timer {
            timer.abort();
        }
        run.result.duration_ms = started.elapsed().as_millis() as u64;
        ApplyOutcome {
            cancelled: token.is_cancelled(),
            state: run.state,
            result: run.result,
        }
    }

    /// Forward phase
    async fn forward(
        &self,
        graph: &ResourceGraph,
        plan: &Plan,
        run: &mut Run,
        token: &CancellationToken,
        mut blocked: BTreeSet<String>,
    ) {
        let permits = self.permits();
        let mut tasks: JoinSet<ForwardReport> = JoinSet::new();
        let mut pending: Vec<_> = graph
            .topological_order()
            .iter()
            .filter_map(|name| plan.action(name))
            .filter(|action| action.is_forward() && !blocked.contains(&action.resource))
            .collect();
        let mut running: BTreeSet<String> = BTreeSet::new();

        loop {
            if !token.is_cancelled() {
                let mut waiting = BTreeSet::new();
                let mut still_pending = Vec::new();
                for action in pending {
                    let name = &action.resource;
                    let deps = graph.dependencies_of(name);
                    if deps.iter().any(|d| blocked.contains(d)) {
                        debug!(resource = %name, "Skipping, a dependency did not succeed");
                        run.result.add_skipped(name.clone());
                        blocked.insert(name.clone());
                    } else if deps
                        .iter()
                        .any(|d| running.contains(d) || waiting.contains(d))
                    {
                        waiting.insert(name.clone());
                        still_pending.push(action);
                    } else {
                        match self.prepare(graph, name, action, &run.state) {
                            Ok(job) => {
                                debug!(resource = %name, action = %action.action_type, "Starting");
                                running.insert(name.clone());
                                tasks.spawn(self.worker(token, &permits).materialize(job));
                            }
                            Err(e) => {
                                run.result
                                    .add_failure(name.clone(), action.action_type, e.to_string());
                                blocked.insert(name.clone());
                            }
                        }
                    }
                }
                pending = still_pending;
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            match joined {
                Ok(report) => {
                    running.remove(&report.name);
                    let name = report.name.clone();
                    if !record_forward(run, report) {
                        blocked.insert(name);
                    }
                }
                Err(e) => error!(error = %e, "Worker task failed"),
            }
        }

        // Tasks that panicked never reported back
        for name in running {
            let action = plan
                .action(&name)
                .map(|a| a.action_type)
                .unwrap_or(ActionType::Create);
            run.result
                .add_failure(name, action, "worker task panicked".to_string());
        }
        for action in pending {
            run.result.add_skipped(action.resource.clone());
        }
    }

    /// Resolve attributes against the current snapshot
    fn prepare(
        &self,
        graph: &ResourceGraph,
        name: &str,
        action: &crate::action::Action,
        state: &StateSnapshot,
    ) -> Result<ForwardJob> {
        let descriptor = graph
            .get(name)
            .ok_or_else(|| FlowError::ResourceNotFound(name.to_string()))?;
        let lookup = |r: &Reference| state.value(&r.resource, &r.attribute);

        let mut attributes = BTreeMap::new();
        for (key, expr) in &descriptor.attributes {
            let value =
                expr.try_resolve(&lookup)
                    .map_err(|reference| CloudError::UnresolvedReference {
                        resource: name.to_string(),
                        reference: reference.to_string(),
                    })?;
            attributes.insert(key.clone(), value);
        }

        Ok(ForwardJob {
            request: ResourceRequest::new(
                name,
                descriptor.kind,
                attributes,
                client_token(&self.run_id, name),
            ),
            action: action.action_type,
            changed: action.changed_attributes(),
            prior: state.get(name).map(|s| (s.kind, s.id.clone())),
            await_ready: self.provider.schema(descriptor.kind).await_ready,
            dependencies: graph.dependencies_of(name),
        })
    }

    /// Run deletions so that every job waits for the jobs in `waits_on`
    async fn delete_all(
        &self,
        jobs: Vec<DeleteJob>,
        run: &mut Run,
        token: &CancellationToken,
        mode: DeleteMode,
    ) {
        let permits = self.permits();
        let mut tasks: JoinSet<(DeleteJob, Result<()>)> = JoinSet::new();
        let mut pending = jobs;
        let mut running: BTreeSet<String> = BTreeSet::new();
        let mut blocked: BTreeSet<String> = BTreeSet::new();

        loop {
            if !token.is_cancelled() {
                let outstanding: BTreeSet<String> =
                    pending.iter().map(|j| j.key.clone()).collect();
                let mut still_pending = Vec::new();
                for job in pending {
                    if job.waits_on.iter().any(|k| blocked.contains(k)) {
                        debug!(resource = %job.name, "Skipping delete, a dependent was not deleted");
                        run.result.add_skipped(job.name.clone());
                        blocked.insert(job.key.clone());
                    } else if job
                        .waits_on
                        .iter()
                        .any(|k| running.contains(k) || outstanding.contains(k))
                    {
                        still_pending.push(job);
                    } else {
                        debug!(resource = %job.name, id = %job.id, "Deleting");
                        running.insert(job.key.clone());
                        let worker = self.worker(token, &permits);
                        tasks.spawn(async move {
                            let result = worker.delete(&job).await;
                            (job, result)
                        });
                    }
                }
                pending = still_pending;
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            match joined {
                Ok((job, result)) => {
                    running.remove(&job.key);
                    if !record_delete(run, &job, result, mode) {
                        blocked.insert(job.key.clone());
                    }
                }
                Err(e) => error!(error = %e, "Worker task failed"),
            }
        }

        for key in running {
            run.result
                .add_failure(key, ActionType::Delete, "worker task panicked".to_string());
        }
        for job in pending {
            run.result.add_skipped(job.name);
        }
    }

    /// Delete everything created in this run, newest first
    async fn rollback(&self, run: &mut Run) {
        let created: BTreeSet<String> = run.created.iter().cloned().collect();
        if created.is_empty() {
            return;
        }
        warn!(resources = created.len(), "Rolling back resources created in this run");

        let jobs: Vec<DeleteJob> = run
            .created
            .iter()
            .rev()
            .filter_map(|name| run.state.get(name).map(|r| DeleteJob::current(name, r)))
            .collect();
        let jobs = link_jobs(jobs, |name| {
            run.state
                .get(name)
                .map(|r| {
                    r.dependencies
                        .iter()
                        .filter(|d| created.contains(*d))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        });

        // The run token is already cancelled; rollback runs to completion
        self.delete_all(jobs, run, &CancellationToken::new(), DeleteMode::Rollback)
            .await;
    }
}

impl Worker {
    async fn materialize(self, job: ForwardJob) -> ForwardReport {
        let outcome = match self.permits.clone().acquire_owned().await {
            Ok(_permit) => self.run_forward(&job).await,
            Err(_) => {
                ForwardOutcome::Failed(CloudError::Cancelled("worker pool closed".to_string()))
            }
        };
        ForwardReport {
            name: job.request.name.clone(),
            kind: job.request.kind,
            action: job.action,
            attributes: job.request.attributes,
            dependencies: job.dependencies,
            outcome,
        }
    }

    /// Update in place, or create a new copy
    ///
    /// Delete-before-create replacements reach this point with no prior copy,
    /// the pre-delete phase already removed it.
    async fn run_forward(&self, job: &ForwardJob) -> ForwardOutcome {
        match (job.action, &job.prior) {
            (ActionType::Update, Some((kind, id))) => {
                let updated = with_retry(&self.retry, "update", || {
                    self.provider.update(id, &job.request, &job.changed)
                })
                .await;
                match updated {
                    Ok(resource) => self.await_ready(job, *kind, resource).await,
                    Err(error) => ForwardOutcome::Failed(error),
                }
            }
            _ => self.create(job).await,
        }
    }

    async fn create(&self, job: &ForwardJob) -> ForwardOutcome {
        let created = with_retry(&self.retry, "create", || {
            self.provider.create(&job.request)
        })
        .await;
        match created {
            Ok(resource) => self.await_ready(job, job.request.kind, resource).await,
            Err(error) => ForwardOutcome::Failed(error),
        }
    }

    async fn await_ready(
        &self,
        job: &ForwardJob,
        kind: ResourceKind,
        resource: ProviderResource,
    ) -> ForwardOutcome {
        if !job.await_ready {
            return ForwardOutcome::Done(resource);
        }
        match wait_until_ready(
            self.provider.as_ref(),
            &job.request.name,
            kind,
            &resource.id,
            &self.poll,
            &self.token,
        )
        .await
        {
            Ok(()) => ForwardOutcome::Done(resource),
            Err(error) => ForwardOutcome::Tainted(resource, error),
        }
    }

    async fn delete(&self, job: &DeleteJob) -> Result<()> {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CloudError::Cancelled("worker pool closed".to_string()))?;
        with_retry(&self.retry, "delete", || {
            self.provider.delete(job.kind, &job.id)
        })
        .await
    }
}

impl DeleteJob {
    fn current(name: &str, state: &ResourceState) -> Self {
        Self {
            key: name.to_string(),
            name: name.to_string(),
            kind: state.kind,
            id: state.id.clone(),
            deposed: false,
            waits_on: BTreeSet::new(),
        }
    }

    fn deposed(name: &str, copy: &DeposedCopy) -> Self {
        Self {
            key: format!("{}#{}", name, copy.id),
            name: name.to_string(),
            kind: copy.kind,
            id: copy.id.clone(),
            deposed: true,
            waits_on: BTreeSet::new(),
        }
    }
}

/// Idempotency token for creating `name` in run `run_id`
///
/// Name-based UUIDs stay unique per name and fit every provider's length limit.
fn client_token(run_id: &Uuid, name: &str) -> String {
    Uuid::new_v5(run_id, name.as_bytes()).to_string()
}

/// Deletions for the reverse phase: removed resources and old copies
fn reverse_jobs(plan: &Plan, state: &StateSnapshot) -> Vec<DeleteJob> {
    let mut jobs: Vec<DeleteJob> = plan
        .actions_by_type(ActionType::Delete)
        .into_iter()
        .filter_map(|action| {
            state
                .get(&action.resource)
                .map(|r| DeleteJob::current(&action.resource, r))
        })
        .collect();
    for (name, recorded) in &state.resources {
        jobs.extend(recorded.deposed.iter().map(|c| DeleteJob::deposed(name, c)));
    }
    jobs
}

/// Deletions for the pre-delete phase, in the order the plan lists them
///
/// A current copy also waits for its own old copies, so nothing is left
/// untracked when its record goes away.
fn pre_delete_jobs(plan: &Plan, graph: &ResourceGraph, state: &StateSnapshot) -> Vec<DeleteJob> {
    let mut jobs = Vec::new();
    for name in &plan.pre_deletes {
        if let Some(recorded) = state.get(name) {
            jobs.extend(recorded.deposed.iter().map(|c| DeleteJob::deposed(name, c)));
            jobs.push(DeleteJob::current(name, recorded));
        }
    }

    let mut jobs = link_jobs(jobs, |name| depends_on(graph, state, name));
    let old_copies: Vec<(String, String)> = jobs
        .iter()
        .filter(|j| j.deposed)
        .map(|j| (j.name.clone(), j.key.clone()))
        .collect();
    for job in jobs.iter_mut().filter(|j| !j.deposed) {
        job.waits_on.extend(
            old_copies
                .iter()
                .filter(|(name, _)| *name == job.name)
                .map(|(_, key)| key.clone()),
        );
    }
    jobs
}

/// Declared and recorded dependencies of `name`
fn depends_on(graph: &ResourceGraph, state: &StateSnapshot, name: &str) -> BTreeSet<String> {
    let mut deps = graph.dependencies_of(name);
    if let Some(recorded) = state.get(name) {
        deps.extend(recorded.dependencies.iter().cloned());
    }
    deps
}

/// A job waits for every other job whose resource depends on it
fn link_jobs<F>(mut jobs: Vec<DeleteJob>, dependencies_of: F) -> Vec<DeleteJob>
where
    F: Fn(&str) -> BTreeSet<String>,
{
    let dependencies: BTreeMap<String, BTreeSet<String>> = jobs
        .iter()
        .map(|j| (j.name.clone(), dependencies_of(&j.name)))
        .collect();
    let keys: Vec<(String, String)> = jobs
        .iter()
        .map(|j| (j.key.clone(), j.name.clone()))
        .collect();

    for job in &mut jobs {
        job.waits_on = keys
            .iter()
            .filter(|(_, other)| {
                *other != job.name
                    && dependencies
                        .get(other)
                        .is_some_and(|deps| deps.contains(&job.name))
            })
            .map(|(key, _)| key.clone())
            .collect();
    }
    jobs
}

/// Fold a forward report into the snapshot. Returns whether it succeeded.
fn record_forward(run: &mut Run, report: ForwardReport) -> bool {
    let ForwardReport {
        name,
        kind,
        action,
        attributes,
        dependencies,
        outcome,
    } = report;

    let (resource, failure) = match outcome {
        ForwardOutcome::Done(resource) => (resource, None),
        ForwardOutcome::Tainted(resource, error) => (resource, Some(error)),
        ForwardOutcome::Failed(error) => {
            warn!(resource = %name, %action, error = %error, "Action failed");
            run.result.add_failure(name, action, error.to_string());
            return false;
        }
    };
    let status = if failure.is_some() {
        ResourceStatus::Tainted
    } else {
        ResourceStatus::Ready
    };

    let message = match action {
        ActionType::Update => {
            if let Some(recorded) = run.state.get_mut(&name) {
                recorded.attributes = attributes;
                recorded.outputs.extend(resource.outputs);
                recorded.dependencies = dependencies;
                recorded.status = status;
                recorded.updated_at = chrono::Utc::now();
            }
            format!("updated {}", resource.id)
        }
        _ => {
            let mut state = ResourceState::new(resource.id.clone(), kind).with_status(status);
            state.attributes = attributes;
            state.outputs = resource.outputs;
            state.dependencies = dependencies;

            let message = match run.state.remove_resource(&name) {
                Some(previous) => {
                    state.deposed = previous.deposed.clone();
                    state.deposed.push(DeposedCopy {
                        id: previous.id.clone(),
                        kind: previous.kind,
                    });
                    let message = format!("replaced {} with {}", previous.id, resource.id);
                    run.previous.insert(name.clone(), previous);
                    message
                }
                None if action == ActionType::Replace => format!("re-created {}", resource.id),
                None => format!("created {}", resource.id),
            };
            run.state.set_resource(name.clone(), state);
            run.created.push(name.clone());
            message
        }
    };

    match failure {
        Some(error) => {
            warn!(resource = %name, error = %error, "Resource exists but is not ready; marked tainted");
            run.result.add_failure(name, action, error.to_string());
            false
        }
        None => {
            info!(resource = %name, %action, "{}", message);
            run.result.add_success(name, action, message);
            true
        }
    }
}

/// Fold a deletion into the snapshot. Returns whether it succeeded.
fn record_delete(run: &mut Run, job: &DeleteJob, result: Result<()>, mode: DeleteMode) -> bool {
    if let Err(error) = result {
        warn!(resource = %job.name, id = %job.id, error = %error, "Delete failed");
        run.result
            .add_failure(job.name.clone(), ActionType::Delete, error.to_string());
        return false;
    }

    if job.deposed {
        if let Some(recorded) = run.state.get_mut(&job.name) {
            recorded.deposed.retain(|c| c.id != job.id);
        }
        info!(resource = %job.name, id = %job.id, "Deleted old copy");
        run.result.add_success(
            job.name.clone(),
            ActionType::Delete,
            format!("deleted old copy {}", job.id),
        );
        return true;
    }

    let current = run.state.get(&job.name).is_some_and(|r| r.id == job.id);
    match mode {
        DeleteMode::Teardown => {
            if current {
                run.state.remove_resource(&job.name);
            }
            info!(resource = %job.name, id = %job.id, "Deleted");
            run.result.add_success(
                job.name.clone(),
                ActionType::Delete,
                format!("deleted {}", job.id),
            );
        }
        DeleteMode::Rollback => {
            let restorable = run.previous.remove(&job.name).filter(|previous| {
                run.state
                    .get(&job.name)
                    .is_some_and(|r| r.deposed.iter().any(|c| c.id == previous.id))
            });
            match restorable {
                Some(previous) => run.state.set_resource(job.name.clone(), previous),
                None if current => {
                    run.state.remove_resource(&job.name);
                }
                None => {}
            }
            info!(resource = %job.name, id = %job.id, "Rolled back");
            run.result.rolled_back.push(job.name.clone());
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler;
    use crate::simulator::SimulatedProvider;
    use gateflow_core::{Expr, ResourceDescriptor};
    use serde_json::json;

    fn chain() -> ResourceGraph {
        ResourceGraph::build(vec![
            ResourceDescriptor::new("a", ResourceKind::NotificationTopic).with("name", "a"),
            ResourceDescriptor::new("b", ResourceKind::TopicPolicy)
                .with("topic_arn", Expr::reference("a", "arn")),
            ResourceDescriptor::new("c", ResourceKind::EventTarget)
                .with("target_arn", Expr::reference("b", "arn")),
        ])
        .unwrap()
    }

    fn fast_config() -> ExecutorConfig {
        ExecutorConfig {
            parallelism: 4,
            retry: RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(100),
                backoff_multiplier: 2.0,
            },
            poll: PollConfig {
                timeout: Duration::from_secs(30),
                initial_interval: Duration::from_secs(1),
                max_interval: Duration::from_secs(5),
                multiplier: 2.0,
            },
            apply_timeout: None,
        }
    }

    async fn apply(
        provider: &Arc<SimulatedProvider>,
        graph: &ResourceGraph,
        snapshot: StateSnapshot,
        config: ExecutorConfig,
    ) -> ApplyOutcome {
        let plan = reconciler::plan(graph, &snapshot, provider.as_ref()).unwrap();
        Executor::new(provider.clone(), config)
            .apply(graph, &plan, snapshot, CancellationToken::new())
            .await
    }

    fn creates(log: &[String]) -> Vec<String> {
        log.iter()
            .filter_map(|l| l.strip_prefix("create:").map(str::to_string))
            .collect()
    }

    fn deletes(log: &[String]) -> Vec<String> {
        log.iter()
            .filter_map(|l| l.strip_prefix("delete:").map(str::to_string))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_creates_in_dependency_order() {
        let provider = Arc::new(SimulatedProvider::new());
        let outcome = apply(&provider, &chain(), StateSnapshot::new(), fast_config()).await;

        assert!(outcome.result.is_success());
        assert_eq!(creates(&provider.log()), vec!["a", "b", "c"]);
        assert_eq!(outcome.state.resources.len(), 3);

        // 参照は作成済みの値で解決される
        let a_arn = outcome.state.value("a", "arn").unwrap();
        assert_eq!(outcome.state.get("b").unwrap().attributes["topic_arn"], a_arn);
        assert!(outcome.state.get("c").unwrap().dependencies.contains("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reapply_makes_no_mutating_calls() {
        let provider = Arc::new(SimulatedProvider::new());
        let graph = chain();
        let first = apply(&provider, &graph, StateSnapshot::new(), fast_config()).await;
        let before = provider.calls();

        let second = apply(&provider, &graph, first.state.clone(), fast_config()).await;

        assert!(second.result.is_success());
        assert_eq!(provider.calls().mutating(), before.mutating());
        assert_eq!(second.state.resources, first.state.resources);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_reverses_create_order() {
        let provider = Arc::new(SimulatedProvider::new());
        let outcome = apply(&provider, &chain(), StateSnapshot::new(), fast_config()).await;

        let destroyed = Executor::new(provider.clone(), fast_config())
            .destroy(outcome.state, CancellationToken::new())
            .await;

        let log = provider.log();
        let mut reversed = creates(&log);
        reversed.reverse();
        assert_eq!(deletes(&log), reversed);
        assert!(destroyed.state.is_empty());
        assert_eq!(provider.resource_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let provider = Arc::new(SimulatedProvider::new());
        provider.fail_transiently("b", 2);

        let outcome = apply(&provider, &chain(), StateSnapshot::new(), fast_config()).await;

        assert!(outcome.result.is_success());
        assert_eq!(provider.calls().create, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_are_partial_apply() {
        let provider = Arc::new(SimulatedProvider::new());
        provider.fail_transiently("b", 10);

        let outcome = apply(&provider, &chain(), StateSnapshot::new(), fast_config()).await;

        // a は作成済み、b は失敗、c は未着手
        assert!(outcome.state.get("a").is_some());
        assert!(outcome.state.get("b").is_none());
        assert_eq!(outcome.result.skipped, vec!["c"]);
        assert!(
            outcome.result.failed[0]
                .error
                .as_deref()
                .unwrap()
                .contains("after 3 attempt(s)")
        );

        match outcome.into_result() {
            Err(CloudError::PartialApply {
                succeeded,
                failed,
                skipped,
            }) => {
                assert_eq!(succeeded, vec!["a"]);
                assert_eq!(failed[0].0, "b");
                assert_eq!(skipped, vec!["c"]);
            }
            other => panic!("expected partial apply, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_after_partial_apply() {
        let provider = Arc::new(SimulatedProvider::new());
        provider.reject("b", "InvalidParameter");
        let graph = chain();
        let first = apply(&provider, &graph, StateSnapshot::new(), fast_config()).await;
        assert!(!first.result.is_success());

        // 障害が解消したら続きから再開し、a は作り直さない
        let provider = Arc::new(SimulatedProvider::from_snapshot(&first.state));
        let second = apply(&provider, &graph, first.state, fast_config()).await;

        assert!(second.result.is_success());
        assert_eq!(creates(&provider.log()), vec!["b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallelism_is_bounded() {
        let provider = Arc::new(
            SimulatedProvider::new().with_latency(Duration::from_millis(100)),
        );
        let graph = ResourceGraph::build(
            (0..8)
                .map(|i| {
                    ResourceDescriptor::new(format!("topic_{i}"), ResourceKind::NotificationTopic)
                })
                .collect::<Vec<_>>(),
        )
        .unwrap();
        let config = ExecutorConfig {
            parallelism: 3,
            ..fast_config()
        };

        let outcome = apply(&provider, &graph, StateSnapshot::new(), config).await;

        assert!(outcome.result.is_success());
        assert_eq!(provider.max_in_flight(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_timeout_taints_resource() {
        let provider = Arc::new(SimulatedProvider::new());
        provider.never_ready("vm");
        let graph = ResourceGraph::build(vec![
            ResourceDescriptor::new("vm", ResourceKind::ComputeInstance).with("image_id", "ami-1"),
            ResourceDescriptor::new("disk", ResourceKind::BlockVolume)
                .with("availability_zone", Expr::reference("vm", "availability_zone")),
        ])
        .unwrap();

        let outcome = apply(&provider, &graph, StateSnapshot::new(), fast_config()).await;

        assert_eq!(outcome.state.get("vm").unwrap().status, ResourceStatus::Tainted);
        assert_eq!(outcome.result.skipped, vec!["disk"]);
        assert!(
            outcome.result.failed[0]
                .error
                .as_deref()
                .unwrap()
                .contains("Timed out")
        );

        // 次回は置き換え対象になる
        let plan = reconciler::plan(&graph, &outcome.state, provider.as_ref()).unwrap();
        assert_eq!(plan.action("vm").unwrap().action_type, ActionType::Replace);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_rolls_back_created_resources() {
        let provider = Arc::new(SimulatedProvider::new());
        provider.never_ready("vm");
        let graph = ResourceGraph::build(vec![
            ResourceDescriptor::new("role", ResourceKind::Role).with("name", "gw"),
            ResourceDescriptor::new("vm", ResourceKind::ComputeInstance).with("image_id", "ami-1"),
            ResourceDescriptor::new("disk", ResourceKind::BlockVolume)
                .with("availability_zone", Expr::reference("vm", "availability_zone")),
        ])
        .unwrap();
        let config = ExecutorConfig {
            apply_timeout: Some(Duration::from_secs(10)),
            ..fast_config()
        };

        let outcome = apply(&provider, &graph, StateSnapshot::new(), config).await;

        assert!(outcome.cancelled);
        assert!(outcome.state.is_empty());
        assert_eq!(provider.resource_count(), 0);
        let mut rolled_back = outcome.result.rolled_back.clone();
        rolled_back.sort();
        assert_eq!(rolled_back, vec!["role", "vm"]);
        assert!(matches!(outcome.into_result(), Err(CloudError::Cancelled(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_before_destroy_replacement() {
        let provider = Arc::new(SimulatedProvider::new());
        let build = |image: &str| {
            ResourceGraph::build(vec![
                ResourceDescriptor::new("vm", ResourceKind::ComputeInstance).with("image_id", image),
                ResourceDescriptor::new("disk", ResourceKind::BlockVolume)
                    .with("availability_zone", Expr::reference("vm", "availability_zone"))
                    .with("size", Expr::literal(json!(150))),
            ])
            .unwrap()
        };
        let first = apply(&provider, &build("ami-1"), StateSnapshot::new(), fast_config()).await;
        let old_vm = first.state.get("vm").unwrap().id.clone();

        let second = apply(&provider, &build("ami-2"), first.state, fast_config()).await;

        assert!(second.result.is_success(), "{:?}", second.result.failed);
        let log = provider.log();
        // 新しいコピーを先に作り、古いコピーは最後に削除する
        assert_eq!(
            &log[2..],
            &["create:vm", "create:disk", "delete:disk", "delete:vm"]
        );
        let vm = second.state.get("vm").unwrap();
        assert_ne!(vm.id, old_vm);
        assert!(vm.deposed.is_empty());
        assert_eq!(second.state.deposed_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_before_create_replacement() {
        let provider = Arc::new(SimulatedProvider::new());
        let build = |name: &str| {
            ResourceGraph::build(vec![
                ResourceDescriptor::new("role", ResourceKind::Role).with("name", name),
            ])
            .unwrap()
        };
        let first = apply(&provider, &build("gw"), StateSnapshot::new(), fast_config()).await;
        let second = apply(&provider, &build("gw-2"), first.state, fast_config()).await;

        assert!(second.result.is_success());
        assert_eq!(
            provider.log(),
            vec!["create:role", "delete:role", "create:role"]
        );
    }

    #[test]
    fn test_client_tokens_are_unique_per_name() {
        let run_id = Uuid::new_v4();
        let a = client_token(&run_id, "gateway_instance_secondary_a");
        let b = client_token(&run_id, "gateway_instance_secondary_b");

        assert_ne!(a, b);
        assert!(a.len() <= 64);
        // 同じ実行・同じ名前なら再送しても同じトークン
        assert_eq!(a, client_token(&run_id, "gateway_instance_secondary_a"));
        assert_ne!(a, client_token(&Uuid::new_v4(), "gateway_instance_secondary_a"));
    }

    fn role_and_policy(role_name: &str) -> ResourceGraph {
        ResourceGraph::build(vec![
            ResourceDescriptor::new("role", ResourceKind::Role).with("name", role_name),
            ResourceDescriptor::new("policy", ResourceKind::RolePolicy)
                .with("role_name", Expr::reference("role", "name")),
            ResourceDescriptor::new("sg", ResourceKind::SecurityGroup).with("name", "gw-sg"),
        ])
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_before_create_removes_dependents_first() {
        let provider = Arc::new(SimulatedProvider::new());
        let first = apply(&provider, &role_and_policy("gw"), StateSnapshot::new(), fast_config()).await;
        assert!(first.result.is_success());
        let created = provider.log().len();

        let second = apply(&provider, &role_and_policy("gw-2"), first.state, fast_config()).await;

        assert!(second.result.is_success(), "{:?}", second.result.failed);
        // ポリシーが残ったままロールは削除できない
        assert_eq!(
            &provider.log()[created..],
            &["delete:policy", "delete:role", "create:role", "create:policy"]
        );
        assert_eq!(
            second.state.get("policy").unwrap().attributes["role_name"],
            json!("gw-2")
        );
        assert_eq!(provider.resource_count(), 3);
        assert_eq!(second.state.deposed_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_pre_delete_keeps_replacements_from_starting() {
        let provider = Arc::new(SimulatedProvider::new());
        let first = apply(&provider, &role_and_policy("gw"), StateSnapshot::new(), fast_config()).await;
        let old_role = first.state.get("role").unwrap().id.clone();
        let created = provider.log().len();
        provider.reject("policy", "DeleteConflict");

        let second = apply(&provider, &role_and_policy("gw-2"), first.state, fast_config()).await;

        assert!(!second.result.is_success());
        assert!(provider.log()[created..].is_empty());
        assert_eq!(second.result.failed[0].resource, "policy");
        assert_eq!(second.result.skipped, vec!["role"]);
        assert_eq!(second.state.get("role").unwrap().id, old_role);
        assert!(second.state.get("policy").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_resource_is_deleted() {
        let provider = Arc::new(SimulatedProvider::new());
        let first = apply(&provider, &chain(), StateSnapshot::new(), fast_config()).await;

        let only_a = ResourceGraph::build(vec![
            ResourceDescriptor::new("a", ResourceKind::NotificationTopic).with("name", "a"),
        ])
        .unwrap();
        let second = apply(&provider, &only_a, first.state, fast_config()).await;

        assert!(second.result.is_success());
        assert_eq!(deletes(&provider.log()), vec!["c", "b"]);
        assert_eq!(second.state.resources.len(), 1);
    }
}
