//! Executor: bounded concurrent apply of a plan against the providers.
//!
//! A single scheduler loop owns all bookkeeping: it dispatches ready steps
//! into a `JoinSet` (at most `max_in_flight` at once), binds references from
//! the outputs it has seen so far, and is the only writer of state records.
//! Workers only await provider calls.
//!
//! A step is dispatched once every step it waits on has succeeded. Deletes
//! additionally wait until no create/update/lookup step is still pending or
//! running. When a step fails, everything waiting on it (transitively) is
//! skipped; `stop_on_first` also halts all other new dispatch.

use super::diff::fingerprint;
use super::error::{ExecError, ProviderError};
use super::graph::ImportedStacks;
use super::planner::PreparedStack;
use super::resolver::{bind_references, OutputIndex};
use super::retry::{with_retry, RetryNote};
use super::types::*;
use crate::provenance::eventlog;
use crate::provider::{ProviderRegistry, ResourceProvider};
use crate::state::{ApplyLease, StateStore};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::Instrument;

/// Cooperative cancellation: stops new dispatch, in-flight steps finish.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Settings for one apply run.
#[derive(Debug, Clone)]
pub struct ApplyOptions {
    pub max_in_flight: usize,
    pub failure: FailurePolicy,
    pub retry: RetryPolicy,
    pub operation_timeout: Duration,
    /// `policy.event_log`; events are written only when a directory is set too
    pub event_log: bool,
    /// Write provenance events under `<dir>/<stack>/events.jsonl`
    pub event_log_dir: Option<PathBuf>,
    pub cancel: CancelToken,
}

impl ApplyOptions {
    pub fn from_policy(policy: &Policy) -> Self {
        Self {
            max_in_flight: policy.max_in_flight.max(1),
            failure: policy.failure,
            retry: policy.retry.clone(),
            operation_timeout: Duration::from_secs(policy.operation_timeout_secs.max(1)),
            event_log: policy.event_log,
            event_log_dir: None,
            cancel: CancelToken::new(),
        }
    }

    /// Enable the event log (builder style).
    pub fn with_event_log(mut self, dir: impl Into<PathBuf>) -> Self {
        self.event_log_dir = Some(dir.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self::from_policy(&Policy::default())
    }
}

/// Machine-readable plan lines, without touching providers or state.
pub fn dry_run(plan: &Plan) -> Vec<PlanEntry> {
    for step in &plan.steps {
        tracing::info!(
            stack = %plan.stack,
            resource = %step.logical_id,
            operation = %step.operation,
            "dry run"
        );
    }
    plan.entries()
}

/// Apply a prepared stack.
///
/// Returns `Err` only for problems detected before any provider call
/// (stale plan, missing provider, unknown step, lease conflict). Every
/// per-resource failure is reported in the returned `ApplyReport`.
pub async fn apply(
    prepared: &PreparedStack,
    imports: &ImportedStacks,
    providers: &ProviderRegistry,
    store: &dyn StateStore,
    options: &ApplyOptions,
) -> Result<ApplyReport, ExecError> {
    let started = Instant::now();
    let plan = &prepared.plan;

    let state = store.load(&plan.stack)?;
    if state.version != plan.base_version {
        return Err(ExecError::StalePlan {
            planned: plan.base_version,
            actual: state.version,
        });
    }
    preflight(prepared, &state, providers)?;

    let lease = store.begin_apply(&plan.stack, plan.base_version)?;
    let mut run = Run::new(prepared, state, imports, providers, store, options, lease);

    tracing::info!(
        stack = %plan.stack,
        run_id = %run.run_id,
        steps = plan.steps.len(),
        max_in_flight = options.max_in_flight,
        "apply started"
    );
    run.emit(ProvenanceEvent::ApplyStarted {
        stack: plan.stack.clone(),
        run_id: run.run_id.clone(),
        base_version: plan.base_version,
        strata_version: env!("CARGO_PKG_VERSION").to_string(),
    });

    run.drive().await;
    Ok(run.finish(started))
}

/// Whether deleting `logical_id` calls the provider (vs. only forgetting state).
fn deletes_at_provider(
    stack: &Stack,
    records: &BTreeMap<String, DeployedRecord>,
    logical_id: &str,
) -> bool {
    let Some(record) = records.get(logical_id) else {
        return false;
    };
    let retained_now = stack
        .resource(logical_id)
        .is_some_and(|r| r.removal_policy == RemovalPolicy::Retain);
    record.owned_by_provider_delete() && !retained_now
}

/// Every step must be known and every provider call must have a provider.
fn preflight(
    prepared: &PreparedStack,
    state: &StackState,
    providers: &ProviderRegistry,
) -> Result<(), ExecError> {
    for step in &prepared.plan.steps {
        let id = &step.logical_id;
        match step.operation {
            Operation::NoOp => continue,
            Operation::Delete => {
                if !state.records.contains_key(id) {
                    return Err(ExecError::UnknownStep(id.clone()));
                }
                if !deletes_at_provider(&prepared.stack, &state.records, id) {
                    continue;
                }
            }
            Operation::Create | Operation::Update | Operation::Lookup => {
                if prepared.stack.resource(id).is_none() {
                    return Err(ExecError::UnknownStep(id.clone()));
                }
            }
        }
        if !providers.contains(&step.kind) {
            return Err(ExecError::MissingProvider {
                kind: step.kind.to_string(),
                resource: id.clone(),
            });
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

/// Provider work for one step.
enum Action {
    Create(Properties),
    Update(String, Properties),
    Delete(String),
    Lookup(Properties),
}

struct Job {
    index: usize,
    resource: String,
    provider: Arc<dyn ResourceProvider>,
    action: Action,
}

enum Effect {
    Applied {
        provider_id: String,
        outputs: Outputs,
        adopted: bool,
    },
    Deleted,
}

/// What a worker hands back to the scheduler.
struct StepRun {
    index: usize,
    result: Result<Effect, ExecError>,
    attempts: u32,
    retries: Vec<RetryNote>,
    duration_seconds: f64,
}

/// Scheduler state for one apply.
struct Run<'a> {
    prepared: &'a PreparedStack,
    providers: &'a ProviderRegistry,
    store: &'a dyn StateStore,
    options: &'a ApplyOptions,
    lease: ApplyLease,
    run_id: String,
    records: BTreeMap<String, DeployedRecord>,
    outputs: OutputIndex,
    position: FxHashMap<String, usize>,
    slots: Vec<Slot>,
    outcomes: Vec<Option<StepOutcome>>,
    forward_pending: usize,
    stopped: bool,
}

impl<'a> Run<'a> {
    fn new(
        prepared: &'a PreparedStack,
        state: StackState,
        imports: &ImportedStacks,
        providers: &'a ProviderRegistry,
        store: &'a dyn StateStore,
        options: &'a ApplyOptions,
        lease: ApplyLease,
    ) -> Self {
        let steps = &prepared.plan.steps;
        let mut outputs = imports.output_index();
        for (id, record) in &state.records {
            outputs.insert(id.clone(), record.outputs.clone());
        }
        Self {
            prepared,
            providers,
            store,
            options,
            lease,
            run_id: eventlog::generate_run_id(),
            records: state.records,
            outputs,
            position: steps
                .iter()
                .enumerate()
                .map(|(i, s)| (s.logical_id.clone(), i))
                .collect(),
            slots: vec![Slot::Pending; steps.len()],
            outcomes: vec![None; steps.len()],
            forward_pending: steps
                .iter()
                .filter(|s| s.operation != Operation::Delete)
                .count(),
            stopped: false,
        }
    }

    fn stack_name(&self) -> &str {
        &self.prepared.plan.stack
    }

    fn emit(&self, event: ProvenanceEvent) {
        let Some(ref dir) = self.options.event_log_dir else {
            return;
        };
        if !self.options.event_log {
            return;
        }
        if let Err(e) = eventlog::append_event(dir, self.stack_name(), event) {
            tracing::warn!(stack = %self.stack_name(), error = %e, "cannot append event");
        }
    }

    fn halted(&self) -> bool {
        self.stopped || self.options.cancel.is_cancelled()
    }

    fn slot_of(&self, logical_id: &str) -> Option<Slot> {
        self.position.get(logical_id).map(|&i| self.slots[i])
    }

    /// First awaited step that failed, or was skipped because of a failure.
    ///
    /// Steps behind a cancelled or stopped skip return `None` and take the
    /// halt reason in `skip_remaining`.
    fn failed_dependency(&self, step: &PlannedStep) -> Option<String> {
        step.waits_on
            .iter()
            .find(|d| self.failure_upstream(d))
            .cloned()
    }

    fn failure_upstream(&self, logical_id: &str) -> bool {
        let Some(&index) = self.position.get(logical_id) else {
            return false;
        };
        match self.slots[index] {
            Slot::Failed => true,
            Slot::Skipped => matches!(
                self.outcomes[index].as_ref().map(|o| &o.status),
                Some(StepStatus::Skipped {
                    reason: SkipReason::DependencyFailed { .. }
                })
            ),
            _ => false,
        }
    }

    fn is_ready(&self, step: &PlannedStep) -> bool {
        let awaited_done = step
            .waits_on
            .iter()
            .all(|d| matches!(self.slot_of(d), Some(Slot::Succeeded) | None));
        let phase_open = step.operation != Operation::Delete || self.forward_pending == 0;
        awaited_done && phase_open
    }

    async fn drive(&mut self) {
        let mut tasks: JoinSet<StepRun> = JoinSet::new();
        loop {
            self.dispatch(&mut tasks);
            let Some(joined) = tasks.join_next().await else {
                break;
            };
            match joined {
                Ok(run) => self.complete(run),
                Err(e) => {
                    tracing::error!(stack = %self.stack_name(), error = %e, "worker lost");
                    self.stopped = true;
                }
            }
        }
        self.skip_remaining();
    }

    /// Dispatch every ready step, settling inline work until nothing moves.
    fn dispatch(&mut self, tasks: &mut JoinSet<StepRun>) {
        let prepared = self.prepared;
        loop {
            let mut progressed = false;
            for (index, step) in prepared.plan.steps.iter().enumerate() {
                if self.slots[index] != Slot::Pending {
                    continue;
                }
                if let Some(dependency) = self.failed_dependency(step) {
                    self.skip(index, SkipReason::DependencyFailed { dependency });
                    progressed = true;
                    continue;
                }
                if self.halted() || !self.is_ready(step) {
                    continue;
                }

                match step.operation {
                    Operation::NoOp => {
                        self.succeed(index, 0, 0.0);
                        progressed = true;
                    }
                    Operation::Delete
                        if !deletes_at_provider(&prepared.stack, &self.records, &step.logical_id) =>
                    {
                        self.forget(index);
                        progressed = true;
                    }
                    _ => {
                        if tasks.len() >= self.options.max_in_flight {
                            continue;
                        }
                        match self.job_for(index, step) {
                            Ok(job) => self.spawn(tasks, step, job),
                            Err(e) => self.fail(index, e, 0, 0.0),
                        }
                        progressed = true;
                    }
                }
            }
            if !progressed {
                break;
            }
        }
    }

    fn spawn(&mut self, tasks: &mut JoinSet<StepRun>, step: &PlannedStep, job: Job) {
        tracing::info!(
            stack = %self.stack_name(),
            resource = %step.logical_id,
            operation = %step.operation,
            "dispatching"
        );
        self.emit(ProvenanceEvent::OperationStarted {
            stack: self.stack_name().to_string(),
            resource: step.logical_id.clone(),
            operation: step.operation,
        });
        self.slots[job.index] = Slot::Running;
        let retry = self.options.retry.clone();
        let timeout = self.options.operation_timeout;
        let (index, resource) = (job.index, job.resource.clone());
        let span = tracing::info_span!(
            "step",
            stack = %self.stack_name(),
            resource = %step.logical_id,
            operation = %step.operation
        );
        let work = execute(job, retry, timeout).instrument(span);
        tasks.spawn(supervise(index, resource, work));
    }

    /// Build the provider work for a step, binding references now.
    fn job_for(&self, index: usize, step: &PlannedStep) -> Result<Job, ExecError> {
        let id = &step.logical_id;
        let provider = self
            .providers
            .get(&step.kind)
            .ok_or_else(|| ExecError::MissingProvider {
                kind: step.kind.to_string(),
                resource: id.clone(),
            })?;
        let bound = || -> Result<Properties, ExecError> {
            let resource = self
                .prepared
                .stack
                .resource(id)
                .ok_or_else(|| ExecError::UnknownStep(id.clone()))?;
            bind_references(resource, &self.outputs)
        };
        let record = || {
            self.records
                .get(id)
                .ok_or_else(|| ExecError::UnknownStep(id.clone()))
        };

        let action = match step.operation {
            Operation::Create => Action::Create(bound()?),
            Operation::Lookup => Action::Lookup(bound()?),
            Operation::Update => {
                let record = record()?;
                if record.adopted {
                    Action::Lookup(bound()?)
                } else {
                    Action::Update(record.provider_id.clone(), bound()?)
                }
            }
            Operation::Delete => Action::Delete(record()?.provider_id.clone()),
            Operation::NoOp => return Err(ExecError::UnknownStep(id.clone())),
        };
        Ok(Job {
            index,
            resource: id.clone(),
            provider,
            action,
        })
    }

    /// Commit a finished worker's result.
    fn complete(&mut self, run: StepRun) {
        let step = &self.prepared.plan.steps[run.index];
        for note in &run.retries {
            self.emit(ProvenanceEvent::OperationRetried {
                stack: self.stack_name().to_string(),
                resource: step.logical_id.clone(),
                attempt: note.attempt,
                backoff_ms: note.backoff_ms,
                error: note.error.clone(),
            });
        }

        let committed = match run.result {
            Ok(Effect::Applied {
                provider_id,
                outputs,
                adopted,
            }) => self.commit_applied(step, provider_id, outputs, adopted),
            Ok(Effect::Deleted) => self.commit_removed(step),
            Err(e) => Err(e),
        };

        match committed {
            Ok(()) => self.succeed(run.index, run.attempts, run.duration_seconds),
            Err(e) => {
                if matches!(e, ExecError::State(_)) {
                    self.stopped = true;
                }
                self.fail(run.index, e, run.attempts, run.duration_seconds);
            }
        }
    }

    fn commit_applied(
        &mut self,
        step: &PlannedStep,
        provider_id: String,
        outputs: Outputs,
        adopted: bool,
    ) -> Result<(), ExecError> {
        let prepared = self.prepared;
        let id = &step.logical_id;
        let resource = prepared
            .stack
            .resource(id)
            .ok_or_else(|| ExecError::UnknownStep(id.clone()))?;
        let fp = fingerprint(resource);
        let record = DeployedRecord {
            stack: self.stack_name().to_string(),
            logical_id: id.clone(),
            kind: step.kind.clone(),
            provider_id,
            property_hash: fp.hash,
            key_hashes: fp.key_hashes,
            outputs,
            dependencies: prepared
                .graph
                .dependencies_of(id)
                .map(str::to_string)
                .collect(),
            removal_policy: resource.removal_policy,
            adopted,
            applied_at: eventlog::now_iso8601(),
        };
        self.store.put_record(&mut self.lease, &record)?;
        self.outputs.insert(id.clone(), record.outputs.clone());
        self.records.insert(id.clone(), record);
        Ok(())
    }

    fn commit_removed(&mut self, step: &PlannedStep) -> Result<(), ExecError> {
        self.store
            .remove_record(&mut self.lease, &step.logical_id)?;
        self.outputs.remove(&step.logical_id);
        self.records.remove(&step.logical_id);
        Ok(())
    }

    /// Delete that only drops the state record (retained or adopted).
    fn forget(&mut self, index: usize) {
        let step = &self.prepared.plan.steps[index];
        tracing::info!(
            stack = %self.stack_name(),
            resource = %step.logical_id,
            "forgetting record, provider resource retained"
        );
        match self.commit_removed(step) {
            Ok(()) => self.succeed(index, 0, 0.0),
            Err(e) => {
                self.stopped = true;
                self.fail(index, e, 0, 0.0);
            }
        }
    }

    fn settle(&mut self, index: usize, slot: Slot, status: StepStatus, attempts: u32, secs: f64) {
        let step = &self.prepared.plan.steps[index];
        if step.operation != Operation::Delete {
            self.forward_pending = self.forward_pending.saturating_sub(1);
        }
        self.slots[index] = slot;
        self.outcomes[index] = Some(StepOutcome {
            logical_id: step.logical_id.clone(),
            operation: step.operation,
            status,
            attempts,
            duration_seconds: secs,
        });
    }

    fn succeed(&mut self, index: usize, attempts: u32, secs: f64) {
        let step = &self.prepared.plan.steps[index];
        if step.operation.is_change() {
            let hash = self
                .records
                .get(&step.logical_id)
                .map(|r| r.property_hash.clone())
                .unwrap_or_default();
            tracing::info!(
                stack = %self.stack_name(),
                resource = %step.logical_id,
                operation = %step.operation,
                attempts,
                duration_seconds = secs,
                "operation succeeded"
            );
            self.emit(ProvenanceEvent::OperationSucceeded {
                stack: self.stack_name().to_string(),
                resource: step.logical_id.clone(),
                operation: step.operation,
                attempts,
                duration_seconds: secs,
                hash,
            });
        }
        self.settle(index, Slot::Succeeded, StepStatus::Succeeded, attempts, secs);
    }

    fn fail(&mut self, index: usize, error: ExecError, attempts: u32, secs: f64) {
        let step = &self.prepared.plan.steps[index];
        tracing::error!(
            stack = %self.stack_name(),
            resource = %step.logical_id,
            operation = %step.operation,
            attempts,
            error = %error,
            "operation failed"
        );
        self.emit(ProvenanceEvent::OperationFailed {
            stack: self.stack_name().to_string(),
            resource: step.logical_id.clone(),
            attempts,
            error: error.to_string(),
        });
        if self.options.failure == FailurePolicy::StopOnFirst {
            self.stopped = true;
        }
        let status = StepStatus::Failed {
            error: error.to_string(),
        };
        self.settle(index, Slot::Failed, status, attempts, secs);
    }

    fn skip(&mut self, index: usize, reason: SkipReason) {
        let step = &self.prepared.plan.steps[index];
        tracing::warn!(
            stack = %self.stack_name(),
            resource = %step.logical_id,
            reason = %reason,
            "operation skipped"
        );
        self.emit(ProvenanceEvent::OperationSkipped {
            stack: self.stack_name().to_string(),
            resource: step.logical_id.clone(),
            reason: reason.clone(),
        });
        self.settle(index, Slot::Skipped, StepStatus::Skipped { reason }, 0, 0.0);
    }

    /// Everything never dispatched ends skipped.
    fn skip_remaining(&mut self) {
        let prepared = self.prepared;
        for (index, step) in prepared.plan.steps.iter().enumerate() {
            if !matches!(self.slots[index], Slot::Pending | Slot::Running) {
                continue;
            }
            let reason = match self.failed_dependency(step) {
                Some(dependency) => SkipReason::DependencyFailed { dependency },
                None if self.options.cancel.is_cancelled() => SkipReason::Cancelled,
                None => SkipReason::Stopped,
            };
            self.skip(index, reason);
        }
    }

    fn finish(mut self, started: Instant) -> ApplyReport {
        let stack = self.stack_name().to_string();
        let lease = self.lease.clone();
        if let Err(e) = self.store.finish_apply(lease) {
            tracing::error!(stack = %stack, error = %e, "cannot release state lease");
        }

        let outcomes: Vec<StepOutcome> = std::mem::take(&mut self.outcomes)
            .into_iter()
            .flatten()
            .collect();
        let report = ApplyReport {
            stack: stack.clone(),
            run_id: self.run_id.clone(),
            outcomes,
            total_seconds: started.elapsed().as_secs_f64(),
        };
        let (succeeded, failed, skipped) = (
            report.succeeded().len() as u32,
            report.failed().len() as u32,
            report.skipped().len() as u32,
        );
        tracing::info!(
            stack = %stack,
            run_id = %report.run_id,
            succeeded,
            failed,
            skipped,
            total_seconds = report.total_seconds,
            "apply completed"
        );
        self.emit(ProvenanceEvent::ApplyCompleted {
            stack,
            run_id: report.run_id.clone(),
            succeeded,
            failed,
            skipped,
            total_seconds: report.total_seconds,
        });
        report
    }
}

/// Run a worker in its own task so a panicking provider fails only its step.
async fn supervise<F>(index: usize, resource: String, work: F) -> StepRun
where
    F: Future<Output = StepRun> + Send + 'static,
{
    match tokio::spawn(work).await {
        Ok(run) => run,
        Err(e) => StepRun {
            index,
            result: Err(ExecError::Provider {
                resource,
                source: ProviderError::Permanent(format!("provider task aborted: {}", e)),
            }),
            attempts: 1,
            retries: Vec::new(),
            duration_seconds: 0.0,
        },
    }
}

/// Exhausted transient errors become `OperationFailed`, permanent ones `Provider`.
fn classify(resource: String, attempts: u32, error: ProviderError) -> ExecError {
    if error.is_transient() {
        ExecError::OperationFailed {
            resource,
            attempts,
            last: error,
        }
    } else {
        ExecError::Provider {
            resource,
            source: error,
        }
    }
}

async fn execute(job: Job, retry: RetryPolicy, timeout: Duration) -> StepRun {
    let started = Instant::now();
    let Job {
        index,
        resource,
        provider,
        action,
    } = job;
    let provider = provider.as_ref();

    let (result, attempts, retries) = match action {
        Action::Create(props) => {
            let a = with_retry(&retry, timeout, || provider.create(&props)).await;
            let result = a.result.map(|c| Effect::Applied {
                provider_id: c.provider_id,
                outputs: c.outputs,
                adopted: false,
            });
            (result, a.attempts, a.retries)
        }
        Action::Update(provider_id, props) => {
            let a = with_retry(&retry, timeout, || provider.update(&provider_id, &props)).await;
            let result = a.result.map(|outputs| Effect::Applied {
                provider_id: provider_id.clone(),
                outputs,
                adopted: false,
            });
            (result, a.attempts, a.retries)
        }
        Action::Delete(provider_id) => {
            let a = with_retry(&retry, timeout, || provider.delete(&provider_id)).await;
            (a.result.map(|()| Effect::Deleted), a.attempts, a.retries)
        }
        Action::Lookup(props) => {
            let found = with_retry(&retry, timeout, || provider.lookup(&props)).await;
            match found.result {
                Ok(Some(c)) => {
                    tracing::info!(resource = %resource, provider_id = %c.provider_id, "adopted existing resource");
                    let result = Ok(Effect::Applied {
                        provider_id: c.provider_id,
                        outputs: c.outputs,
                        adopted: true,
                    });
                    (result, found.attempts, found.retries)
                }
                Ok(None) => {
                    let created = with_retry(&retry, timeout, || provider.create(&props)).await;
                    let result = created.result.map(|c| Effect::Applied {
                        provider_id: c.provider_id,
                        outputs: c.outputs,
                        adopted: false,
                    });
                    let mut retries = found.retries;
                    retries.extend(created.retries);
                    (result, found.attempts + created.attempts, retries)
                }
                Err(e) => (Err(e), found.attempts, found.retries),
            }
        }
    };

    StepRun {
        index,
        result: result.map_err(|e| classify(resource, attempts, e)),
        attempts,
        retries,
        duration_seconds: started.elapsed().as_secs_f64(),
    }
}
