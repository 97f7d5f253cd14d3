use super::graph::{StepIndex, WorkflowGraph};
use super::step_runner::{StepInvocation, StepRunner};
use crate::config::ExecutionConfig;
use crate::context::RuntimeContext;
use crate::error::{WorkflowError, WorkflowResult};
use crate::events::{Event, EventLog, EventType};
use crate::snapshot::{Snapshot, SnapshotError, SNAPSHOT_VERSION};
use crate::storage::{SnapshotStore, StoreError};
use crate::types::{
    ActivePaths, BranchProgress, RunId, RunResult, RunStatus, StepId, StepOutcome, StepResult,
    WorkflowId,
};
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

/// Error recorded on runs aborted by cancellation or timeout
pub const RUN_CANCELLED: &str = "run cancelled";

/// Builder for [`WorkflowEngine`]
pub struct EngineBuilder {
    store: Arc<dyn SnapshotStore>,
    event_log: Option<Arc<dyn EventLog>>,
    context: RuntimeContext,
    execution: ExecutionConfig,
}

impl EngineBuilder {
    pub fn runtime(mut self, context: RuntimeContext) -> Self {
        self.context = context;
        self
    }

    pub fn event_log(mut self, event_log: Arc<dyn EventLog>) -> Self {
        self.event_log = Some(event_log);
        self
    }

    pub fn execution(mut self, execution: ExecutionConfig) -> Self {
        self.execution = execution;
        self
    }

    pub fn build(self) -> WorkflowEngine {
        WorkflowEngine {
            inner: Arc::new(EngineInner {
                store: self.store,
                has_event_log: self.event_log.is_some(),
                runner: StepRunner::new(self.event_log, Arc::new(self.context)),
                execution: self.execution,
                run_locks: Mutex::new(HashMap::new()),
                active_runs: Mutex::new(HashMap::new()),
            }),
        }
    }
}

struct EngineInner {
    store: Arc<dyn SnapshotStore>,
    runner: StepRunner,
    has_event_log: bool,
    execution: ExecutionConfig,
    // Single writer per run id
    run_locks: Mutex<HashMap<RunId, Arc<AsyncMutex<()>>>>,
    // Track active runs for cancellation
    active_runs: Mutex<HashMap<RunId, CancellationToken>>,
}

/// Drives runs of committed workflows: dispatches steps, enforces join
/// barriers and persists snapshots on suspension and completion.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

/// Mutable execution state of one run
struct RunState {
    run_id: RunId,
    workflow_id: WorkflowId,
    trigger_input: Arc<Value>,
    steps: BTreeMap<StepId, StepResult>,
    active_paths: ActivePaths,
    status: RunStatus,
    output: Option<Value>,
    error: Option<String>,
}

impl RunState {
    fn new(run_id: RunId, workflow_id: WorkflowId, trigger_input: Value) -> Self {
        Self {
            run_id,
            workflow_id,
            trigger_input: Arc::new(trigger_input),
            steps: BTreeMap::new(),
            active_paths: ActivePaths::new(),
            status: RunStatus::Pending,
            output: None,
            error: None,
        }
    }

    fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            run_id: snapshot.run_id,
            workflow_id: snapshot.workflow_id,
            trigger_input: Arc::new(snapshot.trigger_input),
            steps: snapshot.steps,
            active_paths: snapshot.active_paths,
            status: snapshot.status,
            output: snapshot.result,
            error: snapshot.error,
        }
    }

    /// Only a `Suspended` result may be replaced
    fn record(&mut self, step_id: StepId, result: StepResult) {
        if let Some(existing) = self.steps.get(&step_id) {
            if !existing.is_suspended() {
                tracing::error!(
                    "Refusing to overwrite settled result of step {} in run {}",
                    step_id,
                    self.run_id
                );
                return;
            }
        }
        self.steps.insert(step_id, result);
    }

    fn fail(&mut self, error: String) {
        self.status = RunStatus::Failed;
        self.error = Some(error);
        self.active_paths.clear();
    }

    fn pending_steps(&self) -> Vec<StepId> {
        self.active_paths
            .values()
            .flat_map(|p| p.pending.iter().cloned())
            .collect()
    }

    fn to_snapshot(&self, definition_hash: &str) -> Snapshot {
        Snapshot {
            version: SNAPSHOT_VERSION,
            workflow_id: self.workflow_id.clone(),
            run_id: self.run_id,
            definition_hash: definition_hash.to_string(),
            status: self.status,
            trigger_input: self.trigger_input.as_ref().clone(),
            steps: self.steps.clone(),
            active_paths: self.active_paths.clone(),
            result: self.output.clone(),
            error: self.error.clone(),
            timestamp: Utc::now(),
        }
    }

    fn into_result(self) -> RunResult {
        RunResult {
            run_id: self.run_id,
            workflow_id: self.workflow_id,
            status: self.status,
            steps: self.steps,
            active_paths: self.active_paths,
            output: self.output,
            error: self.error,
        }
    }
}

impl WorkflowEngine {
    pub fn builder(store: Arc<dyn SnapshotStore>) -> EngineBuilder {
        EngineBuilder {
            store,
            event_log: None,
            context: RuntimeContext::new(),
            execution: ExecutionConfig::default(),
        }
    }

    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self::builder(store).build()
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.inner.store
    }

    pub fn has_event_log(&self) -> bool {
        self.inner.has_event_log
    }

    /// Create a fresh run bound to `graph`
    pub fn create_run(&self, graph: &WorkflowGraph) -> Run {
        self.attach(graph, RunId::new())
    }

    /// Handle for an existing run, e.g. after a process restart
    pub fn attach(&self, graph: &WorkflowGraph, run_id: RunId) -> Run {
        Run {
            engine: self.clone(),
            graph: graph.clone(),
            run_id,
        }
    }

    pub async fn resume(
        &self,
        graph: &WorkflowGraph,
        run_id: RunId,
        step_id: impl Into<StepId>,
        resume_data: Value,
    ) -> WorkflowResult<RunResult> {
        self.resume_with_cancellation(graph, run_id, step_id, resume_data, CancellationToken::new())
            .await
    }

    /// Re-enter a suspended run at `step_id` with `resume_data`.
    ///
    /// Fails with `NotFound` without touching the snapshot when the run is not
    /// suspended or the step does not hold a `Suspended` result.
    pub async fn resume_with_cancellation(
        &self,
        graph: &WorkflowGraph,
        run_id: RunId,
        step_id: impl Into<StepId>,
        resume_data: Value,
        cancel: CancellationToken,
    ) -> WorkflowResult<RunResult> {
        let step_id = step_id.into();
        let _guard = self.lock_run(run_id).await;

        let snapshot = self.load_snapshot(graph, run_id).await?;
        if !snapshot.is_suspended() {
            return Err(WorkflowError::NotFound(format!(
                "run {} is not suspended (status: {})",
                run_id, snapshot.status
            )));
        }

        let idx = graph.index_of(&step_id).ok_or_else(|| {
            WorkflowError::NotFound(format!(
                "step '{}' is not part of workflow {}",
                step_id,
                graph.id()
            ))
        })?;
        if !snapshot
            .steps
            .get(&step_id)
            .is_some_and(|result| result.is_suspended())
        {
            return Err(WorkflowError::NotFound(format!(
                "step '{}' of run {} is not suspended",
                step_id, run_id
            )));
        }

        if let Some(contract) = graph.step(idx).resume_contract() {
            contract.validate(&resume_data).map_err(|message| {
                WorkflowError::validation(format!("resume data for step '{}'", step_id), message)
            })?;
        }

        tracing::info!(
            "Resuming workflow execution: workflow={}, run_id={}, step={}",
            graph.id(),
            run_id,
            step_id
        );

        let mut state = RunState::from_snapshot(snapshot);
        self.emit(&state, EventType::RunResumed { step_id }).await;

        self.execute(graph, &mut state, Some((idx, resume_data)), cancel)
            .await;
        self.finish(graph, state).await
    }

    /// Persisted state of a run, without mutating anything
    pub async fn get_run(&self, graph: &WorkflowGraph, run_id: RunId) -> WorkflowResult<RunResult> {
        Ok(self.load_snapshot(graph, run_id).await?.into_run_result())
    }

    /// Cancel an in-flight run; returns whether a run was found
    pub fn cancel(&self, run_id: RunId) -> bool {
        let active_runs = self
            .inner
            .active_runs
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        match active_runs.get(&run_id) {
            Some(token) => {
                token.cancel();
                tracing::info!("Cancellation signal sent for run {}", run_id);
                true
            }
            None => false,
        }
    }

    async fn start_run(
        &self,
        graph: &WorkflowGraph,
        run_id: RunId,
        trigger_input: Value,
        cancel: CancellationToken,
    ) -> WorkflowResult<RunResult> {
        let _guard = self.lock_run(run_id).await;

        match self.inner.store.load(graph.id(), &run_id).await {
            Ok(_) => {
                return Err(WorkflowError::validation(
                    format!("run {}", run_id),
                    "run has already been started",
                ))
            }
            Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(store_error(e)),
        }

        graph
            .input_contract()
            .validate(&trigger_input)
            .map_err(|message| WorkflowError::validation("trigger input", message))?;

        tracing::info!(
            "Starting workflow execution: workflow={}, run_id={}",
            graph.id(),
            run_id
        );

        let mut state = RunState::new(run_id, graph.id().clone(), trigger_input.clone());
        self.emit(&state, EventType::RunStarted { trigger_input }).await;

        self.execute(graph, &mut state, None, cancel).await;
        self.finish(graph, state).await
    }

    async fn load_snapshot(&self, graph: &WorkflowGraph, run_id: RunId) -> WorkflowResult<Snapshot> {
        let snapshot = match self.inner.store.load(graph.id(), &run_id).await {
            Ok(snapshot) => snapshot,
            Err(StoreError::NotFound(_)) => {
                return Err(WorkflowError::NotFound(format!(
                    "run {} of workflow {}",
                    run_id,
                    graph.id()
                )))
            }
            Err(e) => return Err(store_error(e)),
        };

        if snapshot.definition_hash != graph.definition_hash() {
            return Err(WorkflowError::DefinitionMismatch {
                expected: graph.definition_hash().to_string(),
                found: snapshot.definition_hash,
            });
        }
        graph
            .check_step_ids(snapshot.steps.keys())
            .map_err(SnapshotError::Inconsistent)?;

        Ok(snapshot)
    }

    async fn execute(
        &self,
        graph: &WorkflowGraph,
        state: &mut RunState,
        resume: Option<(StepIndex, Value)>,
        cancel: CancellationToken,
    ) {
        // Timeouts cancel only this execution, never the caller's token
        let token = cancel.child_token();
        self.inner
            .active_runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(state.run_id, token.clone());

        let timer = self.inner.execution.run_timeout().map(|timeout| {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                token.cancel();
            })
        });

        // Also runs when the caller drops this future mid-execution
        let _registration = ActiveRun {
            inner: self.inner.clone(),
            run_id: state.run_id,
            timer,
            _cancel_on_drop: token.clone().drop_guard(),
        };

        state.status = RunStatus::Running;
        self.drive(graph, state, resume, &token).await;
    }

    /// Advance stage by stage until the run suspends, fails or completes
    async fn drive(
        &self,
        graph: &WorkflowGraph,
        state: &mut RunState,
        mut resume: Option<(StepIndex, Value)>,
        cancel: &CancellationToken,
    ) {
        for stage in graph.stages() {
            if cancel.is_cancelled() {
                self.cancelled(state).await;
                return;
            }

            let prior_results = Arc::new(state.steps.clone());
            let mut invocations = Vec::new();
            for &idx in stage.members() {
                let is_target = matches!(&resume, Some((target, _)) if *target == idx);
                let resume_data = if is_target {
                    resume.take().map(|(_, data)| data)
                } else {
                    None
                };

                // Settled results are reused; other suspended branches keep waiting
                let needs_run = match state.steps.get(graph.step_id(idx)) {
                    None => true,
                    Some(result) => result.is_suspended() && resume_data.is_some(),
                };
                if !needs_run {
                    continue;
                }

                invocations.push(StepInvocation {
                    run_id: state.run_id,
                    workflow_id: state.workflow_id.clone(),
                    step: graph.step(idx).clone(),
                    input: graph.assemble_input(idx, &state.trigger_input, &state.steps),
                    resume_data,
                    trigger_input: state.trigger_input.clone(),
                    prior_results: prior_results.clone(),
                    cancel: cancel.clone(),
                });
            }

            for (step_id, result) in self.dispatch(invocations).await {
                state.record(step_id, result);
            }

            if cancel.is_cancelled() {
                self.cancelled(state).await;
                return;
            }

            let mut progress = BranchProgress::default();
            let mut failure = None;
            for &idx in stage.members() {
                let step_id = graph.step_id(idx);
                match state.steps.get(step_id).map(|r| &r.outcome) {
                    Some(StepOutcome::Success { .. }) => {
                        progress.completed.insert(step_id.clone());
                    }
                    Some(StepOutcome::Suspended { .. }) => {
                        progress.pending.insert(step_id.clone());
                    }
                    Some(StepOutcome::Failed { error }) => {
                        failure.get_or_insert_with(|| (step_id.clone(), error.clone()));
                    }
                    None => {
                        failure.get_or_insert_with(|| {
                            (step_id.clone(), "step produced no result".to_string())
                        });
                    }
                }
            }

            if let Some((step_id, error)) = failure {
                state.fail(format!("Step {} failed: {}", step_id, error));
                return;
            }

            if !progress.pending.is_empty() {
                state.active_paths.insert(stage.id.clone(), progress);
                state.status = RunStatus::Suspended;
                return;
            }
            state.active_paths.remove(&stage.id);
        }

        let output = graph.final_output(&state.steps).and_then(|output| {
            graph
                .output_contract()
                .validate(&output)
                .map(|_| output)
                .map_err(|reason| format!("workflow output validation failed: {}", reason))
        });
        match output {
            Ok(output) => {
                state.status = RunStatus::Success;
                state.output = Some(output);
            }
            Err(error) => state.fail(error),
        }
    }

    /// Run every invocation of one stage on its own task and wait for all of
    /// them. A panicking step becomes a `Failed` result.
    async fn dispatch(&self, invocations: Vec<StepInvocation>) -> Vec<(StepId, StepResult)> {
        let limiter = self
            .inner
            .execution
            .max_parallel_branches
            .map(|n| Arc::new(Semaphore::new(n.max(1))));

        let (step_ids, handles): (Vec<_>, Vec<_>) = invocations
            .into_iter()
            .map(|invocation| {
                let inner = self.inner.clone();
                let limiter = limiter.clone();
                let step_id = invocation.step.id().clone();
                let handle = tokio::spawn(async move {
                    let _permit = match limiter {
                        Some(semaphore) => semaphore.acquire_owned().await.ok(),
                        None => None,
                    };
                    inner.runner.run(invocation).await
                });
                (step_id, handle)
            })
            .unzip();

        let joined = futures::future::join_all(handles).await;
        step_ids
            .into_iter()
            .zip(joined)
            .map(|(step_id, joined)| {
                let result = joined.unwrap_or_else(|e| {
                    tracing::error!("Branch task for step {} aborted: {}", step_id, e);
                    let now = Utc::now();
                    StepResult {
                        outcome: StepOutcome::Failed {
                            error: format!("step task aborted: {}", e),
                        },
                        started_at: now,
                        ended_at: now,
                        resumed_with: None,
                    }
                });
                (step_id, result)
            })
            .collect()
    }

    async fn cancelled(&self, state: &mut RunState) {
        tracing::warn!("Workflow execution cancelled: run_id={}", state.run_id);
        state.fail(RUN_CANCELLED.to_string());
        self.emit(
            state,
            EventType::RunCancelled {
                reason: RUN_CANCELLED.to_string(),
            },
        )
        .await;
    }

    /// Persist the outcome, then report it
    async fn finish(&self, graph: &WorkflowGraph, state: RunState) -> WorkflowResult<RunResult> {
        let snapshot = state.to_snapshot(graph.definition_hash());
        if let Err(e) = self
            .inner
            .store
            .save(&state.workflow_id, &state.run_id, &snapshot)
            .await
        {
            tracing::error!(
                "Failed to persist {} snapshot for run {}: {}",
                state.status,
                state.run_id,
                e
            );
            return Err(store_error(e));
        }

        let event_type = match state.status {
            RunStatus::Suspended => {
                let pending = state.pending_steps();
                tracing::info!(
                    "Workflow execution suspended: run_id={}, pending={:?}",
                    state.run_id,
                    pending
                );
                EventType::RunSuspended { pending }
            }
            RunStatus::Success => {
                tracing::info!("Workflow execution completed: run_id={}", state.run_id);
                EventType::RunSucceeded {
                    output: state.output.clone().unwrap_or(Value::Null),
                }
            }
            _ => {
                let error = state.error.clone().unwrap_or_default();
                tracing::error!(
                    "Workflow execution failed: run_id={}, error={}",
                    state.run_id,
                    error
                );
                EventType::RunFailed { error }
            }
        };
        self.emit(&state, event_type).await;

        Ok(state.into_result())
    }

    async fn emit(&self, state: &RunState, event_type: EventType) {
        self.inner
            .runner
            .emit(Event::new(state.workflow_id.clone(), state.run_id, event_type))
            .await;
    }

    async fn lock_run(&self, run_id: RunId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .inner
                .run_locks
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(run_id).or_default().clone()
        };
        lock.lock_owned().await
    }
}

fn store_error(e: StoreError) -> WorkflowError {
    match e {
        StoreError::Snapshot(e) => WorkflowError::Snapshot(e),
        other => WorkflowError::Persistence(other),
    }
}

/// Registration of an executing run; unregisters it and stops its branch
/// tasks when dropped
struct ActiveRun {
    inner: Arc<EngineInner>,
    run_id: RunId,
    timer: Option<JoinHandle<()>>,
    _cancel_on_drop: DropGuard,
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.inner
            .active_runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.run_id);
    }
}

/// One execution instance of a workflow
#[derive(Clone)]
pub struct Run {
    engine: WorkflowEngine,
    graph: WorkflowGraph,
    run_id: RunId,
}

impl Run {
    pub fn id(&self) -> RunId {
        self.run_id
    }

    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    pub async fn start(&self, trigger_input: Value) -> WorkflowResult<RunResult> {
        self.start_with_cancellation(trigger_input, CancellationToken::new())
            .await
    }

    /// Start the run; cancelling `cancel` fails it with a cancellation error
    pub async fn start_with_cancellation(
        &self,
        trigger_input: Value,
        cancel: CancellationToken,
    ) -> WorkflowResult<RunResult> {
        self.engine
            .start_run(&self.graph, self.run_id, trigger_input, cancel)
            .await
    }

    pub async fn resume(
        &self,
        step_id: impl Into<StepId>,
        resume_data: Value,
    ) -> WorkflowResult<RunResult> {
        self.engine
            .resume(&self.graph, self.run_id, step_id, resume_data)
            .await
    }

    /// Last persisted state of this run
    pub async fn result(&self) -> WorkflowResult<RunResult> {
        self.engine.get_run(&self.graph, self.run_id).await
    }

    pub fn cancel(&self) -> bool {
        self.engine.cancel(self.run_id)
    }
}
