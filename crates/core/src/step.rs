use crate::context::RuntimeContext;
use crate::contract::{AnyValue, Contract};
use crate::types::{RunId, StepId, StepResult, WorkflowId};
use anyhow::Context as _;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What a step hands back when it returns normally
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutput {
    /// The step finished and produced its output
    Complete(Value),
    /// The step paused; the payload describes what it needs to continue
    Suspend(Value),
}

/// An atomic unit of work in a workflow graph.
///
/// On resume a step is invoked again from the beginning with
/// [`StepContext::resume_data`] populated; implementations use its presence to
/// skip side effects they already performed before suspending.
#[async_trait::async_trait]
pub trait Step: Send + Sync {
    fn id(&self) -> &StepId;

    fn input_contract(&self) -> &dyn Contract {
        &AnyValue
    }

    fn output_contract(&self) -> &dyn Contract {
        &AnyValue
    }

    /// Contract for resume data; `None` accepts anything
    fn resume_contract(&self) -> Option<&dyn Contract> {
        None
    }

    /// Contract for suspend payloads; `None` accepts anything
    fn suspend_contract(&self) -> Option<&dyn Contract> {
        None
    }

    async fn execute(&self, ctx: StepContext) -> anyhow::Result<StepOutput>;
}

/// Everything a step can see while it runs
#[derive(Clone)]
pub struct StepContext {
    run_id: RunId,
    workflow_id: WorkflowId,
    step_id: StepId,
    input: Value,
    resume_data: Option<Value>,
    trigger_input: Arc<Value>,
    prior_results: Arc<BTreeMap<StepId, StepResult>>,
    runtime: Arc<RuntimeContext>,
    cancel: CancellationToken,
}

impl StepContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        run_id: RunId,
        workflow_id: WorkflowId,
        step_id: StepId,
        input: Value,
        resume_data: Option<Value>,
        trigger_input: Arc<Value>,
        prior_results: Arc<BTreeMap<StepId, StepResult>>,
        runtime: Arc<RuntimeContext>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            run_id,
            workflow_id,
            step_id,
            input,
            resume_data,
            trigger_input,
            prior_results,
            runtime,
            cancel,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn workflow_id(&self) -> &WorkflowId {
        &self.workflow_id
    }

    pub fn step_id(&self) -> &StepId {
        &self.step_id
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    pub fn input_as<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        T::deserialize(&self.input)
            .with_context(|| format!("Failed to decode input of step {}", self.step_id))
    }

    /// Present only when the step is re-entered after a suspension
    pub fn resume_data(&self) -> Option<&Value> {
        self.resume_data.as_ref()
    }

    pub fn resume_data_as<T: DeserializeOwned>(&self) -> anyhow::Result<Option<T>> {
        self.resume_data
            .as_ref()
            .map(|v| T::deserialize(v))
            .transpose()
            .with_context(|| format!("Failed to decode resume data of step {}", self.step_id))
    }

    pub fn is_resuming(&self) -> bool {
        self.resume_data.is_some()
    }

    /// The payload the run was started with
    pub fn trigger_input(&self) -> &Value {
        &self.trigger_input
    }

    pub fn trigger_input_as<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        T::deserialize(self.trigger_input.as_ref())
            .context("Failed to decode trigger input")
    }

    /// Output of an earlier step in this run, if it succeeded
    pub fn step_output(&self, step_id: &str) -> Option<&Value> {
        self.prior_results
            .get(&StepId::new(step_id))
            .and_then(|r| r.output())
    }

    pub fn runtime(&self) -> &RuntimeContext {
        &self.runtime
    }

    /// Fires when the enclosing run is cancelled
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn suspend(&self, payload: Value) -> StepOutput {
        StepOutput::Suspend(payload)
    }

    pub fn complete(&self, output: Value) -> StepOutput {
        StepOutput::Complete(output)
    }
}

type Handler =
    Arc<dyn Fn(StepContext) -> BoxFuture<'static, anyhow::Result<StepOutput>> + Send + Sync>;

/// A step backed by an async closure
#[derive(Clone)]
pub struct StepDefinition {
    id: StepId,
    input: Arc<dyn Contract>,
    output: Arc<dyn Contract>,
    resume: Option<Arc<dyn Contract>>,
    suspend: Option<Arc<dyn Contract>>,
    handler: Handler,
}

impl StepDefinition {
    pub fn new<F, Fut>(id: impl Into<String>, handler: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<StepOutput>> + Send + 'static,
    {
        Self {
            id: StepId::new(id),
            input: Arc::new(AnyValue),
            output: Arc::new(AnyValue),
            resume: None,
            suspend: None,
            handler: Arc::new(move |ctx| Box::pin(handler(ctx))),
        }
    }

    pub fn with_input(mut self, contract: impl Contract + 'static) -> Self {
        self.input = Arc::new(contract);
        self
    }

    pub fn with_output(mut self, contract: impl Contract + 'static) -> Self {
        self.output = Arc::new(contract);
        self
    }

    pub fn with_resume(mut self, contract: impl Contract + 'static) -> Self {
        self.resume = Some(Arc::new(contract));
        self
    }

    pub fn with_suspend(mut self, contract: impl Contract + 'static) -> Self {
        self.suspend = Some(Arc::new(contract));
        self
    }
}

#[async_trait::async_trait]
impl Step for StepDefinition {
    fn id(&self) -> &StepId {
        &self.id
    }

    fn input_contract(&self) -> &dyn Contract {
        self.input.as_ref()
    }

    fn output_contract(&self) -> &dyn Contract {
        self.output.as_ref()
    }

    fn resume_contract(&self) -> Option<&dyn Contract> {
        self.resume.as_deref()
    }

    fn suspend_contract(&self) -> Option<&dyn Contract> {
        self.suspend.as_deref()
    }

    async fn execute(&self, ctx: StepContext) -> anyhow::Result<StepOutput> {
        (self.handler)(ctx).await
    }
}

impl std::fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDefinition")
            .field("id", &self.id)
            .field("resumable", &self.resume.is_some())
            .finish()
    }
}
