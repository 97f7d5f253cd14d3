use crate::context::RuntimeContext;
use crate::events::{Event, EventLog, EventType};
use crate::step::{Step, StepContext, StepOutput};
use crate::types::{RunId, StepId, StepOutcome, StepResult, WorkflowId};
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Error text recorded on steps aborted by run cancellation
pub(crate) const STEP_CANCELLED: &str = "step cancelled";

/// One scheduled invocation of a step
pub(crate) struct StepInvocation {
    pub run_id: RunId,
    pub workflow_id: WorkflowId,
    pub step: Arc<dyn Step>,
    /// Assembled input, or the reason it could not be assembled
    pub input: Result<Value, String>,
    pub resume_data: Option<Value>,
    pub trigger_input: Arc<Value>,
    pub prior_results: Arc<BTreeMap<StepId, StepResult>>,
    pub cancel: CancellationToken,
}

/// Runs a single step and turns whatever happens into a `StepResult`
pub(crate) struct StepRunner {
    event_log: Option<Arc<dyn EventLog>>,
    context: Arc<RuntimeContext>,
}

impl StepRunner {
    pub fn new(event_log: Option<Arc<dyn EventLog>>, context: Arc<RuntimeContext>) -> Self {
        Self { event_log, context }
    }

    pub async fn run(&self, invocation: StepInvocation) -> StepResult {
        let StepInvocation {
            run_id,
            workflow_id,
            step,
            input,
            resume_data,
            trigger_input,
            prior_results,
            cancel,
        } = invocation;
        let step_id = step.id().clone();
        let resuming = resume_data.is_some();

        tracing::debug!(
            "Executing step {} for run {} (resuming: {})",
            step_id,
            run_id,
            resuming
        );
        self.emit(Event::new(
            workflow_id.clone(),
            run_id,
            EventType::StepStarted {
                step_id: step_id.clone(),
                resuming,
            },
        ))
        .await;

        let started_at = Utc::now();
        let start = std::time::Instant::now();

        let outcome = match input {
            Err(reason) => StepOutcome::Failed {
                error: format!("input unavailable: {}", reason),
            },
            Ok(input) => match step.input_contract().validate(&input) {
                Err(reason) => StepOutcome::Failed {
                    error: format!("input validation failed: {}", reason),
                },
                Ok(()) => {
                    let ctx = StepContext::new(
                        run_id,
                        workflow_id.clone(),
                        step_id.clone(),
                        input,
                        resume_data.clone(),
                        trigger_input,
                        prior_results,
                        self.context.clone(),
                        cancel.clone(),
                    );
                    self.execute(step.as_ref(), ctx, &cancel).await
                }
            },
        };

        let ended_at = Utc::now();
        let event_type = match &outcome {
            StepOutcome::Success { .. } => EventType::StepSucceeded {
                step_id: step_id.clone(),
                duration_ms: start.elapsed().as_millis() as u64,
            },
            StepOutcome::Suspended { payload } => {
                tracing::info!("Step {} suspended in run {}", step_id, run_id);
                EventType::StepSuspended {
                    step_id: step_id.clone(),
                    payload: payload.clone(),
                }
            }
            StepOutcome::Failed { error } => {
                tracing::warn!("Step {} failed in run {}: {}", step_id, run_id, error);
                EventType::StepFailed {
                    step_id: step_id.clone(),
                    error: error.clone(),
                }
            }
        };
        self.emit(Event::new(workflow_id, run_id, event_type)).await;

        StepResult {
            outcome,
            started_at,
            ended_at,
            resumed_with: resume_data,
        }
    }

    async fn execute(
        &self,
        step: &dyn Step,
        ctx: StepContext,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = step.execute(ctx) => Some(result),
        };

        match result {
            None => StepOutcome::Failed {
                error: STEP_CANCELLED.to_string(),
            },
            Some(Err(e)) => StepOutcome::Failed {
                error: format!("{:#}", e),
            },
            Some(Ok(StepOutput::Complete(output))) => match step.output_contract().validate(&output)
            {
                Ok(()) => StepOutcome::Success { output },
                Err(reason) => StepOutcome::Failed {
                    error: format!("output validation failed: {}", reason),
                },
            },
            Some(Ok(StepOutput::Suspend(payload))) => {
                let checked = step
                    .suspend_contract()
                    .map(|c| c.validate(&payload))
                    .unwrap_or(Ok(()));
                match checked {
                    Ok(()) => StepOutcome::Suspended { payload },
                    Err(reason) => StepOutcome::Failed {
                        error: format!("suspend payload validation failed: {}", reason),
                    },
                }
            }
        }
    }

    /// Event-log failures never change a run's outcome
    pub async fn emit(&self, event: Event) {
        if let Some(log) = &self.event_log {
            if let Err(e) = log.append(event).await {
                tracing::warn!("Failed to append workflow event: {:#}", e);
            }
        }
    }
}
