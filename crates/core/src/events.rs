use crate::types::{RunId, StepId, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// An event in a run's history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub run_id: RunId,
    pub workflow_id: WorkflowId,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
}

impl Event {
    pub fn new(workflow_id: WorkflowId, run_id: RunId, event_type: EventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id,
            workflow_id,
            timestamp: Utc::now(),
            event_type,
        }
    }
}

/// Types of events emitted while a run advances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    // Run lifecycle events
    RunStarted {
        trigger_input: Value,
    },
    RunResumed {
        step_id: StepId,
    },
    RunSuspended {
        pending: Vec<StepId>,
    },
    RunSucceeded {
        output: Value,
    },
    RunFailed {
        error: String,
    },
    RunCancelled {
        reason: String,
    },

    // Step lifecycle events
    StepStarted {
        step_id: StepId,
        resuming: bool,
    },
    StepSucceeded {
        step_id: StepId,
        duration_ms: u64,
    },
    StepSuspended {
        step_id: StepId,
        payload: Value,
    },
    StepFailed {
        step_id: StepId,
        error: String,
    },
}

/// Event log writer trait
#[async_trait::async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event to the log
    async fn append(&self, event: Event) -> anyhow::Result<()>;

    /// Get all events for a run, oldest first
    async fn run_events(&self, run_id: RunId) -> anyhow::Result<Vec<Event>>;
}

/// Keeps events in memory and fans them out to live subscribers
pub struct InMemoryEventLog {
    events: Mutex<HashMap<RunId, Vec<Event>>>,
    sender: broadcast::Sender<Event>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            events: Mutex::new(HashMap::new()),
            sender,
        }
    }

    /// Watch events of every run as they are appended
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for InMemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(&self, event: Event) -> anyhow::Result<()> {
        self.events
            .lock()
            .map_err(|e| anyhow::anyhow!("Event log lock poisoned: {}", e))?
            .entry(event.run_id)
            .or_default()
            .push(event.clone());

        // No subscribers is fine
        let _ = self.sender.send(event);
        Ok(())
    }

    async fn run_events(&self, run_id: RunId) -> anyhow::Result<Vec<Event>> {
        Ok(self
            .events
            .lock()
            .map_err(|e| anyhow::anyhow!("Event log lock poisoned: {}", e))?
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }
}
