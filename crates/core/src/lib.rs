// Runloom: durable workflow orchestration with suspend/resume

pub mod config;
pub mod context;
pub mod contract;
pub mod error;
pub mod events;
pub mod generation;
pub mod snapshot;
pub mod step;
pub mod storage;
pub mod telemetry;
pub mod types;
pub mod workflow;

pub use config::EngineConfig;
pub use context::RuntimeContext;
pub use contract::{AnyValue, Contract, JsonShape, JsonType, Typed};
pub use error::{GraphError, WorkflowError, WorkflowResult};
pub use events::{Event, EventLog, EventType, InMemoryEventLog};
pub use generation::{Generation, Generator, Message, Role};
pub use snapshot::{Snapshot, SnapshotError, SNAPSHOT_VERSION};
pub use step::{Step, StepContext, StepDefinition, StepOutput};
pub use storage::{InMemorySnapshotStore, RedbSnapshotStore, SnapshotStore, StoreError};
pub use types::*;
pub use workflow::{Run, WorkflowBuilder, WorkflowEngine, WorkflowGraph};
