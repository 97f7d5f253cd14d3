pub mod executor;
pub mod graph;
pub(crate) mod step_runner;


pub use executor::{EngineBuilder, Run, WorkflowEngine, RUN_CANCELLED};
pub use graph::{WorkflowBuilder, WorkflowGraph};
