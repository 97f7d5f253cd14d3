use crate::snapshot::SnapshotError;
use crate::storage::StoreError;

/// Result type for engine operations.
pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Errors raised while composing or committing a workflow graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// Two steps share the same id.
    #[error("Duplicate step id: '{0}'")]
    DuplicateStepId(String),

    /// `commit` was called before any step was added.
    #[error("Workflow '{0}' has no steps")]
    EmptyWorkflow(String),

    /// `parallel` was called with no branches.
    #[error("Parallel group at position {0} has no branches")]
    EmptyParallelGroup(usize),

    /// The graph was already frozen by a previous `commit`.
    #[error("Workflow '{0}' is already committed")]
    AlreadyCommitted(String),
}

/// Errors surfaced by `start`, `resume` and friends.
///
/// Step failures are not errors at this level: they are recorded as the step's
/// `Failed` result and reported through a `RunResult` with status `failed`.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Graph validation error: {0}")]
    Graph(#[from] GraphError),

    /// A value failed its contract check before any state was touched.
    #[error("Validation error on {target}: {message}")]
    Validation { target: String, message: String },

    /// Unknown run, or a step that is not currently suspended.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A required snapshot write or read failed.
    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// The snapshot was produced by a differently shaped workflow.
    #[error("Workflow definition mismatch: expected hash '{expected}', found '{found}'")]
    DefinitionMismatch { expected: String, found: String },
}

impl WorkflowError {
    pub fn validation(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            target: target.into(),
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
