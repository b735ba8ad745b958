use thiserror::Error;

use crate::TaskId;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Spawn error: {0}")]
    Spawn(#[from] SpawnError),

    #[error("Shared object error: {0}")]
    Shared(#[from] SharedError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors of a shared object. A lock timeout is not one of them: `lock`
/// reports it as `Ok(false)`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SharedError {
    #[error("Shared object not available: {0}")]
    NotAvailable(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("Failed to spawn thread: {0}")]
    Thread(#[source] std::io::Error),

    #[error("Failed to spawn process '{program}': {source}")]
    Process {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unknown component: {0}")]
    UnknownComponent(String),

    #[error("Unsupported spawn target: {0}")]
    Unsupported(String),

    #[error("Component could not be created: {0}")]
    Component(String),
}

/// Errors raised by a task body. An `Err` leaving `TaskBody::run` aborts the
/// run before the Finished event is raised.
#[derive(Error, Debug, Clone)]
pub enum TaskError {
    #[error("Missing required argument: {0}")]
    MissingArgument(String),

    #[error("Invalid argument '{name}': expected {expected}")]
    InvalidArgument { name: String, expected: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Shared object error: {0}")]
    Shared(#[from] SharedError),

    #[error("Spawn error: {0}")]
    Spawn(String),
}

impl From<SpawnError> for TaskError {
    fn from(err: SpawnError) -> Self {
        TaskError::Spawn(err.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("A workflow cannot contain itself")]
    SelfMembership,

    #[error("Task {0} is already a member of this workflow")]
    DuplicateTask(TaskId),

    #[error("Task not found: {0}")]
    UnknownTask(TaskId),

    #[error("Cyclic dependency detected")]
    CyclicDependency,
}
