use crate::{ExecutionRange, Kwargs, Shared, SharedGuard, TaskError, TaskId};
use std::sync::Arc;
use std::time::Duration;
use tracing::level_filters::LevelFilter;

/// Work a task performs. Domain plug-ins implement this and nothing else.
pub trait TaskBody: Send + Sync {
    /// Type identifier (e.g. "debug.log", "shared.counter")
    fn body_type(&self) -> &str;

    /// Execute once with the given arguments. Domain-level success or failure
    /// is the body's own business; `Err` means the run itself broke off.
    fn run(&self, ctx: &TaskContext, kwargs: &Kwargs) -> Result<(), TaskError>;

    /// Optional: learning components report whether internal state changed
    fn adapt(&self, _ctx: &TaskContext, _kwargs: &Kwargs) -> Result<bool, TaskError> {
        Ok(false)
    }
}

/// What a body gets to see of the task running it
#[derive(Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub range: ExecutionRange,
    pub log_level: LevelFilter,
    pub shared: Option<Arc<dyn Shared>>,
}

impl TaskContext {
    pub fn shared(&self) -> Option<&Arc<dyn Shared>> {
        self.shared.as_ref()
    }

    /// Get the shared object or return error
    pub fn require_shared(&self) -> Result<&Arc<dyn Shared>, TaskError> {
        self.shared.as_ref().ok_or_else(|| {
            TaskError::Configuration(format!("task {} has no shared object", self.task_id))
        })
    }

    /// Locks the shared object on behalf of this task. `Ok(None)` on timeout.
    pub fn lock_shared(&self, timeout: Option<Duration>) -> Result<Option<SharedGuard<'_>>, TaskError> {
        let shared = self.require_shared()?;
        Ok(shared.acquire(self.task_id, timeout)?)
    }
}

/// Body backed by a closure
pub struct FnBody<F> {
    body_type: String,
    func: F,
}

impl<F> FnBody<F>
where
    F: Fn(&TaskContext, &Kwargs) -> Result<(), TaskError> + Send + Sync,
{
    pub fn new(body_type: impl Into<String>, func: F) -> Self {
        Self {
            body_type: body_type.into(),
            func,
        }
    }
}

impl<F> TaskBody for FnBody<F>
where
    F: Fn(&TaskContext, &Kwargs) -> Result<(), TaskError> + Send + Sync,
{
    fn body_type(&self) -> &str {
        &self.body_type
    }

    fn run(&self, ctx: &TaskContext, kwargs: &Kwargs) -> Result<(), TaskError> {
        (self.func)(ctx, kwargs)
    }
}
