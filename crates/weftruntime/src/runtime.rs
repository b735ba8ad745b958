use crate::launcher::{launcher_for, Launcher};
use crate::task::TaskBuilder;
use crate::workflow::WorkflowBuilder;
use crate::worker::run_worker;
use crate::{RuntimeConfig, Task, TaskRegistry, Workflow};
use std::sync::Arc;
use weftcore::{ExecutionRange, Kwargs, RuntimeError, Shared};

/// Entry point tying the component registry to the runtime configuration
///
/// Tasks, workflows and launchers created through the runtime share its
/// registry, so any of them can spawn registered components.
pub struct WeftRuntime {
    registry: Arc<TaskRegistry>,
    config: RuntimeConfig,
}

impl WeftRuntime {
    /// Create a new runtime with an empty registry and default settings
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self::with_registry(Arc::new(TaskRegistry::new()), config)
    }

    /// Create a new runtime with a pre-populated registry
    pub fn with_registry(registry: Arc<TaskRegistry>, config: RuntimeConfig) -> Self {
        tracing::debug!(
            "Runtime created with {} component(s)",
            registry.list_components().len()
        );
        Self { registry, config }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Task builder for a registered component
    pub fn task(&self, component: &str, kwargs: &Kwargs) -> Result<TaskBuilder, RuntimeError> {
        let body = self.registry.create(component, kwargs)?;
        Ok(Task::builder_boxed(body)
            .component(component)
            .registry(self.registry.clone())
            .config(self.config.clone()))
    }

    pub fn workflow(&self, name: impl Into<String>) -> WorkflowBuilder {
        Workflow::builder()
            .name(name)
            .registry(self.registry.clone())
            .config(self.config.clone())
    }

    pub fn launcher(
        &self,
        range: ExecutionRange,
        shared: Option<Arc<dyn Shared>>,
    ) -> Result<Box<dyn Launcher>, RuntimeError> {
        launcher_for(range, self.registry.clone(), shared, self.config.clone())
    }

    /// Runs this process as a worker for a process-range spawn
    pub fn run_worker(&self, spec_json: &str) -> Result<(), RuntimeError> {
        run_worker(self.registry.clone(), spec_json, &self.config)
    }
}

impl Default for WeftRuntime {
    fn default() -> Self {
        Self::new()
    }
}
