use crate::{RuntimeConfig, SharedClient, Task, TaskRegistry};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use weftcore::{ExecutionRange, Kwargs, LevelFilter, RuntimeError, Shared};

/// What a task does right after it has been built
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Autorun {
    /// Build only
    #[default]
    None,
    /// One `run`
    Run,
    /// `run_loop` until a terminate message arrives
    Loop,
}

/// Everything needed to construct and start a component in another thread
/// or process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentSpec {
    pub component: String,
    #[serde(default)]
    pub kwargs: Kwargs,
    #[serde(default)]
    pub autorun: Autorun,
    /// Manager address of the shared object to attach to (process range)
    #[serde(default)]
    pub shared: Option<SocketAddr>,
    #[serde(default = "default_log_level", with = "level_format")]
    pub log_level: LevelFilter,
}

impl ComponentSpec {
    /// Spec that runs the component once; decoding a spec without an
    /// `autorun` field yields `Autorun::None` instead.
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            kwargs: Kwargs::new(),
            autorun: Autorun::Run,
            shared: None,
            log_level: default_log_level(),
        }
    }

    pub fn with_kwargs(mut self, kwargs: Kwargs) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_autorun(mut self, autorun: Autorun) -> Self {
        self.autorun = autorun;
        self
    }

    pub fn with_shared(mut self, address: SocketAddr) -> Self {
        self.shared = Some(address);
        self
    }

    pub fn with_log_level(mut self, level: LevelFilter) -> Self {
        self.log_level = level;
        self
    }
}

fn default_log_level() -> LevelFilter {
    LevelFilter::INFO
}

mod level_format {
    use serde::{Deserialize, Deserializer, Serializer};
    use weftcore::LevelFilter;

    pub fn serialize<S: Serializer>(level: &LevelFilter, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&level.to_string().to_lowercase())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<LevelFilter, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Builds the component's task, applies its autorun mode and checks out.
///
/// Runs inside the spawned thread (thread range) or the worker process
/// (process range).
pub fn run_component(
    registry: Arc<TaskRegistry>,
    spec: &ComponentSpec,
    range: ExecutionRange,
    shared: Option<Arc<dyn Shared>>,
    config: &RuntimeConfig,
) -> Result<(), RuntimeError> {
    let body = registry.create(&spec.component, &spec.kwargs)?;
    let task = Task::builder_boxed(body)
        .range(range)
        .shared_opt(shared)
        .log_level(spec.log_level)
        .component(spec.component.clone())
        .registry(registry)
        .config(config.clone())
        .build()?;

    let result = task.autorun(spec.autorun, spec.kwargs.clone());

    for outcome in task.shutdown() {
        if !outcome.is_success() {
            tracing::warn!("Task {} left a failed async task: {}", task.id(), outcome);
        }
    }

    Ok(result?)
}

/// Entry point of a worker process: decodes the spec handed over on the
/// command line, connects to the parent's shared object and runs the
/// component.
pub fn run_worker(
    registry: Arc<TaskRegistry>,
    spec_json: &str,
    config: &RuntimeConfig,
) -> Result<(), RuntimeError> {
    let spec: ComponentSpec = serde_json::from_str(spec_json)?;
    tracing::info!(
        "Worker {} starting component {}",
        std::process::id(),
        spec.component
    );

    let shared: Option<Arc<dyn Shared>> = match spec.shared {
        Some(address) => Some(Arc::new(SharedClient::connect_with_config(address, config)?)),
        None => None,
    };

    run_component(registry, &spec, ExecutionRange::Process, shared, config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_survives_the_command_line() {
        let spec = ComponentSpec::new("shared.counter")
            .with_kwargs(Kwargs::new().with("increments", 3))
            .with_autorun(Autorun::Loop)
            .with_shared("127.0.0.1:4000".parse().unwrap())
            .with_log_level(LevelFilter::WARN);

        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains("\"autorun\":\"loop\""));
        assert!(json.contains("\"log_level\":\"warn\""));

        let decoded: ComponentSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.component, "shared.counter");
        assert_eq!(decoded.kwargs.get_u64("increments"), Some(3));
        assert_eq!(decoded.autorun, Autorun::Loop);
        assert_eq!(decoded.log_level, LevelFilter::WARN);
    }

    #[test]
    fn minimal_spec_uses_defaults() {
        let spec: ComponentSpec = serde_json::from_str(r#"{"component": "debug.log"}"#).unwrap();
        assert_eq!(spec.autorun, Autorun::None);
        assert!(spec.kwargs.is_empty());
        assert!(spec.shared.is_none());
        assert_eq!(spec.log_level, LevelFilter::INFO);
    }
}
