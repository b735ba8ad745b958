use std::collections::HashMap;
use std::sync::Arc;
use weftcore::{Kwargs, SpawnError, TaskBody, TaskError};

/// Factory trait for creating task bodies by component name
///
/// This is how a component is "constructed" inside a new thread or worker
/// process: the launcher ships the name and the keyword arguments, the
/// receiving side looks the factory up and builds the body.
pub trait TaskFactory: Send + Sync {
    /// Create a new body from the given arguments
    fn create(&self, kwargs: &Kwargs) -> Result<Box<dyn TaskBody>, TaskError>;

    /// Component name (e.g. "debug.log")
    fn component(&self) -> &str;

    /// Optional: description and argument schema
    fn metadata(&self) -> ComponentMetadata {
        ComponentMetadata::default()
    }
}

/// Metadata about a component
#[derive(Debug, Clone)]
pub struct ComponentMetadata {
    pub description: String,
    pub category: String,
    pub arguments: Vec<ArgumentDefinition>,
}

impl Default for ComponentMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
            arguments: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArgumentDefinition {
    pub name: String,
    pub description: String,
    pub required: bool,
}

impl ArgumentDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, required: bool) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required,
        }
    }
}

/// Registry of constructible components
#[derive(Default)]
pub struct TaskRegistry {
    factories: HashMap<String, Arc<dyn TaskFactory>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a component factory
    pub fn register(&mut self, factory: Arc<dyn TaskFactory>) {
        let component = factory.component().to_string();
        tracing::info!("Registering component: {}", component);
        self.factories.insert(component, factory);
    }

    pub fn contains(&self, component: &str) -> bool {
        self.factories.contains_key(component)
    }

    /// Create a task body for a component
    pub fn create(&self, component: &str, kwargs: &Kwargs) -> Result<Box<dyn TaskBody>, SpawnError> {
        let factory = self
            .factories
            .get(component)
            .ok_or_else(|| SpawnError::UnknownComponent(component.to_string()))?;

        factory
            .create(kwargs)
            .map_err(|e| SpawnError::Component(format!("{}: {}", component, e)))
    }

    /// Get all registered component names, sorted
    pub fn list_components(&self) -> Vec<String> {
        let mut components: Vec<String> = self.factories.keys().cloned().collect();
        components.sort();
        components
    }

    /// Get metadata for a component
    pub fn get_metadata(&self, component: &str) -> Option<ComponentMetadata> {
        self.factories.get(component).map(|f| f.metadata())
    }
}
