use weftcore::{Kwargs, TaskBody, TaskContext, TaskError};
use weftruntime::{ArgumentDefinition, ComponentMetadata, TaskFactory};

/// Simple debug body that logs its arguments
///
/// Arguments given at construction are defaults; run arguments win.
pub struct DebugBody {
    defaults: Kwargs,
}

impl DebugBody {
    pub fn new(defaults: Kwargs) -> Self {
        Self { defaults }
    }
}

impl TaskBody for DebugBody {
    fn body_type(&self) -> &str {
        "debug.log"
    }

    fn run(&self, ctx: &TaskContext, kwargs: &Kwargs) -> Result<(), TaskError> {
        let mut args = self.defaults.clone();
        args.merge(kwargs);

        if tracing::Level::INFO > ctx.log_level {
            return Ok(());
        }

        let message = args.get_str("message").unwrap_or("(no message)");
        tracing::info!("DEBUG [{}]: {}", ctx.task_id, message);

        // Also log all arguments for visibility
        for (key, value) in args.iter().filter(|(key, _)| key.as_str() != "message") {
            tracing::info!("  {}: {}", key, value);
        }
        Ok(())
    }
}

pub struct DebugBodyFactory;

impl TaskFactory for DebugBodyFactory {
    fn create(&self, kwargs: &Kwargs) -> Result<Box<dyn TaskBody>, TaskError> {
        Ok(Box::new(DebugBody::new(kwargs.clone())))
    }

    fn component(&self) -> &str {
        "debug.log"
    }

    fn metadata(&self) -> ComponentMetadata {
        ComponentMetadata {
            description: "Logs its arguments for debugging".to_string(),
            category: "debug".to_string(),
            arguments: vec![ArgumentDefinition::new("message", "Text to log", false)],
        }
    }
}
