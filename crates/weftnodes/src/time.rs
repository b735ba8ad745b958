use std::thread::sleep;
use std::time::Duration;
use weftcore::{Kwargs, TaskBody, TaskContext, TaskError};
use weftruntime::{ArgumentDefinition, ComponentMetadata, TaskFactory};

/// Delay execution for a specified duration
pub struct DelayBody {
    delay: Duration,
}

impl DelayBody {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl TaskBody for DelayBody {
    fn body_type(&self) -> &str {
        "time.delay"
    }

    fn run(&self, ctx: &TaskContext, kwargs: &Kwargs) -> Result<(), TaskError> {
        let delay = match kwargs.get("delay_ms") {
            Some(_) => delay_arg(kwargs)?,
            None => self.delay,
        };

        if tracing::Level::DEBUG <= ctx.log_level {
            tracing::debug!("Task {} delaying for {}ms", ctx.task_id, delay.as_millis());
        }
        sleep(delay);
        Ok(())
    }
}

fn delay_arg(kwargs: &Kwargs) -> Result<Duration, TaskError> {
    match kwargs.get("delay_ms") {
        None => Ok(Duration::from_millis(1000)), // Default to 1 second if not specified
        Some(_) => kwargs
            .get_f64("delay_ms")
            .filter(|ms| ms.is_finite() && *ms >= 0.0)
            .map(|ms| Duration::from_millis(ms as u64))
            .ok_or_else(|| TaskError::InvalidArgument {
                name: "delay_ms".to_string(),
                expected: "a non-negative number of milliseconds".to_string(),
            }),
    }
}

pub struct DelayBodyFactory;

impl TaskFactory for DelayBodyFactory {
    fn create(&self, kwargs: &Kwargs) -> Result<Box<dyn TaskBody>, TaskError> {
        Ok(Box::new(DelayBody::new(delay_arg(kwargs)?)))
    }

    fn component(&self) -> &str {
        "time.delay"
    }

    fn metadata(&self) -> ComponentMetadata {
        ComponentMetadata {
            description: "Delay execution for specified milliseconds".to_string(),
            category: "time".to_string(),
            arguments: vec![ArgumentDefinition::new(
                "delay_ms",
                "Milliseconds to sleep per run (default 1000)",
                false,
            )],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use weftcore::{ExecutionRange, LevelFilter, TaskId};

    fn context() -> TaskContext {
        TaskContext {
            task_id: TaskId::new_v4(),
            range: ExecutionRange::Thread,
            log_level: LevelFilter::OFF,
            shared: None,
        }
    }

    #[test]
    fn run_kwargs_override_the_configured_delay() {
        let body = DelayBodyFactory
            .create(&Kwargs::new().with("delay_ms", 5_000))
            .unwrap();

        let started = Instant::now();
        body.run(&context(), &Kwargs::new().with("delay_ms", 20)).unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(20));
        assert!(elapsed < Duration::from_millis(5_000));
    }

    #[test]
    fn rejects_negative_delay() {
        assert!(matches!(
            DelayBodyFactory.create(&Kwargs::new().with("delay_ms", -3)),
            Err(TaskError::InvalidArgument { .. })
        ));
    }
}
