use serde_json::json;
use std::time::Duration;
use weftcore::{Kwargs, Message, MessageKind, Shared, TaskBody, TaskContext, TaskError, TaskId};
use weftruntime::{ArgumentDefinition, ComponentMetadata, TaskFactory};

fn task_id_arg(kwargs: &Kwargs, name: &str) -> Result<Option<TaskId>, TaskError> {
    match kwargs.get(name) {
        None => Ok(None),
        Some(_) => kwargs
            .get_str(name)
            .and_then(|raw| raw.parse().ok())
            .map(Some)
            .ok_or_else(|| TaskError::InvalidArgument {
                name: name.to_string(),
                expected: "a task id".to_string(),
            }),
    }
}

/// Increments a counter kept in the shared object's mailbox
///
/// The value lives in the data slot of the `store` task id. Each run takes
/// the shared lock, reads the slot, writes back `value + step` and releases,
/// so concurrent counters in other threads or processes never lose an update.
pub struct CounterBody {
    store: TaskId,
    step: u64,
    timeout: Option<Duration>,
}

impl CounterBody {
    pub fn new(store: TaskId, step: u64) -> Self {
        Self {
            store,
            step,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Current value in `store`'s slot, without consuming it
    ///
    /// Takes the shared lock under a fresh owner id, so a counter run never
    /// observes the slot while it is emptied and refilled here.
    pub fn peek(shared: &dyn Shared, store: TaskId) -> Result<u64, TaskError> {
        let owner = TaskId::new_v4();
        let Some(_guard) = shared.acquire(owner, None)? else {
            return Err(TaskError::ExecutionFailed(
                "could not acquire the shared lock to read the counter".to_string(),
            ));
        };

        let message = shared.receive_message(store, Some(MessageKind::Data))?;
        let value = message.as_ref().map(counter_value).unwrap_or(0);
        if let Some(message) = message {
            shared.send_message(Some(store), message)?;
        }
        Ok(value)
    }
}

fn counter_value(message: &Message) -> u64 {
    message.payload.get("count").and_then(|v| v.as_u64()).unwrap_or(0)
}

impl TaskBody for CounterBody {
    fn body_type(&self) -> &str {
        "shared.counter"
    }

    fn run(&self, ctx: &TaskContext, kwargs: &Kwargs) -> Result<(), TaskError> {
        let step = kwargs.get_u64("step").unwrap_or(self.step);
        let shared = ctx.require_shared()?;

        let Some(_guard) = ctx.lock_shared(self.timeout)? else {
            return Err(TaskError::ExecutionFailed(format!(
                "task {} timed out waiting for the shared lock",
                ctx.task_id
            )));
        };

        let current = shared
            .receive_message(self.store, Some(MessageKind::Data))?
            .as_ref()
            .map(counter_value)
            .unwrap_or(0);
        let next = current + step;
        shared.send_message(
            Some(self.store),
            Message::data(Some(ctx.task_id), json!({ "count": next })),
        )?;

        if tracing::Level::DEBUG <= ctx.log_level {
            tracing::debug!("Task {} counter {} -> {}", ctx.task_id, current, next);
        }
        Ok(())
    }
}

pub struct CounterBodyFactory;

impl TaskFactory for CounterBodyFactory {
    fn create(&self, kwargs: &Kwargs) -> Result<Box<dyn TaskBody>, TaskError> {
        let store = task_id_arg(kwargs, "store")?
            .ok_or_else(|| TaskError::MissingArgument("store".to_string()))?;
        let step = kwargs.get_u64("step").unwrap_or(1);

        let mut body = CounterBody::new(store, step);
        if let Some(ms) = kwargs.get_u64("timeout_ms") {
            body = body.with_timeout(Duration::from_millis(ms));
        }
        Ok(Box::new(body))
    }

    fn component(&self) -> &str {
        "shared.counter"
    }

    fn metadata(&self) -> ComponentMetadata {
        ComponentMetadata {
            description: "Increments a counter held in the shared object".to_string(),
            category: "shared".to_string(),
            arguments: vec![
                ArgumentDefinition::new("store", "Task id whose data slot holds the count", true),
                ArgumentDefinition::new("step", "Amount added per run (default 1)", false),
                ArgumentDefinition::new("timeout_ms", "Give up waiting for the lock after this long", false),
            ],
        }
    }
}

/// Sends a terminate message to one task, or to every active task
pub struct TerminateBody {
    target: Option<TaskId>,
}

impl TerminateBody {
    pub fn new(target: Option<TaskId>) -> Self {
        Self { target }
    }
}

impl TaskBody for TerminateBody {
    fn body_type(&self) -> &str {
        "shared.terminate"
    }

    fn run(&self, ctx: &TaskContext, kwargs: &Kwargs) -> Result<(), TaskError> {
        let target = match task_id_arg(kwargs, "target")? {
            Some(target) => Some(target),
            None => self.target,
        };
        let shared = ctx.require_shared()?;
        shared.send_message(target, Message::terminate(Some(ctx.task_id)))?;

        if tracing::Level::INFO <= ctx.log_level {
            match target {
                Some(target) => tracing::info!("Task {} asked {} to terminate", ctx.task_id, target),
                None => tracing::info!("Task {} asked all tasks to terminate", ctx.task_id),
            }
        }
        Ok(())
    }
}

pub struct TerminateBodyFactory;

impl TaskFactory for TerminateBodyFactory {
    fn create(&self, kwargs: &Kwargs) -> Result<Box<dyn TaskBody>, TaskError> {
        Ok(Box::new(TerminateBody::new(task_id_arg(kwargs, "target")?)))
    }

    fn component(&self) -> &str {
        "shared.terminate"
    }

    fn metadata(&self) -> ComponentMetadata {
        ComponentMetadata {
            description: "Sends a terminate message through the shared object".to_string(),
            category: "shared".to_string(),
            arguments: vec![ArgumentDefinition::new(
                "target",
                "Task id to stop; every active task when omitted",
                false,
            )],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use weftcore::ExecutionRange;
    use weftruntime::{Autorun, SharedState, Task};

    fn counter_kwargs(store: TaskId) -> Kwargs {
        Kwargs::new().with("store", store.to_string())
    }

    #[test]
    fn counters_in_threads_lose_no_updates() {
        let shared = Arc::new(SharedState::new(ExecutionRange::Thread));
        let store = TaskId::new_v4();

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let shared = shared.clone();
                thread::spawn(move || {
                    let body = CounterBodyFactory.create(&counter_kwargs(store)).unwrap();
                    let task = Task::builder_boxed(body)
                        .range(ExecutionRange::Thread)
                        .shared(shared)
                        .build()
                        .unwrap();
                    for _ in 0..50 {
                        task.run(Kwargs::new()).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(CounterBody::peek(&*shared, store).unwrap(), 200);
        // Peeking leaves the value in place
        assert_eq!(CounterBody::peek(&*shared, store).unwrap(), 200);
    }

    #[test]
    fn peeking_during_counter_runs_loses_no_updates() {
        let shared = Arc::new(SharedState::new(ExecutionRange::Thread));
        let store = TaskId::new_v4();
        let counter = Task::builder_boxed(CounterBodyFactory.create(&counter_kwargs(store)).unwrap())
            .range(ExecutionRange::Thread)
            .shared(shared.clone())
            .build()
            .unwrap();

        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let reader = {
            let shared = shared.clone();
            let done = done.clone();
            thread::spawn(move || {
                let mut last = 0;
                while !done.load(std::sync::atomic::Ordering::SeqCst) {
                    let value = CounterBody::peek(&*shared, store).unwrap();
                    assert!(value >= last, "count went back from {} to {}", last, value);
                    last = value;
                }
            })
        };

        for _ in 0..5_000 {
            counter.run(Kwargs::new()).unwrap();
        }
        done.store(true, std::sync::atomic::Ordering::SeqCst);
        reader.join().unwrap();

        assert_eq!(CounterBody::peek(&*shared, store).unwrap(), 5_000);
        // Every peek released the lock
        assert!(shared.lock(TaskId::new_v4(), Some(Duration::from_millis(10))).unwrap());
    }

    #[test]
    fn counter_needs_a_store_and_a_shared_object() {
        assert!(matches!(
            CounterBodyFactory.create(&Kwargs::new()),
            Err(TaskError::MissingArgument(name)) if name == "store"
        ));
        assert!(matches!(
            CounterBodyFactory.create(&Kwargs::new().with("store", "not-a-uuid")),
            Err(TaskError::InvalidArgument { .. })
        ));

        let body = CounterBodyFactory
            .create(&counter_kwargs(TaskId::new_v4()))
            .unwrap();
        let task = Task::builder_boxed(body)
            .range(ExecutionRange::Thread)
            .build()
            .unwrap();
        assert!(matches!(task.run(Kwargs::new()), Err(TaskError::Configuration(_))));
    }

    #[test]
    fn terminate_stops_a_looping_counter() {
        let shared = Arc::new(SharedState::new(ExecutionRange::Thread));
        let store = TaskId::new_v4();
        let counter = Task::builder_boxed(CounterBodyFactory.create(&counter_kwargs(store)).unwrap())
            .range(ExecutionRange::Thread)
            .shared(shared.clone())
            .build()
            .unwrap();

        let looping = {
            let counter = counter.clone();
            thread::spawn(move || counter.autorun(Autorun::Loop, Kwargs::new()))
        };
        while counter.runs() < 5 {
            thread::yield_now();
        }

        let stopper = Task::builder(TerminateBody::new(Some(counter.id())))
            .range(ExecutionRange::Thread)
            .shared(shared.clone())
            .build()
            .unwrap();
        stopper.run(Kwargs::new()).unwrap();

        looping.join().unwrap().unwrap();
        assert_eq!(
            CounterBody::peek(&*shared, store).unwrap(),
            counter.runs()
        );
    }

    #[test]
    fn terminate_without_target_broadcasts() {
        let shared = Arc::new(SharedState::new(ExecutionRange::Thread));
        let a = TaskId::new_v4();
        let b = TaskId::new_v4();
        shared.checkin(a).unwrap();
        shared.checkin(b).unwrap();

        let stopper = Task::builder(TerminateBody::new(None))
            .range(ExecutionRange::Thread)
            .shared(shared.clone())
            .build()
            .unwrap();
        stopper.run(Kwargs::new()).unwrap();

        for task in [a, b, stopper.id()] {
            assert!(shared
                .receive_message(task, Some(MessageKind::Terminate))
                .unwrap()
                .is_some());
        }
    }
}
