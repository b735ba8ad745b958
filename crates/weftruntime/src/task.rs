use crate::launcher::{launcher_for, HandleSet, Launcher, Outcome, SpawnTarget};
use crate::worker::{Autorun, ComponentSpec};
use crate::{RuntimeConfig, TaskRegistry};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::Level;
use uuid::Uuid;
use weftcore::{
    Event, EventHandler, EventId, EventSource, ExecutionRange, Kwargs, LevelFilter, MessageKind,
    RuntimeError, Shared, SharedError, TaskBody, TaskContext, TaskError, TaskId,
};

/// Lifecycle of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Running,
    Finished,
}

/// Unit of schedulable work
///
/// A task wraps one `TaskBody` and raises `EventId::Finished` after every
/// completed run. Registering another task's `run_on_event` handler on that
/// event is how tasks are chained; the handler runs on whichever thread
/// raised the event.
pub struct Task {
    id: TaskId,
    range: ExecutionRange,
    body: Box<dyn TaskBody>,
    shared: Option<Arc<dyn Shared>>,
    events: EventSource,
    state: Mutex<TaskState>,
    runs: AtomicU64,
    log_level: RwLock<LevelFilter>,
    component: Option<String>,
    registry: Arc<TaskRegistry>,
    config: RuntimeConfig,
    handles: Mutex<HandleSet>,
    checked_out: AtomicBool,
}

impl Task {
    pub fn builder(body: impl TaskBody + 'static) -> TaskBuilder {
        Self::builder_boxed(Box::new(body))
    }

    pub fn builder_boxed(body: Box<dyn TaskBody>) -> TaskBuilder {
        TaskBuilder {
            body,
            range: ExecutionRange::default(),
            shared: None,
            log_level: LevelFilter::INFO,
            component: None,
            registry: None,
            config: RuntimeConfig::default(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn range(&self) -> ExecutionRange {
        self.range
    }

    pub fn body_type(&self) -> &str {
        self.body.body_type()
    }

    pub fn component(&self) -> Option<&str> {
        self.component.as_deref()
    }

    pub fn shared(&self) -> Option<&Arc<dyn Shared>> {
        self.shared.as_ref()
    }

    pub fn state(&self) -> TaskState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of runs started so far
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn log_level(&self) -> LevelFilter {
        *self.log_level.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn switch_logging(&self, level: LevelFilter) {
        *self.log_level.write().unwrap_or_else(PoisonError::into_inner) = level;
    }

    fn logs(&self, level: Level) -> bool {
        level <= self.log_level()
    }

    fn set_state(&self, state: TaskState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn context(&self) -> TaskContext {
        TaskContext {
            task_id: self.id,
            range: self.range,
            log_level: self.log_level(),
            shared: self.shared.clone(),
        }
    }

    /// Runs the body once, then raises the Finished event with `kwargs`.
    ///
    /// An error from the body comes straight back and no event is raised.
    /// Errors of handlers (successor tasks run synchronously on this thread)
    /// come back the same way.
    pub fn run(&self, kwargs: Kwargs) -> Result<(), TaskError> {
        self.set_state(TaskState::Running);
        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        if self.logs(Level::DEBUG) {
            tracing::debug!("Task {} ({}) run {} started", self.id, self.body_type(), run);
        }

        let ctx = self.context();
        let result = self.body.run(&ctx, &kwargs);
        self.set_state(TaskState::Finished);

        if let Err(e) = result {
            if self.logs(Level::ERROR) {
                tracing::error!("Task {} ({}) failed: {}", self.id, self.body_type(), e);
            }
            return Err(e);
        }

        if self.logs(Level::INFO) {
            tracing::info!("Task {} ({}) finished run {}", self.id, self.body_type(), run);
        }
        self.raise_event(&Event::finished(self.id, kwargs))
    }

    /// Runs until a terminate message for this task shows up on the shared
    /// object. The message is checked after each run, so the run in flight
    /// always completes.
    ///
    /// Without a shared object nothing can stop the loop; such a worker
    /// lives until its thread or process is terminated from outside.
    pub fn run_loop(&self, kwargs: Kwargs) -> Result<(), TaskError> {
        if self.shared.is_none() && self.logs(Level::WARN) {
            tracing::warn!(
                "Task {} loops without a shared object and cannot be terminated",
                self.id
            );
        }

        loop {
            self.run(kwargs.clone())?;

            if let Some(shared) = &self.shared {
                if shared
                    .receive_message(self.id, Some(MessageKind::Terminate))?
                    .is_some()
                {
                    if self.logs(Level::INFO) {
                        tracing::info!("Task {} terminated after {} runs", self.id, self.runs());
                    }
                    return Ok(());
                }
            }
        }
    }

    pub fn autorun(&self, mode: Autorun, kwargs: Kwargs) -> Result<(), TaskError> {
        match mode {
            Autorun::None => Ok(()),
            Autorun::Run => self.run(kwargs),
            Autorun::Loop => self.run_loop(kwargs),
        }
    }

    pub fn register_event_handler(&self, event_id: EventId, handler: EventHandler) {
        self.events.register(event_id, handler);
    }

    pub fn raise_event(&self, event: &Event) -> Result<(), TaskError> {
        self.events.raise(event)
    }

    pub fn handler_count(&self, event_id: &EventId) -> usize {
        self.events.handler_count(event_id)
    }

    /// Handler that runs this task with the kwargs of the triggering event
    pub fn run_on_event(self: &Arc<Self>) -> EventHandler {
        let task = Arc::clone(self);
        Arc::new(move |event: &Event| {
            if task.logs(Level::DEBUG) {
                tracing::debug!("Task {} triggered by {}", task.id, event.source);
            }
            task.run(event.kwargs.clone())
        })
    }

    fn launcher(&self) -> Result<Box<dyn Launcher>, RuntimeError> {
        launcher_for(
            self.range,
            self.registry.clone(),
            self.shared.clone(),
            self.config.clone(),
        )
    }

    /// Starts `target` in a new thread or process, per this task's range.
    /// The handle is kept until `wait_async_tasks` or `shutdown`.
    pub fn run_async(&self, target: SpawnTarget) -> Result<(), RuntimeError> {
        let handle = self.launcher()?.spawn(target)?;
        if self.logs(Level::INFO) {
            tracing::info!(
                "Task {} started async {} ({})",
                self.id,
                handle.label(),
                handle.range()
            );
        }
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        Ok(())
    }

    /// Starts a fresh instance of this task's own component asynchronously
    pub fn spawn_self(&self, kwargs: Kwargs, autorun: Autorun) -> Result<(), RuntimeError> {
        let component = self.component.clone().ok_or_else(|| {
            RuntimeError::InvalidConfiguration(format!(
                "task {} was not built from a registered component",
                self.id
            ))
        })?;

        let spec = ComponentSpec::new(component)
            .with_kwargs(kwargs)
            .with_autorun(autorun)
            .with_log_level(self.log_level());
        self.run_async(SpawnTarget::Component(spec))
    }

    /// Async tasks started and not yet joined
    pub fn pending_async_tasks(&self) -> usize {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Joins every async task in start order
    pub fn wait_async_tasks(&self) -> Vec<Outcome> {
        // Take the handles out so the set is not locked while joining
        let mut handles = std::mem::take(
            &mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner),
        );
        handles.join_all()
    }

    /// Leaves the shared object. Later calls do nothing.
    pub fn checkout(&self) -> Result<(), SharedError> {
        if self.checked_out.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match &self.shared {
            Some(shared) => shared.checkout(self.id),
            None => Ok(()),
        }
    }

    /// Joins async tasks and checks out
    pub fn shutdown(&self) -> Vec<Outcome> {
        let outcomes = self.wait_async_tasks();
        if let Err(e) = self.checkout() {
            tracing::debug!("Task {} checkout during shutdown failed: {}", self.id, e);
        }
        outcomes
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        let pending = self.pending_async_tasks();
        if pending > 0 {
            tracing::debug!("Task {} dropped with {} unjoined async tasks", self.id, pending);
        }
        if let Err(e) = self.checkout() {
            tracing::debug!("Task {} checkout on drop failed: {}", self.id, e);
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("body", &self.body_type())
            .field("range", &self.range)
            .field("state", &self.state())
            .field("runs", &self.runs())
            .finish()
    }
}

/// Builder for `Task`
pub struct TaskBuilder {
    body: Box<dyn TaskBody>,
    range: ExecutionRange,
    shared: Option<Arc<dyn Shared>>,
    log_level: LevelFilter,
    component: Option<String>,
    registry: Option<Arc<TaskRegistry>>,
    config: RuntimeConfig,
}

impl TaskBuilder {
    pub fn range(mut self, range: ExecutionRange) -> Self {
        self.range = range;
        self
    }

    pub fn shared(mut self, shared: Arc<dyn Shared>) -> Self {
        self.shared = Some(shared);
        self
    }

    pub fn shared_opt(mut self, shared: Option<Arc<dyn Shared>>) -> Self {
        self.shared = shared;
        self
    }

    pub fn log_level(mut self, level: LevelFilter) -> Self {
        self.log_level = level;
        self
    }

    /// Name under which the body is registered, enabling `spawn_self`
    pub fn component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    pub fn registry(mut self, registry: Arc<TaskRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Validates the configuration, assigns a fresh id and checks the task in
    pub fn build(self) -> Result<Arc<Task>, RuntimeError> {
        if let Some(shared) = &self.shared {
            if self.range == ExecutionRange::Process && shared.range() == ExecutionRange::Thread {
                return Err(RuntimeError::InvalidConfiguration(
                    "a process-range task cannot use a thread-range shared object".to_string(),
                ));
            }
        }

        let id = Uuid::new_v4();
        if let Some(shared) = &self.shared {
            shared.checkin(id)?;
        }

        let task = Task {
            id,
            range: self.range,
            body: self.body,
            shared: self.shared,
            events: EventSource::new(),
            state: Mutex::new(TaskState::Created),
            runs: AtomicU64::new(0),
            log_level: RwLock::new(self.log_level),
            component: self.component,
            registry: self.registry.unwrap_or_default(),
            config: self.config,
            handles: Mutex::new(HandleSet::new()),
            checked_out: AtomicBool::new(false),
        };

        if task.logs(Level::INFO) {
            tracing::info!(
                "Task {} ({}) created, range {}",
                task.id,
                task.body_type(),
                task.range
            );
        }
        Ok(Arc::new(task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SharedState;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;
    use weftcore::{FnBody, Message};

    fn counting_body(counter: Arc<AtomicUsize>) -> Box<dyn TaskBody> {
        Box::new(FnBody::new("test.count", move |_ctx: &TaskContext, _kwargs: &Kwargs| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
    }

    fn thread_task(counter: Arc<AtomicUsize>) -> Arc<Task> {
        Task::builder_boxed(counting_body(counter))
            .range(ExecutionRange::Thread)
            .build()
            .unwrap()
    }

    #[test]
    fn ids_are_unique() {
        let ids: HashSet<TaskId> = (0..500)
            .map(|_| thread_task(Arc::new(AtomicUsize::new(0))).id())
            .collect();
        assert_eq!(ids.len(), 500);
    }

    #[test]
    fn run_raises_finished_with_kwargs() {
        let task = thread_task(Arc::new(AtomicUsize::new(0)));
        let received = Arc::new(Mutex::new(None));
        let sink = received.clone();

        task.register_event_handler(
            EventId::Finished,
            Arc::new(move |event: &Event| {
                *sink.lock().unwrap() = Some((event.source, event.kwargs.clone()));
                Ok(())
            }),
        );

        assert_eq!(task.state(), TaskState::Created);
        task.run(Kwargs::new().with("step", 3)).unwrap();

        let (source, kwargs) = received.lock().unwrap().clone().unwrap();
        assert_eq!(source, task.id());
        assert_eq!(kwargs.get_u64("step"), Some(3));
        assert_eq!(task.state(), TaskState::Finished);
        assert_eq!(task.runs(), 1);
    }

    #[test]
    fn body_error_skips_finished_and_propagates() {
        let task = Task::builder(FnBody::new("test.fail", |_ctx: &TaskContext, _kwargs: &Kwargs| {
            Err(TaskError::ExecutionFailed("no luck".to_string()))
        }))
        .range(ExecutionRange::Thread)
        .build()
        .unwrap();

        let raised = Arc::new(AtomicUsize::new(0));
        let sink = raised.clone();
        task.register_event_handler(
            EventId::Finished,
            Arc::new(move |_event: &Event| {
                sink.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        assert!(matches!(task.run(Kwargs::new()), Err(TaskError::ExecutionFailed(_))));
        assert_eq!(raised.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn successor_error_reaches_the_first_caller() {
        let head = thread_task(Arc::new(AtomicUsize::new(0)));
        let tail = Task::builder(FnBody::new("test.fail", |_ctx: &TaskContext, _kwargs: &Kwargs| {
            Err(TaskError::ExecutionFailed("tail broke".to_string()))
        }))
        .range(ExecutionRange::Thread)
        .build()
        .unwrap();

        head.register_event_handler(EventId::Finished, tail.run_on_event());

        let result = head.run(Kwargs::new());
        assert!(matches!(result, Err(TaskError::ExecutionFailed(msg)) if msg == "tail broke"));
        assert_eq!(tail.runs(), 1);
    }

    #[test]
    fn checkin_on_build_and_checkout_on_drop() {
        let shared = Arc::new(SharedState::new(ExecutionRange::Thread));
        let task = Task::builder_boxed(counting_body(Arc::new(AtomicUsize::new(0))))
            .range(ExecutionRange::Thread)
            .shared(shared.clone())
            .build()
            .unwrap();

        assert_eq!(shared.active_tasks().unwrap(), vec![task.id()]);
        drop(task);
        assert!(shared.active_tasks().unwrap().is_empty());
    }

    #[test]
    fn checkout_survives_a_failed_run() {
        let shared = Arc::new(SharedState::new(ExecutionRange::Thread));
        let task = Task::builder(FnBody::new("test.fail", |_ctx: &TaskContext, _kwargs: &Kwargs| {
            Err(TaskError::ExecutionFailed("boom".to_string()))
        }))
        .range(ExecutionRange::Thread)
        .shared(shared.clone())
        .build()
        .unwrap();

        assert!(task.run(Kwargs::new()).is_err());
        drop(task);
        assert!(shared.active_tasks().unwrap().is_empty());
    }

    #[test]
    fn process_task_rejects_thread_shared_object() {
        let shared = Arc::new(SharedState::new(ExecutionRange::Thread));
        let result = Task::builder_boxed(counting_body(Arc::new(AtomicUsize::new(0))))
            .range(ExecutionRange::Process)
            .shared(shared)
            .build();
        assert!(matches!(result, Err(RuntimeError::InvalidConfiguration(_))));
    }

    #[test]
    fn run_loop_stops_on_terminate() {
        let shared = Arc::new(SharedState::new(ExecutionRange::Thread));
        let counter = Arc::new(AtomicUsize::new(0));
        let task = Task::builder(FnBody::new("test.tick", {
            let counter = counter.clone();
            move |_ctx: &TaskContext, _kwargs: &Kwargs| {
                counter.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(5));
                Ok(())
            }
        }))
        .range(ExecutionRange::Thread)
        .shared(shared.clone())
        .build()
        .unwrap();

        let worker = {
            let task = task.clone();
            thread::spawn(move || task.run_loop(Kwargs::new()))
        };

        while counter.load(Ordering::SeqCst) < 3 {
            thread::sleep(Duration::from_millis(1));
        }
        shared
            .send_message(Some(task.id()), Message::terminate(None))
            .unwrap();
        let runs_at_terminate = counter.load(Ordering::SeqCst);

        worker.join().unwrap().unwrap();
        assert!(counter.load(Ordering::SeqCst) <= runs_at_terminate + 1);
        assert_eq!(task.state(), TaskState::Finished);
    }

    #[test]
    fn run_loop_ignores_data_messages() {
        let shared = Arc::new(SharedState::new(ExecutionRange::Thread));
        let task = Task::builder(FnBody::new("test.stop_after_three", {
            let shared = shared.clone();
            move |ctx: &TaskContext, _kwargs: &Kwargs| {
                shared.send_message(Some(ctx.task_id), Message::data(None, json!("noise")))?;
                Ok(())
            }
        }))
        .range(ExecutionRange::Thread)
        .shared(shared.clone())
        .build()
        .unwrap();

        let handler_shared = shared.clone();
        let id = task.id();
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = fired.clone();
        task.register_event_handler(
            EventId::Finished,
            Arc::new(move |_event: &Event| {
                if seen.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                    handler_shared.send_message(Some(id), Message::terminate(None))?;
                }
                Ok(())
            }),
        );

        task.run_loop(Kwargs::new()).unwrap();
        assert_eq!(task.runs(), 3);
    }

    #[test]
    fn body_can_lock_through_its_context() {
        let shared = Arc::new(SharedState::new(ExecutionRange::Thread));
        let holder = Arc::new(Mutex::new(None));
        let sink = holder.clone();
        let probe = shared.clone();

        let task = Task::builder(FnBody::new("test.lock", move |ctx: &TaskContext, _kwargs: &Kwargs| {
            let _guard = ctx.lock_shared(None)?;
            *sink.lock().unwrap() = probe.holder();
            Ok(())
        }))
        .range(ExecutionRange::Thread)
        .shared(shared.clone())
        .build()
        .unwrap();

        task.run(Kwargs::new()).unwrap();
        assert_eq!(*holder.lock().unwrap(), Some(task.id()));
        assert_eq!(shared.holder(), None);
    }

    #[test]
    fn run_async_on_thread_range() {
        let task = thread_task(Arc::new(AtomicUsize::new(0)));
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let hits = hits.clone();
            task.run_async(SpawnTarget::callable(
                move |_kwargs| {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                Kwargs::new(),
            ))
            .unwrap();
        }

        assert_eq!(task.pending_async_tasks(), 3);
        let outcomes = task.wait_async_tasks();
        assert_eq!(outcomes, vec![Outcome::Completed; 3]);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(task.pending_async_tasks(), 0);
    }

    #[test]
    fn spawn_self_requires_a_component() {
        let task = thread_task(Arc::new(AtomicUsize::new(0)));
        assert!(matches!(
            task.spawn_self(Kwargs::new(), Autorun::Run),
            Err(RuntimeError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn switch_logging_updates_context() {
        let task = thread_task(Arc::new(AtomicUsize::new(0)));
        task.switch_logging(LevelFilter::OFF);
        assert_eq!(task.log_level(), LevelFilter::OFF);
        assert_eq!(task.context().log_level, LevelFilter::OFF);
    }
}
