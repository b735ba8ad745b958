use crate::task::{Task, TaskBuilder};
use crate::{RuntimeConfig, SharedManager, SharedState, TaskRegistry};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::Level;
use weftcore::{
    EventHandler, EventId, ExecutionRange, Kwargs, LevelFilter, RuntimeError, Shared, TaskBody,
    TaskContext, TaskError, TaskId, WorkflowError,
};

type Entries = Arc<RwLock<Vec<Arc<Task>>>>;

/// Body of a workflow's own task: runs the entry tasks in order
struct WorkflowBody {
    entries: Entries,
}

impl TaskBody for WorkflowBody {
    fn body_type(&self) -> &str {
        "workflow"
    }

    fn run(&self, _ctx: &TaskContext, kwargs: &Kwargs) -> Result<(), TaskError> {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for entry in entries {
            entry.run(kwargs.clone())?;
        }
        Ok(())
    }
}

/// Shared state created by the workflow itself
struct HostedShared {
    state: Arc<SharedState>,
    manager: Option<SharedManager>,
}

/// A task composed of member tasks wired together by their Finished events
///
/// Entry tasks (added without predecessors) are run by `run`; every other
/// member runs when one of its predecessors finishes, once per finished
/// predecessor. The workflow raises its own Finished event after the whole
/// synchronous chain has returned, so it can itself be a member of another
/// workflow.
pub struct Workflow {
    name: String,
    task: Arc<Task>,
    members: Vec<Arc<Task>>,
    entries: Entries,
    graph: DiGraph<TaskId, ()>,
    index: HashMap<TaskId, NodeIndex>,
    registry: Arc<TaskRegistry>,
    config: RuntimeConfig,
    hosted: Option<HostedShared>,
}

impl Workflow {
    pub fn builder() -> WorkflowBuilder {
        WorkflowBuilder::default()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> TaskId {
        self.task.id()
    }

    pub fn range(&self) -> ExecutionRange {
        self.task.range()
    }

    /// The workflow's own task, for nesting or for chaining on its Finished event
    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    pub fn shared(&self) -> Option<&Arc<dyn Shared>> {
        self.task.shared()
    }

    /// Manager address when the workflow serves its own process-range state
    pub fn manager_address(&self) -> Option<std::net::SocketAddr> {
        self.hosted
            .as_ref()
            .and_then(|hosted| hosted.manager.as_ref())
            .map(SharedManager::address)
    }

    /// Builder for a member task with the workflow's range, shared object,
    /// log level and configuration preset
    pub fn new_task(&self, body: impl TaskBody + 'static) -> TaskBuilder {
        Task::builder(body)
            .range(self.task.range())
            .shared_opt(self.task.shared().cloned())
            .log_level(self.task.log_level())
            .registry(self.registry.clone())
            .config(self.config.clone())
    }

    /// Builds a member task from a registered component
    pub fn new_component(&self, component: &str, kwargs: &Kwargs) -> Result<TaskBuilder, RuntimeError> {
        let body = self.registry.create(component, kwargs)?;
        Ok(Task::builder_boxed(body)
            .range(self.task.range())
            .shared_opt(self.task.shared().cloned())
            .log_level(self.task.log_level())
            .component(component)
            .registry(self.registry.clone())
            .config(self.config.clone()))
    }

    /// Adds `task` as a member
    ///
    /// Without predecessors the task becomes an entry task. Otherwise it is
    /// run whenever one of `predecessors` finishes; listing the same
    /// predecessor twice still makes one edge.
    pub fn add_task(&mut self, task: Arc<Task>, predecessors: &[Arc<Task>]) -> Result<(), WorkflowError> {
        if task.id() == self.task.id() {
            return Err(WorkflowError::SelfMembership);
        }
        if self.index.contains_key(&task.id()) {
            return Err(WorkflowError::DuplicateTask(task.id()));
        }

        let mut seen = HashSet::new();
        let mut sources = Vec::with_capacity(predecessors.len());
        for predecessor in predecessors {
            let node = *self
                .index
                .get(&predecessor.id())
                .ok_or(WorkflowError::UnknownTask(predecessor.id()))?;
            if seen.insert(predecessor.id()) {
                sources.push((node, predecessor));
            }
        }

        if !self.shares_with(&task) {
            tracing::warn!(
                "Workflow {}: task {} does not use the workflow's shared object",
                self.name,
                task.id()
            );
        }
        task.switch_logging(self.task.log_level());

        let node = self.graph.add_node(task.id());
        self.index.insert(task.id(), node);
        self.members.push(task.clone());

        if sources.is_empty() {
            self.entries
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .push(task.clone());
            if self.logs(Level::INFO) {
                tracing::info!("Workflow {}: added entry task {}", self.name, task.id());
            }
            return Ok(());
        }

        for (source, predecessor) in sources {
            self.graph.add_edge(source, node, ());
            predecessor.register_event_handler(EventId::Finished, task.run_on_event());
        }
        if self.logs(Level::INFO) {
            tracing::info!(
                "Workflow {}: added task {} after {} predecessor(s)",
                self.name,
                task.id(),
                seen.len()
            );
        }
        Ok(())
    }

    /// Wires an extra edge between two members
    ///
    /// Connecting an already connected pair does nothing. An edge that would
    /// close a cycle is refused and leaves the workflow unchanged.
    pub fn connect(&mut self, predecessor: &Arc<Task>, successor: &Arc<Task>) -> Result<(), WorkflowError> {
        let source = self.node(predecessor.id())?;
        let target = self.node(successor.id())?;
        if self.graph.contains_edge(source, target) {
            return Ok(());
        }

        let edge = self.graph.add_edge(source, target, ());
        if toposort(&self.graph, None).is_err() {
            self.graph.remove_edge(edge);
            return Err(WorkflowError::CyclicDependency);
        }

        predecessor.register_event_handler(EventId::Finished, successor.run_on_event());
        if self.logs(Level::DEBUG) {
            tracing::debug!(
                "Workflow {}: connected {} -> {}",
                self.name,
                predecessor.id(),
                successor.id()
            );
        }
        Ok(())
    }

    /// Runs every entry task in registration order, then raises the
    /// workflow's Finished event
    pub fn run(&self, kwargs: Kwargs) -> Result<(), TaskError> {
        if self.logs(Level::INFO) {
            tracing::info!(
                "Workflow {}: running {} entry task(s) of {}",
                self.name,
                self.entry_count(),
                self.members.len()
            );
        }
        self.task.run(kwargs)
    }

    pub fn run_loop(&self, kwargs: Kwargs) -> Result<(), TaskError> {
        self.task.run_loop(kwargs)
    }

    pub fn register_event_handler(&self, event_id: EventId, handler: EventHandler) {
        self.task.register_event_handler(event_id, handler);
    }

    /// Sets the log level of the workflow and every member
    pub fn switch_logging(&self, level: LevelFilter) {
        self.task.switch_logging(level);
        for member in &self.members {
            member.switch_logging(level);
        }
    }

    pub fn log_level(&self) -> LevelFilter {
        self.task.log_level()
    }

    /// Members in insertion order
    pub fn tasks(&self) -> &[Arc<Task>] {
        &self.members
    }

    pub fn entry_tasks(&self) -> Vec<Arc<Task>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.index.contains_key(&id)
    }

    /// Direct successors of a member, in membership order
    pub fn successors(&self, id: TaskId) -> Result<Vec<TaskId>, WorkflowError> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Direct predecessors of a member, in membership order
    pub fn predecessors(&self, id: TaskId) -> Result<Vec<TaskId>, WorkflowError> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Members nothing else waits for
    pub fn terminal_tasks(&self) -> Vec<TaskId> {
        self.members
            .iter()
            .map(|member| member.id())
            .filter(|id| {
                self.graph
                    .neighbors_directed(self.index[id], Direction::Outgoing)
                    .next()
                    .is_none()
            })
            .collect()
    }

    /// Members ordered so that every predecessor comes before its successors
    pub fn topological_order(&self) -> Result<Vec<TaskId>, WorkflowError> {
        let order = toposort(&self.graph, None).map_err(|_| WorkflowError::CyclicDependency)?;
        Ok(order.into_iter().map(|node| self.graph[node]).collect())
    }

    fn node(&self, id: TaskId) -> Result<NodeIndex, WorkflowError> {
        self.index.get(&id).copied().ok_or(WorkflowError::UnknownTask(id))
    }

    fn neighbors(&self, id: TaskId, direction: Direction) -> Result<Vec<TaskId>, WorkflowError> {
        let node = self.node(id)?;
        let linked: HashSet<TaskId> = self
            .graph
            .neighbors_directed(node, direction)
            .map(|neighbor| self.graph[neighbor])
            .collect();
        Ok(self
            .members
            .iter()
            .map(|member| member.id())
            .filter(|member| linked.contains(member))
            .collect())
    }

    fn entry_count(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn shares_with(&self, task: &Task) -> bool {
        match (self.task.shared(), task.shared()) {
            (None, _) => true,
            (Some(own), Some(theirs)) => {
                std::ptr::eq(Arc::as_ptr(own) as *const (), Arc::as_ptr(theirs) as *const ())
            }
            (Some(_), None) => false,
        }
    }

    fn logs(&self, level: Level) -> bool {
        level <= self.task.log_level()
    }
}

impl Drop for Workflow {
    fn drop(&mut self) {
        // Break task -> body -> entries references before members go
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.members.clear();

        if let Err(e) = self.task.checkout() {
            tracing::debug!("Workflow {} checkout on drop failed: {}", self.name, e);
        }

        if let Some(mut hosted) = self.hosted.take() {
            hosted.state.close();
            if let Some(manager) = hosted.manager.as_mut() {
                manager.shutdown();
            }
            tracing::info!("Workflow {}: shared object closed", self.name);
        }
    }
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("name", &self.name)
            .field("id", &self.id())
            .field("range", &self.range())
            .field("members", &self.members.len())
            .field("entries", &self.entry_count())
            .finish()
    }
}

/// Builder for `Workflow`
#[derive(Default)]
pub struct WorkflowBuilder {
    name: Option<String>,
    range: ExecutionRange,
    shared: Option<Arc<dyn Shared>>,
    host_shared: bool,
    log_level: Option<LevelFilter>,
    registry: Option<Arc<TaskRegistry>>,
    config: RuntimeConfig,
}

impl WorkflowBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn range(mut self, range: ExecutionRange) -> Self {
        self.range = range;
        self
    }

    /// Attach to an existing shared object
    pub fn shared(mut self, shared: Arc<dyn Shared>) -> Self {
        self.shared = Some(shared);
        self
    }

    /// Create and own a shared object of the workflow's range. For the
    /// process range it is served by a `SharedManager` as well.
    pub fn host_shared(mut self) -> Self {
        self.host_shared = true;
        self
    }

    pub fn log_level(mut self, level: LevelFilter) -> Self {
        self.log_level = Some(level);
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

    pub fn build(self) -> Result<Workflow, RuntimeError> {
        if self.host_shared && self.shared.is_some() {
            return Err(RuntimeError::InvalidConfiguration(
                "a workflow either hosts its shared object or attaches to one".to_string(),
            ));
        }

        let hosted = if self.host_shared {
            let state = Arc::new(SharedState::new(self.range));
            let manager = match self.range {
                ExecutionRange::Process => {
                    Some(SharedManager::start_with_config(state.clone(), &self.config)?)
                }
                ExecutionRange::Thread => None,
            };
            Some(HostedShared { state, manager })
        } else {
            None
        };

        let shared = match &hosted {
            Some(hosted) => Some(hosted.state.clone() as Arc<dyn Shared>),
            None => self.shared,
        };

        let registry = self.registry.unwrap_or_default();
        let entries: Entries = Arc::new(RwLock::new(Vec::new()));
        let task = Task::builder(WorkflowBody {
            entries: entries.clone(),
        })
        .range(self.range)
        .shared_opt(shared)
        .log_level(self.log_level.unwrap_or(LevelFilter::INFO))
        .registry(registry.clone())
        .config(self.config.clone())
        .build()?;

        let name = self.name.unwrap_or_else(|| format!("workflow-{}", task.id()));
        if Level::INFO <= task.log_level() {
            tracing::info!("Workflow {} created, range {}", name, task.range());
        }

        Ok(Workflow {
            name,
            task,
            members: Vec::new(),
            entries,
            graph: DiGraph::new(),
            index: HashMap::new(),
            registry,
            config: self.config,
            hosted,
        })
    }
}
