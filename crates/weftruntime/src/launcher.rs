use crate::worker::{run_component, ComponentSpec};
use crate::{RuntimeConfig, TaskRegistry};
use std::fmt;
use std::net::SocketAddr;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use weftcore::{ExecutionRange, Kwargs, RuntimeError, Shared, SpawnError, TaskError};

const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Closure launched by `SpawnTarget::Callable`
pub type AsyncFn = Box<dyn FnOnce(Kwargs) -> Result<(), TaskError> + Send + 'static>;

/// What to start asynchronously
pub enum SpawnTarget {
    /// A plain function, called with the given arguments
    Callable { func: AsyncFn, kwargs: Kwargs },
    /// A registered component, constructed inside the new thread or process
    Component(ComponentSpec),
}

impl SpawnTarget {
    pub fn callable<F>(func: F, kwargs: Kwargs) -> Self
    where
        F: FnOnce(Kwargs) -> Result<(), TaskError> + Send + 'static,
    {
        SpawnTarget::Callable {
            func: Box::new(func),
            kwargs,
        }
    }

    pub fn component(spec: ComponentSpec) -> Self {
        SpawnTarget::Component(spec)
    }

    fn label(&self) -> String {
        match self {
            SpawnTarget::Callable { .. } => "callable".to_string(),
            SpawnTarget::Component(spec) => spec.component.clone(),
        }
    }
}

/// How an asynchronous task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed(String),
    Panicked(String),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Completed)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Completed => f.write_str("completed"),
            Outcome::Failed(reason) => write!(f, "failed: {}", reason),
            Outcome::Panicked(reason) => write!(f, "panicked: {}", reason),
        }
    }
}

enum HandleKind {
    Thread(Mutex<Option<JoinHandle<Result<(), RuntimeError>>>>),
    Process(Mutex<Child>),
}

/// Handle of a spawned thread or process
///
/// A failure inside the spawned task is only visible through `join`.
pub struct Handle {
    label: String,
    kind: HandleKind,
    outcome: Mutex<Option<Outcome>>,
}

impl Handle {
    fn thread(label: String, handle: JoinHandle<Result<(), RuntimeError>>) -> Self {
        Self {
            label,
            kind: HandleKind::Thread(Mutex::new(Some(handle))),
            outcome: Mutex::new(None),
        }
    }

    fn process(label: String, child: Child) -> Self {
        Self {
            label,
            kind: HandleKind::Process(Mutex::new(child)),
            outcome: Mutex::new(None),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn range(&self) -> ExecutionRange {
        match self.kind {
            HandleKind::Thread(_) => ExecutionRange::Thread,
            HandleKind::Process(_) => ExecutionRange::Process,
        }
    }

    /// OS process id for process-range handles
    pub fn pid(&self) -> Option<u32> {
        match &self.kind {
            HandleKind::Thread(_) => None,
            HandleKind::Process(child) => {
                Some(child.lock().unwrap_or_else(PoisonError::into_inner).id())
            }
        }
    }

    pub fn is_alive(&self) -> bool {
        match &self.kind {
            HandleKind::Thread(handle) => handle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
                .is_some_and(|h| !h.is_finished()),
            HandleKind::Process(child) => matches!(
                child
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .try_wait(),
                Ok(None)
            ),
        }
    }

    /// Blocks until the thread or process has ended. Repeated calls return
    /// the first outcome.
    pub fn join(&self) -> Outcome {
        let mut cached = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(outcome) = cached.as_ref() {
            return outcome.clone();
        }

        let outcome = match &self.kind {
            HandleKind::Thread(handle) => {
                let handle = handle.lock().unwrap_or_else(PoisonError::into_inner).take();
                match handle.map(JoinHandle::join) {
                    Some(Ok(Ok(()))) | None => Outcome::Completed,
                    Some(Ok(Err(e))) => Outcome::Failed(e.to_string()),
                    Some(Err(panic)) => Outcome::Panicked(panic_message(panic.as_ref())),
                }
            }
            HandleKind::Process(child) => match wait_child(child) {
                Ok(status) if status.success() => Outcome::Completed,
                Ok(status) => Outcome::Failed(format!("worker exited with {}", status)),
                Err(e) => Outcome::Failed(format!("cannot wait for worker: {}", e)),
            },
        };

        tracing::debug!("Async task {} {}", self.label, outcome);
        *cached = Some(outcome.clone());
        outcome
    }
}

/// Polls the child, releasing its mutex between polls so `is_alive` and
/// `pid` never wait on a blocked `join`
fn wait_child(child: &Mutex<Child>) -> std::io::Result<ExitStatus> {
    loop {
        let status = child.lock().unwrap_or_else(PoisonError::into_inner).try_wait()?;
        if let Some(status) = status {
            return Ok(status);
        }
        std::thread::sleep(CHILD_POLL_INTERVAL);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Handles in spawn order
#[derive(Default)]
pub struct HandleSet {
    handles: Vec<Handle>,
}

impl HandleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, handle: Handle) {
        self.handles.push(handle);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Joins every handle in spawn order and empties the set
    pub fn join_all(&mut self) -> Vec<Outcome> {
        self.handles.drain(..).map(|handle| handle.join()).collect()
    }
}

/// Starts work asynchronously within one execution range
pub trait Launcher: Send + Sync {
    fn range(&self) -> ExecutionRange;

    /// Starts `target` without waiting for it
    fn spawn(&self, target: SpawnTarget) -> Result<Handle, SpawnError>;
}

/// Runs targets on new OS threads of the current process
pub struct ThreadLauncher {
    registry: Arc<TaskRegistry>,
    shared: Option<Arc<dyn Shared>>,
    config: RuntimeConfig,
}

impl ThreadLauncher {
    pub fn new(
        registry: Arc<TaskRegistry>,
        shared: Option<Arc<dyn Shared>>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            registry,
            shared,
            config,
        }
    }
}

impl Launcher for ThreadLauncher {
    fn range(&self) -> ExecutionRange {
        ExecutionRange::Thread
    }

    fn spawn(&self, target: SpawnTarget) -> Result<Handle, SpawnError> {
        let label = target.label();
        let builder = std::thread::Builder::new().name(format!("weft-{}", label));

        let handle = match target {
            SpawnTarget::Callable { func, kwargs } => builder
                .spawn(move || func(kwargs).map_err(RuntimeError::from))
                .map_err(SpawnError::Thread)?,
            SpawnTarget::Component(spec) => {
                if !self.registry.contains(&spec.component) {
                    return Err(SpawnError::UnknownComponent(spec.component));
                }
                let registry = self.registry.clone();
                let shared = self.shared.clone();
                let config = self.config.clone();
                builder
                    .spawn(move || {
                        run_component(registry, &spec, ExecutionRange::Thread, shared, &config)
                    })
                    .map_err(SpawnError::Thread)?
            }
        };

        tracing::info!("Spawned thread for {}", label);
        Ok(Handle::thread(label, handle))
    }
}

/// Runs components in worker processes started from the configured program
pub struct ProcessLauncher {
    shared: Option<SocketAddr>,
    config: RuntimeConfig,
}

impl ProcessLauncher {
    pub fn new(shared: Option<SocketAddr>, config: RuntimeConfig) -> Self {
        Self { shared, config }
    }
}

impl Launcher for ProcessLauncher {
    fn range(&self) -> ExecutionRange {
        ExecutionRange::Process
    }

    fn spawn(&self, target: SpawnTarget) -> Result<Handle, SpawnError> {
        let mut spec = match target {
            SpawnTarget::Component(spec) => spec,
            SpawnTarget::Callable { .. } => {
                return Err(SpawnError::Unsupported(
                    "a closure cannot cross a process boundary; spawn a registered component"
                        .to_string(),
                ))
            }
        };
        if spec.shared.is_none() {
            spec.shared = self.shared;
        }

        let program = self
            .config
            .resolve_worker_program()
            .map_err(|source| SpawnError::Process {
                program: "<current executable>".to_string(),
                source,
            })?;
        let encoded =
            serde_json::to_string(&spec).map_err(|e| SpawnError::Component(e.to_string()))?;

        let child = Command::new(&program)
            .args(&self.config.worker_args)
            .arg("--spec")
            .arg(&encoded)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| SpawnError::Process {
                program: program.display().to_string(),
                source,
            })?;

        tracing::info!(
            "Spawned worker process {} for {} ({})",
            child.id(),
            spec.component,
            program.display()
        );
        Ok(Handle::process(spec.component, child))
    }
}

/// Picks the launcher for `range`
///
/// Process-range launching needs the shared object (if any) to be served by
/// a manager, since worker processes can only reach it over the wire.
pub fn launcher_for(
    range: ExecutionRange,
    registry: Arc<TaskRegistry>,
    shared: Option<Arc<dyn Shared>>,
    config: RuntimeConfig,
) -> Result<Box<dyn Launcher>, RuntimeError> {
    match range {
        ExecutionRange::Thread => Ok(Box::new(ThreadLauncher::new(registry, shared, config))),
        ExecutionRange::Process => {
            let endpoint = match &shared {
                Some(shared) => Some(shared.endpoint().ok_or_else(|| {
                    RuntimeError::InvalidConfiguration(
                        "process-range launching needs a shared object served by a SharedManager"
                            .to_string(),
                    )
                })?),
                None => None,
            };
            Ok(Box::new(ProcessLauncher::new(endpoint, config)))
        }
    }
}
