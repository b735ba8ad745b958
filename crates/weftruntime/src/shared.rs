use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};
use weftcore::{ExecutionRange, Message, MessageKind, Shared, SharedError, TaskId};

/// In-memory shared object
///
/// One instance per workflow. Thread-range tasks use it directly; for the
/// process range a `SharedManager` serves it to worker processes, which
/// reach it through a `SharedClient`.
pub struct SharedState {
    range: ExecutionRange,
    lock: Mutex<LockState>,
    released: Condvar,
    registry: Mutex<Registry>,
    closed: AtomicBool,
    endpoint: OnceLock<SocketAddr>,
}

#[derive(Default)]
struct LockState {
    holder: Option<TaskId>,
    depth: usize,
}

#[derive(Default)]
struct Registry {
    active: BTreeSet<TaskId>,
    mailbox: HashMap<(TaskId, MessageKind), Message>,
}

impl SharedState {
    pub fn new(range: ExecutionRange) -> Self {
        Self {
            range,
            lock: Mutex::new(LockState::default()),
            released: Condvar::new(),
            registry: Mutex::new(Registry::default()),
            closed: AtomicBool::new(false),
            endpoint: OnceLock::new(),
        }
    }

    /// Tears the object down. Every later call fails with `NotAvailable`
    /// and tasks blocked in `lock` wake up with the same error.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _state = self.lock_state();
        self.released.notify_all();
        tracing::debug!("Shared object closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Current lock holder, if any
    pub fn holder(&self) -> Option<TaskId> {
        self.lock_state().holder
    }

    pub(crate) fn set_endpoint(&self, address: SocketAddr) {
        if self.endpoint.set(address).is_err() {
            tracing::warn!("Shared object is already served at {:?}", self.endpoint.get());
        }
    }

    fn ensure_open(&self) -> Result<(), SharedError> {
        if self.is_closed() {
            Err(SharedError::NotAvailable("shared object has been torn down".to_string()))
        } else {
            Ok(())
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, LockState> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Shared for SharedState {
    fn range(&self) -> ExecutionRange {
        self.range
    }

    fn lock(&self, owner: TaskId, timeout: Option<Duration>) -> Result<bool, SharedError> {
        self.ensure_open()?;
        let mut state = self.lock_state();

        if state.holder == Some(owner) {
            state.depth += 1;
            return Ok(true);
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        while state.holder.is_some() {
            self.ensure_open()?;
            match deadline {
                None => {
                    state = self
                        .released
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        tracing::debug!("Lock timeout for {}", owner);
                        return Ok(false);
                    }
                    let (next, _) = self
                        .released
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    state = next;
                }
            }
        }
        self.ensure_open()?;

        state.holder = Some(owner);
        state.depth = 1;
        tracing::debug!("Shared object locked by {}", owner);
        Ok(true)
    }

    fn unlock(&self, owner: TaskId) -> Result<(), SharedError> {
        self.ensure_open()?;
        let mut state = self.lock_state();

        if state.holder != Some(owner) {
            return Ok(());
        }

        state.depth -= 1;
        if state.depth == 0 {
            state.holder = None;
            self.released.notify_one();
            tracing::debug!("Shared object unlocked by {}", owner);
        }
        Ok(())
    }

    fn checkin(&self, task: TaskId) -> Result<(), SharedError> {
        let shared: &dyn Shared = self;
        let _guard = shared.acquire(task, None)?;

        if self.registry().active.insert(task) {
            tracing::debug!("Task {} checked in", task);
        }
        Ok(())
    }

    fn checkout(&self, task: TaskId) -> Result<(), SharedError> {
        let shared: &dyn Shared = self;
        let _guard = shared.acquire(task, None)?;

        let mut registry = self.registry();
        if registry.active.remove(&task) {
            registry.mailbox.retain(|(recipient, _), _| *recipient != task);
            tracing::debug!("Task {} checked out", task);
        }
        Ok(())
    }

    fn send_message(&self, target: Option<TaskId>, message: Message) -> Result<(), SharedError> {
        self.ensure_open()?;
        let mut registry = self.registry();

        match target {
            Some(task) => {
                registry.mailbox.insert((task, message.kind), message);
            }
            None => {
                let recipients: Vec<TaskId> = registry.active.iter().copied().collect();
                for task in recipients {
                    registry.mailbox.insert((task, message.kind), message.clone());
                }
            }
        }
        Ok(())
    }

    fn receive_message(
        &self,
        task: TaskId,
        kind: Option<MessageKind>,
    ) -> Result<Option<Message>, SharedError> {
        self.ensure_open()?;
        let mut registry = self.registry();

        let message = match kind {
            Some(kind) => registry.mailbox.remove(&(task, kind)),
            None => registry
                .mailbox
                .remove(&(task, MessageKind::Terminate))
                .or_else(|| registry.mailbox.remove(&(task, MessageKind::Data))),
        };
        Ok(message)
    }

    fn active_tasks(&self) -> Result<Vec<TaskId>, SharedError> {
        self.ensure_open()?;
        Ok(self.registry().active.iter().copied().collect())
    }

    fn endpoint(&self) -> Option<SocketAddr> {
        self.endpoint.get().copied()
    }
}
