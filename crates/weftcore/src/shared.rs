use crate::{ExecutionRange, Message, MessageKind, SharedError, TaskId};
use std::net::SocketAddr;
use std::time::Duration;

/// Lock-guarded registry and mailbox reachable by every task of a workflow
///
/// Implemented in memory for thread-range workflows and by a proxy talking
/// to a manager for process-range ones; callers cannot tell them apart.
pub trait Shared: Send + Sync {
    /// Range the object was created for
    fn range(&self) -> ExecutionRange;

    /// Acquires the lock for `owner`. Returns `Ok(true)` at once when `owner`
    /// already holds it, `Ok(false)` when `timeout` expires first. `None`
    /// waits forever.
    fn lock(&self, owner: TaskId, timeout: Option<Duration>) -> Result<bool, SharedError>;

    /// Releases one level of the lock held by `owner`; no-op for anyone else.
    fn unlock(&self, owner: TaskId) -> Result<(), SharedError>;

    /// Registers a task. Registering twice keeps a single entry.
    fn checkin(&self, task: TaskId) -> Result<(), SharedError>;

    /// Unregisters a task. Unknown ids are ignored.
    fn checkout(&self, task: TaskId) -> Result<(), SharedError>;

    /// Stores a message for `target`, or for every active task when `None`.
    fn send_message(&self, target: Option<TaskId>, message: Message) -> Result<(), SharedError>;

    /// Takes a pending message for `task` without blocking.
    fn receive_message(
        &self,
        task: TaskId,
        kind: Option<MessageKind>,
    ) -> Result<Option<Message>, SharedError>;

    fn active_tasks(&self) -> Result<Vec<TaskId>, SharedError>;

    /// Address a worker process can connect to, if the object is served
    fn endpoint(&self) -> Option<SocketAddr> {
        None
    }
}

impl<'a> dyn Shared + 'a {
    /// Scoped form of `lock`: the returned guard unlocks when dropped.
    pub fn acquire(
        &self,
        owner: TaskId,
        timeout: Option<Duration>,
    ) -> Result<Option<SharedGuard<'_>>, SharedError> {
        if self.lock(owner, timeout)? {
            Ok(Some(SharedGuard { shared: self, owner }))
        } else {
            Ok(None)
        }
    }
}

/// Holds the lock of a shared object until dropped
pub struct SharedGuard<'a> {
    shared: &'a dyn Shared,
    owner: TaskId,
}

impl SharedGuard<'_> {
    pub fn owner(&self) -> TaskId {
        self.owner
    }

    pub fn shared(&self) -> &dyn Shared {
        self.shared
    }
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.shared.unlock(self.owner) {
            tracing::warn!("Failed to release shared lock for {}: {}", self.owner, e);
        }
    }
}
