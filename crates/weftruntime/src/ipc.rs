//! Cross-process access to a shared object
//!
//! `SharedManager` serves a process-range `SharedState` over TCP on the
//! loopback interface; `SharedClient` is the proxy worker processes use.
//! Frames are single-line JSON objects, requests tagged by `op` and
//! responses by `status`.

use crate::{RuntimeConfig, SharedState};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use weftcore::{
    ExecutionRange, Message, MessageKind, RuntimeError, Shared, SharedError, SpawnError, TaskId,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    Range,
    Lock {
        owner: TaskId,
        timeout_ms: Option<u64>,
    },
    Unlock {
        owner: TaskId,
    },
    Checkin {
        task: TaskId,
    },
    Checkout {
        task: TaskId,
    },
    Send {
        target: Option<TaskId>,
        message: Message,
    },
    Receive {
        task: TaskId,
        kind: Option<MessageKind>,
    },
    ActiveTasks,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum Response {
    Done,
    Range { range: ExecutionRange },
    Locked { acquired: bool },
    Message { message: Option<Message> },
    Tasks { tasks: Vec<TaskId> },
    Error { kind: WireErrorKind, message: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum WireErrorKind {
    NotAvailable,
    Protocol,
}

impl From<SharedError> for Response {
    fn from(err: SharedError) -> Self {
        match err {
            SharedError::NotAvailable(message) => Response::Error {
                kind: WireErrorKind::NotAvailable,
                message,
            },
            SharedError::Protocol(message) => Response::Error {
                kind: WireErrorKind::Protocol,
                message,
            },
        }
    }
}

fn dispatch(state: &SharedState, request: Request) -> Response {
    let result = match request {
        Request::Range => Ok(Response::Range {
            range: state.range(),
        }),
        Request::Lock { owner, timeout_ms } => state
            .lock(owner, timeout_ms.map(Duration::from_millis))
            .map(|acquired| Response::Locked { acquired }),
        Request::Unlock { owner } => state.unlock(owner).map(|_| Response::Done),
        Request::Checkin { task } => state.checkin(task).map(|_| Response::Done),
        Request::Checkout { task } => state.checkout(task).map(|_| Response::Done),
        Request::Send { target, message } => {
            state.send_message(target, message).map(|_| Response::Done)
        }
        Request::Receive { task, kind } => state
            .receive_message(task, kind)
            .map(|message| Response::Message { message }),
        Request::ActiveTasks => state.active_tasks().map(|tasks| Response::Tasks { tasks }),
    };
    result.unwrap_or_else(Response::from)
}

/// Serves a process-range shared object to worker processes
///
/// Runs a small tokio runtime on a dedicated thread. Dropping the manager
/// stops the server; the shared object itself stays usable in-process.
pub struct SharedManager {
    address: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl SharedManager {
    pub fn start(state: Arc<SharedState>) -> Result<Self, RuntimeError> {
        Self::start_with_config(state, &RuntimeConfig::default())
    }

    pub fn start_with_config(
        state: Arc<SharedState>,
        config: &RuntimeConfig,
    ) -> Result<Self, RuntimeError> {
        if state.range() != ExecutionRange::Process {
            return Err(RuntimeError::InvalidConfiguration(format!(
                "only a process-range shared object can be served, got {}",
                state.range()
            )));
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("weft-manager-io")
            .enable_all()
            .build()?;
        let listener = runtime.block_on(TcpListener::bind(config.manager_bind))?;
        let address = listener.local_addr()?;
        state.set_endpoint(address);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let thread = std::thread::Builder::new()
            .name("weft-manager".to_string())
            .spawn(move || {
                runtime.block_on(serve(listener, state, shutdown_rx));
                // Lock requests may still be parked in blocking threads
                runtime.shutdown_timeout(Duration::from_millis(100));
            })
            .map_err(SpawnError::Thread)?;

        tracing::info!("Shared object manager listening on {}", address);

        Ok(Self {
            address,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Stops accepting requests and waits for the server thread
    pub fn shutdown(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Shared object manager thread panicked");
            }
            tracing::info!("Shared object manager on {} stopped", self.address);
        }
    }
}

impl Drop for SharedManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn serve(listener: TcpListener, state: Arc<SharedState>, mut shutdown: oneshot::Receiver<()>) {
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!("Shared object client connected from {}", peer);
                    let state = state.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, state).await {
                            tracing::debug!("Shared object connection from {} ended: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!("Failed to accept shared object client: {}", e);
                }
            }
        }
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    state: Arc<SharedState>,
) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let (reader, mut writer) = stream.into_split();
    let mut lines = tokio::io::BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                let state = state.clone();
                // `lock` may block for as long as another task holds the object
                tokio::task::spawn_blocking(move || dispatch(&state, request))
                    .await
                    .unwrap_or_else(|e| {
                        Response::from(SharedError::Protocol(format!("request handler failed: {}", e)))
                    })
            }
            Err(e) => Response::from(SharedError::Protocol(format!("malformed request: {}", e))),
        };

        let mut frame = serde_json::to_vec(&response)?;
        frame.push(b'\n');
        writer.write_all(&frame).await?;
    }

    Ok(())
}

struct Connection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

/// Proxy to a shared object served by a `SharedManager`
///
/// Requests travel over a small pool of connections, so one thread parked
/// in `lock` does not hold up another thread's `unlock`.
pub struct SharedClient {
    address: SocketAddr,
    idle: Mutex<Vec<Connection>>,
    pool_size: usize,
    connect_timeout: Duration,
}

impl SharedClient {
    pub fn connect(address: SocketAddr) -> Result<Self, SharedError> {
        Self::connect_with_config(address, &RuntimeConfig::default())
    }

    pub fn connect_with_config(
        address: SocketAddr,
        config: &RuntimeConfig,
    ) -> Result<Self, SharedError> {
        let client = Self {
            address,
            idle: Mutex::new(Vec::new()),
            pool_size: config.client_pool_size.max(1),
            connect_timeout: config.connect_timeout,
        };

        match client.request(&Request::Range)? {
            Response::Range {
                range: ExecutionRange::Process,
            } => {}
            other => {
                return Err(SharedError::Protocol(format!(
                    "{} does not serve a process-range shared object: {:?}",
                    address, other
                )))
            }
        }

        tracing::debug!("Connected to shared object at {}", address);
        Ok(client)
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    fn open(&self) -> Result<Connection, SharedError> {
        let unavailable = |e: std::io::Error| {
            SharedError::NotAvailable(format!("cannot reach manager at {}: {}", self.address, e))
        };

        let writer = TcpStream::connect_timeout(&self.address, self.connect_timeout)
            .map_err(unavailable)?;
        writer.set_nodelay(true).map_err(unavailable)?;
        let reader = BufReader::new(writer.try_clone().map_err(unavailable)?);
        Ok(Connection { reader, writer })
    }

    fn request(&self, request: &Request) -> Result<Response, SharedError> {
        let pooled = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let mut connection = match pooled {
            Some(connection) => connection,
            None => self.open()?,
        };

        // A connection that failed mid-exchange is dropped, not pooled
        let response = Self::exchange(&mut connection, request)?;

        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.pool_size {
            idle.push(connection);
        }
        drop(idle);

        match response {
            Response::Error { kind, message } => Err(match kind {
                WireErrorKind::NotAvailable => SharedError::NotAvailable(message),
                WireErrorKind::Protocol => SharedError::Protocol(message),
            }),
            response => Ok(response),
        }
    }

    fn exchange(connection: &mut Connection, request: &Request) -> Result<Response, SharedError> {
        let lost = |e: std::io::Error| {
            SharedError::NotAvailable(format!("connection to manager lost: {}", e))
        };

        let mut frame =
            serde_json::to_vec(request).map_err(|e| SharedError::Protocol(e.to_string()))?;
        frame.push(b'\n');
        connection.writer.write_all(&frame).map_err(lost)?;
        connection.writer.flush().map_err(lost)?;

        let mut line = String::new();
        let read = connection.reader.read_line(&mut line).map_err(lost)?;
        if read == 0 {
            return Err(SharedError::NotAvailable(
                "manager closed the connection".to_string(),
            ));
        }

        serde_json::from_str(&line)
            .map_err(|e| SharedError::Protocol(format!("malformed response: {}", e)))
    }

    fn unexpected(response: Response) -> SharedError {
        SharedError::Protocol(format!("unexpected response: {:?}", response))
    }
}

/// Timeouts travel in whole milliseconds, rounded up so a short wait is
/// never sent as none
fn wire_millis(timeout: Duration) -> u64 {
    timeout.as_micros().div_ceil(1000).min(u64::MAX as u128) as u64
}

impl Shared for SharedClient {
    fn range(&self) -> ExecutionRange {
        ExecutionRange::Process
    }

    fn lock(&self, owner: TaskId, timeout: Option<Duration>) -> Result<bool, SharedError> {
        let timeout_ms = timeout.map(wire_millis);
        match self.request(&Request::Lock { owner, timeout_ms })? {
            Response::Locked { acquired } => Ok(acquired),
            other => Err(Self::unexpected(other)),
        }
    }

    fn unlock(&self, owner: TaskId) -> Result<(), SharedError> {
        match self.request(&Request::Unlock { owner })? {
            Response::Done => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    fn checkin(&self, task: TaskId) -> Result<(), SharedError> {
        match self.request(&Request::Checkin { task })? {
            Response::Done => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    fn checkout(&self, task: TaskId) -> Result<(), SharedError> {
        match self.request(&Request::Checkout { task })? {
            Response::Done => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    fn send_message(&self, target: Option<TaskId>, message: Message) -> Result<(), SharedError> {
        match self.request(&Request::Send { target, message })? {
            Response::Done => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    fn receive_message(
        &self,
        task: TaskId,
        kind: Option<MessageKind>,
    ) -> Result<Option<Message>, SharedError> {
        match self.request(&Request::Receive { task, kind })? {
            Response::Message { message } => Ok(message),
            other => Err(Self::unexpected(other)),
        }
    }

    fn active_tasks(&self) -> Result<Vec<TaskId>, SharedError> {
        match self.request(&Request::ActiveTasks)? {
            Response::Tasks { tasks } => Ok(tasks),
            other => Err(Self::unexpected(other)),
        }
    }

    fn endpoint(&self) -> Option<SocketAddr> {
        Some(self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use uuid::Uuid;

    fn served() -> (Arc<SharedState>, SharedManager) {
        let state = Arc::new(SharedState::new(ExecutionRange::Process));
        let manager = SharedManager::start(state.clone()).unwrap();
        (state, manager)
    }

    #[test]
    fn thread_range_state_cannot_be_served() {
        let state = Arc::new(SharedState::new(ExecutionRange::Thread));
        assert!(matches!(
            SharedManager::start(state),
            Err(RuntimeError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn client_sees_the_served_state() {
        let (state, manager) = served();
        assert_eq!(state.endpoint(), Some(manager.address()));

        let client = SharedClient::connect(manager.address()).unwrap();
        let task = Uuid::new_v4();

        client.checkin(task).unwrap();
        client.checkin(task).unwrap();
        assert_eq!(state.active_tasks().unwrap(), vec![task]);
        assert_eq!(client.active_tasks().unwrap(), vec![task]);

        state
            .send_message(Some(task), Message::data(None, json!({"hello": "worker"})))
            .unwrap();
        let message = client
            .receive_message(task, Some(MessageKind::Data))
            .unwrap()
            .unwrap();
        assert_eq!(message.payload, json!({"hello": "worker"}));

        client.checkout(task).unwrap();
        assert!(state.active_tasks().unwrap().is_empty());
    }

    #[test]
    fn remote_lock_is_reentrant_and_times_out() {
        let (state, manager) = served();
        let client = SharedClient::connect(manager.address()).unwrap();
        let holder = Uuid::new_v4();

        assert!(client.lock(holder, None).unwrap());
        assert!(client.lock(holder, Some(Duration::from_millis(10))).unwrap());
        assert_eq!(state.holder(), Some(holder));

        assert!(!client
            .lock(Uuid::new_v4(), Some(Duration::from_millis(50)))
            .unwrap());

        client.unlock(holder).unwrap();
        client.unlock(holder).unwrap();
        assert_eq!(state.holder(), None);
    }

    #[test]
    fn sub_millisecond_timeouts_still_wait() {
        assert_eq!(wire_millis(Duration::ZERO), 0);
        assert_eq!(wire_millis(Duration::from_micros(500)), 1);
        assert_eq!(wire_millis(Duration::from_millis(1)), 1);
        assert_eq!(wire_millis(Duration::from_micros(1_200)), 2);

        let (state, manager) = served();
        let client = SharedClient::connect(manager.address()).unwrap();
        let holder = Uuid::new_v4();
        assert!(state.lock(holder, None).unwrap());

        let started = Instant::now();
        assert!(!client
            .lock(Uuid::new_v4(), Some(Duration::from_micros(800)))
            .unwrap());
        assert!(started.elapsed() >= Duration::from_micros(800));
        state.unlock(holder).unwrap();
    }

    #[test]
    fn remote_lock_serializes_client_threads() {
        let (_state, manager) = served();
        let client = Arc::new(SharedClient::connect(manager.address()).unwrap());
        let counter = Arc::new(AtomicUsize::new(0));
        let started = Instant::now();

        let workers: Vec<_> = (0..2)
            .map(|_| {
                let client = client.clone();
                let counter = counter.clone();
                std::thread::spawn(move || {
                    let owner = Uuid::new_v4();
                    assert!(client.lock(owner, Some(Duration::from_secs(2))).unwrap());
                    let value = counter.load(Ordering::Relaxed);
                    std::thread::sleep(Duration::from_millis(200));
                    counter.store(value + 1, Ordering::Relaxed);
                    client.unlock(owner).unwrap();
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        assert!(started.elapsed() >= Duration::from_millis(400));
        assert_eq!(counter.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn closed_state_reports_not_available_remotely() {
        let (state, manager) = served();
        let client = SharedClient::connect(manager.address()).unwrap();

        state.close();
        assert!(matches!(
            client.checkin(Uuid::new_v4()),
            Err(SharedError::NotAvailable(_))
        ));
    }

    #[test]
    fn stopped_manager_is_not_available() {
        let (_state, mut manager) = served();
        let address = manager.address();
        manager.shutdown();

        assert!(matches!(
            SharedClient::connect(address),
            Err(SharedError::NotAvailable(_))
        ));
    }
}
