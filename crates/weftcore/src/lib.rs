//! Core abstractions for the weft task runtime
//!
//! This crate provides the value types and traits every other crate depends
//! on: execution ranges, keyword arguments, events, mailbox messages, the
//! shared-object interface and the task body contract. It has no runtime
//! behaviour of its own.

mod body;
mod error;
mod event;
mod kwargs;
mod message;
mod range;
mod shared;

pub use body::{FnBody, TaskBody, TaskContext};
pub use error::{RuntimeError, SharedError, SpawnError, TaskError, WorkflowError};
pub use event::{Event, EventHandler, EventId, EventSource};
pub use kwargs::Kwargs;
pub use message::{Message, MessageKind};
pub use range::ExecutionRange;
pub use shared::{Shared, SharedGuard};

pub use tracing::level_filters::LevelFilter;

/// Unique task identity, generated once per task
pub type TaskId = uuid::Uuid;

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;
