//! Task and workflow execution runtime
//!
//! This crate provides the shared object (in-memory and served to worker
//! processes), the thread/process launchers, the component registry, and the
//! event-chained `Task` and `Workflow` types built on top of them.

mod config;
mod ipc;
mod launcher;
mod registry;
mod runtime;
mod shared;
mod task;
mod worker;
mod workflow;

pub use config::RuntimeConfig;
pub use ipc::{SharedClient, SharedManager};
pub use launcher::{
    launcher_for, AsyncFn, Handle, HandleSet, Launcher, Outcome, ProcessLauncher, SpawnTarget,
    ThreadLauncher,
};
pub use registry::{ArgumentDefinition, ComponentMetadata, TaskFactory, TaskRegistry};
pub use runtime::WeftRuntime;
pub use shared::SharedState;
pub use task::{Task, TaskBuilder, TaskState};
pub use worker::{run_component, run_worker, Autorun, ComponentSpec};
pub use workflow::{Workflow, WorkflowBuilder};
