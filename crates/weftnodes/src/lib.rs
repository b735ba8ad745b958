//! Standard component library
//!
//! Small task bodies used by the CLI demo and by process-range workers

mod debug;
mod shared;
mod time;

pub use debug::{DebugBody, DebugBodyFactory};
pub use shared::{CounterBody, CounterBodyFactory, TerminateBody, TerminateBodyFactory};
pub use time::{DelayBody, DelayBodyFactory};
use weftruntime::TaskRegistry;

use std::sync::Arc;

/// Register all standard components with a registry
pub fn register_all(registry: &mut TaskRegistry) {
    registry.register(Arc::new(debug::DebugBodyFactory));
    registry.register(Arc::new(time::DelayBodyFactory));
    registry.register(Arc::new(shared::CounterBodyFactory));
    registry.register(Arc::new(shared::TerminateBodyFactory));
}

/// Registry holding every standard component
pub fn registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    register_all(&mut registry);
    registry
}
