use crate::{Kwargs, TaskError, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Identifier of an event a task can raise
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "name")]
pub enum EventId {
    /// Raised once per completed `run`, after the body returned
    Finished,
    Custom(String),
}

/// Event raised by a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub source: TaskId,
    pub kwargs: Kwargs,
    pub raised_at: DateTime<Utc>,
}

impl Event {
    pub fn new(id: EventId, source: TaskId, kwargs: Kwargs) -> Self {
        Self {
            id,
            source,
            kwargs,
            raised_at: Utc::now(),
        }
    }

    pub fn finished(source: TaskId, kwargs: Kwargs) -> Self {
        Self::new(EventId::Finished, source, kwargs)
    }
}

/// Callback attached to an event. It runs on the thread that raised the
/// event; an error stops the remaining handlers and goes back to the raiser.
pub type EventHandler = Arc<dyn Fn(&Event) -> Result<(), TaskError> + Send + Sync>;

/// Handler table of one event source
#[derive(Default)]
pub struct EventSource {
    handlers: RwLock<HashMap<EventId, Vec<EventHandler>>>,
}

impl EventSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: EventId, handler: EventHandler) {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        handlers.entry(id).or_default().push(handler);
    }

    /// Calls every handler of `event.id` in registration order.
    pub fn raise(&self, event: &Event) -> Result<(), TaskError> {
        // Snapshot so handlers may register further handlers while running
        let handlers: Vec<EventHandler> = {
            let table = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
            table.get(&event.id).cloned().unwrap_or_default()
        };

        for handler in handlers {
            handler(event)?;
        }
        Ok(())
    }

    pub fn handler_count(&self, id: &EventId) -> usize {
        let table = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        table.get(id).map_or(0, Vec::len)
    }
}
