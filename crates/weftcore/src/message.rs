use crate::TaskId;
use serde::{Deserialize, Serialize};

/// Kind of a mailbox message. The set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Payload for the recipient; a newer one replaces an unread older one
    Data,
    /// Request to leave `run_loop`; sending it twice is the same as once
    Terminate,
}

/// Message stored in a shared object's mailbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    pub sender: Option<TaskId>,
    pub payload: serde_json::Value,
}

impl Message {
    pub fn data(sender: Option<TaskId>, payload: serde_json::Value) -> Self {
        Self {
            kind: MessageKind::Data,
            sender,
            payload,
        }
    }

    pub fn terminate(sender: Option<TaskId>) -> Self {
        Self {
            kind: MessageKind::Terminate,
            sender,
            payload: serde_json::Value::Null,
        }
    }
}
