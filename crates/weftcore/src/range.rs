use crate::RuntimeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Concurrency scope a task or workflow may run under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionRange {
    /// Separate thread inside the same process
    Thread,
    /// Separate process on the same machine
    #[default]
    Process,
}

impl ExecutionRange {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionRange::Thread => "thread",
            ExecutionRange::Process => "process",
        }
    }
}

impl fmt::Display for ExecutionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionRange {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "thread" => Ok(ExecutionRange::Thread),
            "process" => Ok(ExecutionRange::Process),
            other => Err(RuntimeError::InvalidConfiguration(format!(
                "unknown execution range '{}'",
                other
            ))),
        }
    }
}

/// Numeric codes used by older configurations: 0 = thread, 1 = process.
impl TryFrom<u8> for ExecutionRange {
    type Error = RuntimeError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(ExecutionRange::Thread),
            1 => Ok(ExecutionRange::Process),
            other => Err(RuntimeError::InvalidConfiguration(format!(
                "execution range code {} is not one of 0 (thread), 1 (process)",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_ranges() {
        assert_eq!("thread".parse::<ExecutionRange>().unwrap(), ExecutionRange::Thread);
        assert_eq!(" Process ".parse::<ExecutionRange>().unwrap(), ExecutionRange::Process);
        assert_eq!(ExecutionRange::try_from(0).unwrap(), ExecutionRange::Thread);
        assert_eq!(ExecutionRange::default(), ExecutionRange::Process);
    }

    #[test]
    fn rejects_unknown_ranges() {
        assert!(matches!(
            "cluster".parse::<ExecutionRange>(),
            Err(RuntimeError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            ExecutionRange::try_from(2),
            Err(RuntimeError::InvalidConfiguration(_))
        ));
    }
}
