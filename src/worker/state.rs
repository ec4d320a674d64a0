use serde::{Deserialize, Serialize};
use std::fmt;

/// Worker agent lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Created, not yet accepting tasks
    Initializing,
    /// Waiting for a task
    Idle,
    /// Executing exactly one task
    Busy,
    /// Unrecoverable internal fault
    Error,
    /// Stopping or stopped; terminal
    ShuttingDown,
}

impl WorkerStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ShuttingDown)
    }

    pub fn accepts_tasks(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn can_transition_to(&self, next: WorkerStatus) -> bool {
        use WorkerStatus::*;
        match (self, next) {
            (ShuttingDown, _) => false,
            (_, ShuttingDown) => true,
            (Initializing, Idle | Error) => true,
            (Idle, Busy | Error) => true,
            (Busy, Idle | Error) => true,
            _ => false,
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Idle => write!(f, "idle"),
            Self::Busy => write!(f, "busy"),
            Self::Error => write!(f, "error"),
            Self::ShuttingDown => write!(f, "shutting_down"),
        }
    }
}

impl std::str::FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initializing" => Ok(Self::Initializing),
            "idle" => Ok(Self::Idle),
            "busy" => Ok(Self::Busy),
            "error" => Ok(Self::Error),
            "shutting_down" => Ok(Self::ShuttingDown),
            _ => Err(format!("Invalid worker status: {s}")),
        }
    }
}
