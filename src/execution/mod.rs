//! Execution tracking: per-task contexts, their registry and retry timing.
//!
//! - `context`: `ExecutionContext` (timing, progress, metadata, cleanup)
//! - `manager`: `ContextManager` owning every task's status and context
//! - `retry`: backoff curve between attempts

pub mod context;
pub mod manager;
pub mod retry;

pub use context::{CancelFlag, ExecutionContext, ExecutionState, LogEntry, LogLevel};
pub use manager::{ContextManager, ContextSummary};
pub use retry::RetryPolicy;

use serde::Serialize;

use crate::error::ExecutionError;
use crate::task::model::TaskStatus;

/// Final result of a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed { result: serde_json::Value },
    Failed { error: ExecutionError },
    TimedOut { error: ExecutionError },
    Cancelled,
}

impl TaskOutcome {
    /// Terminal status matching this outcome.
    pub fn status(&self) -> TaskStatus {
        match self {
            Self::Completed { .. } => TaskStatus::Completed,
            Self::Failed { .. } => TaskStatus::Failed,
            Self::TimedOut { .. } => TaskStatus::TimedOut,
            Self::Cancelled => TaskStatus::Cancelled,
        }
    }

    pub fn result(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Completed { result } => Some(result),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ExecutionError> {
        match self {
            Self::Failed { error } | Self::TimedOut { error } => Some(error),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}
