//! Task lifecycle events broadcast to observers.

use serde::Serialize;

use crate::error::ExecutionError;
use crate::task::model::TaskId;

/// Lifecycle notification. Delivery is fire-and-forget: a receiver that
/// falls behind loses the oldest events, never stalls the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    Submitted {
        task_id: TaskId,
        task_type: String,
        priority: i32,
    },
    Started {
        task_id: TaskId,
        task_type: String,
        /// 1 for the first attempt.
        attempt: u32,
    },
    Retrying {
        task_id: TaskId,
        /// Attempt number that will run after the delay.
        next_attempt: u32,
        delay_ms: u64,
        error: ExecutionError,
    },
    Completed {
        task_id: TaskId,
        result: serde_json::Value,
    },
    /// Terminal failure, including missed deadlines.
    Failed {
        task_id: TaskId,
        error: ExecutionError,
    },
    Cancelled {
        task_id: TaskId,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            Self::Submitted { task_id, .. }
            | Self::Started { task_id, .. }
            | Self::Retrying { task_id, .. }
            | Self::Completed { task_id, .. }
            | Self::Failed { task_id, .. }
            | Self::Cancelled { task_id } => *task_id,
        }
    }

    /// Event name in `task:<what>` form.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Submitted { .. } => "task:submitted",
            Self::Started { .. } => "task:started",
            Self::Retrying { .. } => "task:retrying",
            Self::Completed { .. } => "task:completed",
            Self::Failed { .. } => "task:failed",
            Self::Cancelled { .. } => "task:cancelled",
        }
    }

    /// True for events that end a task's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { .. } | Self::Cancelled { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn serializes_with_type_tag() {
        let id = Uuid::new_v4();
        let event = TaskEvent::Failed {
            task_id: id,
            error: ExecutionError::Terminal {
                reason: "bad input".into(),
            },
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "failed");
        assert_eq!(json["task_id"], id.to_string());
        assert_eq!(json["error"]["kind"], "terminal");
        assert_eq!(event.name(), "task:failed");
        assert!(event.is_terminal());
    }

    #[test]
    fn retrying_is_not_terminal() {
        let event = TaskEvent::Retrying {
            task_id: Uuid::new_v4(),
            next_attempt: 2,
            delay_ms: 500,
            error: ExecutionError::Transient {
                reason: "503".into(),
            },
        };
        assert!(!event.is_terminal());
        assert_eq!(serde_json::to_value(&event).unwrap()["delay_ms"], 500);
    }
}
