//! Task model and lifecycle states.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a submitted task.
pub type TaskId = Uuid;

/// What a task asks the engine to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskKind {
    /// Run a pooled agent of `agent_type` against `payload`.
    Agent {
        agent_type: String,
        payload: serde_json::Value,
    },
    /// Call a registered tool directly.
    Tool {
        tool_name: String,
        parameters: serde_json::Value,
    },
    /// Run sub-tasks in dependency order and aggregate their results.
    Composite {
        subtasks: Vec<Task>,
        /// Stop at the first failed sub-task.
        fail_fast: bool,
    },
}

impl TaskKind {
    /// Short label used in logs and execution snapshots.
    pub fn label(&self) -> String {
        match self {
            Self::Agent { agent_type, .. } => format!("agent:{agent_type}"),
            Self::Tool { tool_name, .. } => format!("tool:{tool_name}"),
            Self::Composite { .. } => "composite".to_string(),
        }
    }
}

/// A unit of work submitted to the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    /// Higher values dequeue first.
    pub priority: i32,
    /// Sibling sub-task ids that must finish first (composite sub-tasks only).
    pub dependencies: Vec<TaskId>,
    /// Advisory deadline for one attempt; falls back to the scheduler default.
    pub timeout: Option<Duration>,
    /// Overrides the scheduler's retry limit.
    pub max_retries: Option<u32>,
    /// Treat a missed deadline like a transient failure.
    pub retry_on_timeout: bool,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Create a task with a fresh id and default priority.
    pub fn new(kind: TaskKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            priority: 0,
            dependencies: Vec::new(),
            timeout: None,
            max_retries: None,
            retry_on_timeout: false,
            created_at: Utc::now(),
        }
    }

    pub fn agent(agent_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::new(TaskKind::Agent {
            agent_type: agent_type.into(),
            payload,
        })
    }

    pub fn tool(tool_name: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self::new(TaskKind::Tool {
            tool_name: tool_name.into(),
            parameters,
        })
    }

    /// A fail-fast composite over `subtasks`.
    pub fn composite(subtasks: Vec<Task>) -> Self {
        Self::new(TaskKind::Composite {
            subtasks,
            fail_fast: true,
        })
    }

    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, dependencies: impl IntoIterator<Item = TaskId>) -> Self {
        self.dependencies = dependencies.into_iter().collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn retry_on_timeout(mut self) -> Self {
        self.retry_on_timeout = true;
        self
    }

    /// Keep running independent sub-tasks after one fails.
    pub fn continue_on_error(mut self) -> Self {
        if let TaskKind::Composite { fail_fast, .. } = &mut self.kind {
            *fail_fast = false;
        }
        self
    }

    /// Label of the task's kind (`agent:<type>`, `tool:<name>`, `composite`).
    pub fn task_type(&self) -> String {
        self.kind.label()
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in the queue.
    Queued,
    /// Dequeued and executing.
    Processing,
    /// Waiting out a backoff delay before being queued again.
    Retrying,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl TaskStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            // From Queued
            (Queued, Processing) | (Queued, Cancelled) |
            // From Processing
            (Processing, Completed) | (Processing, Failed) |
            (Processing, Cancelled) | (Processing, TimedOut) |
            (Processing, Retrying) |
            // From Retrying
            (Retrying, Queued) | (Retrying, Failed) | (Retrying, Cancelled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn state_transitions_valid() {
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Processing));
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Cancelled));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::TimedOut));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Retrying));
        assert!(TaskStatus::Retrying.can_transition_to(TaskStatus::Queued));
    }

    #[test]
    fn no_transition_out_of_terminal_states() {
        let all = [
            TaskStatus::Queued,
            TaskStatus::Processing,
            TaskStatus::Retrying,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
            TaskStatus::TimedOut,
        ];
        for from in all.iter().filter(|s| s.is_terminal()) {
            for to in all {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn builder_sets_fields() {
        let id = Uuid::new_v4();
        let dep = Uuid::new_v4();
        let task = Task::agent("classifier", json!({"text": "hi"}))
            .with_id(id)
            .with_priority(7)
            .with_dependencies([dep])
            .with_timeout(Duration::from_millis(250))
            .with_max_retries(1)
            .retry_on_timeout();

        assert_eq!(task.id, id);
        assert_eq!(task.priority, 7);
        assert_eq!(task.dependencies, vec![dep]);
        assert_eq!(task.timeout, Some(Duration::from_millis(250)));
        assert_eq!(task.max_retries, Some(1));
        assert!(task.retry_on_timeout);
        assert_eq!(task.task_type(), "agent:classifier");
    }

    #[test]
    fn continue_on_error_only_affects_composites() {
        let task = Task::composite(vec![]).continue_on_error();
        assert!(matches!(
            task.kind,
            TaskKind::Composite {
                fail_fast: false,
                ..
            }
        ));

        let tool = Task::tool("search", json!({})).continue_on_error();
        assert_eq!(tool.task_type(), "tool:search");
    }

    #[test]
    fn task_kind_serializes_with_tag() {
        let task = Task::tool("search", json!({"q": "rust"}));
        let json = serde_json::to_value(&task.kind).unwrap();
        assert_eq!(json["kind"], "tool");
        assert_eq!(json["tool_name"], "search");
    }

    #[test]
    fn status_display() {
        assert_eq!(TaskStatus::TimedOut.to_string(), "timed_out");
        assert_eq!(TaskStatus::Queued.to_string(), "queued");
    }
}
