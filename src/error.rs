//! Error types for agent-dispatch.

use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Task queue admission errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Task queue is full (capacity {capacity})")]
    Full { capacity: usize },

    #[error("Task {id} is already queued or processing")]
    Duplicate { id: Uuid },
}

/// Agent pool errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("Agent type {agent_type} is not registered")]
    TypeNotRegistered { agent_type: String },

    #[error("No {agent_type} agent available ({max} in use)")]
    Exhausted { agent_type: String, max: usize },

    #[error("Failed to initialize {agent_type} agent: {reason}")]
    InitFailed { agent_type: String, reason: String },

    #[error("Agent pool is shut down")]
    ShutDown,
}

/// Error reported by a worker or tool implementation.
///
/// The implementation decides whether a failure is worth another attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    #[error("{0}")]
    Transient(String),

    #[error("{0}")]
    Terminal(String),
}

impl WorkerError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient(reason.into())
    }

    pub fn terminal(reason: impl Into<String>) -> Self {
        Self::Terminal(reason.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Outcome errors recorded against a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionError {
    #[error("Task {id} timed out after {timeout:?}")]
    Timeout { id: Uuid, timeout: Duration },

    #[error("Transient failure: {reason}")]
    Transient { reason: String },

    #[error("Execution failed: {reason}")]
    Terminal { reason: String },

    #[error("Gave up after {attempts} attempts: {reason}")]
    RetriesExhausted { attempts: u32, reason: String },

    #[error("Task {id} was cancelled")]
    Cancelled { id: Uuid },

    #[error("Agent type {agent_type} is not registered")]
    AgentTypeNotRegistered { agent_type: String },

    #[error("Tool {name} not found")]
    ToolNotFound { name: String },

    #[error("Agent pool unavailable: {reason}")]
    PoolUnavailable { reason: String },

    #[error("Worker panicked: {reason}")]
    Panicked { reason: String },
}

impl ExecutionError {
    /// Whether the scheduler may re-admit the task after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

impl From<WorkerError> for ExecutionError {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::Transient(reason) => Self::Transient { reason },
            WorkerError::Terminal(reason) => Self::Terminal { reason },
        }
    }
}

impl From<PoolError> for ExecutionError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::TypeNotRegistered { agent_type } => {
                Self::AgentTypeNotRegistered { agent_type }
            }
            // Construction failures are usually the inference backend being unreachable.
            PoolError::InitFailed { agent_type, reason } => Self::Transient {
                reason: format!("{agent_type} agent failed to initialize: {reason}"),
            },
            other => Self::PoolUnavailable {
                reason: other.to_string(),
            },
        }
    }
}

/// Scheduler-level errors returned synchronously to callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("Scheduler is shutting down")]
    ShuttingDown,

    #[error("Invalid task {id}: {reason}")]
    InvalidTask { id: Uuid, reason: String },

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
