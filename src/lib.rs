//! Agent Dispatch: a multi-agent task execution engine.
//!
//! Tasks are admitted into a bounded [`TaskQueue`], dispatched under a
//! concurrency limit by the [`TaskScheduler`], and executed either by pooled
//! agents checked out of the [`AgentPool`] or by stateless tools from the
//! [`ToolRegistry`].

pub mod agents;
pub mod config;
pub mod error;
pub mod execution;
pub mod scheduler;
pub mod task;
pub mod tools;

pub use agents::{Agent, AgentContext, AgentFactory, AgentHandle, AgentPool, PoolStats};
pub use config::{EngineConfig, PoolConfig, QueueConfig, QueueStrategy, SchedulerConfig, ShutdownPolicy};
pub use error::{Error, ExecutionError, PoolError, QueueError, Result, SchedulerError, WorkerError};
pub use execution::{ExecutionContext, ExecutionState, RetryPolicy, TaskOutcome};
pub use scheduler::{TaskEvent, TaskScheduler};
pub use task::{QueueStatus, Task, TaskId, TaskKind, TaskQueue, TaskStatus};
pub use tools::{Tool, ToolRegistry};
