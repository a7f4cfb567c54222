//! Agent abstraction and the pool that keeps agent instances warm.
//!
//! Agents are the expensive collaborators (LLM-backed classifiers, chat
//! assistants, search enhancers). The engine knows them only through the
//! `Agent` trait and builds them through registered `AgentFactory`s.

pub mod pool;

pub use pool::{AgentHandle, AgentPool, PoolStats, TypeStats};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::WorkerError;
use crate::execution::context::{CancelFlag, ExecutionState, LogLevel};
use crate::execution::manager::ContextManager;
use crate::task::model::{Task, TaskId};

/// A poolable worker.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Warm-up hook run once after construction. Must be idempotent.
    async fn initialize(&self) -> Result<(), WorkerError> {
        Ok(())
    }

    /// Run one task payload.
    async fn execute(
        &self,
        payload: serde_json::Value,
        ctx: &AgentContext,
    ) -> Result<serde_json::Value, WorkerError>;

    /// Destroy hook, run when the pool evicts or shuts down the instance.
    async fn shutdown(&self) {}
}

/// Builds agent instances for one agent type.
#[async_trait]
pub trait AgentFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn Agent>, WorkerError>;
}

#[async_trait]
impl<F> AgentFactory for F
where
    F: Fn() -> Arc<dyn Agent> + Send + Sync,
{
    async fn create(&self) -> Result<Arc<dyn Agent>, WorkerError> {
        Ok(self())
    }
}

/// What an agent sees of the task it is running.
///
/// Long calls should check `is_cancelled()` / `is_timed_out()` between steps;
/// the scheduler never interrupts them.
pub struct AgentContext {
    task_id: TaskId,
    snapshot: ExecutionState,
    cancel: CancelFlag,
    contexts: Arc<ContextManager>,
}

impl AgentContext {
    pub(crate) fn new(
        snapshot: ExecutionState,
        cancel: CancelFlag,
        contexts: Arc<ContextManager>,
    ) -> Self {
        Self {
            task_id: snapshot.task_id,
            snapshot,
            cancel,
            contexts,
        }
    }

    /// A context backed by its own throwaway manager, for driving an agent
    /// outside a scheduler (tests, one-off calls).
    pub async fn detached(task: Task, timeout: Option<Duration>) -> Self {
        let contexts = Arc::new(ContextManager::new(1));
        let id = task.id;
        // A fresh manager can't already know this id.
        let _ = contexts.register(&task).await;
        let attached = contexts.attach(task, timeout).await;
        let cancel = attached.map(|a| a.cancel).unwrap_or_default();
        let snapshot = contexts.state(id).await.unwrap_or_else(|| ExecutionState {
            task_id: id,
            task_type: String::new(),
            started_at: None,
            elapsed: Duration::ZERO,
            progress: 0,
            retry_count: 0,
            metadata: serde_json::Map::new(),
        });
        Self::new(snapshot, cancel, contexts)
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Execution state as of the start of this call.
    pub fn snapshot(&self) -> &ExecutionState {
        &self.snapshot
    }

    /// Previous attempts of this task.
    pub fn retry_count(&self) -> u32 {
        self.snapshot.retry_count
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the task is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub async fn is_timed_out(&self) -> bool {
        self.contexts.is_timed_out(self.task_id).await
    }

    pub async fn set_progress(&self, progress: i64) {
        self.contexts
            .update_context(self.task_id, |ctx| ctx.set_progress(progress))
            .await;
    }

    pub async fn log(&self, message: impl Into<String>, level: LogLevel) {
        let message = message.into();
        self.contexts
            .update_context(self.task_id, |ctx| ctx.add_log(message, level))
            .await;
    }

    pub async fn update_metadata(&self, key: impl Into<String>, value: serde_json::Value) {
        let key = key.into();
        self.contexts
            .update_context(self.task_id, |ctx| ctx.update_metadata(key, value))
            .await;
    }

    /// Register a callback for when the task finishes, whatever the outcome.
    pub async fn add_cleanup_callback<F>(&self, callback: F) -> bool
    where
        F: FnOnce() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.contexts
            .update_context(self.task_id, |ctx| ctx.add_cleanup_callback(callback))
            .await
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Upper;

    #[async_trait]
    impl Agent for Upper {
        async fn execute(
            &self,
            payload: serde_json::Value,
            ctx: &AgentContext,
        ) -> Result<serde_json::Value, WorkerError> {
            ctx.set_progress(50).await;
            let text = payload["text"]
                .as_str()
                .ok_or_else(|| WorkerError::terminal("missing text"))?;
            Ok(json!(text.to_uppercase()))
        }
    }

    #[tokio::test]
    async fn detached_context_drives_an_agent() {
        let task = Task::agent("upper", json!({"text": "hi"}));
        let ctx = AgentContext::detached(task.clone(), None).await;
        assert_eq!(ctx.task_id(), task.id);
        assert_eq!(ctx.retry_count(), 0);
        assert!(!ctx.is_cancelled());

        let out = Upper.execute(json!({"text": "hi"}), &ctx).await.unwrap();
        assert_eq!(out, json!("HI"));
        assert_eq!(ctx.contexts.state(task.id).await.unwrap().progress, 50);

        let err = Upper.execute(json!({}), &ctx).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn closures_are_factories() {
        let factory = || Arc::new(Upper) as Arc<dyn Agent>;
        let agent = factory.create().await.unwrap();
        assert!(agent.initialize().await.is_ok());
    }
}
