//! Status records and execution contexts for every task the scheduler
//! knows about.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::SchedulerError;
use crate::execution::context::{CancelFlag, ExecutionContext, ExecutionState, PendingCleanup};
use crate::execution::TaskOutcome;
use crate::task::model::{Task, TaskId, TaskStatus};

/// Everything tracked for one task.
#[derive(Debug)]
struct TaskEntry {
    status: TaskStatus,
    /// Created on first dequeue, kept across retries.
    context: Option<ExecutionContext>,
    outcome: Option<TaskOutcome>,
}

/// What the caller learns when a task is handed to a worker slot.
#[derive(Debug, Clone)]
pub struct Attached {
    pub cancel: CancelFlag,
    pub retry_count: u32,
    pub timeout: Option<Duration>,
}

/// Tracks every submitted task from admission until its record is pruned.
pub struct ContextManager {
    entries: RwLock<HashMap<TaskId, TaskEntry>>,
    /// Terminal task ids, oldest first.
    finished: RwLock<VecDeque<TaskId>>,
    /// Terminal records kept for lookups.
    retained: usize,
}

impl ContextManager {
    /// Track tasks, keeping at least the latest `retained` finished records
    /// (never fewer than one).
    pub fn new(retained: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            finished: RwLock::new(VecDeque::new()),
            retained: retained.max(1),
        }
    }

    /// Start tracking a newly admitted task.
    pub async fn register(&self, task: &Task) -> Result<(), SchedulerError> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&task.id) {
            return Err(SchedulerError::InvalidTask {
                id: task.id,
                reason: "task id already in use".to_string(),
            });
        }
        entries.insert(
            task.id,
            TaskEntry {
                status: TaskStatus::Queued,
                context: None,
                outcome: None,
            },
        );
        Ok(())
    }

    /// Drop a record that never made it into the queue.
    pub async fn forget(&self, id: TaskId) {
        self.entries.write().await.remove(&id);
    }

    /// Move a dequeued task to `Processing`, creating its context on the
    /// first attempt and restarting the attempt clock. Returns `None` if the
    /// task is no longer waiting to run.
    pub async fn attach(&self, task: Task, timeout: Option<Duration>) -> Option<Attached> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(&task.id)?;
        if !entry.status.can_transition_to(TaskStatus::Processing) {
            return None;
        }

        let context = entry
            .context
            .get_or_insert_with(|| ExecutionContext::new(task, timeout));
        context.initialize();
        entry.status = TaskStatus::Processing;

        Some(Attached {
            cancel: context.cancel_flag(),
            retry_count: context.retry_count(),
            timeout: context.timeout(),
        })
    }

    /// Apply a non-terminal status change. Returns false if the state
    /// machine forbids it.
    pub async fn transition(&self, id: TaskId, target: TaskStatus) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get_mut(&id) {
            Some(entry) if entry.status.can_transition_to(target) => {
                if target == TaskStatus::Retrying
                    && let Some(ctx) = entry.context.as_mut()
                {
                    ctx.mark_finished();
                }
                entry.status = target;
                true
            }
            _ => false,
        }
    }

    /// Record the terminal outcome and run cleanup callbacks.
    ///
    /// Returns false if the task was unknown or already terminal; in that
    /// case nothing changes and no callbacks run.
    pub async fn finish(&self, id: TaskId, outcome: TaskOutcome) -> bool {
        let cleanup: Option<PendingCleanup> = {
            let mut entries = self.entries.write().await;
            let Some(entry) = entries.get_mut(&id) else {
                return false;
            };
            let target = outcome.status();
            if !entry.status.can_transition_to(target) {
                tracing::debug!(
                    task_id = %id,
                    from = %entry.status,
                    to = %target,
                    "Ignoring terminal transition"
                );
                return false;
            }

            entry.status = target;
            entry.outcome = Some(outcome);
            entry.context.as_mut().map(|ctx| {
                ctx.mark_finished();
                ctx.detach_cleanup()
            })
        };

        // Callbacks run outside the lock.
        if let Some(cleanup) = cleanup
            && !cleanup.is_empty()
        {
            let ran = cleanup.run();
            tracing::debug!(task_id = %id, callbacks = ran, "Cleanup complete");
        }

        self.retire(id).await;
        true
    }

    async fn retire(&self, id: TaskId) {
        let evicted: Vec<TaskId> = {
            let mut finished = self.finished.write().await;
            finished.push_back(id);
            let excess = finished.len().saturating_sub(self.retained);
            finished.drain(..excess).collect()
        };

        if !evicted.is_empty() {
            let mut entries = self.entries.write().await;
            for old in evicted {
                entries.remove(&old);
            }
        }
    }

    /// Raise the cancellation flag of a task that has a context.
    pub async fn request_cancel(&self, id: TaskId) -> bool {
        let entries = self.entries.read().await;
        match entries.get(&id) {
            Some(entry) if entry.status.is_active() => match entry.context.as_ref() {
                Some(ctx) => {
                    ctx.cancel_flag().cancel();
                    true
                }
                None => false,
            },
            _ => false,
        }
    }

    pub async fn cancel_flag(&self, id: TaskId) -> Option<CancelFlag> {
        self.entries
            .read()
            .await
            .get(&id)
            .and_then(|e| e.context.as_ref())
            .map(|ctx| ctx.cancel_flag())
    }

    /// Count one more retry for a task. Returns the new count.
    pub async fn increment_retry(&self, id: TaskId) -> Option<u32> {
        let mut entries = self.entries.write().await;
        entries
            .get_mut(&id)
            .and_then(|e| e.context.as_mut())
            .map(|ctx| ctx.increment_retry())
    }

    /// Mutate a task's context in place.
    pub async fn update_context<F, R>(&self, id: TaskId, f: F) -> Option<R>
    where
        F: FnOnce(&mut ExecutionContext) -> R,
    {
        let mut entries = self.entries.write().await;
        entries
            .get_mut(&id)
            .and_then(|e| e.context.as_mut())
            .map(f)
    }

    /// Read from a task's context.
    pub async fn with_context<F, R>(&self, id: TaskId, f: F) -> Option<R>
    where
        F: FnOnce(&ExecutionContext) -> R,
    {
        let entries = self.entries.read().await;
        entries.get(&id).and_then(|e| e.context.as_ref()).map(f)
    }

    pub async fn is_timed_out(&self, id: TaskId) -> bool {
        self.with_context(id, |ctx| ctx.is_timed_out())
            .await
            .unwrap_or(false)
    }

    pub async fn state(&self, id: TaskId) -> Option<ExecutionState> {
        self.with_context(id, |ctx| ctx.state()).await
    }

    pub async fn status(&self, id: TaskId) -> Option<TaskStatus> {
        self.entries.read().await.get(&id).map(|e| e.status)
    }

    pub async fn outcome(&self, id: TaskId) -> Option<TaskOutcome> {
        self.entries
            .read()
            .await
            .get(&id)
            .and_then(|e| e.outcome.clone())
    }

    /// Ids of tasks that have not reached a terminal state.
    pub async fn active_ids(&self) -> Vec<TaskId> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|(_, e)| e.status.is_active())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Count tasks per state.
    pub async fn summary(&self) -> ContextSummary {
        let entries = self.entries.read().await;

        let mut summary = ContextSummary::default();
        for entry in entries.values() {
            match entry.status {
                TaskStatus::Queued => summary.queued += 1,
                TaskStatus::Processing => summary.processing += 1,
                TaskStatus::Retrying => summary.retrying += 1,
                TaskStatus::Completed => summary.completed += 1,
                TaskStatus::Failed => summary.failed += 1,
                TaskStatus::Cancelled => summary.cancelled += 1,
                TaskStatus::TimedOut => summary.timed_out += 1,
            }
        }

        summary.total = entries.len();
        summary
    }
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new(500)
    }
}

/// Summary of all tracked tasks.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ContextSummary {
    pub total: usize,
    pub queued: usize,
    pub processing: usize,
    pub retrying: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub timed_out: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecutionError;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn task() -> Task {
        Task::agent("x", json!({}))
    }

    #[tokio::test]
    async fn latest_finished_record_always_kept() {
        let manager = ContextManager::new(0);
        let first = task();
        let second = task();
        for t in [&first, &second] {
            manager.register(t).await.unwrap();
            manager.attach(t.clone(), None).await.unwrap();
            assert!(manager.finish(t.id, TaskOutcome::Cancelled).await);
        }

        assert_eq!(manager.status(first.id).await, None);
        assert_eq!(manager.outcome(second.id).await, Some(TaskOutcome::Cancelled));
    }

    #[tokio::test]
    async fn register_rejects_duplicates() {
        let manager = ContextManager::new(10);
        let t = task();
        manager.register(&t).await.unwrap();
        assert!(manager.register(&t).await.is_err());
        assert_eq!(manager.status(t.id).await, Some(TaskStatus::Queued));
    }

    #[tokio::test]
    async fn context_created_on_attach() {
        let manager = ContextManager::new(10);
        let t = task();
        manager.register(&t).await.unwrap();
        assert!(manager.state(t.id).await.is_none());

        let attached = manager.attach(t.clone(), None).await.unwrap();
        assert_eq!(attached.retry_count, 0);
        assert_eq!(manager.status(t.id).await, Some(TaskStatus::Processing));
        assert!(manager.state(t.id).await.unwrap().started_at.is_some());

        // Already processing, so a second attach is refused.
        assert!(manager.attach(t, None).await.is_none());
    }

    #[tokio::test]
    async fn context_survives_retry() {
        let manager = ContextManager::new(10);
        let t = task();
        manager.register(&t).await.unwrap();
        manager.attach(t.clone(), None).await.unwrap();
        manager
            .update_context(t.id, |ctx| ctx.update_metadata("k", json!(1)))
            .await;

        assert!(manager.transition(t.id, TaskStatus::Retrying).await);
        assert_eq!(manager.increment_retry(t.id).await, Some(1));
        assert!(manager.transition(t.id, TaskStatus::Queued).await);

        let attached = manager.attach(t.clone(), None).await.unwrap();
        assert_eq!(attached.retry_count, 1);
        let state = manager.state(t.id).await.unwrap();
        assert_eq!(state.metadata["k"], json!(1));
    }

    #[tokio::test]
    async fn finish_runs_cleanup_once() {
        let manager = ContextManager::new(10);
        let t = task();
        manager.register(&t).await.unwrap();
        manager.attach(t.clone(), None).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        manager
            .update_context(t.id, move |ctx| {
                ctx.add_cleanup_callback(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .await;

        assert!(
            manager
                .finish(t.id, TaskOutcome::Completed { result: json!("ok") })
                .await
        );
        // No transition out of a terminal state.
        assert!(
            !manager
                .finish(
                    t.id,
                    TaskOutcome::Failed {
                        error: ExecutionError::Terminal { reason: "late".into() }
                    }
                )
                .await
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.status(t.id).await, Some(TaskStatus::Completed));
        assert!(matches!(
            manager.outcome(t.id).await,
            Some(TaskOutcome::Completed { .. })
        ));
    }

    #[tokio::test]
    async fn cancel_before_dequeue_needs_no_context() {
        let manager = ContextManager::new(10);
        let t = task();
        manager.register(&t).await.unwrap();
        assert!(!manager.request_cancel(t.id).await);
        assert!(manager.finish(t.id, TaskOutcome::Cancelled).await);
        assert_eq!(manager.status(t.id).await, Some(TaskStatus::Cancelled));
        assert!(manager.attach(t, None).await.is_none());
    }

    #[tokio::test]
    async fn request_cancel_raises_flag() {
        let manager = ContextManager::new(10);
        let t = task();
        manager.register(&t).await.unwrap();
        let attached = manager.attach(t.clone(), None).await.unwrap();

        assert!(manager.request_cancel(t.id).await);
        assert!(attached.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn finished_records_are_pruned() {
        let manager = ContextManager::new(2);
        let mut ids = Vec::new();
        for _ in 0..3 {
            let t = task();
            manager.register(&t).await.unwrap();
            manager.finish(t.id, TaskOutcome::Cancelled).await;
            ids.push(t.id);
        }

        assert!(manager.status(ids[0]).await.is_none());
        assert_eq!(manager.status(ids[1]).await, Some(TaskStatus::Cancelled));
        assert_eq!(manager.status(ids[2]).await, Some(TaskStatus::Cancelled));
    }

    #[tokio::test]
    async fn summary_counts_states() {
        let manager = ContextManager::new(10);
        let a = task();
        let b = task();
        manager.register(&a).await.unwrap();
        manager.register(&b).await.unwrap();
        manager.attach(b.clone(), None).await.unwrap();

        let summary = manager.summary().await;
        assert_eq!(summary.total, 2);
        assert_eq!(summary.queued, 1);
        assert_eq!(summary.processing, 1);
    }
}
