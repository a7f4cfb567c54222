//! Task scheduler: admission, bounded-concurrency dispatch, retries and
//! shutdown.
//!
//! - `events`: lifecycle notifications
//! - `composite`: admission checks and step ordering for composite tasks

pub mod composite;
pub mod events;

pub use events::TaskEvent;

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::json;
use tokio::sync::{Mutex, Notify, broadcast};
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, error, info, warn};

use crate::agents::{AgentContext, AgentHandle, AgentPool};
use crate::config::{QueueConfig, SchedulerConfig, ShutdownPolicy};
use crate::error::{ExecutionError, PoolError, SchedulerError};
use crate::execution::manager::Attached;
use crate::execution::{CancelFlag, ContextManager, ContextSummary, ExecutionState, TaskOutcome};
use crate::task::model::{Task, TaskId, TaskKind, TaskStatus};
use crate::task::queue::{QueueStatus, TaskQueue};
use crate::tools::ToolRegistry;

/// Queue plus the counters the dispatch loop and shutdown rely on. Always
/// locked before the context manager.
struct DispatchState {
    queue: TaskQueue,
    /// Tasks spawned and not yet finished.
    active: usize,
    /// Tasks waiting out a backoff delay.
    retrying: usize,
}

impl DispatchState {
    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.active == 0 && self.retrying == 0
    }
}

/// The attempt being executed.
struct Run {
    id: TaskId,
    cancel: CancelFlag,
    timeout: Option<Duration>,
}

impl Run {
    fn timeout_error(&self) -> ExecutionError {
        ExecutionError::Timeout {
            id: self.id,
            timeout: self.timeout.unwrap_or_default(),
        }
    }

    fn cancelled_error(&self) -> ExecutionError {
        ExecutionError::Cancelled { id: self.id }
    }
}

/// What happens to a task once an attempt ends.
enum Disposition {
    Finished(TaskOutcome),
    Retry {
        delay: Duration,
        next_attempt: u32,
        error: ExecutionError,
    },
}

/// Schedules tasks onto agents and tools.
pub struct TaskScheduler {
    config: SchedulerConfig,
    pool: Arc<AgentPool>,
    tools: Arc<ToolRegistry>,
    contexts: Arc<ContextManager>,
    dispatch: Mutex<DispatchState>,
    events: broadcast::Sender<TaskEvent>,
    accepting: AtomicBool,
    /// Raised by `shutdown`; wakes every retry waiter.
    stopping: CancelFlag,
    /// Woken when the scheduler has no queued, running or retrying work.
    idle: Notify,
    /// Woken on every terminal transition.
    finished: Notify,
}

impl TaskScheduler {
    /// Build a scheduler over an existing pool and tool registry. Work can be
    /// submitted right away; `start` only pre-warms the pool and begins idle
    /// eviction.
    pub fn new(
        queue: QueueConfig,
        config: SchedulerConfig,
        pool: Arc<AgentPool>,
        tools: Arc<ToolRegistry>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let contexts = Arc::new(ContextManager::new(config.retained_contexts));

        Arc::new(Self {
            config,
            pool,
            tools,
            contexts,
            dispatch: Mutex::new(DispatchState {
                queue: TaskQueue::new(queue),
                active: 0,
                retrying: 0,
            }),
            events,
            accepting: AtomicBool::new(true),
            stopping: CancelFlag::new(),
            idle: Notify::new(),
            finished: Notify::new(),
        })
    }

    /// Pre-warm the pool if configured and start idle eviction.
    pub async fn start(&self) {
        if self.pool.config().initialize_on_startup {
            let built = self.pool.initialize_pools().await;
            info!(built, "Agent pools initialized");
        }
        self.pool.start_health_check();
        info!(
            max_concurrency = self.config.max_concurrency,
            agent_types = ?self.pool.registered_types(),
            "Task scheduler started"
        );
    }

    /// Settings this scheduler was built with.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// The agent pool tasks check agents out of.
    pub fn pool(&self) -> &Arc<AgentPool> {
        &self.pool
    }

    /// Registry used for tool tasks.
    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    /// False once `shutdown` has started.
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Validate and enqueue a task. Returns as soon as the task is admitted.
    pub async fn submit_task(self: &Arc<Self>, task: Task) -> Result<TaskId, SchedulerError> {
        if !self.is_accepting() {
            return Err(SchedulerError::ShuttingDown);
        }
        composite::validate(&task)?;

        let id = task.id;
        let task_type = task.task_type();
        let priority = task.priority;
        {
            let mut dispatch = self.dispatch.lock().await;
            if !self.is_accepting() {
                return Err(SchedulerError::ShuttingDown);
            }
            self.contexts.register(&task).await?;
            if let Err(e) = dispatch.queue.enqueue(task) {
                self.contexts.forget(id).await;
                warn!(task_id = %id, error = %e, "Task rejected");
                return Err(e.into());
            }
        }

        info!(task_id = %id, task_type = %task_type, priority, "Task submitted");
        self.emit(TaskEvent::Submitted {
            task_id: id,
            task_type,
            priority,
        });
        self.pump().await;
        Ok(id)
    }

    /// Request cancellation. Queued tasks are removed and cancelled at once;
    /// running or retrying tasks have their flag raised and stop at the next
    /// checkpoint. Returns false for unknown or finished tasks.
    pub async fn cancel_task(&self, id: TaskId) -> bool {
        {
            // Held throughout so a retry waiter can't re-queue the task
            // between the queue check and the status check.
            let mut dispatch = self.dispatch.lock().await;
            if dispatch.queue.remove_queued(id).is_none() {
                return match self.contexts.status(id).await {
                    Some(TaskStatus::Processing | TaskStatus::Retrying) => {
                        let accepted = self.contexts.request_cancel(id).await;
                        if accepted {
                            info!(task_id = %id, "Cancellation requested");
                        }
                        accepted
                    }
                    _ => false,
                };
            }
        }

        let cancelled = self.conclude(id, TaskOutcome::Cancelled).await;
        self.notify_if_idle().await;
        cancelled
    }

    /// Snapshot of the queue's occupancy.
    pub async fn queue_status(&self) -> QueueStatus {
        self.dispatch.lock().await.queue.status()
    }

    /// Execution snapshot; absent until the task is first dequeued.
    pub async fn task_context(&self, id: TaskId) -> Option<ExecutionState> {
        self.contexts.state(id).await
    }

    /// Current lifecycle state, or `None` for unknown or pruned tasks.
    pub async fn task_status(&self, id: TaskId) -> Option<TaskStatus> {
        self.contexts.status(id).await
    }

    /// Terminal outcome, once there is one.
    pub async fn task_outcome(&self, id: TaskId) -> Option<TaskOutcome> {
        self.contexts.outcome(id).await
    }

    /// Wait until a task reaches a terminal state. Returns `None` if the
    /// scheduler has no record of it.
    pub async fn wait_for_task(&self, id: TaskId) -> Option<TaskOutcome> {
        loop {
            let finished = self.finished.notified();
            match self.contexts.status(id).await {
                None => return None,
                Some(status) if status.is_terminal() => return self.contexts.outcome(id).await,
                Some(_) => finished.await,
            }
        }
    }

    /// Register a cleanup callback on a task that has started. Returns false
    /// if the task has no context yet or has already finished.
    pub async fn add_cleanup_callback<F>(&self, id: TaskId, callback: F) -> bool
    where
        F: FnOnce() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.contexts
            .update_context(id, |ctx| ctx.add_cleanup_callback(callback))
            .await
            .unwrap_or(false)
    }

    /// Receive lifecycle events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Events as a stream. Events missed by a lagging consumer are skipped.
    pub fn event_stream(&self) -> impl Stream<Item = TaskEvent> + Send + Unpin + 'static {
        BroadcastStream::new(self.events.subscribe()).filter_map(|event| event.ok())
    }

    /// Tasks currently holding a concurrency slot.
    pub async fn active_count(&self) -> usize {
        self.dispatch.lock().await.active
    }

    /// Task counts per state.
    pub async fn summary(&self) -> ContextSummary {
        self.contexts.summary().await
    }

    /// Stop accepting work, settle outstanding tasks per the shutdown
    /// policy, then shut the agent pool down.
    pub async fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(policy = ?self.config.shutdown_policy, "Task scheduler shutting down");

        self.stopping.cancel();
        if self.config.shutdown_policy == ShutdownPolicy::Cancel {
            self.cancel_outstanding().await;
        }

        let deadline = Instant::now() + self.config.shutdown_grace;
        if !self.wait_idle_until(deadline).await {
            warn!(
                grace_ms = self.config.shutdown_grace.as_millis() as u64,
                "Shutdown grace period elapsed; cancelling remaining work"
            );
            self.cancel_outstanding().await;
        }

        self.pool.shutdown().await;
        let summary = self.contexts.summary().await;
        info!(?summary, "Task scheduler stopped");
    }

    /// Cancel every queued task and flag every running one.
    async fn cancel_outstanding(&self) {
        let drained = self.dispatch.lock().await.queue.drain_queued();
        for task in &drained {
            self.conclude(task.id, TaskOutcome::Cancelled).await;
        }
        for id in self.contexts.active_ids().await {
            self.contexts.request_cancel(id).await;
        }
        self.notify_if_idle().await;
    }

    async fn wait_idle_until(&self, deadline: Instant) -> bool {
        loop {
            let idle = self.idle.notified();
            if self.dispatch.lock().await.is_idle() {
                return true;
            }
            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                return self.dispatch.lock().await.is_idle();
            }
        }
    }

    async fn notify_if_idle(&self) {
        if self.dispatch.lock().await.is_idle() {
            self.idle.notify_waiters();
        }
    }

    fn emit(&self, event: TaskEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Record a terminal outcome and tell observers. Returns false if the
    /// task had already finished.
    async fn conclude(&self, id: TaskId, outcome: TaskOutcome) -> bool {
        let event = match &outcome {
            TaskOutcome::Completed { result } => TaskEvent::Completed {
                task_id: id,
                result: result.clone(),
            },
            TaskOutcome::Failed { error } | TaskOutcome::TimedOut { error } => TaskEvent::Failed {
                task_id: id,
                error: error.clone(),
            },
            TaskOutcome::Cancelled => TaskEvent::Cancelled { task_id: id },
        };

        let status = outcome.status();
        if !self.contexts.finish(id, outcome).await {
            return false;
        }

        match &event {
            TaskEvent::Failed { error, .. } => {
                warn!(task_id = %id, status = %status, error = %error, "Task failed")
            }
            _ => info!(task_id = %id, status = %status, "Task finished"),
        }
        self.emit(event);
        self.finished.notify_waiters();
        true
    }

    /// Dispatch queued tasks while concurrency slots are free.
    ///
    /// Boxed because finishing executions call back into it.
    fn pump(self: &Arc<Self>) -> BoxFuture<'static, ()> {
        let this = Arc::clone(self);
        async move {
            let mut dispatch = this.dispatch.lock().await;
            while dispatch.active < this.config.max_concurrency {
                let Some(task) = dispatch.queue.dequeue() else {
                    break;
                };

                let id = task.id;
                let timeout = task.timeout.or(this.config.default_timeout);
                let Some(attached) = this.contexts.attach(task.clone(), timeout).await else {
                    debug!(task_id = %id, "Dequeued task no longer runnable");
                    dispatch.queue.mark_complete(id);
                    continue;
                };

                dispatch.active += 1;
                let runner = Arc::clone(&this);
                tokio::spawn(async move { runner.run_task(task, attached).await });
            }
        }
        .boxed()
    }

    async fn run_task(self: Arc<Self>, task: Task, attached: Attached) {
        let id = task.id;
        let task_type = task.task_type();
        let attempt = attached.retry_count + 1;
        let run = Run {
            id,
            cancel: attached.cancel,
            timeout: attached.timeout,
        };

        info!(task_id = %id, task_type = %task_type, attempt, "Task started");
        self.emit(TaskEvent::Started {
            task_id: id,
            task_type,
            attempt,
        });

        let result = if run.cancel.is_cancelled() {
            Err(run.cancelled_error())
        } else {
            AssertUnwindSafe(self.execute_kind(&task.kind, &run))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(ExecutionError::Panicked {
                        reason: panic_message(panic.as_ref()),
                    })
                })
        };

        // A cancelled or late attempt discards whatever the call returned.
        let result = if run.cancel.is_cancelled() {
            Err(run.cancelled_error())
        } else if self.contexts.is_timed_out(id).await {
            Err(run.timeout_error())
        } else {
            result
        };

        let disposition = match self.dispose(&task, attached.retry_count, result) {
            Disposition::Retry { error, .. } if !self.is_accepting() => {
                debug!(task_id = %id, error = %error, "Retry dropped; scheduler shutting down");
                Disposition::Finished(TaskOutcome::Cancelled)
            }
            disposition => disposition,
        };
        let retry = match disposition {
            Disposition::Finished(outcome) => {
                self.conclude(id, outcome).await;
                None
            }
            Disposition::Retry {
                delay,
                next_attempt,
                error,
            } => {
                if self.contexts.transition(id, TaskStatus::Retrying).await {
                    self.contexts.increment_retry(id).await;
                    info!(
                        task_id = %id,
                        next_attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Task will be retried"
                    );
                    self.emit(TaskEvent::Retrying {
                        task_id: id,
                        next_attempt,
                        delay_ms: delay.as_millis() as u64,
                        error,
                    });
                    Some(delay)
                } else {
                    None
                }
            }
        };

        {
            let mut dispatch = self.dispatch.lock().await;
            dispatch.queue.mark_complete(id);
            dispatch.active = dispatch.active.saturating_sub(1);
            if retry.is_some() {
                dispatch.retrying += 1;
            }
            if dispatch.is_idle() {
                self.idle.notify_waiters();
            }
        }

        if let Some(delay) = retry {
            let waiter = Arc::clone(&self);
            tokio::spawn(async move { waiter.readmit_after(task, run.cancel, delay).await });
        }
        self.pump().await;
    }

    /// Decide between a terminal outcome and another attempt.
    fn dispose(
        &self,
        task: &Task,
        retry_count: u32,
        result: Result<serde_json::Value, ExecutionError>,
    ) -> Disposition {
        let error = match result {
            Ok(result) => return Disposition::Finished(TaskOutcome::Completed { result }),
            Err(error) => error,
        };

        if error.is_cancelled() {
            return Disposition::Finished(TaskOutcome::Cancelled);
        }

        let retryable = error.is_retryable() || (error.is_timeout() && task.retry_on_timeout);
        let max_retries = task.max_retries.unwrap_or(self.config.max_retries);

        if retryable && retry_count < max_retries {
            let next = retry_count + 1;
            return Disposition::Retry {
                delay: self.config.retry.delay_for(next),
                next_attempt: next + 1,
                error,
            };
        }

        if error.is_timeout() {
            return Disposition::Finished(TaskOutcome::TimedOut { error });
        }
        if retryable {
            return Disposition::Finished(TaskOutcome::Failed {
                error: ExecutionError::RetriesExhausted {
                    attempts: retry_count + 1,
                    reason: error.to_string(),
                },
            });
        }
        Disposition::Finished(TaskOutcome::Failed { error })
    }

    /// Wait out the backoff delay, then queue the task again unless it was
    /// cancelled or the scheduler stopped accepting work meanwhile.
    async fn readmit_after(self: Arc<Self>, task: Task, cancel: CancelFlag, delay: Duration) {
        let id = task.id;
        let cancelled = tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = cancel.cancelled() => true,
            _ = self.stopping.cancelled() => true,
        };

        let outcome = {
            let mut dispatch = self.dispatch.lock().await;
            dispatch.retrying = dispatch.retrying.saturating_sub(1);

            if cancelled || cancel.is_cancelled() || !self.is_accepting() {
                Some(TaskOutcome::Cancelled)
            } else {
                match dispatch.queue.enqueue(task) {
                    Ok(_) => {
                        if self.contexts.transition(id, TaskStatus::Queued).await {
                            debug!(task_id = %id, "Task re-queued");
                        } else {
                            dispatch.queue.remove_queued(id);
                        }
                        None
                    }
                    Err(e) => Some(TaskOutcome::Failed {
                        error: ExecutionError::Transient {
                            reason: format!("could not re-queue for retry: {e}"),
                        },
                    }),
                }
            }
        };

        if let Some(outcome) = outcome {
            self.conclude(id, outcome).await;
            self.notify_if_idle().await;
        }
        self.pump().await;
    }

    fn execute_kind<'a>(
        &'a self,
        kind: &'a TaskKind,
        run: &'a Run,
    ) -> BoxFuture<'a, Result<serde_json::Value, ExecutionError>> {
        async move {
            match kind {
                TaskKind::Agent {
                    agent_type,
                    payload,
                } => self.run_agent(agent_type, payload, run).await,
                TaskKind::Tool {
                    tool_name,
                    parameters,
                } => self.run_tool(tool_name, parameters, run).await,
                TaskKind::Composite {
                    subtasks,
                    fail_fast,
                } => self.run_composite(subtasks, *fail_fast, run).await,
            }
        }
        .boxed()
    }

    async fn run_agent(
        &self,
        agent_type: &str,
        payload: &serde_json::Value,
        run: &Run,
    ) -> Result<serde_json::Value, ExecutionError> {
        let snapshot = self
            .contexts
            .state(run.id)
            .await
            .ok_or_else(|| ExecutionError::Terminal {
                reason: format!("no execution context for task {}", run.id),
            })?;

        let handle = self.acquire_agent(agent_type, run).await?;
        let ctx = AgentContext::new(snapshot, run.cancel.clone(), Arc::clone(&self.contexts));

        let call = AssertUnwindSafe(handle.agent().execute(payload.clone(), &ctx)).catch_unwind();
        match self.with_deadline(run, call).await {
            Ok(Ok(result)) => {
                self.pool.return_agent(handle).await;
                result.map_err(ExecutionError::from)
            }
            Ok(Err(panic)) => {
                let reason = panic_message(panic.as_ref());
                error!(task_id = %run.id, agent_type, reason = %reason, "Agent panicked");
                self.pool.discard_agent(handle).await;
                Err(ExecutionError::Panicked { reason })
            }
            Err(timeout) => {
                // Abandoned mid-call.
                self.pool.discard_agent(handle).await;
                Err(timeout)
            }
        }
    }

    /// Check out an agent, waiting for one to be released while the type
    /// is exhausted. Gives up on cancellation or when the deadline passes.
    async fn acquire_agent(&self, agent_type: &str, run: &Run) -> Result<AgentHandle, ExecutionError> {
        loop {
            let released = self.pool.released().notified();
            match self.pool.get_agent(agent_type).await {
                Ok(handle) => return Ok(handle),
                Err(PoolError::Exhausted { max, .. }) => {
                    debug!(task_id = %run.id, agent_type, max, "Waiting for a free agent");
                }
                Err(e) => return Err(e.into()),
            }

            let remaining = self
                .contexts
                .with_context(run.id, |ctx| ctx.remaining())
                .await
                .flatten();
            tokio::select! {
                _ = released => {}
                _ = run.cancel.cancelled() => return Err(run.cancelled_error()),
                _ = sleep_for(remaining) => return Err(run.timeout_error()),
            }
        }
    }

    async fn run_tool(
        &self,
        tool_name: &str,
        parameters: &serde_json::Value,
        run: &Run,
    ) -> Result<serde_json::Value, ExecutionError> {
        let tool = self
            .tools
            .get(tool_name)
            .await
            .ok_or_else(|| ExecutionError::ToolNotFound {
                name: tool_name.to_string(),
            })?;

        let call = AssertUnwindSafe(tool.execute(parameters.clone())).catch_unwind();
        match self.with_deadline(run, call).await? {
            Ok(result) => result.map_err(ExecutionError::from),
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                error!(task_id = %run.id, tool = tool_name, reason = %reason, "Tool panicked");
                Err(ExecutionError::Panicked { reason })
            }
        }
    }

    /// Run sub-tasks in dependency order, checking for cancellation and the
    /// deadline before each step.
    async fn run_composite(
        &self,
        subtasks: &[Task],
        fail_fast: bool,
        run: &Run,
    ) -> Result<serde_json::Value, ExecutionError> {
        let order = composite::execution_order(subtasks).map_err(|e| ExecutionError::Terminal {
            reason: e.to_string(),
        })?;

        let total = order.len();
        let mut results = serde_json::Map::new();
        let mut unusable = std::collections::HashSet::new();
        let (mut completed, mut failed, mut skipped) = (0usize, 0usize, 0usize);

        for (done, index) in order.into_iter().enumerate() {
            self.checkpoint(run).await?;

            let step = &subtasks[index];
            let key = step.id.to_string();

            let blocked = step.dependencies.iter().any(|dep| unusable.contains(dep));
            let result = if blocked {
                None
            } else {
                Some(self.execute_kind(&step.kind, run).await)
            };

            match result {
                None => {
                    unusable.insert(step.id);
                    skipped += 1;
                    results.insert(key, json!({ "status": "skipped" }));
                }
                Some(Ok(result)) => {
                    completed += 1;
                    results.insert(key, json!({ "status": "completed", "result": result }));
                }
                Some(Err(e)) if fail_fast || e.is_cancelled() || e.is_timeout() => {
                    debug!(task_id = %run.id, step = %step.id, error = %e, "Composite step failed");
                    return Err(e);
                }
                Some(Err(e)) => {
                    warn!(task_id = %run.id, step = %step.id, error = %e, "Composite step failed; continuing");
                    unusable.insert(step.id);
                    failed += 1;
                    results.insert(key, json!({ "status": "failed", "error": e }));
                }
            }

            let progress = ((done + 1) * 100 / total.max(1)) as i64;
            self.contexts
                .update_context(run.id, |ctx| ctx.set_progress(progress))
                .await;
        }

        Ok(json!({
            "completed": completed,
            "failed": failed,
            "skipped": skipped,
            "results": results,
        }))
    }

    async fn checkpoint(&self, run: &Run) -> Result<(), ExecutionError> {
        if run.cancel.is_cancelled() {
            return Err(run.cancelled_error());
        }
        if self.contexts.is_timed_out(run.id).await {
            return Err(run.timeout_error());
        }
        Ok(())
    }

    /// Await `call`, dropping it once the deadline passes when deadlines are
    /// enforced.
    async fn with_deadline<F>(&self, run: &Run, call: F) -> Result<F::Output, ExecutionError>
    where
        F: Future,
    {
        if self.config.enforce_deadlines
            && let Some(remaining) = self
                .contexts
                .with_context(run.id, |ctx| ctx.remaining())
                .await
                .flatten()
        {
            return tokio::time::timeout(remaining, call)
                .await
                .map_err(|_| run.timeout_error());
        }
        Ok(call.await)
    }
}

/// Sleep for `duration`, or forever when there is none.
async fn sleep_for(duration: Option<Duration>) {
    match duration {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
