//! Per-task execution bookkeeping.
//!
//! Timeouts and cancellation here are cooperative: nothing in this module
//! interrupts a running call. Code holding a context polls `is_timed_out()`
//! and `is_cancelled()` at safe checkpoints.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::task::model::{Task, TaskId};

/// Maximum log entries kept per context.
const MAX_LOG_ENTRIES: usize = 200;

/// Callback fired once when the task reaches a terminal state.
pub type CleanupCallback = Box<dyn FnOnce() -> anyhow::Result<()> + Send + Sync>;

/// Cooperative cancellation signal shared between the scheduler and a task.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. Returns false if it was already raised.
    pub fn cancel(&self) -> bool {
        let first = !self.inner.cancelled.swap(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the flag is raised.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Severity of a context log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A log line recorded against a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Point-in-time view of a task's execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionState {
    pub task_id: TaskId,
    pub task_type: String,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed: Duration,
    pub progress: u8,
    pub retry_count: u32,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Cleanup callbacks detached from their context, ready to run.
pub struct PendingCleanup {
    task_id: TaskId,
    callbacks: Vec<CleanupCallback>,
}

impl PendingCleanup {
    /// Run every callback in registration order. Failures and panics are
    /// logged and do not stop the remaining callbacks. Returns how many
    /// callbacks ran.
    pub fn run(self) -> usize {
        let count = self.callbacks.len();
        for (index, callback) in self.callbacks.into_iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(callback)) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(task_id = %self.task_id, index, error = %e, "Cleanup callback failed");
                }
                Err(_) => {
                    tracing::error!(task_id = %self.task_id, index, "Cleanup callback panicked");
                }
            }
        }
        count
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

/// Execution state for exactly one task.
pub struct ExecutionContext {
    task: Task,
    timeout: Option<Duration>,
    started: Option<Instant>,
    started_at: Option<DateTime<Utc>>,
    finished: Option<Instant>,
    retry_count: u32,
    progress: u8,
    metadata: serde_json::Map<String, serde_json::Value>,
    cleanup_callbacks: Vec<CleanupCallback>,
    cleaned_up: bool,
    logs: Vec<LogEntry>,
    cancel: CancelFlag,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("task_id", &self.task.id)
            .field("timeout", &self.timeout)
            .field("retry_count", &self.retry_count)
            .field("progress", &self.progress)
            .field("cleanup_callbacks", &self.cleanup_callbacks.len())
            .field("cleaned_up", &self.cleaned_up)
            .finish()
    }
}

impl ExecutionContext {
    pub fn new(task: Task, timeout: Option<Duration>) -> Self {
        Self {
            task,
            timeout,
            started: None,
            started_at: None,
            finished: None,
            retry_count: 0,
            progress: 0,
            metadata: serde_json::Map::new(),
            cleanup_callbacks: Vec::new(),
            cleaned_up: false,
            logs: Vec::new(),
            cancel: CancelFlag::new(),
        }
    }

    /// Stamp the start of an attempt. The deadline counts from here.
    pub fn initialize(&mut self) {
        self.started = Some(Instant::now());
        self.started_at = Some(Utc::now());
        self.finished = None;
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn task_id(&self) -> TaskId {
        self.task.id
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Time left before the deadline, if one is set and the clock is running.
    pub fn remaining(&self) -> Option<Duration> {
        let timeout = self.timeout?;
        self.started?;
        Some(timeout.saturating_sub(self.elapsed()))
    }

    /// True once the current attempt has run longer than its timeout.
    pub fn is_timed_out(&self) -> bool {
        match (self.timeout, self.started) {
            (Some(timeout), Some(_)) => self.elapsed() > timeout,
            _ => false,
        }
    }

    /// Wall-clock time of the current attempt (frozen once finished).
    pub fn elapsed(&self) -> Duration {
        match self.started {
            Some(start) => self
                .finished
                .unwrap_or_else(Instant::now)
                .saturating_duration_since(start),
            None => Duration::ZERO,
        }
    }

    /// Stop the attempt clock.
    pub fn mark_finished(&mut self) {
        if self.started.is_some() && self.finished.is_none() {
            self.finished = Some(Instant::now());
        }
    }

    pub fn set_progress(&mut self, progress: i64) {
        self.progress = progress.clamp(0, 100) as u8;
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn update_metadata(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.metadata.insert(key.into(), value);
    }

    pub fn metadata(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.metadata
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Only the scheduler counts retries.
    pub(crate) fn increment_retry(&mut self) -> u32 {
        self.retry_count += 1;
        self.retry_count
    }

    /// Record a log line and mirror it to tracing.
    pub fn add_log(&mut self, message: impl Into<String>, level: LogLevel) {
        let message = message.into();
        let task_id = self.task.id;
        match level {
            LogLevel::Debug => tracing::debug!(task_id = %task_id, "{message}"),
            LogLevel::Info => tracing::info!(task_id = %task_id, "{message}"),
            LogLevel::Warn => tracing::warn!(task_id = %task_id, "{message}"),
            LogLevel::Error => tracing::error!(task_id = %task_id, "{message}"),
        }

        self.logs.push(LogEntry {
            timestamp: Utc::now(),
            level,
            message,
        });

        if self.logs.len() > MAX_LOG_ENTRIES {
            let drain_count = self.logs.len() - MAX_LOG_ENTRIES;
            self.logs.drain(..drain_count);
        }
    }

    pub fn logs(&self) -> &[LogEntry] {
        &self.logs
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Register a callback for the terminal transition. Returns false, and
    /// drops the callback unrun, once cleanup has already happened.
    pub fn add_cleanup_callback<F>(&mut self, callback: F) -> bool
    where
        F: FnOnce() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        if self.cleaned_up {
            tracing::warn!(task_id = %self.task.id, "Cleanup callback registered after cleanup");
            return false;
        }
        self.cleanup_callbacks.push(Box::new(callback));
        true
    }

    pub fn is_cleaned_up(&self) -> bool {
        self.cleaned_up
    }

    /// Take the callbacks without running them, marking the context cleaned
    /// up. Lets the owner run them after releasing its lock.
    pub fn detach_cleanup(&mut self) -> PendingCleanup {
        self.cleaned_up = true;
        PendingCleanup {
            task_id: self.task.id,
            callbacks: std::mem::take(&mut self.cleanup_callbacks),
        }
    }

    /// Run all cleanup callbacks. Idempotent: later calls run nothing.
    pub fn cleanup(&mut self) -> usize {
        self.detach_cleanup().run()
    }

    pub fn state(&self) -> ExecutionState {
        ExecutionState {
            task_id: self.task.id,
            task_type: self.task.task_type(),
            started_at: self.started_at,
            elapsed: self.elapsed(),
            progress: self.progress,
            retry_count: self.retry_count,
            metadata: self.metadata.clone(),
        }
    }
}
