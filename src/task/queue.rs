//! Task queue: bounded holding area with a configurable dequeue order.
//!
//! Plain synchronous data structure. The scheduler owns the only instance and
//! serializes access behind its dispatch lock.

use std::collections::{HashSet, VecDeque};

use serde::Serialize;
use tracing::debug;

use crate::config::{QueueConfig, QueueStrategy};
use crate::error::QueueError;
use crate::task::model::{Task, TaskId};

/// Snapshot of queue occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub queued: usize,
    pub processing: usize,
    pub capacity: usize,
}

/// Ordered queue of pending tasks plus the set of dequeued-but-unfinished ids.
#[derive(Debug)]
pub struct TaskQueue {
    config: QueueConfig,
    items: VecDeque<Task>,
    processing: HashSet<TaskId>,
}

impl TaskQueue {
    /// Empty queue with the given capacity and ordering strategy.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            items: VecDeque::new(),
            processing: HashSet::new(),
        }
    }

    /// Admit a task. Fails without side effects when full or when the id is
    /// already queued or processing.
    pub fn enqueue(&mut self, task: Task) -> Result<TaskId, QueueError> {
        if self.contains(task.id) {
            return Err(QueueError::Duplicate { id: task.id });
        }
        if self.items.len() >= self.config.max_size {
            return Err(QueueError::Full {
                capacity: self.config.max_size,
            });
        }

        let id = task.id;
        match self.config.strategy {
            QueueStrategy::Fifo => self.items.push_back(task),
            QueueStrategy::Lifo => self.items.push_front(task),
            QueueStrategy::Priority => {
                // After every item of equal or higher priority.
                let at = self
                    .items
                    .iter()
                    .position(|queued| queued.priority < task.priority)
                    .unwrap_or(self.items.len());
                self.items.insert(at, task);
            }
        }

        debug!(task_id = %id, queued = self.items.len(), "Task enqueued");
        Ok(id)
    }

    /// Take the head of the queue and mark it as processing.
    pub fn dequeue(&mut self) -> Option<Task> {
        let task = self.items.pop_front()?;
        self.processing.insert(task.id);
        Some(task)
    }

    /// The task `dequeue` would return next, left in place.
    pub fn peek(&self) -> Option<&Task> {
        self.items.front()
    }

    /// Remove a queued task or clear its processing marker.
    pub fn remove(&mut self, id: TaskId) -> bool {
        if let Some(pos) = self.items.iter().position(|t| t.id == id) {
            self.items.remove(pos);
            return true;
        }
        self.processing.remove(&id)
    }

    /// Remove a task only if it is still waiting in the queue.
    pub fn remove_queued(&mut self, id: TaskId) -> Option<Task> {
        let pos = self.items.iter().position(|t| t.id == id)?;
        self.items.remove(pos)
    }

    /// Clear the processing marker for a finished task.
    pub fn mark_complete(&mut self, id: TaskId) -> bool {
        self.processing.remove(&id)
    }

    /// Drain every queued task (processing markers are untouched).
    pub fn drain_queued(&mut self) -> Vec<Task> {
        self.items.drain(..).collect()
    }

    /// True if the id is queued or processing.
    pub fn contains(&self, id: TaskId) -> bool {
        self.processing.contains(&id) || self.items.iter().any(|t| t.id == id)
    }

    /// True only while the id is waiting in the queue.
    pub fn is_queued(&self, id: TaskId) -> bool {
        self.items.iter().any(|t| t.id == id)
    }

    /// Number of queued tasks; processing tasks are not counted.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of dequeued tasks not yet marked complete.
    pub fn processing_count(&self) -> usize {
        self.processing.len()
    }

    /// Queued and processing counts alongside the capacity.
    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            queued: self.items.len(),
            processing: self.processing.len(),
            capacity: self.config.max_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queue(max_size: usize, strategy: QueueStrategy) -> TaskQueue {
        TaskQueue::new(QueueConfig { max_size, strategy })
    }

    fn task(priority: i32) -> Task {
        Task::agent("x", json!({})).with_priority(priority)
    }

    #[test]
    fn priority_full_rejects_third() {
        let mut q = queue(2, QueueStrategy::Priority);
        q.enqueue(task(1)).unwrap();
        q.enqueue(task(5)).unwrap();
        let err = q.enqueue(task(5)).unwrap_err();
        assert_eq!(err, QueueError::Full { capacity: 2 });
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn priority_order_is_stable() {
        let mut q = queue(3, QueueStrategy::Priority);
        let a = q.enqueue(task(1)).unwrap();
        let b = q.enqueue(task(5)).unwrap();
        let c = q.enqueue(task(5)).unwrap();

        assert_eq!(q.dequeue().unwrap().id, b);
        assert_eq!(q.dequeue().unwrap().id, c);
        assert_eq!(q.dequeue().unwrap().id, a);
        assert!(q.dequeue().is_none());
    }

    #[test]
    fn priority_matches_stable_sort() {
        let priorities = [3, -1, 7, 3, 0, 7, 7, -1, 2, 3, 0, 9];
        let mut q = queue(64, QueueStrategy::Priority);
        let mut expected = Vec::new();
        for (seq, p) in priorities.iter().enumerate() {
            let id = q.enqueue(task(*p)).unwrap();
            expected.push((*p, seq, id));
        }
        // Descending priority, ascending insertion sequence.
        expected.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let order: Vec<TaskId> = std::iter::from_fn(|| q.dequeue().map(|t| t.id)).collect();
        let want: Vec<TaskId> = expected.into_iter().map(|(_, _, id)| id).collect();
        assert_eq!(order, want);
    }

    #[test]
    fn fifo_and_lifo() {
        let mut fifo = queue(10, QueueStrategy::Fifo);
        let first = fifo.enqueue(task(0)).unwrap();
        let second = fifo.enqueue(task(9)).unwrap();
        assert_eq!(fifo.dequeue().unwrap().id, first);
        assert_eq!(fifo.dequeue().unwrap().id, second);

        let mut lifo = queue(10, QueueStrategy::Lifo);
        let first = lifo.enqueue(task(9)).unwrap();
        let second = lifo.enqueue(task(0)).unwrap();
        assert_eq!(lifo.dequeue().unwrap().id, second);
        assert_eq!(lifo.dequeue().unwrap().id, first);
    }

    #[test]
    fn dequeue_moves_to_processing() {
        let mut q = queue(10, QueueStrategy::Fifo);
        let id = q.enqueue(task(0)).unwrap();
        assert_eq!(q.status().queued, 1);

        q.dequeue().unwrap();
        let status = q.status();
        assert_eq!(status.queued, 0);
        assert_eq!(status.processing, 1);
        assert_eq!(status.capacity, 10);

        // Processing ids can't be admitted twice.
        assert!(matches!(
            q.enqueue(task(0).with_id(id)),
            Err(QueueError::Duplicate { .. })
        ));

        assert!(q.mark_complete(id));
        assert!(!q.mark_complete(id));
        assert_eq!(q.status().processing, 0);
    }

    #[test]
    fn duplicate_queued_id_rejected() {
        let mut q = queue(10, QueueStrategy::Priority);
        let t = task(1);
        q.enqueue(t.clone()).unwrap();
        assert_eq!(
            q.enqueue(t.clone()).unwrap_err(),
            QueueError::Duplicate { id: t.id }
        );
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn removed_task_never_dequeued() {
        let mut q = queue(10, QueueStrategy::Priority);
        let keep = q.enqueue(task(1)).unwrap();
        let gone = q.enqueue(task(5)).unwrap();

        assert!(q.remove(gone));
        assert!(!q.remove(gone));
        assert_eq!(q.peek().unwrap().id, keep);
        assert_eq!(q.dequeue().unwrap().id, keep);
        assert!(q.dequeue().is_none());
    }

    #[test]
    fn remove_clears_processing_marker() {
        let mut q = queue(10, QueueStrategy::Fifo);
        let id = q.enqueue(task(0)).unwrap();
        q.dequeue();
        assert!(q.remove(id));
        assert_eq!(q.processing_count(), 0);
    }

    #[test]
    fn empty_queue_returns_none() {
        let mut q = queue(1, QueueStrategy::Fifo);
        assert!(q.is_empty());
        assert!(q.peek().is_none());
        assert!(q.dequeue().is_none());
    }
}
