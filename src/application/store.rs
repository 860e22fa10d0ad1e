//! Task registry plus FIFO admission queue.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};
use metrics::gauge;
use thiserror::Error;
use tracing::warn;

use crate::domain::tasks::{CompilationTask, TaskId, TaskStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task `{0}` is already registered")]
    Duplicate(TaskId),
    #[error("task store unavailable: {message}")]
    Unavailable { message: String },
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }
}

/// Concurrent-safe bookkeeping of every task and the order they were admitted.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Register a task and append it to the admission queue.
    async fn enqueue(&self, task: CompilationTask) -> Result<(), StoreError>;

    /// Pop the oldest admitted task that has not been handed out yet.
    ///
    /// Never blocks waiting for work; an empty queue yields `Ok(None)`.
    async fn dequeue_next(&self) -> Result<Option<CompilationTask>, StoreError>;

    async fn get(&self, id: TaskId) -> Result<Option<CompilationTask>, StoreError>;

    /// Replace the stored snapshot for `task.id` (last writer wins).
    async fn update(&self, task: CompilationTask) -> Result<(), StoreError>;

    async fn list_all(&self) -> Result<Vec<CompilationTask>, StoreError>;

    /// Delete a record, reporting whether it existed.
    async fn remove(&self, id: TaskId) -> Result<bool, StoreError>;

    /// Number of admitted tasks not yet dequeued.
    async fn queued_len(&self) -> Result<usize, StoreError>;

    /// One-based position of a task in the admission queue.
    async fn queue_position(&self, id: TaskId) -> Result<Option<usize>, StoreError>;
}

/// Process-local store: a sharded map for lookups and a short-lived queue lock
/// for admission order. Lookups never touch the queue lock.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    records: DashMap<TaskId, CompilationTask>,
    queue: Mutex<VecDeque<TaskId>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The queue holds plain ids, so a guard left poisoned by a panicking
    /// holder is still consistent and is recovered.
    fn lock_queue(&self, op: &'static str) -> MutexGuard<'_, VecDeque<TaskId>> {
        self.queue.lock().unwrap_or_else(|poisoned| {
            warn!(
                target = "texforge::store",
                op,
                result = "poison_recovered",
                "Admission queue lock was poisoned"
            );
            poisoned.into_inner()
        })
    }

    fn publish_depth(&self, depth: usize) {
        gauge!("texforge_queue_depth").set(depth as f64);
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn enqueue(&self, task: CompilationTask) -> Result<(), StoreError> {
        let id = task.id;
        match self.records.entry(id) {
            Entry::Occupied(_) => return Err(StoreError::Duplicate(id)),
            Entry::Vacant(slot) => {
                slot.insert(task);
            }
        }

        let depth = {
            let mut queue = self.lock_queue("enqueue");
            queue.push_back(id);
            queue.len()
        };
        self.publish_depth(depth);
        Ok(())
    }

    async fn dequeue_next(&self) -> Result<Option<CompilationTask>, StoreError> {
        loop {
            let (next, depth) = {
                let mut queue = self.lock_queue("dequeue_next");
                (queue.pop_front(), queue.len())
            };
            self.publish_depth(depth);

            let Some(id) = next else {
                return Ok(None);
            };

            match self.records.get(&id) {
                Some(record) => return Ok(Some(record.clone())),
                None => {
                    warn!(
                        target = "texforge::store",
                        op = "dequeue_next",
                        result = "skipped",
                        task_id = %id,
                        "Queued task vanished before dispatch"
                    );
                }
            }
        }
    }

    async fn get(&self, id: TaskId) -> Result<Option<CompilationTask>, StoreError> {
        Ok(self.records.get(&id).map(|record| record.clone()))
    }

    async fn update(&self, task: CompilationTask) -> Result<(), StoreError> {
        match self.records.get_mut(&task.id) {
            Some(mut record) => {
                *record = task;
            }
            None => {
                warn!(
                    target = "texforge::store",
                    op = "update",
                    result = "missing",
                    task_id = %task.id,
                    status = task.status.as_str(),
                    "Dropped update for a task that is no longer registered"
                );
            }
        }
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<CompilationTask>, StoreError> {
        Ok(self
            .records
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn remove(&self, id: TaskId) -> Result<bool, StoreError> {
        Ok(self.records.remove(&id).is_some())
    }

    async fn queued_len(&self) -> Result<usize, StoreError> {
        Ok(self.lock_queue("queued_len").len())
    }

    async fn queue_position(&self, id: TaskId) -> Result<Option<usize>, StoreError> {
        let is_queued = self
            .records
            .get(&id)
            .is_some_and(|record| record.status == TaskStatus::Queued);
        if !is_queued {
            return Ok(None);
        }

        let queue = self.lock_queue("queue_position");
        Ok(queue
            .iter()
            .position(|queued| *queued == id)
            .map(|index| index + 1))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use time::OffsetDateTime;

    use super::*;
    use crate::domain::sources::{SourceDocument, SourceKind};

    fn task(name: &str) -> CompilationTask {
        let id = TaskId::new();
        CompilationTask::queued(
            id,
            name,
            SourceDocument::new(
                PathBuf::from(format!("/uploads/{id}.tex")),
                format!("{id}.tex"),
                SourceKind::Document,
            ),
            OffsetDateTime::now_utc(),
        )
    }

    #[tokio::test]
    async fn dequeues_in_admission_order() {
        let store = InMemoryTaskStore::new();
        let first = task("a.tex");
        let second = task("b.tex");
        store.enqueue(first.clone()).await.expect("enqueue");
        store.enqueue(second.clone()).await.expect("enqueue");

        assert_eq!(store.queue_position(second.id).await.expect("pos"), Some(2));

        let popped = store.dequeue_next().await.expect("dequeue");
        assert_eq!(popped.map(|task| task.id), Some(first.id));
        let popped = store.dequeue_next().await.expect("dequeue");
        assert_eq!(popped.map(|task| task.id), Some(second.id));
        assert!(store.dequeue_next().await.expect("dequeue").is_none());

        assert!(store.get(first.id).await.expect("get").is_some());
        assert_eq!(store.queued_len().await.expect("len"), 0);
    }

    #[tokio::test]
    async fn rejects_duplicate_ids() {
        let store = InMemoryTaskStore::new();
        let record = task("a.tex");
        store.enqueue(record.clone()).await.expect("enqueue");

        let err = store.enqueue(record).await.expect_err("duplicate");
        assert!(matches!(err, StoreError::Duplicate(_)));
        assert_eq!(store.queued_len().await.expect("len"), 1);
    }

    #[tokio::test]
    async fn update_does_not_resurrect_removed_records() {
        let store = InMemoryTaskStore::new();
        let record = task("a.tex");
        store.enqueue(record.clone()).await.expect("enqueue");

        assert!(store.remove(record.id).await.expect("remove"));
        assert!(!store.remove(record.id).await.expect("remove"));

        store.update(record.clone()).await.expect("update");
        assert!(store.get(record.id).await.expect("get").is_none());
        // The queued id is skipped once its record is gone.
        assert!(store.dequeue_next().await.expect("dequeue").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_dequeue_never_hands_out_a_task_twice() {
        let store = Arc::new(InMemoryTaskStore::new());
        for index in 0..200 {
            store
                .enqueue(task(&format!("{index}.tex")))
                .await
                .expect("enqueue");
        }

        let mut workers = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            workers.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(task) = store.dequeue_next().await.expect("dequeue") {
                    seen.push(task.id);
                }
                seen
            }));
        }

        let mut all = Vec::new();
        for worker in workers {
            all.extend(worker.await.expect("join"));
        }
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(total, 200);
        assert_eq!(all.len(), 200);
    }
}
