//! Single-flight queue drain loop.

use std::{sync::Arc, time::Instant};

use metrics::{counter, histogram};
use time::OffsetDateTime;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use crate::domain::tasks::{CompilationTask, TaskId};

use super::compiler::DocumentCompiler;
use super::store::{StoreError, TaskStore};

/// Drives the admission queue to empty, one task at a time.
///
/// Any number of callers may [`kick`](Self::kick) concurrently; at most one
/// drain loop holds the single gate permit. The loop releases the permit only
/// after it has observed an empty queue, then re-checks the queue so a task
/// enqueued between that check and the release is never stranded.
#[derive(Clone)]
pub struct QueueDispatcher {
    store: Arc<dyn TaskStore>,
    compiler: Arc<dyn DocumentCompiler>,
    gate: Arc<Semaphore>,
}

impl QueueDispatcher {
    pub fn new(store: Arc<dyn TaskStore>, compiler: Arc<dyn DocumentCompiler>) -> Self {
        Self {
            store,
            compiler,
            gate: Arc::new(Semaphore::new(1)),
        }
    }

    /// Admit a task and make sure a drain loop will pick it up.
    pub async fn submit(&self, task: CompilationTask) -> Result<TaskId, StoreError> {
        let id = task.id;
        self.store.enqueue(task).await?;
        counter!("texforge_tasks_submitted_total").increment(1);
        self.kick();
        Ok(id)
    }

    /// Start a drain loop unless one is already running. Never blocks.
    pub fn kick(&self) {
        let Ok(permit) = self.gate.clone().try_acquire_owned() else {
            debug!(
                target = "texforge::dispatcher",
                op = "kick",
                result = "already_running",
                "Drain loop already active"
            );
            return;
        };

        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.drain(permit).await;
        });
    }

    /// Wait until no drain loop is active and the queue is empty.
    pub async fn wait_idle(&self) {
        loop {
            let Ok(permit) = self.gate.acquire().await else {
                return;
            };
            let pending = self.store.queued_len().await.unwrap_or(0);
            drop(permit);

            if pending == 0 {
                return;
            }
            // A submission may have lost the gate to us while we held it.
            self.kick();
        }
    }

    async fn drain(&self, mut permit: OwnedSemaphorePermit) {
        loop {
            let Some(processed) = self.drain_until_empty().await else {
                return;
            };
            debug!(
                target = "texforge::dispatcher",
                op = "drain",
                result = "empty",
                processed,
                "Queue drained"
            );

            drop(permit);

            match self.store.queued_len().await {
                Ok(0) => return,
                Ok(_) => {}
                Err(err) => {
                    error!(
                        target = "texforge::dispatcher",
                        op = "drain",
                        result = "error",
                        error = %err,
                        "Could not re-check queue after release"
                    );
                    return;
                }
            }

            // Work arrived after the empty check. Whoever wins the gate drains it.
            match self.gate.clone().try_acquire_owned() {
                Ok(next) => permit = next,
                Err(_) => return,
            }
        }
    }

    /// Process tasks until the queue is empty. `None` means the store failed
    /// and the loop should stop without re-checking.
    async fn drain_until_empty(&self) -> Option<usize> {
        let mut processed = 0;
        loop {
            let next = match self.store.dequeue_next().await {
                Ok(next) => next,
                Err(err) => {
                    error!(
                        target = "texforge::dispatcher",
                        op = "dequeue_next",
                        result = "error",
                        error = %err,
                        processed,
                        "Task store unavailable; pausing drain loop"
                    );
                    return None;
                }
            };

            let Some(task) = next else {
                return Some(processed);
            };

            self.process(task).await;
            processed += 1;
        }
    }

    async fn process(&self, task: CompilationTask) {
        let started_at = Instant::now();
        let task_id = task.id;

        let running = match task.start(OffsetDateTime::now_utc()) {
            Ok(running) => running,
            Err(err) => {
                warn!(
                    target = "texforge::dispatcher",
                    op = "process",
                    result = "skipped",
                    task_id = %task_id,
                    error = %err,
                    "Dequeued task was not startable"
                );
                return;
            }
        };
        self.persist(running.clone(), "start").await;

        info!(
            target = "texforge::dispatcher",
            op = "process",
            result = "started",
            task_id = %task_id,
            original_name = %running.original_name,
            "Compilation started"
        );

        let compiler = self.compiler.clone();
        let input = running.clone();
        let joined = tokio::spawn(async move { compiler.compile(&input).await }).await;

        let now = OffsetDateTime::now_utc();
        let finished = match joined {
            Ok(outcome) => running.finish(&outcome, now),
            Err(err) => {
                let reason = if err.is_panic() {
                    panic_message(err.into_panic())
                } else {
                    err.to_string()
                };
                error!(
                    target = "texforge::dispatcher",
                    op = "process",
                    result = "fault",
                    task_id = %task_id,
                    error = %reason,
                    "Compilation faulted unexpectedly"
                );
                counter!("texforge_compile_total", "outcome" => "internal_error").increment(1);
                running.fail_internal(reason, now)
            }
        };

        match finished {
            Ok(finished) => {
                let status = finished.status.as_str();
                self.persist(finished, "finish").await;
                histogram!("texforge_task_ms").record(started_at.elapsed().as_millis() as f64);
                info!(
                    target = "texforge::dispatcher",
                    op = "process",
                    result = status,
                    task_id = %task_id,
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    "Compilation finished"
                );
            }
            Err(err) => error!(
                target = "texforge::dispatcher",
                op = "process",
                result = "error",
                task_id = %task_id,
                error = %err,
                "Could not record compilation result"
            ),
        }
    }

    async fn persist(&self, task: CompilationTask, stage: &'static str) {
        let task_id = task.id;
        if let Err(err) = self.store.update(task).await {
            error!(
                target = "texforge::dispatcher",
                op = "persist",
                result = "error",
                stage,
                task_id = %task_id,
                error = %err,
                "Failed to persist task update"
            );
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "compiler panicked".to_string()
    }
}
