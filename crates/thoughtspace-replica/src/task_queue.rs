//! Bounded-concurrency task queue with progress reporting.

use crate::error::{ReplicaError, Result};
use futures::future::join_all;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

pub type StepCallback = Arc<dyn Fn(Progress) + Send + Sync>;
pub type EndCallback = Arc<dyn Fn() + Send + Sync>;

/// Tasks settled out of tasks added since the queue was last idle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
}

impl Progress {
    /// Completion ratio capped at 1. An empty run counts as complete.
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            (self.completed as f64 / self.total as f64).min(1.0)
        }
    }
}

#[derive(Default)]
struct Counts {
    completed: usize,
    total: usize,
}

struct QueueInner {
    semaphore: Arc<Semaphore>,
    counts: Mutex<Counts>,
    generation: AtomicU64,
    idle: watch::Sender<bool>,
    on_step: Option<StepCallback>,
    on_end: Option<EndCallback>,
}

impl QueueInner {
    fn settle(&self) {
        let (progress, done) = {
            let mut counts = self.counts.lock();
            counts.completed += 1;
            let progress = Progress {
                completed: counts.completed,
                total: counts.total,
            };
            let done = counts.completed >= counts.total;
            if done {
                *counts = Counts::default();
            }
            (progress, done)
        };

        if let Some(on_step) = &self.on_step {
            on_step(progress);
        }
        if done {
            self.idle.send_replace(true);
            if let Some(on_end) = &self.on_end {
                on_end();
            }
        }
    }
}

/// Settles a task even if it panics or is aborted.
struct Settle(Arc<QueueInner>);

impl Drop for Settle {
    fn drop(&mut self) {
        self.0.settle();
    }
}

/// Runs async tasks with at most `concurrency` in flight.
///
/// Tasks start as soon as they are added. `on_step` fires whenever tasks
/// are added or settle; `on_end` fires when the queue drains.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    pub fn new(concurrency: usize) -> Self {
        TaskQueueBuilder::new(concurrency).build()
    }

    /// Start `tasks`. The returned batch resolves with their results.
    pub fn add<T, F, Fut>(&self, tasks: impl IntoIterator<Item = F>) -> TaskBatch<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let tasks: Vec<F> = tasks.into_iter().collect();
        if tasks.is_empty() {
            return TaskBatch {
                handles: Vec::new(),
            };
        }

        let generation = self.inner.generation.load(Ordering::SeqCst);
        let progress = {
            let mut counts = self.inner.counts.lock();
            counts.total += tasks.len();
            Progress {
                completed: counts.completed,
                total: counts.total,
            }
        };
        self.inner.idle.send_replace(false);
        if let Some(on_step) = &self.inner.on_step {
            on_step(progress);
        }

        let handles = tasks
            .into_iter()
            .map(|task| {
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    let _settle = Settle(inner.clone());
                    match inner.semaphore.clone().acquire_owned().await {
                        Ok(_permit) => {
                            if inner.generation.load(Ordering::SeqCst) == generation {
                                task().await
                            } else {
                                Err(ReplicaError::Cancelled)
                            }
                        }
                        Err(_) => Err(ReplicaError::Cancelled),
                    }
                })
            })
            .collect();

        TaskBatch { handles }
    }

    /// Cancel every task that has not started yet. Running tasks finish.
    pub fn clear(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Resolves once every added task has settled.
    pub async fn end(&self) {
        let mut idle = self.inner.idle.subscribe();
        let _ = idle.wait_for(|idle| *idle).await;
    }

    pub fn progress(&self) -> Progress {
        let counts = self.inner.counts.lock();
        Progress {
            completed: counts.completed,
            total: counts.total,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.inner.counts.lock().total > 0
    }
}

/// Builder for a task queue.
pub struct TaskQueueBuilder {
    concurrency: usize,
    on_step: Option<StepCallback>,
    on_end: Option<EndCallback>,
}

impl TaskQueueBuilder {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            on_step: None,
            on_end: None,
        }
    }

    pub fn on_step(mut self, f: impl Fn(Progress) + Send + Sync + 'static) -> Self {
        self.on_step = Some(Arc::new(f));
        self
    }

    pub fn on_end(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_end = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> TaskQueue {
        TaskQueue {
            inner: Arc::new(QueueInner {
                semaphore: Arc::new(Semaphore::new(self.concurrency)),
                counts: Mutex::new(Counts::default()),
                generation: AtomicU64::new(0),
                idle: watch::channel(true).0,
                on_step: self.on_step,
                on_end: self.on_end,
            }),
        }
    }
}

/// Handles of one `add` call.
pub struct TaskBatch<T> {
    handles: Vec<JoinHandle<Result<T>>>,
}

impl<T> TaskBatch<T> {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every task of the batch. Fails with the first error once
    /// all of them have settled.
    pub async fn join(self) -> Result<Vec<T>> {
        let mut values = Vec::with_capacity(self.handles.len());
        let mut first_error = None;
        for joined in join_all(self.handles).await {
            match joined {
                Ok(Ok(value)) => values.push(value),
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(_) => {
                    first_error.get_or_insert(ReplicaError::Cancelled);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(values),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let queue = TaskQueue::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks = (0..8).map(|i| {
            let running = running.clone();
            let peak = peak.clone();
            move || async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(i)
            }
        });

        let mut results = queue.add(tasks).join().await.unwrap();
        results.sort();
        assert_eq!(results, (0..8).collect::<Vec<_>>());
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_progress_and_end_callbacks() {
        let steps = Arc::new(Mutex::new(Vec::new()));
        let ended = Arc::new(AtomicUsize::new(0));
        let queue = {
            let steps = steps.clone();
            let ended = ended.clone();
            TaskQueueBuilder::new(1)
                .on_step(move |p| steps.lock().push(p))
                .on_end(move || {
                    ended.fetch_add(1, Ordering::SeqCst);
                })
                .build()
        };

        let tasks = (0..3).map(|_| || async { Ok(()) });
        queue.add(tasks).join().await.unwrap();
        queue.end().await;

        let steps = steps.lock().clone();
        assert_eq!(steps.first(), Some(&Progress { completed: 0, total: 3 }));
        assert_eq!(steps.last(), Some(&Progress { completed: 3, total: 3 }));
        assert_eq!(ended.load(Ordering::SeqCst), 1);
        assert!(!queue.is_busy());
        assert_eq!(queue.progress().ratio(), 1.0);
    }

    #[tokio::test]
    async fn test_failure_propagates() {
        let queue = TaskQueue::new(4);
        type Task = Box<dyn FnOnce() -> futures::future::BoxFuture<'static, Result<u32>> + Send>;
        let tasks: Vec<Task> = vec![
            Box::new(|| Box::pin(async { Ok(1) })),
            Box::new(|| Box::pin(async { Err(ReplicaError::Serialization("bad".into())) })),
        ];

        let err = queue.add(tasks).join().await.unwrap_err();
        assert!(matches!(err, ReplicaError::Serialization(_)));
    }

    #[tokio::test]
    async fn test_clear_cancels_pending_tasks() {
        let queue = TaskQueue::new(1);
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let started = Arc::new(AtomicUsize::new(0));

        let (running_tx, running_rx) = tokio::sync::oneshot::channel::<()>();

        let blocker = queue.add([move || async move {
            let _ = running_tx.send(());
            let _ = release_rx.await;
            Ok(())
        }]);
        running_rx.await.unwrap();
        let pending = {
            let started = started.clone();
            queue.add((0..3).map(move |_| {
                let started = started.clone();
                move || async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }))
        };

        queue.clear();
        let _ = release_tx.send(());
        blocker.join().await.unwrap();
        assert!(matches!(pending.join().await, Err(ReplicaError::Cancelled)));
        assert_eq!(started.load(Ordering::SeqCst), 0);

        queue.end().await;
        assert!(!queue.is_busy());
    }
}
