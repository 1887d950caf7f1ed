//! Shared download work queue
//!
//! Workers check tasks out with `next` and get a `Claim`. A failed task goes
//! back with `Claim::requeue`; a task that is done (verified or abandoned) is
//! retired with `Claim::complete`. `next` only returns `None` once every task
//! has been retired, so a worker never exits while another worker's task may
//! still come back. A claim dropped unresolved, as when its worker panics,
//! retires the task and records it as abandoned.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::manifest::ManifestEntry;

/// A manifest entry plus its retry state
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub entry: ManifestEntry,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl DownloadTask {
    pub fn new(entry: ManifestEntry) -> Self {
        Self {
            entry,
            attempts: 0,
            last_error: None,
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    tasks: VecDeque<DownloadTask>,
    /// Tasks handed out or queued that have not been retired
    outstanding: usize,
    /// Tasks whose claim was dropped without being resolved
    abandoned: Vec<DownloadTask>,
}

#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new(tasks: impl IntoIterator<Item = DownloadTask>) -> Self {
        let tasks: VecDeque<DownloadTask> = tasks.into_iter().collect();
        Self {
            state: Mutex::new(QueueState {
                outstanding: tasks.len(),
                tasks,
                abandoned: Vec::new(),
            }),
            notify: Notify::new(),
        }
    }

    /// Next task, waiting while others are in flight. `None` once drained.
    pub async fn next(self: &Arc<Self>) -> Option<Claim> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if let Some(task) = state.tasks.pop_front() {
                    return Some(Claim {
                        queue: Arc::clone(self),
                        task: Some(task),
                    });
                }
                if state.outstanding == 0 {
                    return None;
                }
            }
            notified.await;
        }
    }

    fn push_back(&self, task: DownloadTask) {
        self.lock().tasks.push_back(task);
        self.notify.notify_one();
    }

    fn retire(&self, abandoned: Option<DownloadTask>) {
        let drained = {
            let mut state = self.lock();
            state.outstanding = state.outstanding.saturating_sub(1);
            state.abandoned.extend(abandoned);
            state.outstanding == 0
        };
        if drained {
            self.notify.notify_waiters();
        }
    }

    /// Tasks not yet retired
    pub fn outstanding(&self) -> usize {
        self.lock().outstanding
    }

    /// Take the tasks whose claims were dropped unresolved
    pub fn take_abandoned(&self) -> Vec<DownloadTask> {
        std::mem::take(&mut self.lock().abandoned)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        // A panicking worker cannot leave the counters half-updated
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A task checked out of the queue
pub struct Claim {
    queue: Arc<WorkQueue>,
    task: Option<DownloadTask>,
}

impl Claim {
    pub fn task(&self) -> &DownloadTask {
        // Only emptied by `requeue`, `complete` or drop, which consume the claim
        self.task.as_ref().unwrap_or_else(|| unreachable!("claim already resolved"))
    }

    pub fn task_mut(&mut self) -> &mut DownloadTask {
        self.task.as_mut().unwrap_or_else(|| unreachable!("claim already resolved"))
    }

    /// Put the task back at the end of the queue
    pub fn requeue(mut self) {
        if let Some(task) = self.task.take() {
            self.queue.push_back(task);
        }
    }

    /// Retire the task for good
    pub fn complete(mut self) {
        if self.task.take().is_some() {
            self.queue.retire(None);
        }
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            self.queue.retire(Some(task));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn task(hash: &str) -> DownloadTask {
        DownloadTask::new(ManifestEntry {
            path: format!("/{}", hash),
            hash: hash.to_string(),
            size: 1,
        })
    }

    #[tokio::test]
    async fn test_empty_queue_returns_none() {
        let queue = Arc::new(WorkQueue::new(Vec::new()));
        assert!(queue.next().await.is_none());
    }

    #[tokio::test]
    async fn test_drains_in_order() {
        let queue = Arc::new(WorkQueue::new(vec![task("aa"), task("bb")]));
        let first = queue.next().await.unwrap();
        assert_eq!(first.task().entry.hash, "aa");
        first.complete();
        let second = queue.next().await.unwrap();
        assert_eq!(second.task().entry.hash, "bb");
        second.complete();
        assert!(queue.next().await.is_none());
        assert!(queue.take_abandoned().is_empty());
    }

    #[tokio::test]
    async fn test_idle_worker_waits_for_requeue() {
        let queue = Arc::new(WorkQueue::new(vec![task("aa")]));
        let first = queue.next().await.unwrap();

        // A second worker finds the queue empty but one task outstanding
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        first.requeue();
        let retried = waiter.await.unwrap().unwrap();
        assert_eq!(retried.task().entry.hash, "aa");
        retried.complete();
        assert!(queue.next().await.is_none());
    }

    #[tokio::test]
    async fn test_waiters_released_when_drained() {
        let queue = Arc::new(WorkQueue::new(vec![task("aa")]));
        let held = queue.next().await.unwrap();

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await.is_none() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        held.complete();
        assert!(waiter.await.unwrap());
        assert_eq!(queue.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_panicked_holder_retires_its_task() {
        let queue = Arc::new(WorkQueue::new(vec![task("aa"), task("bb")]));

        let crashed = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let _claim = queue.next().await;
                panic!("worker crashed mid-transfer");
            })
        };
        assert!(crashed.await.unwrap_err().is_panic());

        // The surviving worker still drains the queue and returns
        let survivor = queue.next().await.unwrap();
        assert_eq!(survivor.task().entry.hash, "bb");
        survivor.complete();
        let drained = tokio::time::timeout(Duration::from_secs(1), queue.next())
            .await
            .expect("queue never drained");
        assert!(drained.is_none());

        let abandoned = queue.take_abandoned();
        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].entry.hash, "aa");
    }
}
