//! Worker pool with a bounded job queue.
//!
//! The queue is a [`Semaphore`]: submitting a job adds one permit, a worker
//! claims one permit per job and forgets it. The queue bound is nominal —
//! `workers × 8` — enforced by checking the outstanding permit count before
//! adding, which keeps both submission paths lock-free.
//!
//! The pool only grows. Workers are detached tasks that live until process
//! exit; between phases they park on the empty queue. They never observe
//! phase cancellation: a phase ends by ceasing to submit and calling
//! [`flush`], which waits for the backlog to drain while in-flight jobs
//! complete naturally.
//!
//! The pool is generic over the job action, a cloneable `Fn() -> Future`,
//! exactly like the HTTP request closure the binary feeds it.
//!
//! [`flush`]: WorkerPool::flush

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};
use std::time::Duration;

use tokio::sync::Semaphore;

/// Nominal queue capacity per worker.
pub const QUEUE_FACTOR: usize = 8;

/// Outcome of a non-blocking submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Submission {
    Enqueued,
    Overflow,
}

pub struct WorkerPool<F, Fut>
where
    F: Fn() -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    jobs: Arc<Semaphore>,
    spawned: AtomicUsize,
    action: F,
    _job: PhantomData<fn() -> Fut>,
}

impl<F, Fut> WorkerPool<F, Fut>
where
    F: Fn() -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    pub fn new(action: F) -> Self {
        Self {
            jobs: Arc::new(Semaphore::new(0)),
            spawned: AtomicUsize::new(0),
            action,
            _job: PhantomData,
        }
    }

    /// Spawn `n` additional workers. Calling again grows the pool; there is
    /// no shrink.
    pub fn run_workers(&self, n: usize) {
        for _ in 0..n {
            let jobs = self.jobs.clone();
            let action = self.action.clone();
            tokio::spawn(async move {
                loop {
                    match jobs.clone().acquire_owned().await {
                        Ok(permit) => {
                            // Claimed jobs are consumed, not returned.
                            permit.forget();
                            action().await;
                        }
                        Err(_) => break,
                    }
                }
            });
        }
        self.spawned.fetch_add(n, Relaxed);
    }

    /// Current worker count.
    pub fn workers(&self) -> usize {
        self.spawned.load(Relaxed)
    }

    /// Pending jobs not yet claimed by a worker. A nonzero backlog means the
    /// producers are outrunning the workers.
    pub fn backlog(&self) -> usize {
        self.jobs.available_permits()
    }

    /// Nominal queue capacity; grows with the pool.
    pub fn capacity(&self) -> usize {
        self.workers() * QUEUE_FACTOR
    }

    /// Non-blocking enqueue.
    pub fn try_submit(&self) -> Submission {
        if self.backlog() >= self.capacity() {
            return Submission::Overflow;
        }
        self.jobs.add_permits(1);
        Submission::Enqueued
    }

    /// Enqueue, waiting for queue space if necessary. This is the
    /// backpressure path of the paced driver.
    pub async fn submit(&self) {
        loop {
            if self.try_submit() == Submission::Enqueued {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Wait until the queue is empty. Workers stay alive and in-flight jobs
    /// finish on their own; requires at least one worker to make progress
    /// when jobs are pending.
    pub async fn flush(&self) {
        while self.backlog() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use tokio::sync::Notify;

    macro_rules! counting_pool {
        ($counter:expr) => {{
            let counter = $counter.clone();
            WorkerPool::new(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Relaxed);
                }
            })
        }};
    }

    #[tokio::test]
    async fn pool_only_grows() {
        let pool = counting_pool!(Arc::new(AtomicU64::new(0)));
        assert_eq!(pool.workers(), 0);
        pool.run_workers(3);
        assert_eq!(pool.workers(), 3);
        pool.run_workers(2);
        assert_eq!(pool.workers(), 5);
        assert_eq!(pool.capacity(), 5 * QUEUE_FACTOR);
    }

    #[tokio::test]
    async fn submit_overflows_with_no_workers() {
        let pool = counting_pool!(Arc::new(AtomicU64::new(0)));
        assert_eq!(pool.try_submit(), Submission::Overflow);
    }

    #[tokio::test]
    async fn queue_overflows_at_nominal_capacity() {
        // A single worker that blocks forever, so queued jobs stay queued.
        let gate = Arc::new(Notify::new());
        let pool = WorkerPool::new({
            let gate = gate.clone();
            move || {
                let gate = gate.clone();
                async move {
                    gate.notified().await;
                }
            }
        });
        pool.run_workers(1);

        // Let the worker swallow one job so the queue itself is empty again.
        assert_eq!(pool.try_submit(), Submission::Enqueued);
        while pool.backlog() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        for _ in 0..pool.capacity() {
            assert_eq!(pool.try_submit(), Submission::Enqueued);
        }
        assert_eq!(pool.try_submit(), Submission::Overflow);
        assert_eq!(pool.backlog(), pool.capacity());
    }

    #[tokio::test]
    async fn flush_drains_the_backlog() {
        let counter = Arc::new(AtomicU64::new(0));
        let pool = counting_pool!(counter);
        pool.run_workers(2);
        for _ in 0..10 {
            pool.submit().await;
        }
        pool.flush().await;
        assert_eq!(pool.backlog(), 0);
    }

    #[tokio::test]
    async fn workers_execute_submitted_jobs() {
        let counter = Arc::new(AtomicU64::new(0));
        let pool = counting_pool!(counter);
        pool.run_workers(4);
        for _ in 0..20 {
            pool.submit().await;
        }
        pool.flush().await;
        // Every queued job is at least claimed; give in-flight ones a beat.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Relaxed), 20);
    }
}
