//! Bounded worker pool for per-job tasks.

use std::{future::Future, sync::Arc};

use tokio::{sync::Semaphore, task::JoinSet};

/// A bounded pool of concurrently running job tasks.
///
/// `spawn` suspends once `max_parallel` tasks are in flight, so a daemon
/// tick can dispatch an arbitrary batch of jobs without overcommitting the
/// host. Tasks are detached from any particular result type: a stage worker
/// reports its outcome through the job database, not through the pool.
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    tasks: JoinSet<()>,
}

impl WorkerPool {
    pub fn new(max_parallel: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_parallel.max(1))),
            tasks: JoinSet::new(),
        }
    }

    /// Spawn a job task, waiting for a free slot first.
    pub async fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // The semaphore is never closed, but a spawn on a broken pool should
        // drop work rather than panic a daemon.
        let Ok(permit) = Arc::clone(&self.semaphore).acquire_owned().await else {
            tracing::error!("worker pool semaphore closed; dropping task");
            return;
        };
        self.tasks.spawn(async move {
            let _permit = permit;
            task.await;
        });
    }

    /// Wait for every in-flight task to finish.
    ///
    /// Called at the end of a one-shot tick and on daemon shutdown. A
    /// panicked task is logged and does not poison the pool.
    pub async fn join_all(&mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(err) = result {
                if err.is_panic() {
                    tracing::error!(error = %err, "worker task panicked");
                }
            }
        }
    }

    /// Abort all in-flight tasks and await their termination.
    pub async fn abort_all(&mut self) {
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;

    #[tokio::test]
    async fn pool_bounds_concurrency() {
        //* Given
        static ACTIVE: AtomicUsize = AtomicUsize::new(0);
        static PEAK: AtomicUsize = AtomicUsize::new(0);
        let mut pool = WorkerPool::new(2);

        //* When
        for _ in 0..6 {
            pool.spawn(async {
                let now = ACTIVE.fetch_add(1, Ordering::SeqCst) + 1;
                PEAK.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                ACTIVE.fetch_sub(1, Ordering::SeqCst);
            })
            .await;
        }
        pool.join_all().await;

        //* Then
        assert_eq!(ACTIVE.load(Ordering::SeqCst), 0);
        assert!(
            PEAK.load(Ordering::SeqCst) <= 2,
            "no more than max_parallel tasks may run at once"
        );
    }

    #[tokio::test]
    async fn join_all_survives_a_panicking_task() {
        //* Given
        let mut pool = WorkerPool::new(2);
        pool.spawn(async { panic!("worker blew up") }).await;
        pool.spawn(async {}).await;

        //* When / Then: must not propagate the panic
        pool.join_all().await;
    }
}
