//! Bounded worker pool for blocking and CPU-bound jobs.
//!
//! Jobs run on tokio's blocking threads; a semaphore caps how many run at
//! once. The permit travels into the job, so the cap holds even when the
//! awaiting future is dropped (a cancelled stream) while the job finishes.
//! The job's result is then discarded.

use std::sync::Arc;

use tokio::sync::Semaphore;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerError {
    /// The pool was closed.
    Closed,
    /// The job panicked.
    Panicked(String),
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerError::Closed => write!(f, "worker pool closed"),
            WorkerError::Panicked(reason) => write!(f, "worker job panicked: {}", reason),
        }
    }
}

impl std::error::Error for WorkerError {}

#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `job` on a blocking thread once a worker slot is free.
    pub async fn run<F, T>(&self, job: F) -> Result<T, WorkerError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| WorkerError::Closed)?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await
        .map_err(|err| WorkerError::Panicked(err.to_string()))
    }

    /// Refuse new jobs. Running jobs complete.
    pub fn close(&self) {
        self.permits.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pool_bounds_concurrency() -> Result<(), WorkerError> {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let jobs = (0..6).map(|_| {
            let pool = pool.clone();
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            async move {
                pool.run(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .await
            }
        });
        for result in futures::future::join_all(jobs).await {
            result?;
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        Ok(())
    }

    #[tokio::test]
    async fn closed_pool_rejects_jobs() {
        let pool = WorkerPool::new(1);
        pool.close();
        assert_eq!(pool.run(|| 1).await, Err(WorkerError::Closed));
    }

    #[tokio::test]
    async fn panics_are_reported() {
        let pool = WorkerPool::new(1);
        let result: Result<(), WorkerError> = pool.run(|| panic!("boom")).await;
        assert!(matches!(result, Err(WorkerError::Panicked(_))));
    }
}
