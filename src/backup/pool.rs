//! Bounded worker pool with cooperative pacing.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::error;

use super::stats::TaskOutcome;

pub struct WorkerPool {
    permits: Arc<Semaphore>,
    pacing: Duration,
}

impl WorkerPool {
    pub fn new(max_workers: usize, pacing: Duration) -> Self {
        WorkerPool {
            permits: Arc::new(Semaphore::new(max_workers.max(1))),
            pacing,
        }
    }

    /// Runs one task per item on at most `max_workers` workers and waits for
    /// all of them. A worker sleeps for the pacing delay after each task while
    /// still holding its slot. Panicking tasks come back as failures.
    pub async fn run_batch<T, F, Fut>(&self, items: Vec<T>, task: F) -> Vec<TaskOutcome>
    where
        T: Send + 'static,
        F: Fn(T) -> Fut,
        Fut: Future<Output = TaskOutcome> + Send + 'static,
    {
        let mut set = JoinSet::new();
        let expected = items.len();
        for item in items {
            let permits = Arc::clone(&self.permits);
            let pacing = self.pacing;
            let work = task(item);
            set.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return TaskOutcome::Failed("pool-closed");
                };
                let outcome = work.await;
                if !pacing.is_zero() {
                    tokio::time::sleep(pacing).await;
                }
                outcome
            });
        }

        let mut outcomes = Vec::with_capacity(expected);
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    error!(error = %e, "Worker task aborted");
                    outcomes.push(TaskOutcome::Failed("panic"));
                }
            }
        }
        outcomes
    }
}
