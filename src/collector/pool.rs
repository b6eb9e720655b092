//! Worker pool bounding concurrently executing fetch tasks, drained at a join barrier.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};

use crate::error::{Error, Result};

/// Fixed-capacity pool of execution slots
///
/// [`spawn`](Self::spawn) waits for a free slot, then runs the task on the
/// tokio runtime holding the slot until the task returns. Tasks are
/// independent: a failing or panicking task releases its slot and never
/// affects its siblings. [`join`](Self::join) is the barrier that resolves
/// once every spawned task has finished.
pub struct WorkerPool<T> {
    slots: Arc<Semaphore>,
    capacity: usize,
    tasks: JoinSet<T>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Create a pool with `capacity` slots
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `capacity` is zero.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::config(
                "max_parallel_requests",
                "worker pool needs at least one slot",
            ));
        }
        Ok(Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            tasks: JoinSet::new(),
        })
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently occupied
    pub fn busy(&self) -> usize {
        self.capacity - self.slots.available_permits()
    }

    /// Wait for a free slot, then spawn `task` in it
    pub async fn spawn<F>(&mut self, task: F) -> Result<()>
    where
        F: Future<Output = T> + Send + 'static,
    {
        // Blocks while all slots are taken
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Other("worker pool closed".into()))?;

        self.tasks.spawn(async move {
            let _permit = permit;
            task.await
        });
        Ok(())
    }

    /// Join barrier: wait for every spawned task and collect their results
    ///
    /// Panicked tasks come back as `Err(JoinError)`; the caller decides how
    /// to record them.
    pub async fn join(mut self) -> Vec<std::result::Result<T, JoinError>> {
        let mut results = Vec::with_capacity(self.tasks.len());
        while let Some(result) = self.tasks.join_next().await {
            results.push(result);
        }
        results
    }
}

impl<T> std::fmt::Debug for WorkerPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("capacity", &self.capacity)
            .field("available", &self.slots.available_permits())
            .field("spawned", &self.tasks.len())
            .finish()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(
            WorkerPool::<()>::new(0),
            Err(Error::Config { .. })
        ));
    }

    #[tokio::test]
    async fn test_never_exceeds_capacity() {
        let mut pool = WorkerPool::new(3).unwrap();
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for i in 0..20u64 {
            let current = current.clone();
            let peak = peak.clone();
            pool.spawn(async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5 + i % 4 * 5)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        }

        let results = pool.join().await;
        assert_eq!(results.len(), 20);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(current.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_panicking_task_does_not_affect_siblings() {
        let mut pool = WorkerPool::new(2).unwrap();
        pool.spawn(async {
            if true {
                panic!("boom");
            }
            -1
        })
        .await
        .unwrap();
        for i in 0..4 {
            pool.spawn(async move { i }).await.unwrap();
        }

        let results = pool.join().await;
        let ok: Vec<i32> = results.iter().filter_map(|r| r.as_ref().ok().copied()).collect();
        assert_eq!(ok.len(), 4);
        assert_eq!(results.iter().filter(|r| r.is_err()).count(), 1);
    }

    #[tokio::test]
    async fn test_join_waits_for_all() {
        let mut pool = WorkerPool::new(4).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let done = done.clone();
            pool.spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                done.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        }
        assert_eq!(pool.busy(), 4);
        pool.join().await;
        assert_eq!(done.load(Ordering::SeqCst), 4);
    }
}
