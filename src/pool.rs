use std::sync::Arc;

use rayon::ThreadPoolBuilder;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("could not configure build parallelism ({0})")]
pub struct PoolBuildError(#[from] rayon::ThreadPoolBuildError);

/// Handle to the worker pool that executes step bodies and fan-out batches.
///
/// The driver is the scheduler; the pool is the engine. Cloning the handle is
/// cheap and shares the same workers.
#[derive(Clone)]
pub struct ThreadPool {
    inner: Arc<rayon::ThreadPool>,
    threads: usize,
}

impl ThreadPool {
    /// Build a pool with the requested number of worker threads.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying thread pool cannot be constructed.
    pub fn new(threads: usize) -> Result<Self, PoolBuildError> {
        let threads = threads.max(1);
        let inner = ThreadPoolBuilder::new().num_threads(threads).build()?;
        Ok(Self {
            inner: Arc::new(inner),
            threads,
        })
    }

    #[must_use]
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Submit an opaque task; it runs on some worker at some later point.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        self.inner.spawn(job);
    }

    /// Fan a set of jobs out across the workers and wait for all of them.
    ///
    /// The calling thread work-steals while it waits, so a step body running
    /// on a worker can fan out into the same pool without starving it.
    pub fn fan_out<'scope, F>(&self, schedule: F)
    where
        F: FnOnce(&rayon::Scope<'scope>),
    {
        self.inner.in_place_scope(schedule);
    }
}

#[cfg(test)]
mod tests {
    use super::ThreadPool;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn fan_out_joins_every_job() {
        let pool = ThreadPool::new(4).unwrap();
        let hits = AtomicUsize::new(0);
        pool.fan_out(|scope| {
            for _ in 0..32 {
                scope.spawn(|_| {
                    hits.fetch_add(1, Ordering::Relaxed);
                });
            }
        });
        assert_eq!(hits.load(Ordering::Relaxed), 32);
    }

    #[test]
    fn nested_fan_out_from_a_worker_completes() {
        let pool = ThreadPool::new(1).unwrap();
        let hits = AtomicUsize::new(0);
        let inner = pool.clone();
        pool.fan_out(|scope| {
            scope.spawn(|_| {
                inner.fan_out(|nested| {
                    for _ in 0..4 {
                        nested.spawn(|_| {
                            hits.fetch_add(1, Ordering::Relaxed);
                        });
                    }
                });
            });
        });
        assert_eq!(hits.load(Ordering::Relaxed), 4);
    }
}
