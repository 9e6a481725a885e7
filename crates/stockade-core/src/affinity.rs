//! Thread-affinity executor.
//!
//! Namespace membership, fs-uid/fs-gid and the working directory seen by
//! the kernel belong to the calling thread, not to the process. Work that
//! reads or changes that state is submitted here and always runs on the
//! same dedicated worker, one closure at a time.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc::{self, Sender};
use std::thread::{self, ThreadId};

use stockade_common::error::{Result, StockadeError};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Handle to the pinned worker thread.
///
/// Cloning the handle is cheap; every clone feeds the same worker. The
/// worker exits once the last handle is dropped.
#[derive(Debug, Clone)]
pub struct AffinityExecutor {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    jobs: Sender<Job>,
    worker: ThreadId,
}

impl AffinityExecutor {
    /// Spawns the worker thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS refuses to create the thread.
    pub fn spawn() -> Result<Self> {
        let (jobs, queue) = mpsc::channel::<Job>();
        let handle = thread::Builder::new()
            .name("stockade-affinity".into())
            .spawn(move || {
                for job in queue {
                    job();
                }
                tracing::debug!("affinity worker stopped");
            })
            .map_err(|e| StockadeError::Internal {
                message: format!("failed to spawn affinity worker: {e}"),
            })?;
        let worker = handle.thread().id();
        tracing::debug!(?worker, "affinity worker started");
        Ok(Self {
            inner: Arc::new(Inner { jobs, worker }),
        })
    }

    /// Runs `work` on the worker thread and waits for its result.
    ///
    /// Submitting from the worker itself runs `work` inline.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker is gone or `work` panicked.
    pub fn submit<F, R>(&self, work: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_worker() {
            return Ok(work());
        }

        let (reply, outcome) = mpsc::sync_channel(1);
        let job: Job = Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(work));
            let _ = reply.send(result);
        });
        self.inner
            .jobs
            .send(job)
            .map_err(|_| StockadeError::Internal {
                message: "affinity worker is no longer running".into(),
            })?;

        match outcome.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(StockadeError::Internal {
                message: "work submitted to the affinity worker panicked".into(),
            }),
            Err(_) => Err(StockadeError::Internal {
                message: "affinity worker dropped the job without replying".into(),
            }),
        }
    }

    /// Runs fallible `work` on the worker and flattens the result.
    ///
    /// # Errors
    ///
    /// Returns the error produced by `work`, or a submission error.
    pub fn run<F, R>(&self, work: F) -> Result<R>
    where
        F: FnOnce() -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.submit(work)?
    }

    /// Returns whether the calling thread is the worker.
    #[must_use]
    pub fn is_worker(&self) -> bool {
        thread::current().id() == self.inner.worker
    }

    /// Returns the worker's thread id.
    #[must_use]
    pub fn worker_id(&self) -> ThreadId {
        self.inner.worker
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_runs_on_one_consistent_thread() {
        let executor = AffinityExecutor::spawn().unwrap();
        let first = executor.submit(|| thread::current().id()).unwrap();
        let second = executor.submit(|| thread::current().id()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, executor.worker_id());
        assert_ne!(first, thread::current().id());
    }

    #[test]
    fn clones_share_the_worker() {
        let executor = AffinityExecutor::spawn().unwrap();
        let clone = executor.clone();
        let from_clone = thread::spawn(move || clone.submit(|| thread::current().id()).unwrap())
            .join()
            .unwrap();
        assert_eq!(from_clone, executor.worker_id());
    }

    #[test]
    fn nested_submission_runs_inline() {
        let executor = AffinityExecutor::spawn().unwrap();
        let inner = executor.clone();
        let value = executor
            .submit(move || inner.submit(|| 7).unwrap() * 6)
            .unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    #[allow(clippy::panic)]
    fn panicking_work_is_reported_and_worker_survives() {
        let executor = AffinityExecutor::spawn().unwrap();
        let err = executor.submit(|| -> u32 { panic!("boom") }).unwrap_err();
        assert!(matches!(err, StockadeError::Internal { .. }));
        assert_eq!(executor.submit(|| 1 + 1).unwrap(), 2);
    }

    #[test]
    fn run_flattens_inner_errors() {
        let executor = AffinityExecutor::spawn().unwrap();
        let err = executor
            .run(|| -> Result<()> {
                Err(StockadeError::Config {
                    message: "bad".into(),
                })
            })
            .unwrap_err();
        assert!(matches!(err, StockadeError::Config { .. }));
    }

    #[test]
    fn work_is_serialized() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let executor = AffinityExecutor::spawn().unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let executor = executor.clone();
                let active = Arc::clone(&active);
                thread::spawn(move || {
                    executor
                        .submit(move || {
                            let concurrent = active.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(std::time::Duration::from_millis(2));
                            let _ = active.fetch_sub(1, Ordering::SeqCst);
                            concurrent
                        })
                        .unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 0);
        }
    }
}
