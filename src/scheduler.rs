//! Worker pool running one job per group.
//!
//! The pool admits at most `capacity` jobs at a time. Every running job holds a
//! [`PoolCapacity`] handle it can poll to size its own I/O concurrency: the
//! advertised share is `capacity / running_jobs`, so it grows as sibling jobs
//! finish.
//!
//! ```text
//! capacity 8, 4 jobs running  -> 2 workers each
//! capacity 8, 1 job running   -> 8 workers
//! ```
//!
//! A failing or panicking job never cancels its siblings; `join` collects every
//! outcome.

use crate::error::{Result, StackError};
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::Instrument;

/// Source of the live concurrency hint a running job sizes its I/O from
pub trait WorkerBudget: Send + Sync {
    /// Workers the caller may use right now; never zero
    fn available_workers(&self) -> usize;
}

#[derive(Debug)]
struct CapacityState {
    capacity: usize,
    running: AtomicUsize,
}

/// Live, read-only view of a pool's capacity
#[derive(Debug, Clone)]
pub struct PoolCapacity {
    state: Arc<CapacityState>,
}

impl PoolCapacity {
    /// A capacity not attached to any pool; always advertises `capacity` workers
    pub fn fixed(capacity: usize) -> Self {
        Self {
            state: Arc::new(CapacityState {
                capacity: capacity.max(1),
                running: AtomicUsize::new(0),
            }),
        }
    }

    /// Total worker budget of the pool
    pub fn capacity(&self) -> usize {
        self.state.capacity
    }

    /// Number of jobs currently running
    pub fn running_jobs(&self) -> usize {
        self.state.running.load(Ordering::Acquire)
    }

    /// Workers a running job may use right now; never zero
    pub fn available_workers(&self) -> usize {
        let running = self.running_jobs().max(1);
        (self.state.capacity / running).max(1)
    }

    pub(crate) fn enter(&self) -> RunningGuard {
        self.state.running.fetch_add(1, Ordering::AcqRel);
        RunningGuard {
            state: Arc::clone(&self.state),
        }
    }
}

/// Marks a job as running until dropped, including on unwind
pub(crate) struct RunningGuard {
    state: Arc<CapacityState>,
}

impl WorkerBudget for PoolCapacity {
    fn available_workers(&self) -> usize {
        PoolCapacity::available_workers(self)
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.state.running.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Failure of one job
#[derive(Debug)]
pub struct JobFailure {
    pub job: String,
    pub error: StackError,
}

/// Aggregate outcome of every submitted job
#[derive(Debug, Default)]
pub struct JoinReport {
    pub succeeded: Vec<String>,
    pub failures: Vec<JobFailure>,
}

impl JoinReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failures.len()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Default worker budget: the machine's available parallelism
pub fn default_capacity() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
}

/// Pool of workers bound to one run; `join` ends its lifetime
pub struct WorkerPool {
    category: String,
    capacity: PoolCapacity,
    slots: Arc<Semaphore>,
    tasks: JoinSet<(String, Result<()>)>,
}

impl WorkerPool {
    /// Create a pool with `capacity` workers, or one per available core.
    ///
    /// Must be called within a tokio runtime.
    pub fn init(capacity: Option<usize>, category: impl Into<String>) -> Self {
        let capacity = capacity.unwrap_or_else(default_capacity).max(1);
        let category = category.into();

        tracing::info!(capacity, category = %category, "Initialized worker pool");

        Self {
            category,
            capacity: PoolCapacity::fixed(capacity),
            slots: Arc::new(Semaphore::new(capacity)),
            tasks: JoinSet::new(),
        }
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    /// Handle to the pool's live capacity
    pub fn capacity(&self) -> PoolCapacity {
        self.capacity.clone()
    }

    pub fn available_workers(&self) -> usize {
        self.capacity.available_workers()
    }

    /// Number of submitted jobs that have not been joined yet
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// Queue a job. Returns immediately; the job starts once a worker is free.
    pub fn submit<F, Fut>(&mut self, name: impl Into<String>, job: F)
    where
        F: FnOnce(PoolCapacity) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        let slots = Arc::clone(&self.slots);
        let capacity = self.capacity.clone();
        let span = tracing::info_span!("job", category = %self.category, job = %name);

        tracing::debug!(job = %name, "Submitted job");

        self.tasks.spawn(
            async move {
                let _permit = match slots.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        let error = StackError::WorkerCrash {
                            job: name.clone(),
                            message: "worker pool closed".to_string(),
                        };
                        return (name, Err(error));
                    }
                };
                let _running = capacity.enter();
                tracing::debug!(
                    available_workers = capacity.available_workers(),
                    "Job started"
                );

                let run = AssertUnwindSafe(async move { job(capacity).await });
                let result = match run.catch_unwind().await {
                    Ok(result) => result,
                    Err(payload) => Err(StackError::WorkerCrash {
                        job: name.clone(),
                        message: panic_message(&*payload),
                    }),
                };
                (name, result)
            }
            .instrument(span),
        );
    }

    /// Wait for every submitted job and collect the outcomes
    pub async fn join(mut self) -> JoinReport {
        let mut report = JoinReport::default();

        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok((name, Ok(()))) => {
                    tracing::info!(job = %name, "Job finished");
                    report.succeeded.push(name);
                }
                Ok((name, Err(error))) => {
                    tracing::error!(job = %name, error = %error, "Job failed");
                    report.failures.push(JobFailure { job: name, error });
                }
                Err(join_error) => {
                    tracing::error!(error = %join_error, "Worker task aborted");
                    report.failures.push(JobFailure {
                        job: "<unknown>".to_string(),
                        error: StackError::WorkerCrash {
                            job: "<unknown>".to_string(),
                            message: join_error.to_string(),
                        },
                    });
                }
            }
        }

        report.succeeded.sort();
        report.failures.sort_by(|a, b| a.job.cmp(&b.job));
        tracing::info!(
            category = %self.category,
            succeeded = report.succeeded.len(),
            failed = report.failures.len(),
            "Worker pool drained"
        );
        report
    }
}
