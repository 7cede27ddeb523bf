//! Named worker pools for parallel multicast, async throttling and delayed
//! redelivery.
//!
//! A pool is a Tokio runtime handle plus a semaphore bounding how many of its
//! tasks run at once. What happens when the semaphore is exhausted depends on
//! the pool's [`RejectionPolicy`].

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::config::{EngineConfig, PoolConfig, RejectionPolicy};
use crate::error::{RejectedExecutionError, TaskAbortedError};

/// Name of the pool used when a definition does not reference one.
pub const DEFAULT_POOL: &str = "default";

// ---------------------------------------------------------------------------
// WorkerPool
// ---------------------------------------------------------------------------

/// A bounded set of workers on a Tokio runtime.
#[derive(Debug)]
pub struct WorkerPool {
    name: String,
    handle: Handle,
    permits: Arc<Semaphore>,
    size: usize,
    rejection: RejectionPolicy,
}

/// Outcome of [`WorkerPool::submit`].
pub enum Submission<F: Future> {
    /// The task was spawned (or queued) on the pool.
    Accepted(PoolTask<F::Output>),
    /// Every worker was busy. The task is handed back untouched; the pool's
    /// [`RejectionPolicy`] says whether to run it on the caller or fail.
    Rejected(F),
}

impl WorkerPool {
    #[must_use]
    pub fn new(name: impl Into<String>, handle: Handle, config: PoolConfig) -> Self {
        let size = config.pool_size.max(1);
        Self {
            name: name.into(),
            handle,
            permits: Arc::new(Semaphore::new(size)),
            size,
            rejection: config.rejection,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn rejection(&self) -> RejectionPolicy {
        self.rejection
    }

    #[must_use]
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Number of tasks currently holding a worker.
    #[must_use]
    pub fn active(&self) -> usize {
        self.size.saturating_sub(self.permits.available_permits())
    }

    /// Submits a task.
    ///
    /// Under [`RejectionPolicy::Queue`] the task is always accepted and waits
    /// for a free worker. Under the other policies a task arriving while
    /// every worker is busy comes back as [`Submission::Rejected`].
    pub fn submit<F>(&self, task: F) -> Submission<F>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let inner = match self.rejection {
            RejectionPolicy::Queue => {
                let permits = Arc::clone(&self.permits);
                self.handle.spawn(async move {
                    let permit = permits.acquire_owned().await;
                    let output = task.await;
                    drop(permit);
                    output
                })
            }
            RejectionPolicy::Abort | RejectionPolicy::CallerRuns => {
                let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                    return Submission::Rejected(task);
                };
                self.handle.spawn(async move {
                    // Held for the duration of the task.
                    let output = task.await;
                    drop(permit);
                    output
                })
            }
        };
        Submission::Accepted(PoolTask {
            pool: self.name.clone(),
            inner,
        })
    }

    /// Spawns `task` and returns a future for its result, applying the
    /// rejection policy: caller-runs awaits the task inline, abort fails with
    /// [`RejectedExecutionError`].
    ///
    /// # Errors
    ///
    /// Returns an error if the pool rejected the task under
    /// [`RejectionPolicy::Abort`], or the spawned task did not complete.
    pub async fn run<F>(&self, task: F) -> anyhow::Result<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        match self.submit(task) {
            Submission::Accepted(spawned) => Ok(spawned.await?),
            Submission::Rejected(task) => match self.rejection {
                RejectionPolicy::Abort => Err(self.rejected().into()),
                RejectionPolicy::CallerRuns | RejectionPolicy::Queue => Ok(task.await),
            },
        }
    }

    /// Completes after `duration`. The timer runs on the pool's runtime, so
    /// the returned future may be awaited from any executor.
    pub fn delay(&self, duration: Duration) -> impl Future<Output = ()> + Send + 'static {
        let timer = (!duration.is_zero())
            .then(|| self.handle.spawn(tokio::time::sleep(duration)));
        let pool = self.name.clone();
        async move {
            if let Some(timer) = timer {
                if let Err(err) = timer.await {
                    tracing::warn!(pool = %pool, error = %err, "delay timer did not complete");
                }
            }
        }
    }

    /// Error recorded on an exchange when this pool refuses a task.
    #[must_use]
    pub fn rejected(&self) -> RejectedExecutionError {
        RejectedExecutionError {
            pool: self.name.clone(),
            capacity: self.size,
        }
    }
}

/// Waits out `duration`. Under a Tokio runtime the task yields its worker
/// while waiting; callers without one sleep their own thread.
pub async fn pause(duration: Duration) {
    if duration.is_zero() {
        return;
    }
    if Handle::try_current().is_ok() {
        tokio::time::sleep(duration).await;
    } else {
        std::thread::sleep(duration);
    }
}

// ---------------------------------------------------------------------------
// PoolTask
// ---------------------------------------------------------------------------

/// A task spawned on a [`WorkerPool`].
#[derive(Debug)]
pub struct PoolTask<T> {
    pool: String,
    inner: JoinHandle<T>,
}

impl<T> Future for PoolTask<T> {
    type Output = Result<T, TaskAbortedError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let pool = &this.pool;
        Pin::new(&mut this.inner).poll(cx).map(|result| {
            result.map_err(|err| TaskAbortedError {
                pool: pool.clone(),
                reason: err.to_string(),
            })
        })
    }
}

// ---------------------------------------------------------------------------
// ExecutorRegistry
// ---------------------------------------------------------------------------

/// Looks up worker pools by name.
#[derive(Debug)]
pub struct ExecutorRegistry {
    handle: Handle,
    default_pool: Arc<WorkerPool>,
    pools: DashMap<String, Arc<WorkerPool>>,
}

impl ExecutorRegistry {
    /// Creates a registry with only the default pool.
    #[must_use]
    pub fn new(handle: Handle, default_config: PoolConfig) -> Self {
        let default_pool = Arc::new(WorkerPool::new(DEFAULT_POOL, handle.clone(), default_config));
        Self {
            handle,
            default_pool,
            pools: DashMap::new(),
        }
    }

    /// Creates the default pool and every named pool in `config`.
    #[must_use]
    pub fn from_config(handle: Handle, config: &EngineConfig) -> Self {
        let registry = Self::new(handle, config.default_pool);
        for (name, pool) in &config.pools {
            registry.register(name.clone(), *pool);
        }
        registry
    }

    /// Creates (or replaces) the named pool.
    pub fn register(&self, name: impl Into<String>, config: PoolConfig) -> Arc<WorkerPool> {
        let name = name.into();
        let pool = Arc::new(WorkerPool::new(name.clone(), self.handle.clone(), config));
        self.pools.insert(name, Arc::clone(&pool));
        pool
    }

    #[must_use]
    pub fn default_pool(&self) -> Arc<WorkerPool> {
        Arc::clone(&self.default_pool)
    }

    /// The named pool, or the default pool when `name` is `None`.
    #[must_use]
    pub fn get(&self, name: Option<&str>) -> Option<Arc<WorkerPool>> {
        match name {
            None | Some(DEFAULT_POOL) => Some(self.default_pool()),
            Some(name) => self.pools.get(name).map(|entry| Arc::clone(entry.value())),
        }
    }

    /// Snapshot of `name -> active task count` for every pool.
    #[must_use]
    pub fn activity(&self) -> HashMap<String, usize> {
        let mut out: HashMap<String, usize> = self
            .pools
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().active()))
            .collect();
        out.insert(DEFAULT_POOL.to_string(), self.default_pool.active());
        out
    }
}
