//! Per-path worker pools and their registry.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use moka::notification::RemovalCause;
use moka::ops::compute::Op;
use moka::sync::Cache;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::types::ExecutionPath;
use crate::{Result, ScriptError};

/// Unit of work submitted to a pool.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Creates the pool for a path the registry has not seen yet.
pub type PoolFactory = Arc<dyn Fn(&ExecutionPath) -> Result<Arc<dyn WorkerPool>> + Send + Sync>;

/// Task execution resource owned by one registry entry.
pub trait WorkerPool: Send + Sync {
    /// Queue `job`. A pool that has been shut down hands the job back.
    fn execute(&self, job: Job) -> std::result::Result<(), Job>;

    /// Stop accepting work. Idempotent and non-blocking.
    fn shutdown(&self);

    fn is_shutdown(&self) -> bool;
}

struct PoolState {
    runtime: Option<Runtime>,
    accepting: bool,
    in_flight: usize,
}

/// [`WorkerPool`] running jobs on the blocking threads of a dedicated tokio
/// runtime.
///
/// Shutdown rejects new jobs right away; the runtime and its threads are
/// released once the jobs already accepted have finished.
pub struct TokioWorkerPool {
    name: String,
    state: Arc<Mutex<PoolState>>,
    shut_down: AtomicBool,
}

impl TokioWorkerPool {
    pub fn new(name: impl Into<String>, threads: usize) -> Result<Self> {
        let name = name.into();
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(threads.max(1))
            .thread_name(name.clone())
            .build()?;

        debug!(pool = %name, threads, "Worker pool created");

        Ok(Self {
            name,
            state: Arc::new(Mutex::new(PoolState {
                runtime: Some(runtime),
                accepting: true,
                in_flight: 0,
            })),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Factory building one pool per path according to `config`.
    pub fn factory(config: &PoolConfig) -> PoolFactory {
        let prefix = config.thread_name_prefix.clone();
        let threads = config.worker_threads;
        Arc::new(move |path: &ExecutionPath| {
            let pool = TokioWorkerPool::new(format!("{}-{}", prefix, path), threads)?;
            Ok(Arc::new(pool) as Arc<dyn WorkerPool>)
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of accepted jobs that have not finished yet.
    pub fn in_flight(&self) -> usize {
        lock(&self.state).in_flight
    }
}

fn lock(state: &Mutex<PoolState>) -> MutexGuard<'_, PoolState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Stop accepting jobs; hand out the runtime if nothing is left to drain.
fn close(state: &Mutex<PoolState>) -> Option<Runtime> {
    let mut state = lock(state);
    state.accepting = false;
    if state.in_flight == 0 {
        state.runtime.take()
    } else {
        None
    }
}

fn release(runtime: Option<Runtime>) {
    if let Some(runtime) = runtime {
        runtime.shutdown_background();
    }
}

/// Marks a job finished even if it panics.
struct InFlight(Arc<Mutex<PoolState>>);

impl Drop for InFlight {
    fn drop(&mut self) {
        let runtime = {
            let mut state = lock(&self.0);
            state.in_flight -= 1;
            if !state.accepting && state.in_flight == 0 {
                state.runtime.take()
            } else {
                None
            }
        };
        release(runtime);
    }
}

impl WorkerPool for TokioWorkerPool {
    fn execute(&self, job: Job) -> std::result::Result<(), Job> {
        let mut state = lock(&self.state);
        if !state.accepting {
            return Err(job);
        }
        let Some(runtime) = state.runtime.as_ref() else {
            return Err(job);
        };

        let guard = InFlight(Arc::clone(&self.state));
        runtime.spawn_blocking(move || {
            let _guard = guard;
            job();
        });
        state.in_flight += 1;
        Ok(())
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!(pool = %self.name, "Worker pool shut down");
        release(close(&self.state));
    }

    fn is_shutdown(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

impl Drop for TokioWorkerPool {
    fn drop(&mut self) {
        release(close(&self.state));
    }
}

/// One worker pool per [`ExecutionPath`], created on first use.
///
/// Pools that have not been looked up for the idle period are evicted and
/// shut down by the cache's eviction listener.
pub struct PoolRegistry {
    pools: Cache<ExecutionPath, Arc<dyn WorkerPool>>,
    factory: PoolFactory,
    created: AtomicUsize,
}

impl PoolRegistry {
    pub fn new(factory: PoolFactory, idle_ttl: Duration, max_entries: Option<u64>) -> Self {
        let mut builder = Cache::builder()
            .time_to_idle(idle_ttl)
            .eviction_listener(
                |path: Arc<ExecutionPath>, pool: Arc<dyn WorkerPool>, cause: RemovalCause| {
                    info!(path = %path, ?cause, "Evicting worker pool");
                    pool.shutdown();
                },
            );
        if let Some(max) = max_entries {
            builder = builder.max_capacity(max);
        }

        Self {
            pools: builder.build(),
            factory,
            created: AtomicUsize::new(0),
        }
    }

    pub fn from_config(factory: PoolFactory, config: &PoolConfig) -> Self {
        Self::new(
            factory,
            Duration::from_secs(config.idle_ttl_secs),
            config.max_entries,
        )
    }

    /// Return the live pool for `path`, creating it if needed.
    pub fn pool_for(&self, path: &ExecutionPath) -> Result<Arc<dyn WorkerPool>> {
        for _ in 0..2 {
            let pool = self
                .pools
                .try_get_with_by_ref(path, || {
                    let pool = (self.factory)(path)?;
                    self.created.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ScriptError>(pool)
                })
                .map_err(|e| ScriptError::Configuration(format!(
                    "no worker pool for '{}': {}",
                    path, e
                )))?;

            if !pool.is_shutdown() {
                return Ok(pool);
            }

            // Shut down behind the registry's back; replace it.
            warn!(path = %path, "Dropping shut down worker pool");
            self.discard(path, &pool);
        }
        Err(ScriptError::PoolShutdown(path.to_string()))
    }

    /// Remove `stale` from the registry unless another pool already took its place.
    fn discard(&self, path: &ExecutionPath, stale: &Arc<dyn WorkerPool>) {
        self.pools
            .entry_by_ref(path)
            .and_compute_with(|current| match current {
                Some(entry) if Arc::ptr_eq(entry.value(), stale) => Op::Remove,
                _ => Op::Nop,
            });
    }

    /// Evict the pool for `path`, shutting it down.
    pub fn evict(&self, path: &ExecutionPath) {
        self.pools.invalidate(path);
        self.pools.run_pending_tasks();
    }

    /// Evict and shut down every pool.
    pub fn shutdown_all(&self) {
        self.pools.invalidate_all();
        self.pools.run_pending_tasks();
    }

    /// Number of pools currently tracked.
    pub fn len(&self) -> u64 {
        self.pools.run_pending_tasks();
        self.pools.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of pools created since the registry was built.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Run expiration (and the resulting shutdowns) now.
    pub fn run_pending_tasks(&self) {
        self.pools.run_pending_tasks();
    }
}
