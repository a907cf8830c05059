//! # Thread Pool
//!
//! A dynamically sized set of workers sharing one spawn script. Work is
//! routed through a pluggable [`SchedulerStrategy`]; the pool grows up to
//! its capacity when every worker is busy, shrinks when idle workers close
//! themselves, and respawns workers to keep the configured minimum alive.
//!
//! ## Slot discipline
//!
//! Live threads form a dense array. A worker exit swap-removes its slot
//! (the last slot fills the hole), so `size()` is always the array length
//! and strategies never observe dead entries.
//!
//! ## Failure tolerance
//!
//! `send_work` retries on workers that stopped between selection and
//! dispatch; every other error propagates to the caller unchanged.

mod strategy;

pub use strategy::{LeastPending, SchedulerStrategy, Selection};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use weft_api::errors::{PoolError, SpawnError, ThreadError};
use weft_api::value::Value;

use crate::thread::{SpawnOptions, Thread};

/// Builds the handler set for each fresh pool worker.
pub type ScriptFactory = Arc<dyn Fn() + Send + Sync>;

/// Configuration for [`ThreadPool::spawn`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Init payload handed to every worker.
    pub init_data: Value,
    /// Hard capacity.
    pub max_threads: usize,
    /// Floor kept alive by respawning; clamped to `max_threads`.
    pub min_threads: usize,
    /// Idle window after which excess workers close themselves.
    pub close_when_idle: Option<Duration>,
    /// Dispatch attempts before `send_work` gives up.
    pub queue_retries: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let max_threads = num_cpus::get().max(2);
        Self {
            init_data: Value::Null,
            max_threads,
            min_threads: max_threads,
            close_when_idle: None,
            queue_retries: 5,
        }
    }
}

/// Point-in-time statistics about a pool.
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    /// Live workers.
    pub size: usize,
    /// Hard capacity.
    pub capacity: usize,
    /// Outstanding requests plus claims across all live workers.
    pub pending_requests: usize,
    /// Whether the pool has been closed or killed.
    pub is_closed: bool,
}

struct PoolInner {
    factory: ScriptFactory,
    config: PoolConfig,
    strategy: Box<dyn SchedulerStrategy>,
    /// Dense array of live threads; eviction swap-removes.
    slots: AsyncMutex<Vec<Thread>>,
    closed: AtomicBool,
}

impl PoolInner {
    fn floor(&self) -> usize {
        self.config.min_threads.min(self.config.max_threads)
    }
}

/// Handle to a pool of workers. Clones share the pool.
#[derive(Clone)]
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("capacity", &self.inner.config.max_threads)
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl ThreadPool {
    /// Spawn a pool with the default [`LeastPending`] strategy.
    pub async fn spawn(
        script: impl Fn() + Send + Sync + 'static,
        config: PoolConfig,
    ) -> Result<ThreadPool, PoolError> {
        Self::spawn_with_strategy(script, config, Box::new(LeastPending)).await
    }

    /// Spawn a pool, eagerly bringing up `min_threads` workers. If any of
    /// them fails to initialize, the ones already up are killed and the
    /// spawn fails.
    pub async fn spawn_with_strategy(
        script: impl Fn() + Send + Sync + 'static,
        config: PoolConfig,
        strategy: Box<dyn SchedulerStrategy>,
    ) -> Result<ThreadPool, PoolError> {
        let inner = Arc::new(PoolInner {
            factory: Arc::new(script),
            config,
            strategy,
            slots: AsyncMutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        let pool = ThreadPool { inner };
        for _ in 0..pool.inner.floor() {
            match spawn_worker(&pool.inner).await {
                Ok(thread) => pool.inner.slots.lock().await.push(thread),
                Err(error) => {
                    pool.kill().await;
                    return Err(PoolError::Spawn(error));
                }
            }
        }
        Ok(pool)
    }

    /// Dispatch one unit of work through the strategy.
    pub async fn send_work(&self, work: Value) -> Result<Value, PoolError> {
        let attempts = self.inner.config.queue_retries.max(1);
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(2 * attempt as u64)).await;
            }
            if self.inner.closed.load(Ordering::SeqCst) {
                return Err(PoolError::Closed);
            }
            let thread = match self.select_thread().await? {
                Some(thread) => thread,
                None => continue,
            };
            // The claim from selection holds this worker's load signal up
            // until the real send settles
            let result = thread.send_work(work.clone()).await;
            thread.pool_release();
            match result {
                Ok(value) => return Ok(value),
                // The worker died between selection and dispatch; another
                // attempt picks a different one
                Err(ThreadError::Stopped | ThreadError::ShuttingDown) => continue,
                Err(error) => return Err(PoolError::Thread(error)),
            }
        }
        Err(PoolError::SchedulerExhausted { attempts })
    }

    async fn select_thread(&self) -> Result<Option<Thread>, PoolError> {
        let mut slots = self.inner.slots.lock().await;
        let can_grow = slots.len() < self.inner.config.max_threads;
        match self.inner.strategy.select(&slots, can_grow) {
            Selection::Pick(index) => Ok(slots.get(index).map(|thread| {
                thread.pool_claim();
                thread.clone()
            })),
            Selection::Grow if can_grow => {
                let thread = spawn_worker(&self.inner).await.map_err(PoolError::Spawn)?;
                thread.pool_claim();
                slots.push(thread.clone());
                debug!(thread = %thread.id(), size = slots.len(), "pool grew");
                Ok(Some(thread))
            }
            Selection::Grow | Selection::Skip => Ok(None),
        }
    }

    /// Gracefully close every live worker and refuse further work.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let threads = self.inner.slots.lock().await.clone();
        for thread in threads {
            if let Err(error) = thread.close() {
                debug!(thread = %thread.id(), %error, "close raced a stopping worker");
            }
        }
    }

    /// Terminate every live worker immediately.
    pub async fn kill(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let threads = self.inner.slots.lock().await.clone();
        for thread in threads {
            thread.kill();
        }
    }

    /// Number of live workers.
    pub async fn size(&self) -> usize {
        self.inner.slots.lock().await.len()
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.inner.config.max_threads
    }

    /// Snapshot of the pool's current load.
    pub async fn metrics(&self) -> PoolMetrics {
        let slots = self.inner.slots.lock().await;
        PoolMetrics {
            size: slots.len(),
            capacity: self.inner.config.max_threads,
            pending_requests: slots.iter().map(Thread::num_pending_requests).sum(),
            is_closed: self.inner.closed.load(Ordering::SeqCst),
        }
    }
}

/// Spawn one pool worker and wire its exit back into the pool.
///
/// Returns an explicitly boxed future (rather than `async fn`'s normal
/// opaque type) because this function and [`handle_exit`] call each other:
/// without a named, non-opaque return type here, rustc cannot resolve the
/// mutually recursive `Send` auto-trait check between the two.
fn spawn_worker(
    inner: &Arc<PoolInner>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Thread, SpawnError>> + Send + '_>>
{
    Box::pin(async move {
        let factory = inner.factory.clone();
        let opts = SpawnOptions {
            init_data: inner.config.init_data.clone(),
            close_when_idle: inner.config.close_when_idle,
            ..Default::default()
        };
        let thread = Thread::spawn(move || factory(), opts).await?;

        let weak = Arc::downgrade(inner);
        let handle = thread.clone();
        thread.set_on_close(Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                let handle = handle.clone();
                tokio::spawn(async move { handle_exit(inner, handle).await });
            }
        }));
        Ok(thread)
    })
}

/// Evict an exited worker and top the pool back up to its floor.
async fn handle_exit(inner: Arc<PoolInner>, thread: Thread) {
    let mut slots = inner.slots.lock().await;
    if let Some(index) = slots.iter().position(|t| t.id() == thread.id()) {
        // Swap-remove keeps the live prefix dense
        slots.swap_remove(index);
        debug!(thread = %thread.id(), remaining = slots.len(), "pool evicted worker");
    }
    while !inner.closed.load(Ordering::SeqCst) && slots.len() < inner.floor() {
        match spawn_worker(&inner).await {
            Ok(replacement) => slots.push(replacement),
            Err(error) => {
                warn!(%error, "pool respawn failed");
                break;
            }
        }
    }
}
