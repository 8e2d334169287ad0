use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use anyhow::{Context as _, Result};
use parking_lot::Mutex;
use tracing::debug;

use crate::runtime::context::Context;
use crate::runtime::shared::Shared;
use crate::runtime::worker::{Flavor, Worker};
use crate::runtime::{Config, RootHandle, Scheduler};

/// Worker threads plus the shared state they steal over.
pub(crate) struct Pool {
    shared: Arc<Shared>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
    next: AtomicUsize,
}

impl Pool {
    pub(crate) fn try_new(cfg: Config, flavor: Flavor) -> Result<Pool> {
        cfg.validate()?;

        let shared = Shared::new();
        let contexts: Vec<_> = (0..cfg.workers)
            .map(|index| Arc::new(Context::new(index, &cfg, Arc::downgrade(&shared))))
            .collect();
        shared.install_contexts(contexts.clone());

        let handles = contexts
            .iter()
            .map(|ctx| spawn_worker(&cfg, flavor, Arc::clone(ctx)))
            .collect::<Result<Vec<_>>>()?;

        debug!(workers = cfg.workers, ?flavor, "pool started");
        Ok(Pool {
            shared,
            handles: Mutex::new(handles),
            next: AtomicUsize::new(0),
        })
    }

    /// Round-robin root frames over the worker inboxes.
    pub(crate) fn schedule(&self, root: RootHandle) {
        let contexts = self.shared.contexts();
        let index = self.next.fetch_add(1, Ordering::Relaxed) % contexts.len();
        contexts[index].submit(root.into_raw());
    }

    /// Idempotent. Runs after all roots have completed (waiters hold the
    /// pool borrowed), so workers quiesce instead of cancelling anything.
    pub(crate) fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        self.shared.unpark_all();
        for handle in self.handles.lock().drain(..) {
            if handle.join().is_err() {
                // Chains catch panics into frames; a worker unwinding is a
                // runtime bug.
                debug_assert!(false, "worker thread panicked");
            }
        }
        debug!("pool shut down");
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_worker(cfg: &Config, flavor: Flavor, ctx: Arc<Context>) -> Result<thread::JoinHandle<()>> {
    let name = format!("{}-{}", cfg.thread_name, ctx.index());
    let steal_retries = cfg.steal_retries;

    thread::Builder::new()
        .name(name.clone())
        .spawn(move || Worker::new(ctx, flavor, steal_retries).run())
        .with_context(|| format!("failed to spawn worker thread {name}"))
}

/// Work-stealing pool whose idle workers spin. Intended for benchmarks and
/// latency-sensitive work; keeps every core hot.
pub struct BusyPool {
    pub(crate) pool: Pool,
}

impl BusyPool {
    /// # Panics
    ///
    /// Panics if worker threads cannot be spawned; use
    /// [`BusyPool::with_config`] to handle that.
    pub fn new(workers: usize) -> BusyPool {
        Self::with_config(Config::new().workers(workers)).expect("failed to build busy pool")
    }

    pub fn with_config(cfg: Config) -> Result<BusyPool> {
        Ok(BusyPool {
            pool: Pool::try_new(cfg, Flavor::Busy)?,
        })
    }
}

impl Scheduler for BusyPool {
    fn schedule(&self, root: RootHandle) {
        self.pool.schedule(root);
    }
}

/// Work-stealing pool whose idle workers park after a dry round and are
/// woken by pushes and submissions. Trades a little latency for idle CPUs.
pub struct LazyPool {
    pub(crate) pool: Pool,
}

impl LazyPool {
    /// # Panics
    ///
    /// Panics if worker threads cannot be spawned; use
    /// [`LazyPool::with_config`] to handle that.
    pub fn new(workers: usize) -> LazyPool {
        Self::with_config(Config::new().workers(workers)).expect("failed to build lazy pool")
    }

    pub fn with_config(cfg: Config) -> Result<LazyPool> {
        Ok(LazyPool {
            pool: Pool::try_new(cfg, Flavor::Lazy)?,
        })
    }
}

impl Scheduler for LazyPool {
    fn schedule(&self, root: RootHandle) {
        self.pool.schedule(root);
    }
}
