use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;

use crate::runtime::context::Context;
use crate::runtime::shared::Shared;
use crate::runtime::worker;
use crate::runtime::{Config, RootHandle, Scheduler};

/// Zero-thread pool: each submitted root runs to completion on the calling
/// thread.
///
/// With a single worker no continuation can ever be stolen, so every join
/// takes the fast path and execution is exactly the serial elision of the
/// program. Useful for tests and serial baselines; concurrent callers
/// serialize.
pub struct UnitPool {
    /// Keeps the shared state (and the context's back-reference) alive.
    _shared: Arc<Shared>,
    ctx: Arc<Context>,
    guard: Mutex<()>,
}

impl UnitPool {
    pub fn new() -> UnitPool {
        Self::with_config(Config::new()).expect("failed to build unit pool")
    }

    /// `workers` in `cfg` is ignored; a unit pool always has one context.
    pub fn with_config(cfg: Config) -> Result<UnitPool> {
        let cfg = cfg.workers(1);
        cfg.validate()?;

        let shared = Shared::new();
        let ctx = Arc::new(Context::new(0, &cfg, Arc::downgrade(&shared)));
        shared.install_contexts(vec![Arc::clone(&ctx)]);

        Ok(UnitPool {
            _shared: shared,
            ctx,
            guard: Mutex::new(()),
        })
    }

    #[cfg(test)]
    pub(crate) fn context(&self) -> &Context {
        &self.ctx
    }
}

impl Default for UnitPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for UnitPool {
    fn schedule(&self, root: RootHandle) {
        let _serialized = self.guard.lock();
        worker::resume_submitted(&self.ctx, root.into_raw());
        debug_assert!(self.ctx.deque_is_empty(), "unit pool left work behind");
    }
}
