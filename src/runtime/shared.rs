use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering, fence};
use std::sync::{Arc, OnceLock};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::frame::header::Header;
use crate::runtime::context::Context;

/// State shared by every worker of a pool.
pub(crate) struct Shared {
    pub(crate) shutdown: AtomicBool,

    /// Sibling contexts, filled once at pool construction.
    contexts: OnceLock<Vec<Arc<Context>>>,
}

impl Shared {
    pub(crate) fn new() -> Arc<Shared> {
        Arc::new(Shared {
            shutdown: AtomicBool::new(false),
            contexts: OnceLock::new(),
        })
    }

    pub(crate) fn install_contexts(&self, contexts: Vec<Arc<Context>>) {
        self.contexts
            .set(contexts)
            .unwrap_or_else(|_| panic!("contexts installed twice"));
    }

    pub(crate) fn contexts(&self) -> &[Arc<Context>] {
        self.contexts.get().expect("contexts not installed")
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Route a migrating frame to `target`'s inbox.
    pub(crate) fn submit_to(&self, target: usize, frame: NonNull<Header>) {
        self.contexts()[target].submit(frame);
    }

    /// Wake one parked worker, if any. Newly pushed deque work is stealable
    /// by anyone, so any sleeper will do.
    pub(crate) fn unpark_any(&self) {
        // Pairs with the fence in `Parker::park`: either we observe the
        // sleeper's registration, or the sleeper observes the work that
        // prompted this call.
        fence(Ordering::SeqCst);
        for ctx in self.contexts() {
            if ctx.parker().unpark_one() {
                return;
            }
        }
    }

    pub(crate) fn unpark_all(&self) {
        for ctx in self.contexts() {
            ctx.parker().unpark_all();
        }
    }

    #[cfg(test)]
    pub(crate) fn sleepers(&self) -> usize {
        self.contexts().iter().map(|c| c.parker().sleepers()).sum()
    }
}

/// Per-worker sleep/wake machinery for the lazy pool.
///
/// Wake policy: wakers pay a relaxed counter check while the worker is busy.
/// The epoch under the mutex closes the missed-wake window: a parking worker
/// either observes the bumped epoch before waiting or is woken by the
/// notify.
pub(crate) struct Parker {
    sleepers: AtomicUsize,
    epoch: Mutex<u64>,
    condvar: Condvar,
}

impl Parker {
    pub(crate) fn new() -> Parker {
        Parker {
            sleepers: AtomicUsize::new(0),
            epoch: Mutex::new(0),
            condvar: Condvar::new(),
        }
    }

    /// Park the owning worker until an unpark arrives, unless `has_work`
    /// already observes something to do.
    pub(crate) fn park<F: Fn() -> bool>(&self, has_work: F) {
        self.sleepers.fetch_add(1, Ordering::SeqCst);
        // Pairs with the fences in `Shared::unpark_any` and `unpark_one`.
        fence(Ordering::SeqCst);

        {
            let mut epoch = self.epoch.lock();
            if !has_work() {
                trace!("worker parking");
                let seen = *epoch;
                while *epoch == seen {
                    self.condvar.wait(&mut epoch);
                }
                trace!("worker unparked");
            }
        }

        self.sleepers.fetch_sub(1, Ordering::SeqCst);
    }

    /// Returns true if a sleeper was (or is being) woken.
    pub(crate) fn unpark_one(&self) -> bool {
        fence(Ordering::SeqCst);
        if self.sleepers.load(Ordering::Relaxed) == 0 {
            return false;
        }
        let mut epoch = self.epoch.lock();
        *epoch += 1;
        self.condvar.notify_one();
        true
    }

    pub(crate) fn unpark_all(&self) {
        let mut epoch = self.epoch.lock();
        *epoch += 1;
        self.condvar.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn sleepers(&self) -> usize {
        self.sleepers.load(Ordering::SeqCst)
    }
}
