use std::panic;
use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::coro::Coroutine;
use crate::frame::Eventually;
use crate::frame::header::Stash;
use crate::frame::layout;
use crate::runtime::{RootHandle, Scheduler};
use crate::utils::Signal;

/// Completion latch for a root frame: the binary signal `sync_wait` blocks
/// on, plus the fault slot it rethrows from. Lives on the waiter's stack and
/// outlives the root by construction.
pub(crate) struct RootLatch {
    signal: Signal,
    fault: Mutex<Option<Stash>>,
}

impl RootLatch {
    fn new() -> RootLatch {
        RootLatch {
            signal: Signal::new(),
            fault: Mutex::new(None),
        }
    }

    pub(crate) fn set_fault(&self, stash: Stash) {
        *self.fault.lock() = Some(stash);
    }

    pub(crate) fn release(&self) {
        self.signal.release();
    }

    fn wait(&self) {
        self.signal.acquire();
    }

    fn take_fault(&self) -> Option<Stash> {
        self.fault.lock().take()
    }
}

/// Run `coro` to completion on `scheduler` and return its value, blocking
/// the calling thread.
///
/// Faults that reached the root — panics captured by the runtime or payloads
/// recorded with [`Sc::stash_exception`](crate::Sc::stash_exception) —
/// resurface here via `resume_unwind`.
///
/// Thread-safe: any number of threads may drive roots through one scheduler
/// concurrently. `coro` may borrow from the caller; the call does not return
/// before the whole frame tree is gone (the argument that makes scoped
/// threads sound).
pub fn sync_wait<S, C>(scheduler: &S, coro: C) -> C::Output
where
    S: Scheduler + ?Sized,
    C: Coroutine,
{
    let mut result = Eventually::empty();
    let latch = RootLatch::new();
    let result_ptr = NonNull::from(&mut result);
    let latch_ptr = NonNull::from(&latch);

    // The root writes `result` and the latch strictly before the release
    // the wait below pairs with, so neither pointer outlives its referent.
    let root = layout::new_root(coro, result_ptr, latch_ptr);
    scheduler.schedule(RootHandle::new(root));

    latch.wait();
    if let Some(stash) = latch.take_fault() {
        panic::resume_unwind(stash.payload);
    }
    result.take()
}
