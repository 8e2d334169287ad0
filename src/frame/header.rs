use std::any::Any;
use std::cell::Cell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::frame::layout::Vtable;
use crate::runtime::Context;
use crate::stack::AsyncStack;
use crate::sync_wait::RootLatch;

/// How a frame was spawned. Decides the final-suspend path: roots release
/// their latch, call children resume the parent directly, fork children run
/// the pop/steal protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    Root,
    Fork,
    Call,
}

/// Control block co-located with every live coroutine.
///
/// `Header` must be the first field of the frame layout: a `NonNull<Header>`
/// doubles as the coroutine handle that queues, steals and resumptions trade
/// in.
///
/// Ownership rules:
/// - `steals` and the debug balance are written only by the frame's current
///   owner, the thread holding its execution.
/// - `joins` is decremented by children with release ordering and read by
///   the owner with acquire; the biased encoding
///   `joins = u32::MAX - children_joined` lets the owner publish its
///   expected steal count with a single `fetch_sub`.
/// - Every frame is reached exactly once by `destroy`.
pub(crate) struct Header {
    /// Resume/destroy entry points for the coroutine this header fronts.
    vtable: Vtable,

    /// Continuation of the frame that forked or called us. `None` for roots.
    pub(crate) parent: Option<NonNull<Header>>,

    pub(crate) kind: Kind,

    /// Stack segment this frame was carved from. `None` for heap frames
    /// (roots, or the per-frame overflow fallback).
    pub(crate) top: Option<NonNull<AsyncStack>>,

    /// Bump rewind cookie for `top`.
    pub(crate) prev_sp: usize,

    /// Fork ordinal within the parent's current join epoch; orders fault
    /// merging left-to-right.
    pub(crate) branch: u32,

    /// Continuation thefts since the last control-block reset.
    steals: Cell<u32>,

    /// Biased join counter: `u32::MAX - children_joined`.
    joins: AtomicU32,

    /// Fork ordinals handed out since the last reset.
    forks: Cell<u32>,

    /// One-slot exception back-channel.
    stash: Mutex<Option<Stash>>,

    /// Root frames only: completion latch released at final suspend.
    pub(crate) latch: Option<NonNull<RootLatch>>,

    /// Fork/join balance; must be zero at join completion and at destroy.
    #[cfg(debug_assertions)]
    debug_forks: Cell<u32>,
}

// Safety: cross-thread access follows the ownership rules above; the plain
// cells are only ever written by the thread that owns the frame, and
// ownership transfer is ordered by the deque (push-release/steal-acquire)
// and the join counter (sub-release/fence-acquire).
unsafe impl Send for Header {}
unsafe impl Sync for Header {}

impl Header {
    pub(crate) fn new(
        vtable: Vtable,
        parent: Option<NonNull<Header>>,
        kind: Kind,
        top: Option<NonNull<AsyncStack>>,
        prev_sp: usize,
        branch: u32,
    ) -> Header {
        Header {
            vtable,
            parent,
            kind,
            top,
            prev_sp,
            branch,
            steals: Cell::new(0),
            joins: AtomicU32::new(u32::MAX),
            forks: Cell::new(0),
            stash: Mutex::new(None),
            latch: None,
            #[cfg(debug_assertions)]
            debug_forks: Cell::new(0),
        }
    }

    pub(crate) fn set_latch(&mut self, latch: NonNull<RootLatch>) {
        debug_assert_eq!(self.kind, Kind::Root);
        self.latch = Some(latch);
    }

    // ===== steal / join counters =====

    pub(crate) fn steals(&self) -> u32 {
        self.steals.get()
    }

    /// Record a continuation theft. Only the thread that just took the frame
    /// off a queue may call this.
    pub(crate) fn add_steal(&self) {
        self.steals.set(self.steals.get() + 1);
    }

    pub(crate) fn load_joins(&self, order: Ordering) -> u32 {
        self.joins.load(order)
    }

    /// Returns the previous value, like the underlying `fetch_sub`.
    pub(crate) fn fetch_sub_joins(&self, n: u32, order: Ordering) -> u32 {
        self.joins.fetch_sub(n, order)
    }

    /// Reset the control block after a completed join.
    pub(crate) fn reset(&self) {
        self.steals.set(0);
        self.joins.store(u32::MAX, Ordering::Relaxed);
        self.forks.set(0);
        #[cfg(debug_assertions)]
        self.debug_forks.set(0);
    }

    /// Hand out the next fork ordinal for this join epoch.
    pub(crate) fn next_branch(&self) -> u32 {
        let branch = self.forks.get();
        self.forks.set(branch + 1);
        branch
    }

    pub(crate) fn debug_fork_inc(&self) {
        #[cfg(debug_assertions)]
        self.debug_forks.set(self.debug_forks.get() + 1);
    }

    /// Zero the fork/join balance on a join that completed without a reset
    /// (the no-steals fast path).
    pub(crate) fn debug_join_reset(&self) {
        #[cfg(debug_assertions)]
        self.debug_forks.set(0);
    }

    pub(crate) fn debug_assert_joined(&self) {
        #[cfg(debug_assertions)]
        {
            debug_assert_eq!(self.debug_forks.get(), 0, "fork without a matching join");
            debug_assert_eq!(self.steals.get(), 0, "destroyed before its join completed");
            debug_assert_eq!(
                self.joins.load(Ordering::Relaxed),
                u32::MAX,
                "destroyed in an invalid state"
            );
        }
    }

    // ===== exception stash =====

    /// Record a fault, keeping the highest-precedence one: lowest rank wins,
    /// so child faults (ranked by fork ordinal) outrank a frame's own
    /// stashed fault (ranked `u32::MAX`).
    pub(crate) fn stash_put(&self, stash: Stash) {
        let mut slot = self.stash.lock();
        match &*slot {
            Some(current) if current.rank <= stash.rank => {}
            _ => *slot = Some(stash),
        }
    }

    pub(crate) fn stash_take(&self) -> Option<Stash> {
        self.stash.lock().take()
    }

    pub(crate) fn has_stash(&self) -> bool {
        self.stash.lock().is_some()
    }

    // ===== vtable dispatch =====

    /// Run the coroutine to its next suspension point and interpret it.
    ///
    /// # Safety
    ///
    /// The calling thread must own the frame (hold its only live handle).
    pub(crate) unsafe fn resume(ptr: NonNull<Header>, ctx: &Context) -> Transfer {
        let vtable = unsafe { ptr.as_ref() }.vtable;
        unsafe { (vtable.resume)(ptr, ctx) }
    }

    /// Drop the coroutine state and release the frame's memory.
    ///
    /// # Safety
    ///
    /// The calling thread must own the frame; the frame must not be reached
    /// again.
    pub(crate) unsafe fn destroy(ptr: NonNull<Header>) {
        unsafe { ptr.as_ref() }.debug_assert_joined();
        let vtable = unsafe { ptr.as_ref() }.vtable;
        unsafe { (vtable.destroy)(ptr) }
    }
}

/// A captured panic riding the one-slot back-channel from a faulted frame to
/// the join that rethrows it.
pub(crate) struct Stash {
    /// Merge rank within the destination slot. Children use their fork
    /// ordinal; a frame's own fault ranks below every child.
    pub(crate) rank: u32,
    pub(crate) payload: Box<dyn Any + Send + 'static>,
}

impl Stash {
    /// A fault raised (or stashed) by the frame itself.
    pub(crate) fn own(payload: Box<dyn Any + Send + 'static>) -> Stash {
        Stash {
            rank: u32::MAX,
            payload,
        }
    }

    /// Re-rank for transport into the parent's slot.
    pub(crate) fn reranked(self, branch: u32) -> Stash {
        Stash {
            rank: branch,
            payload: self.payload,
        }
    }
}

/// What the worker does after a frame suspends: bounce into the next frame
/// (symmetric transfer) or fall back to the scheduler loop.
pub(crate) enum Transfer {
    Resume(NonNull<Header>),
    Yield,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stash_keeps_leftmost() {
        let header = Header::new(
            crate::frame::layout::noop_vtable(),
            None,
            Kind::Root,
            None,
            0,
            0,
        );

        header.stash_put(Stash::own(Box::new("own")));
        header.stash_put(Stash {
            rank: 3,
            payload: Box::new("right child"),
        });
        header.stash_put(Stash {
            rank: 1,
            payload: Box::new("left child"),
        });
        header.stash_put(Stash {
            rank: 2,
            payload: Box::new("middle child"),
        });

        let stash = header.stash_take().unwrap();
        assert_eq!(stash.rank, 1);
        assert_eq!(*stash.payload.downcast::<&str>().unwrap(), "left child");
        assert!(header.stash_take().is_none());
    }

    #[test]
    fn test_biased_join_counter() {
        let header = Header::new(
            crate::frame::layout::noop_vtable(),
            None,
            Kind::Root,
            None,
            0,
            0,
        );

        // Two children complete down the stolen path.
        assert_eq!(header.fetch_sub_joins(1, Ordering::Release), u32::MAX);
        assert_eq!(header.fetch_sub_joins(1, Ordering::Release), u32::MAX - 1);

        let joined = u32::MAX - header.load_joins(Ordering::Acquire);
        assert_eq!(joined, 2);

        header.reset();
        assert_eq!(header.load_joins(Ordering::Relaxed), u32::MAX);
        assert_eq!(header.steals(), 0);
    }
}
