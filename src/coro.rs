use std::any::Any;
use std::panic;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use tracing::trace;

use crate::frame::Eventually;
use crate::frame::header::{Header, Kind, Stash};
use crate::frame::layout;
use crate::runtime::Context;

/// A fork/join coroutine: a hand-compiled state machine the runtime resumes
/// from one suspension point to the next.
///
/// `resume` runs until the body either finishes ([`Step::Done`]) or arms a
/// suspension through one of the [`Sc`] methods and returns it
/// ([`Step::Pending`]). On the next resumption the state machine re-enters
/// past that point.
///
/// Programs must be strict: every fork is joined in the frame that forked
/// it, before that frame returns `Done`. The runtime debug-asserts the
/// balance.
pub trait Coroutine: Send {
    type Output: Send;

    fn resume(&mut self, sc: &mut Sc<'_>) -> Step<Self::Output>;
}

/// What a [`Coroutine::resume`] call came back with.
#[must_use]
pub enum Step<T> {
    /// Ran to completion; the value lands in the spawner's slot.
    Done(T),
    /// Stopped at a suspension point.
    Pending(Pending),
}

/// An armed suspension. Built only by the methods on [`Sc`]; the worker
/// executes it after `resume` returns.
#[must_use]
pub struct Pending {
    pub(crate) kind: PendingKind,
}

pub(crate) enum PendingKind {
    Fork(NonNull<Header>),
    Call(NonNull<Header>),
    Join,
    Switch(usize),
}

/// Suspension context handed to [`Coroutine::resume`]: the gateway to the
/// fork/call/join protocol of the frame being resumed.
pub struct Sc<'a> {
    frame: NonNull<Header>,
    ctx: &'a Context,
}

impl<'a> Sc<'a> {
    pub(crate) fn new(frame: NonNull<Header>, ctx: &'a Context) -> Sc<'a> {
        Sc { frame, ctx }
    }

    fn header(&self) -> &Header {
        // Safety: the frame outlives the resume call this Sc is scoped to.
        unsafe { self.frame.as_ref() }
    }

    /// Spawn `child` and expose this frame's continuation to thieves; the
    /// returned suspension transfers control into the child with no host
    /// stack growth.
    ///
    /// # Safety
    ///
    /// `slot`, and everything `child` borrows, must stay valid until this
    /// frame's next join completes. Keeping the slot in the coroutine's own
    /// state satisfies this; a stack local of `resume` does not.
    pub unsafe fn fork<C: Coroutine>(&mut self, slot: &Eventually<C::Output>, child: C) -> Pending {
        self.header().debug_fork_inc();
        let child =
            layout::spawn_child(self.ctx, self.frame, Kind::Fork, NonNull::from(slot), child);
        Pending {
            kind: PendingKind::Fork(child),
        }
    }

    /// Spawn `child` and run it inline: control returns here when it
    /// finishes, and the continuation is never published to thieves.
    ///
    /// # Safety
    ///
    /// Same contract as [`Sc::fork`].
    pub unsafe fn call<C: Coroutine>(&mut self, slot: &Eventually<C::Output>, child: C) -> Pending {
        let child =
            layout::spawn_child(self.ctx, self.frame, Kind::Call, NonNull::from(slot), child);
        Pending {
            kind: PendingKind::Call(child),
        }
    }

    /// Expression-style call: run `child` inline into a one-shot slot the
    /// caller reads with [`Eventually::take`] on resume.
    ///
    /// # Safety
    ///
    /// Same contract as [`Sc::fork`].
    pub unsafe fn invoke<C: Coroutine>(
        &mut self,
        slot: &Eventually<C::Output>,
        child: C,
    ) -> Pending {
        // Safety: forwarded contract.
        unsafe { self.call(slot, child) }
    }

    /// Synchronize with every outstanding fork of this frame.
    ///
    /// Returns `None` when the join is already satisfied — the body simply
    /// carries on. Otherwise the returned suspension must be handed back so
    /// the frame can wait; the state machine re-enters past the join when it
    /// is resumed.
    ///
    /// A fault stashed on this frame (its own via
    /// [`Sc::stash_exception`], or transported from a completed child)
    /// resurfaces here as a panic.
    pub fn join(&mut self) -> Option<Pending> {
        let header = self.header();

        if header.steals() == 0 {
            // No thief ever touched the continuation: we are the only owner
            // and every child completed through the pop path.
            trace!("join ready, no steals");
            header.debug_join_reset();
            self.rethrow_stashed();
            return None;
        }

        // Currently joins = u32::MAX - children_joined.
        let joined = u32::MAX - header.load_joins(Ordering::Acquire);
        if header.steals() == joined {
            // Every stolen continuation has been matched by a completion we
            // can already observe: take the stack back and reset.
            trace!("join ready, all children accounted for");
            self.ctx.take_stack(header.top);
            header.reset();
            self.rethrow_stashed();
            return None;
        }

        trace!("join not ready, suspending");
        Some(Pending {
            kind: PendingKind::Join,
        })
    }

    /// Record a caught panic payload on this frame. The next join — here or
    /// in an ancestor — rethrows it, after sibling subtrees have finished.
    /// When several faults reach one join, the left-most child's wins.
    pub fn stash_exception(&mut self, payload: Box<dyn Any + Send + 'static>) {
        self.header().stash_put(Stash::own(payload));
    }

    /// Move this coroutine to another worker. Returns `None` (no suspension
    /// needed) when already running there.
    ///
    /// # Panics
    ///
    /// Panics if `worker` is out of range for the pool.
    pub fn switch_to(&mut self, worker: usize) -> Option<Pending> {
        assert!(
            worker < self.num_workers(),
            "switch_to({worker}) out of range for a pool of {}",
            self.num_workers()
        );
        if worker == self.ctx.index() {
            return None;
        }
        Some(Pending {
            kind: PendingKind::Switch(worker),
        })
    }

    /// Index of the worker currently running this frame.
    pub fn worker(&self) -> usize {
        self.ctx.index()
    }

    pub fn num_workers(&self) -> usize {
        self.ctx.num_workers()
    }

    fn rethrow_stashed(&self) {
        if let Some(stash) = self.header().stash_take() {
            trace!("join rethrows stashed fault");
            panic::resume_unwind(stash.payload);
        }
    }
}
