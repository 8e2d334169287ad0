use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{Ordering, fence};

use tracing::trace;

use crate::coro::{Coroutine, PendingKind, Sc, Step};
use crate::frame::header::{Header, Kind, Stash, Transfer};
use crate::frame::layout::FrameLayout;
use crate::runtime::Context;

/// Typed view over a raw frame: runs the coroutine body and executes the
/// suspension it asked for.
pub(super) struct Harness<C: Coroutine> {
    cell: NonNull<FrameLayout<C>>,
}

impl<C: Coroutine> Harness<C> {
    /// # Safety
    ///
    /// `ptr` must head a live `FrameLayout<C>` owned by the calling thread.
    pub(super) unsafe fn from_raw(ptr: NonNull<Header>) -> Harness<C> {
        Harness { cell: ptr.cast() }
    }

    fn header_ptr(&self) -> NonNull<Header> {
        self.cell.cast()
    }

    fn header(&self) -> &Header {
        // Safety: the frame is live for the duration of this harness.
        &unsafe { self.cell.as_ref() }.header
    }

    pub(super) fn resume(self, ctx: &Context) -> Transfer {
        let step = panic::catch_unwind(AssertUnwindSafe(|| {
            // Safety: we own the frame; the body gets the only live &mut.
            let coro = unsafe { &mut (*self.cell.as_ptr()).coro };
            let mut sc = Sc::new(self.header_ptr(), ctx);
            coro.resume(&mut sc)
        }));

        match step {
            Ok(Step::Done(value)) => {
                // Safety: written before final suspend; the spawner reads it
                // only after the join this completion synchronizes with.
                unsafe { self.cell.as_ref().ret.as_ref().set(value) };
                final_suspend(ctx, self.header_ptr())
            }
            Ok(Step::Pending(pending)) => self.suspend(ctx, pending.kind),
            Err(payload) => {
                // A panic unwinding out of a body completes the frame
                // exceptionally; the fault rides the stash slots up to the
                // next join (and ultimately to `sync_wait`).
                trace!("body panicked, completing frame exceptionally");
                self.header().stash_put(Stash::own(payload));
                final_suspend(ctx, self.header_ptr())
            }
        }
    }

    fn suspend(self, ctx: &Context, kind: PendingKind) -> Transfer {
        match kind {
            PendingKind::Fork(child) => {
                // Publish our continuation, then rip into the child. The
                // push is the release edge a thief's steal acquires.
                trace!("fork: publishing continuation");
                ctx.task_push(self.header_ptr());
                Transfer::Resume(child)
            }
            PendingKind::Call(child) => {
                trace!("call: transferring inline");
                Transfer::Resume(child)
            }
            PendingKind::Join => join_suspend(ctx, self.header_ptr()),
            PendingKind::Switch(target) => {
                // The segment travels with the frame: stop using it before
                // the destination can pick it up.
                if self.header().top == Some(ctx.current_stack()) {
                    ctx.replace_current_stack();
                }
                trace!(dest = target, "switch: migrating to another worker");
                ctx.shared().submit_to(target, self.header_ptr());
                Transfer::Yield
            }
        }
    }
}

/// The slow half of a join: publish the expected steal count and race the
/// outstanding children.
pub(crate) fn join_suspend(ctx: &Context, frame: NonNull<Header>) -> Transfer {
    // Safety: we own the frame until the subtraction below is published.
    let header = unsafe { frame.as_ref() };

    let steals = header.steals();
    let prev = header.fetch_sub_joins(u32::MAX - steals, Ordering::Release);

    if steals == u32::MAX - prev {
        // Our subtraction brought the counter into alignment: every child
        // had already joined, so we win and keep the frame.
        fence(Ordering::Acquire);
        trace!("join race won, resuming");
        header.reset();
        ctx.take_stack(header.top);
        if header.has_stash() {
            // The join completes exceptionally; the body never resumes.
            return final_suspend(ctx, frame);
        }
        return Transfer::Resume(frame);
    }

    // A child still running will finish the join and resume the frame. We
    // must not touch it past the published subtraction.
    trace!("join race lost, yielding");
    Transfer::Yield
}

/// Final suspension: decides who continues after a frame completes.
///
/// Iterative so that a chain of ancestors completing exceptionally unwinds
/// without growing the host stack.
pub(crate) fn final_suspend(ctx: &Context, frame: NonNull<Header>) -> Transfer {
    let mut frame = frame;
    loop {
        // Safety: we own the frame until `destroy`.
        let (parent, kind, latch, branch) = {
            let header = unsafe { frame.as_ref() };
            (header.parent, header.kind, header.latch, header.branch)
        };

        match kind {
            Kind::Root => {
                let latch = latch.expect("root frame without a latch");
                // Safety: the latch outlives the waiter's `sync_wait` call,
                // which cannot return before the release below.
                unsafe {
                    if let Some(stash) = frame.as_ref().stash_take() {
                        latch.as_ref().set_fault(stash);
                    }
                    trace!("root final suspend, releasing latch");
                    Header::destroy(frame);
                    latch.as_ref().release();
                }
                return Transfer::Yield;
            }

            Kind::Call => {
                let parent = parent.expect("call frame without a parent");
                // An inline child's parent cannot have been stolen; resume
                // it directly, faults ride along in its slot.
                // Safety: parent outlives its children; we own both.
                unsafe {
                    if let Some(stash) = frame.as_ref().stash_take() {
                        parent.as_ref().stash_put(stash.reranked(branch));
                    }
                    Header::destroy(frame);
                }
                trace!("call child done, resuming parent inline");
                return Transfer::Resume(parent);
            }

            Kind::Fork => {
                let parent = parent.expect("forked frame without a parent");
                // Transport the fault before the counter traffic below can
                // hand the parent to another thread.
                // Safety: parent outlives its children; the stash slot is
                // internally locked.
                unsafe {
                    if let Some(stash) = frame.as_ref().stash_take() {
                        parent.as_ref().stash_put(stash.reranked(branch));
                    }
                    Header::destroy(frame);
                }

                if let Some(popped) = ctx.task_pop() {
                    // No one stole the continuation: we are the exclusive
                    // owner of the parent, keep ripping on the same stack.
                    debug_assert_eq!(popped, parent, "final-suspend pop must match the parent");
                    trace!("continuation not stolen, resuming parent");
                    return Transfer::Resume(parent);
                }

                // Someone stole the parent; register our completion.
                // Safety: the parent frame stays alive until its last child
                // has decremented the join counter.
                let parent_ref = unsafe { parent.as_ref() };
                let top = parent_ref.top;

                if parent_ref.fetch_sub_joins(1, Ordering::Release) == 1 {
                    // We were the last outstanding child: the parent reached
                    // its join and lost, so it is ours to continue.
                    fence(Ordering::Acquire);
                    trace!("last child to join, resuming stolen parent");
                    parent_ref.reset();
                    ctx.take_stack(top);
                    if parent_ref.has_stash() {
                        // The parent's join completes exceptionally.
                        frame = parent;
                        continue;
                    }
                    return Transfer::Resume(parent);
                }

                // Not the last child. If we were holding the parent's
                // segment we must give it up so the thread that finishes the
                // join can install it.
                if top.is_some() && top == Some(ctx.current_stack()) {
                    trace!("releasing the parent's stack segment");
                    ctx.replace_current_stack();
                }
                trace!("not last to join, yielding");
                return Transfer::Yield;
            }
        }
    }
}
