use std::alloc::Layout;
use std::mem::MaybeUninit;
use std::ptr::NonNull;

use crate::coro::Coroutine;
use crate::frame::eventually::Eventually;
use crate::frame::harness::Harness;
use crate::frame::header::{Header, Kind, Transfer};
use crate::runtime::Context;
use crate::sync_wait::RootLatch;

/// The frame cell: scheduler metadata co-located with the coroutine state.
///
/// `header` must stay the first field — the frame is referenced as both
/// `NonNull<FrameLayout<C>>` and `NonNull<Header>`.
#[repr(C)]
pub(crate) struct FrameLayout<C: Coroutine> {
    pub(super) header: Header,

    /// Where the spawner wants the result.
    pub(super) ret: NonNull<Eventually<C::Output>>,

    /// The user state machine.
    pub(super) coro: C,
}

/// Per-coroutine entry points, monomorphized once per `C` and carried by
/// value in the header (two function pointers).
#[derive(Clone, Copy)]
pub(crate) struct Vtable {
    /// Runs the coroutine to its next suspension point and interprets it.
    pub(super) resume: unsafe fn(NonNull<Header>, &Context) -> Transfer,

    /// Drops the coroutine state and releases the frame's memory.
    pub(super) destroy: unsafe fn(NonNull<Header>),
}

pub(super) fn vtable<C: Coroutine>() -> Vtable {
    Vtable {
        resume: resume::<C>,
        destroy: destroy::<C>,
    }
}

/// Allocate and initialize a child frame on the worker's current stack
/// segment, falling back to the heap for this one frame when the segment is
/// full.
pub(crate) fn spawn_child<C: Coroutine>(
    ctx: &Context,
    parent: NonNull<Header>,
    kind: Kind,
    ret: NonNull<Eventually<C::Output>>,
    coro: C,
) -> NonNull<Header> {
    debug_assert!(matches!(kind, Kind::Fork | Kind::Call));

    // Safety: the parent is suspended in our ownership while we spawn.
    let branch = unsafe { parent.as_ref() }.next_branch();

    let layout = Layout::new::<FrameLayout<C>>();
    let stack = ctx.current_stack();

    // Safety: we own the current segment.
    let (ptr, top, prev_sp) = match unsafe { stack.as_ref() }.alloc(layout) {
        Some((ptr, prev_sp)) => (ptr.cast::<FrameLayout<C>>(), Some(stack), prev_sp),
        None => {
            let ptr = Box::into_raw(Box::<FrameLayout<C>>::new_uninit()).cast::<FrameLayout<C>>();
            // Safety: `Box::into_raw` never returns null.
            (unsafe { NonNull::new_unchecked(ptr) }, None, 0)
        }
    };

    // Safety: `ptr` is a fresh, properly aligned allocation for the cell.
    unsafe {
        ptr.as_ptr().write(FrameLayout {
            header: Header::new(vtable::<C>(), Some(parent), kind, top, prev_sp, branch),
            ret,
            coro,
        });
    }

    ptr.cast()
}

/// Allocate a root frame on the heap, wired to the waiter's latch.
pub(crate) fn new_root<C: Coroutine>(
    coro: C,
    ret: NonNull<Eventually<C::Output>>,
    latch: NonNull<RootLatch>,
) -> NonNull<Header> {
    let mut header = Header::new(vtable::<C>(), None, Kind::Root, None, 0, 0);
    header.set_latch(latch);

    let ptr = Box::into_raw(Box::new(FrameLayout { header, ret, coro }));
    // Safety: `Box::into_raw` never returns null.
    unsafe { NonNull::new_unchecked(ptr) }.cast()
}

unsafe fn resume<C: Coroutine>(ptr: NonNull<Header>, ctx: &Context) -> Transfer {
    unsafe { Harness::<C>::from_raw(ptr) }.resume(ctx)
}

unsafe fn destroy<C: Coroutine>(ptr: NonNull<Header>) {
    let cell = ptr.cast::<FrameLayout<C>>();

    // Copy the rewind cookie out before the header goes away.
    let (top, prev_sp) = {
        // Safety: caller owns the frame.
        let header = &unsafe { cell.as_ref() }.header;
        (header.top, header.prev_sp)
    };

    match top {
        Some(stack) => {
            // Safety: exclusive owner; rewinds arrive in LIFO order because
            // frames nest.
            unsafe {
                cell.as_ptr().drop_in_place();
                stack.as_ref().dealloc_to(prev_sp);
            }
        }
        None => {
            // Heap frame (root or overflow fallback).
            // Safety: allocated via `Box` in `spawn_child`/`new_root`.
            unsafe {
                cell.as_ptr().drop_in_place();
                drop(Box::from_raw(
                    cell.as_ptr().cast::<MaybeUninit<FrameLayout<C>>>(),
                ));
            }
        }
    }
}

/// Inert vtable for control-block unit tests.
#[cfg(test)]
pub(crate) fn noop_vtable() -> Vtable {
    unsafe fn resume(_: NonNull<Header>, _: &Context) -> Transfer {
        Transfer::Yield
    }
    unsafe fn destroy(_: NonNull<Header>) {}

    Vtable { resume, destroy }
}
