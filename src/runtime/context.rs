use std::cell::{Cell, RefCell};
use std::ptr::NonNull;
use std::sync::{Arc, Weak};

use crossbeam_queue::SegQueue;
use tracing::trace;

use crate::frame::header::Header;
use crate::runtime::deque::{Deque, Steal};
use crate::runtime::shared::{Parker, Shared};
use crate::runtime::{Config, TaskRef};
use crate::stack::AsyncStack;

/// Per-worker state: the stealable continuation deque, the segment pool, the
/// submission inbox, and the victim RNG.
///
/// Exactly one thread drives a context; other threads only touch the deque's
/// thief end and the inbox.
pub(crate) struct Context {
    index: usize,

    /// Stealable continuations, bottom owned by us.
    deque: Deque<TaskRef>,

    /// Externally submitted frames: roots and migrating coroutines.
    inbox: SegQueue<TaskRef>,

    /// Clean segments ready to host new chains.
    stacks: RefCell<Vec<NonNull<AsyncStack>>>,

    /// Segment new child frames are carved from.
    current: Cell<NonNull<AsyncStack>>,

    /// Victim selection.
    rng: RefCell<fastrand::Rng>,

    /// Where this worker sleeps when the pool is lazy and everything is dry.
    parker: Parker,

    stack_size: usize,

    /// Back-reference to the pool; weak, the pool owns the contexts.
    shared: Weak<Shared>,
}

// Safety: non-owning threads only use the thief end of the deque and the
// inbox, both thread-safe; every other field is driven by the single owning
// worker (the cells are never aliased across threads without a hand-off
// through the join counter or the queues).
unsafe impl Send for Context {}
unsafe impl Sync for Context {}

impl Context {
    pub(crate) fn new(index: usize, cfg: &Config, shared: Weak<Shared>) -> Context {
        Context {
            index,
            deque: Deque::new(cfg.deque_capacity),
            inbox: SegQueue::new(),
            stacks: RefCell::new(Vec::new()),
            current: Cell::new(into_raw(AsyncStack::new(cfg.stack_size))),
            rng: RefCell::new(fastrand::Rng::with_seed(0x5a67_0000 + index as u64)),
            parker: Parker::new(),
            stack_size: cfg.stack_size,
            shared,
        }
    }

    pub(crate) fn parker(&self) -> &Parker {
        &self.parker
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn num_workers(&self) -> usize {
        self.shared().contexts().len()
    }

    pub(crate) fn shared(&self) -> Arc<Shared> {
        self.shared.upgrade().expect("scheduler gone")
    }

    // ===== continuation queue =====

    /// Publish a continuation at the bottom of our deque and give a parked
    /// sibling a chance at it.
    pub(crate) fn task_push(&self, frame: NonNull<Header>) {
        self.deque.push(TaskRef(frame));
        self.shared().unpark_any();
    }

    pub(crate) fn task_pop(&self) -> Option<NonNull<Header>> {
        self.deque.pop().map(|task| task.0)
    }

    pub(crate) fn task_steal(&self) -> Steal<TaskRef> {
        self.deque.steal()
    }

    pub(crate) fn deque_is_empty(&self) -> bool {
        self.deque.is_empty()
    }

    // ===== submissions =====

    /// Submissions are bound to this worker, so wake it specifically.
    pub(crate) fn submit(&self, frame: NonNull<Header>) {
        self.inbox.push(TaskRef(frame));
        self.parker.unpark_one();
    }

    pub(crate) fn inbox_pop(&self) -> Option<NonNull<Header>> {
        self.inbox.pop().map(|task| task.0)
    }

    pub(crate) fn inbox_is_empty(&self) -> bool {
        self.inbox.is_empty()
    }

    // ===== stack segments =====

    pub(crate) fn current_stack(&self) -> NonNull<AsyncStack> {
        self.current.get()
    }

    /// Install `top` as the current segment (a stack eat at a sync point).
    /// The displaced segment returns to the pool if empty; a non-empty one
    /// still hosts suspended frames and is reclaimed when one of them is
    /// resumed.
    pub(crate) fn take_stack(&self, top: Option<NonNull<AsyncStack>>) {
        let Some(top) = top else { return };
        if top == self.current.get() {
            return;
        }

        trace!(worker = self.index, "taking ownership of a stack segment");
        let displaced = self.current.get();
        // Safety: we own the current segment until the swap below.
        if unsafe { displaced.as_ref() }.is_empty() {
            self.stacks.borrow_mut().push(displaced);
        }
        self.current.set(top);
    }

    /// Give up the current segment to whichever thread later resumes a frame
    /// living on it, and continue on a clean one.
    pub(crate) fn replace_current_stack(&self) {
        let fresh = self.stack_pop();
        self.current.set(fresh);
    }

    /// A clean segment from the pool; lazily allocated, never null.
    pub(crate) fn stack_pop(&self) -> NonNull<AsyncStack> {
        self.stacks
            .borrow_mut()
            .pop()
            .unwrap_or_else(|| into_raw(AsyncStack::new(self.stack_size)))
    }

    #[cfg(test)]
    pub(crate) fn pooled_stacks(&self) -> usize {
        self.stacks.borrow().len()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // Quiescent by now: no live frames, so every segment is either
        // pooled or current.
        // Safety: segments were leaked from boxes in `into_raw`.
        unsafe {
            for stack in self.stacks.get_mut().drain(..) {
                drop(Box::from_raw(stack.as_ptr()));
            }
            drop(Box::from_raw(self.current.get().as_ptr()));
        }
    }
}

impl Context {
    /// Pick a random victim other than ourselves.
    pub(crate) fn pick_victim<'a>(&self, contexts: &'a [Arc<Context>]) -> &'a Context {
        debug_assert!(contexts.len() > 1);
        let mut rng = self.rng.borrow_mut();
        loop {
            let victim = rng.usize(..contexts.len());
            if victim != self.index {
                return &contexts[victim];
            }
        }
    }
}

fn into_raw(stack: Box<AsyncStack>) -> NonNull<AsyncStack> {
    // Safety: `Box::into_raw` never returns null.
    unsafe { NonNull::new_unchecked(Box::into_raw(stack)) }
}
