use std::ptr::NonNull;
use std::sync::Arc;

use tracing::trace;

use crate::frame::header::{Header, Transfer};
use crate::runtime::context::Context;
use crate::runtime::deque::Steal;

#[derive(Debug, Clone, Copy)]
pub(crate) enum Flavor {
    /// Idle workers spin over their victims. Lowest latency, burns cores.
    Busy,
    /// Idle workers park after a dry round and are woken by pushes and
    /// submissions.
    Lazy,
}

/// One worker thread of a pool, looping: drain submissions, pop the local
/// deque, then go thieving.
pub(crate) struct Worker {
    ctx: Arc<Context>,
    flavor: Flavor,
    steal_retries: usize,
}

impl Worker {
    pub(crate) fn new(ctx: Arc<Context>, flavor: Flavor, steal_retries: usize) -> Worker {
        Worker {
            ctx,
            flavor,
            steal_retries,
        }
    }

    pub(crate) fn run(&self) {
        let shared = self.ctx.shared();
        loop {
            if shared.is_shutdown() {
                trace!(worker = self.ctx.index(), "worker shutting down");
                return;
            }

            // Leftover continuations of our own chains come first: a
            // submitted frame must start on an empty deque, or its
            // final-suspend pop could hand it an unrelated ancestor instead
            // of its parent.
            if let Some(frame) = self.ctx.task_pop() {
                // Taking a continuation out of our own deque counts as a
                // steal: the final-suspend pop that would have matched it is
                // going to miss.
                // Safety: the pop made us the owner.
                unsafe { frame.as_ref() }.add_steal();
                run_chain(&self.ctx, frame);
                continue;
            }

            if let Some(frame) = self.ctx.inbox_pop() {
                resume_submitted(&self.ctx, frame);
                continue;
            }

            if let Some(frame) = self.steal_round() {
                run_chain(&self.ctx, frame);
                continue;
            }

            match self.flavor {
                Flavor::Busy => std::hint::spin_loop(),
                Flavor::Lazy => self.park(),
            }
        }
    }

    /// Try random victims until one yields a continuation or the round goes
    /// dry. Contended (`Retry`) attempts count against the budget like
    /// misses.
    fn steal_round(&self) -> Option<NonNull<Header>> {
        let shared = self.ctx.shared();
        let contexts = shared.contexts();
        if contexts.len() <= 1 {
            return None;
        }

        for _ in 0..self.steal_retries {
            let victim = self.ctx.pick_victim(contexts);
            match victim.task_steal() {
                Steal::Success(task) => {
                    trace!(
                        worker = self.ctx.index(),
                        victim = victim.index(),
                        "stole a continuation"
                    );
                    // Cascading activation: the victim still has work, so
                    // give a parked sibling a chance at it.
                    if !victim.deque_is_empty() {
                        shared.unpark_any();
                    }
                    // Safety: the CAS made us the owner.
                    unsafe { task.0.as_ref() }.add_steal();
                    return Some(task.0);
                }
                Steal::Retry | Steal::Empty => std::hint::spin_loop(),
            }
        }
        None
    }

    fn park(&self) {
        let shared = self.ctx.shared();
        self.ctx.parker().park(|| {
            shared.is_shutdown()
                || !self.ctx.inbox_is_empty()
                || shared.contexts().iter().any(|c| !c.deque_is_empty())
        });
    }
}

/// Resume a frame that arrived through the inbox. Migrating coroutines
/// travel with their stack segment; install it before running. The caller's
/// deque must be empty.
pub(crate) fn resume_submitted(ctx: &Context, frame: NonNull<Header>) {
    debug_assert!(ctx.deque_is_empty());
    // Safety: the inbox pop made us the owner.
    ctx.take_stack(unsafe { frame.as_ref() }.top);
    run_chain(ctx, frame);
}

/// The bounce loop: follow symmetric transfers until the chain runs out of
/// work.
pub(crate) fn run_chain(ctx: &Context, frame: NonNull<Header>) {
    let mut next = Transfer::Resume(frame);
    while let Transfer::Resume(frame) = next {
        // Safety: each transfer hands us the only live handle.
        next = unsafe { Header::resume(frame, ctx) };
    }
}
