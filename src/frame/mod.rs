//! Frames: the control block co-located with every coroutine, its vtable'd
//! layout, and the harness that executes the suspension protocol.
//!
//! Rules the rest of the crate relies on:
//!
//! 1. A frame has exactly one owner at any time: the thread holding its only
//!    live handle (running it, or having taken it off a queue).
//! 2. Ownership moves through three synchronized channels only: the deque
//!    (push-release / steal-acquire), the join counter (sub-release /
//!    fence-acquire), and the submission inbox.
//! 3. Every frame is destroyed exactly once, at its final suspend.
//! 4. A child's write to its result slot happens-before the spawner's read
//!    after join; the last child's release decrement paired with the
//!    winner's acquire fence is the edge.

mod eventually;
pub use eventually::Eventually;

pub(crate) mod harness;
pub(crate) mod header;
pub(crate) mod layout;
