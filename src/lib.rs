//! A continuation-stealing fork/join runtime over segmented cactus stacks.
//!
//! Programs express divide-and-conquer parallelism with three primitives:
//! *fork* (spawn a child and publish the parent's continuation), *call* (run
//! a child inline) and *join* (wait for every outstanding fork). Scheduling
//! is busy-leaves: a thief takes the *parent's* continuation while the
//! forking thread runs the child, so every busy worker is always executing a
//! leaf of the spawn tree.
//!
//! Coroutines are hand-compiled state machines (see [`Coroutine`]). Their
//! frames are bump-allocated on per-worker stack segments that travel
//! between workers as continuations are stolen and joined back.
//!
//! ```no_run
//! use saguaro::{BusyPool, Coroutine, Eventually, Sc, Step, sync_wait};
//!
//! struct Fib {
//!     n: u64,
//!     state: u8,
//!     a: Eventually<u64>,
//!     b: Eventually<u64>,
//! }
//!
//! impl Fib {
//!     fn new(n: u64) -> Fib {
//!         Fib { n, state: 0, a: Eventually::empty(), b: Eventually::empty() }
//!     }
//! }
//!
//! impl Coroutine for Fib {
//!     type Output = u64;
//!
//!     fn resume(&mut self, sc: &mut Sc<'_>) -> Step<u64> {
//!         loop {
//!             match self.state {
//!                 0 => {
//!                     if self.n < 2 {
//!                         return Step::Done(self.n);
//!                     }
//!                     self.state = 1;
//!                     // Safety: the slots live in this coroutine's state.
//!                     return Step::Pending(unsafe { sc.fork(&self.a, Fib::new(self.n - 1)) });
//!                 }
//!                 1 => {
//!                     self.state = 2;
//!                     return Step::Pending(unsafe { sc.call(&self.b, Fib::new(self.n - 2)) });
//!                 }
//!                 2 => {
//!                     self.state = 3;
//!                     if let Some(pending) = sc.join() {
//!                         return Step::Pending(pending);
//!                     }
//!                 }
//!                 _ => return Step::Done(self.a.take() + self.b.take()),
//!             }
//!         }
//!     }
//! }
//!
//! let pool = BusyPool::new(4);
//! assert_eq!(sync_wait(&pool, Fib::new(20)), 6765);
//! ```

mod coro;
mod frame;
mod stack;
mod sync_wait;
mod utils;

pub mod runtime;

#[cfg(test)]
mod test_utils;

pub use coro::{Coroutine, Pending, Sc, Step};
pub use frame::Eventually;
pub use runtime::{BusyPool, Config, LazyPool, RootHandle, Scheduler, UnitPool};
pub use sync_wait::sync_wait;
