//! The scheduler: worker contexts, the Chase–Lev deque, the busy and lazy
//! thread pools, and the single-threaded unit pool.

use std::ptr::NonNull;

use anyhow::{Result, bail};

use crate::frame::header::Header;

pub(crate) mod context;
pub(crate) use context::Context;

pub(crate) mod deque;

pub(crate) mod shared;

pub(crate) mod worker;

mod pool;
pub use pool::{BusyPool, LazyPool};

mod unit;
pub use unit::UnitPool;


/// Opaque continuation handle: representation-equal to a frame pointer,
/// which is what the queues trade in.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct TaskRef(pub(crate) NonNull<Header>);

// Safety: the handle is just an address; frame access is governed by the
// ownership protocol.
unsafe impl Send for TaskRef {}

/// A heap-allocated root frame on its way into a scheduler.
pub struct RootHandle(TaskRef);

// Safety: the root frame is owned by whoever holds the handle.
unsafe impl Send for RootHandle {}

impl RootHandle {
    pub(crate) fn new(frame: NonNull<Header>) -> RootHandle {
        RootHandle(TaskRef(frame))
    }

    pub(crate) fn into_raw(self) -> NonNull<Header> {
        self.0.0
    }
}

/// Entry point the sync-wait driver hands root frames to.
pub trait Scheduler {
    /// Enqueue a root frame onto some worker's submission inbox.
    fn schedule(&self, root: RootHandle);
}

/// Pool tuning knobs, builder style.
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) workers: usize,
    pub(crate) stack_size: usize,
    pub(crate) deque_capacity: usize,
    pub(crate) steal_retries: usize,
    pub(crate) thread_name: String,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            workers: std::thread::available_parallelism()
                .map(Into::into)
                .unwrap_or(1),
            stack_size: 256 * 1024,
            deque_capacity: 64,
            steal_retries: 32,
            thread_name: "saguaro".to_string(),
        }
    }
}

impl Config {
    pub fn new() -> Config {
        Config::default()
    }

    pub fn workers(mut self, workers: usize) -> Config {
        self.workers = workers;
        self
    }

    /// Bytes per cactus-stack segment.
    pub fn stack_size(mut self, bytes: usize) -> Config {
        self.stack_size = bytes;
        self
    }

    /// Initial per-worker deque capacity; the deque doubles on overflow.
    pub fn deque_capacity(mut self, capacity: usize) -> Config {
        self.deque_capacity = capacity;
        self
    }

    /// Victim attempts per steal round before a worker parks (lazy) or
    /// loops (busy).
    pub fn steal_retries(mut self, retries: usize) -> Config {
        self.steal_retries = retries;
        self
    }

    pub fn thread_name(mut self, name: impl Into<String>) -> Config {
        self.thread_name = name.into();
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("pool needs at least one worker");
        }
        if !self.deque_capacity.is_power_of_two() {
            bail!("deque capacity must be a power of two");
        }
        if self.stack_size < 4096 {
            bail!("stack segments below 4 KiB cannot hold a frame chain");
        }
        Ok(())
    }
}
