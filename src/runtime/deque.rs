use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicIsize, AtomicPtr, Ordering, fence};

use crossbeam_utils::CachePadded;

/// Chase–Lev work-stealing deque of `Copy` handles.
///
/// The owning worker pushes and pops at the bottom; any thread steals from
/// the top with a CAS. Grows by doubling when full, so pushes never fail;
/// replaced buffers are parked until the deque drops so an in-flight stealer
/// never reads freed memory.
///
/// Based on Chase & Lev, "Dynamic Circular Work-Stealing Deque" (2005), with
/// the acquire/release orderings of the deque literature: bottom is
/// published with a release fence, top is CAS-advanced sequentially
/// consistent.
pub(crate) struct Deque<T> {
    /// Owner end.
    bottom: CachePadded<AtomicIsize>,

    /// Thief end.
    top: CachePadded<AtomicIsize>,

    buffer: AtomicPtr<Buffer<T>>,

    /// Buffers retired by growth; owner-only until drop.
    retired: UnsafeCell<Vec<NonNull<Buffer<T>>>>,
}

// Safety: the single-owner push/pop contract plus atomics on the shared
// indices; `retired` is touched only by the owner and at drop (exclusive).
unsafe impl<T: Send> Send for Deque<T> {}
unsafe impl<T: Send> Sync for Deque<T> {}

/// Outcome of a steal attempt. `Retry` is contention, not emptiness, and
/// must be retried by the stealer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Steal<T> {
    Empty,
    Retry,
    Success(T),
}

// Keep the combinators even where the worker matches directly.
#[allow(dead_code)]
impl<T> Steal<T> {
    pub(crate) fn success(self) -> Option<T> {
        match self {
            Steal::Success(value) => Some(value),
            _ => None,
        }
    }

    pub(crate) fn is_retry(&self) -> bool {
        matches!(self, Steal::Retry)
    }
}

impl<T: Copy> Deque<T> {
    pub(crate) fn new(capacity: usize) -> Deque<T> {
        assert!(capacity.is_power_of_two(), "deque capacity must be a power of two");
        Deque {
            bottom: CachePadded::new(AtomicIsize::new(0)),
            top: CachePadded::new(AtomicIsize::new(0)),
            buffer: AtomicPtr::new(Buffer::alloc(capacity).as_ptr()),
            retired: UnsafeCell::new(Vec::new()),
        }
    }

    /// Publish `value` at the bottom. Owner only.
    pub(crate) fn push(&self, value: T) {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);
        let mut buffer = self.buffer.load(Ordering::Relaxed);

        // Safety: the owner is the only thread that replaces the buffer.
        unsafe {
            if b - t >= (*buffer).cap as isize {
                buffer = self.grow(buffer, b, t);
            }
            (*buffer).put(b, value);
        }

        fence(Ordering::Release);
        self.bottom.store(b + 1, Ordering::Relaxed);
    }

    /// Take from the bottom. Owner only; races stealers on the last element.
    pub(crate) fn pop(&self) -> Option<T> {
        let b = self.bottom.load(Ordering::Relaxed) - 1;
        let buffer = self.buffer.load(Ordering::Relaxed);
        self.bottom.store(b, Ordering::Relaxed);
        fence(Ordering::SeqCst);

        let t = self.top.load(Ordering::Relaxed);

        if t > b {
            // Already empty; restore.
            self.bottom.store(b + 1, Ordering::Relaxed);
            return None;
        }

        // Safety: in-bounds slot, published by our own earlier push.
        let value = unsafe { (*buffer).get(b) };

        if t == b {
            // Last element: the classical one-element race with thieves.
            let won = self
                .top
                .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok();
            self.bottom.store(b + 1, Ordering::Relaxed);
            return won.then_some(value);
        }

        Some(value)
    }

    /// Steal from the top. Any thread.
    pub(crate) fn steal(&self) -> Steal<T> {
        let t = self.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let b = self.bottom.load(Ordering::Acquire);

        if t >= b {
            return Steal::Empty;
        }

        // Safety: the buffer pointer read here is either current or retired;
        // retired buffers stay allocated until the deque drops, and the slot
        // content is validated by the CAS below.
        let buffer = self.buffer.load(Ordering::Acquire);
        let value = unsafe { (*buffer).get(t) };

        if self
            .top
            .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            Steal::Success(value)
        } else {
            Steal::Retry
        }
    }

    /// Approximate; exact only for the owner.
    pub(crate) fn is_empty(&self) -> bool {
        let t = self.top.load(Ordering::Relaxed);
        let b = self.bottom.load(Ordering::Relaxed);
        b <= t
    }

    #[allow(dead_code)]
    pub(crate) fn len(&self) -> usize {
        let t = self.top.load(Ordering::Relaxed);
        let b = self.bottom.load(Ordering::Relaxed);
        (b - t).max(0) as usize
    }

    /// Double the buffer, parking the old one. Owner only.
    unsafe fn grow(&self, old: *mut Buffer<T>, b: isize, t: isize) -> *mut Buffer<T> {
        // Safety (fn): caller is the owner; `old` is the current buffer.
        let new = unsafe {
            let new = Buffer::alloc((*old).cap * 2);
            for i in t..b {
                new.as_ref().put(i, (*old).get(i));
            }
            new
        };

        self.buffer.store(new.as_ptr(), Ordering::Release);
        // Safety: owner-only vec.
        unsafe {
            (*self.retired.get()).push(NonNull::new_unchecked(old));
        }
        new.as_ptr()
    }
}

impl<T> Drop for Deque<T> {
    fn drop(&mut self) {
        // Exclusive access: workers have quiesced by the time a deque drops.
        // Handles are `Copy`, so only the buffers need freeing.
        unsafe {
            drop(Box::from_raw(self.buffer.load(Ordering::Relaxed)));
            for buffer in self.retired.get_mut().drain(..) {
                drop(Box::from_raw(buffer.as_ptr()));
            }
        }
    }
}

struct Buffer<T> {
    cap: usize,
    data: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

impl<T: Copy> Buffer<T> {
    fn alloc(cap: usize) -> NonNull<Buffer<T>> {
        let data = (0..cap)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();
        // Safety: `Box::into_raw` never returns null.
        unsafe { NonNull::new_unchecked(Box::into_raw(Box::new(Buffer { cap, data }))) }
    }

    unsafe fn get(&self, index: isize) -> T {
        let slot = &self.data[index as usize & (self.cap - 1)];
        // Safety: caller proves the slot was initialized by a prior put.
        unsafe { (*slot.get()).assume_init() }
    }

    unsafe fn put(&self, index: isize, value: T) {
        let slot = &self.data[index as usize & (self.cap - 1)];
        // Safety: caller is the owner; publication is ordered by the caller.
        unsafe { (*slot.get()).write(value) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_lifo_for_owner_fifo_for_thieves() {
        let deque = Deque::new(8);
        for i in 0..4usize {
            deque.push(i);
        }

        assert_eq!(deque.pop(), Some(3));
        assert_eq!(deque.steal().success(), Some(0));
        assert_eq!(deque.steal().success(), Some(1));
        assert_eq!(deque.pop(), Some(2));
        assert_eq!(deque.pop(), None);
        assert_eq!(deque.steal(), Steal::Empty);
    }

    #[test]
    fn test_growth_past_initial_capacity() {
        let deque = Deque::new(2);
        for i in 0..100usize {
            deque.push(i);
        }
        assert_eq!(deque.len(), 100);

        for i in (0..100).rev() {
            assert_eq!(deque.pop(), Some(i));
        }
        assert!(deque.is_empty());
    }

    #[test]
    fn test_each_element_taken_exactly_once() {
        const ELEMENTS: usize = 10_000;
        const THIEVES: usize = 4;

        let deque = Arc::new(Deque::new(64));
        let taken = Arc::new(AtomicUsize::new(0));

        let thieves: Vec<_> = (0..THIEVES)
            .map(|_| {
                let deque = Arc::clone(&deque);
                let taken = Arc::clone(&taken);
                thread::spawn(move || {
                    let mut sum = 0usize;
                    while taken.load(Ordering::Relaxed) < ELEMENTS {
                        match deque.steal() {
                            Steal::Success(v) => {
                                sum += v;
                                taken.fetch_add(1, Ordering::Relaxed);
                            }
                            Steal::Retry | Steal::Empty => std::hint::spin_loop(),
                        }
                    }
                    sum
                })
            })
            .collect();

        let mut owner_sum = 0usize;
        for i in 0..ELEMENTS {
            deque.push(i);
            // Interleave pops to exercise the one-element race.
            if i % 3 == 0
                && let Some(v) = deque.pop()
            {
                owner_sum += v;
                taken.fetch_add(1, Ordering::Relaxed);
            }
        }
        while taken.load(Ordering::Relaxed) < ELEMENTS {
            if let Some(v) = deque.pop() {
                owner_sum += v;
                taken.fetch_add(1, Ordering::Relaxed);
            }
        }

        let stolen_sum: usize = thieves.into_iter().map(|t| t.join().unwrap()).sum();
        assert_eq!(owner_sum + stolen_sum, (0..ELEMENTS).sum());
    }
}
