use std::cell::UnsafeCell;
use std::fmt;

/// One-shot slot connecting a child coroutine to the value its spawner is
/// waiting on.
///
/// The spawner keeps the slot in its own state, hands a pointer to the child
/// at fork/call, and reads the value back after the next join. The join
/// protocol is what makes this sound: the child's write happens-before the
/// spawner's read (release on the join counter, acquire on the winning
/// branch), and at most one of each ever happens.
pub struct Eventually<T> {
    slot: UnsafeCell<Option<T>>,
}

// Safety: writer (child) and reader (spawner) are ordered by the join
// protocol; the slot is never accessed concurrently.
unsafe impl<T: Send> Send for Eventually<T> {}
unsafe impl<T: Send> Sync for Eventually<T> {}

impl<T> Eventually<T> {
    pub fn empty() -> Self {
        Self {
            slot: UnsafeCell::new(None),
        }
    }

    /// Resolve the slot. Called by the child exactly once, before its final
    /// suspend.
    ///
    /// # Safety
    ///
    /// The caller must be the frame the slot was handed to at spawn, and the
    /// spawner must not have joined yet.
    pub(crate) unsafe fn set(&self, value: T) {
        // Safety: per the contract above nothing else is touching the slot.
        unsafe { *self.slot.get() = Some(value) };
    }

    /// Take the resolved value.
    ///
    /// # Panics
    ///
    /// Panics if the slot never resolved, which means it was read before the
    /// join that synchronizes with the writer.
    pub fn take(&mut self) -> T {
        self.slot
            .get_mut()
            .take()
            .expect("eventually read before it resolved")
    }

    pub fn is_resolved(&mut self) -> bool {
        self.slot.get_mut().is_some()
    }
}

impl<T> Default for Eventually<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> fmt::Debug for Eventually<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Eventually(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_then_take() {
        let mut slot = Eventually::empty();
        assert!(!slot.is_resolved());

        unsafe { slot.set(42u64) };
        assert!(slot.is_resolved());
        assert_eq!(slot.take(), 42);
        assert!(!slot.is_resolved());
    }

    #[test]
    #[should_panic(expected = "read before it resolved")]
    fn test_take_unresolved_panics() {
        let mut slot: Eventually<u64> = Eventually::empty();
        let _ = slot.take();
    }
}
