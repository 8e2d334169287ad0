use parking_lot::{Condvar, Mutex};

/// Binary signal a root frame releases at final suspend and `sync_wait`
/// blocks on.
#[derive(Debug, Default)]
pub(crate) struct Signal {
    done: Mutex<bool>,
    condvar: Condvar,
}

impl Signal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn release(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.condvar.notify_all();
    }

    pub(crate) fn acquire(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.condvar.wait(&mut done);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_release_before_acquire() {
        let signal = Signal::new();
        signal.release();
        signal.acquire();
    }

    #[test]
    fn test_acquire_blocks_until_release() {
        let signal = Arc::new(Signal::new());
        let released = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let handle = {
            let signal = Arc::clone(&signal);
            let released = Arc::clone(&released);
            thread::spawn(move || {
                signal.acquire();
                assert!(released.load(std::sync::atomic::Ordering::Acquire));
            })
        };

        thread::sleep(std::time::Duration::from_millis(10));
        released.store(true, std::sync::atomic::Ordering::Release);
        signal.release();
        handle.join().unwrap();
    }
}
