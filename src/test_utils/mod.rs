//! Hand-compiled state machines for the scheduler test suite: the classic
//! fork/join microbenchmarks, plus panic/tracing plumbing.

use std::panic;
use std::sync::Once;

use crate::{Coroutine, Eventually, Sc, Step};

/// Suppress hook output for the deliberate panics the exception tests
/// raise; everything else still reaches the default hook.
pub(crate) fn quiet_panic_hook() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let default_hook = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let deliberate = info
                .payload()
                .downcast_ref::<&str>()
                .is_some_and(|msg| msg.contains("unlucky"));
            if !deliberate {
                default_hook(info);
            }
        }));
    });
}

pub(crate) fn init_tracing() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub(crate) fn sfib(n: u64) -> u64 {
    if n < 2 { n } else { sfib(n - 1) + sfib(n - 2) }
}

// ===== fib: fork + call + join =====

#[derive(Clone, Copy)]
enum FibState {
    Start,
    Forked,
    Called,
    Joined,
}

pub(crate) struct Fib {
    n: u64,
    state: FibState,
    a: Eventually<u64>,
    b: Eventually<u64>,
}

impl Fib {
    pub(crate) fn new(n: u64) -> Fib {
        Fib {
            n,
            state: FibState::Start,
            a: Eventually::empty(),
            b: Eventually::empty(),
        }
    }
}

impl Coroutine for Fib {
    type Output = u64;

    fn resume(&mut self, sc: &mut Sc<'_>) -> Step<u64> {
        loop {
            match self.state {
                FibState::Start => {
                    if self.n < 2 {
                        return Step::Done(self.n);
                    }
                    self.state = FibState::Forked;
                    // Safety: the slots live in this coroutine's state.
                    return Step::Pending(unsafe { sc.fork(&self.a, Fib::new(self.n - 1)) });
                }
                FibState::Forked => {
                    self.state = FibState::Called;
                    // Safety: as above.
                    return Step::Pending(unsafe { sc.call(&self.b, Fib::new(self.n - 2)) });
                }
                FibState::Called => {
                    self.state = FibState::Joined;
                    if let Some(pending) = sc.join() {
                        return Step::Pending(pending);
                    }
                }
                FibState::Joined => return Step::Done(self.a.take() + self.b.take()),
            }
        }
    }
}

// ===== call-only fib: the serial elision of Fib =====

pub(crate) struct CallFib {
    n: u64,
    state: FibState,
    a: Eventually<u64>,
    b: Eventually<u64>,
}

impl CallFib {
    pub(crate) fn new(n: u64) -> CallFib {
        CallFib {
            n,
            state: FibState::Start,
            a: Eventually::empty(),
            b: Eventually::empty(),
        }
    }
}

impl Coroutine for CallFib {
    type Output = u64;

    fn resume(&mut self, sc: &mut Sc<'_>) -> Step<u64> {
        loop {
            match self.state {
                FibState::Start => {
                    if self.n < 2 {
                        return Step::Done(self.n);
                    }
                    self.state = FibState::Forked;
                    // Safety: the slots live in this coroutine's state.
                    return Step::Pending(unsafe { sc.call(&self.a, CallFib::new(self.n - 1)) });
                }
                FibState::Forked => {
                    self.state = FibState::Called;
                    // Safety: as above.
                    return Step::Pending(unsafe { sc.invoke(&self.b, CallFib::new(self.n - 2)) });
                }
                FibState::Called => {
                    self.state = FibState::Joined;
                    if let Some(pending) = sc.join() {
                        return Step::Pending(pending);
                    }
                }
                FibState::Joined => return Step::Done(self.a.take() + self.b.take()),
            }
        }
    }
}

// ===== fib that panics at n == 7 =====

pub(crate) struct FibThrows {
    n: u64,
    state: FibState,
    a: Eventually<u64>,
    b: Eventually<u64>,
}

impl FibThrows {
    pub(crate) fn new(n: u64) -> FibThrows {
        FibThrows {
            n,
            state: FibState::Start,
            a: Eventually::empty(),
            b: Eventually::empty(),
        }
    }
}

impl Coroutine for FibThrows {
    type Output = u64;

    fn resume(&mut self, sc: &mut Sc<'_>) -> Step<u64> {
        loop {
            match self.state {
                FibState::Start => {
                    if self.n == 7 {
                        panic!("7 is unlucky");
                    }
                    if self.n < 2 {
                        return Step::Done(self.n);
                    }
                    self.state = FibState::Forked;
                    // Safety: the slots live in this coroutine's state.
                    return Step::Pending(unsafe { sc.fork(&self.a, FibThrows::new(self.n - 1)) });
                }
                FibState::Forked => {
                    self.state = FibState::Called;
                    // Safety: as above.
                    return Step::Pending(unsafe { sc.call(&self.b, FibThrows::new(self.n - 2)) });
                }
                FibState::Called => {
                    self.state = FibState::Joined;
                    if let Some(pending) = sc.join() {
                        return Step::Pending(pending);
                    }
                }
                FibState::Joined => return Step::Done(self.a.take() + self.b.take()),
            }
        }
    }
}

// ===== fib that catches its own fault, stashes it, and still joins =====

pub(crate) struct FibStash {
    n: u64,
    state: FibState,
    a: Eventually<u64>,
    b: Eventually<u64>,
}

impl FibStash {
    pub(crate) fn new(n: u64) -> FibStash {
        FibStash {
            n,
            state: FibState::Start,
            a: Eventually::empty(),
            b: Eventually::empty(),
        }
    }
}

impl Coroutine for FibStash {
    type Output = u64;

    fn resume(&mut self, sc: &mut Sc<'_>) -> Step<u64> {
        loop {
            match self.state {
                FibState::Start => {
                    if self.n == 7 {
                        // Catch locally and keep going; the fault resurfaces
                        // at the join below, after both subtrees ran.
                        let fault = panic::catch_unwind(|| panic!("7 is unlucky")).unwrap_err();
                        sc.stash_exception(fault);
                    }
                    if self.n < 2 {
                        return Step::Done(self.n);
                    }
                    self.state = FibState::Forked;
                    // Safety: the slots live in this coroutine's state.
                    return Step::Pending(unsafe { sc.fork(&self.a, FibStash::new(self.n - 1)) });
                }
                FibState::Forked => {
                    self.state = FibState::Called;
                    // Safety: as above.
                    return Step::Pending(unsafe { sc.call(&self.b, FibStash::new(self.n - 2)) });
                }
                FibState::Called => {
                    self.state = FibState::Joined;
                    if let Some(pending) = sc.join() {
                        return Step::Pending(pending);
                    }
                }
                FibState::Joined => return Step::Done(self.a.take() + self.b.take()),
            }
        }
    }
}

// ===== parallel reduce =====

#[derive(Clone, Copy)]
enum SplitState {
    Split,
    ForkedLeft,
    CalledRight,
    Joined,
}

pub(crate) struct Reduce<'a> {
    data: &'a [f64],
    grain: usize,
    state: SplitState,
    left: Eventually<f64>,
    right: Eventually<f64>,
}

impl<'a> Reduce<'a> {
    pub(crate) fn new(data: &'a [f64], grain: usize) -> Reduce<'a> {
        Reduce {
            data,
            grain,
            state: SplitState::Split,
            left: Eventually::empty(),
            right: Eventually::empty(),
        }
    }

    fn mid(&self) -> usize {
        self.data.len() / 2
    }
}

impl Coroutine for Reduce<'_> {
    type Output = f64;

    fn resume(&mut self, sc: &mut Sc<'_>) -> Step<f64> {
        loop {
            match self.state {
                SplitState::Split => {
                    if self.data.len() <= self.grain {
                        return Step::Done(self.data.iter().sum());
                    }
                    self.state = SplitState::ForkedLeft;
                    let half = &self.data[..self.mid()];
                    // Safety: the slots live in this coroutine's state; the
                    // data outlives the root per `sync_wait`.
                    return Step::Pending(unsafe {
                        sc.fork(&self.left, Reduce::new(half, self.grain))
                    });
                }
                SplitState::ForkedLeft => {
                    self.state = SplitState::CalledRight;
                    let half = &self.data[self.mid()..];
                    // Safety: as above.
                    return Step::Pending(unsafe {
                        sc.call(&self.right, Reduce::new(half, self.grain))
                    });
                }
                SplitState::CalledRight => {
                    self.state = SplitState::Joined;
                    if let Some(pending) = sc.join() {
                        return Step::Pending(pending);
                    }
                }
                SplitState::Joined => return Step::Done(self.left.take() + self.right.take()),
            }
        }
    }
}

// ===== adaptive integration of sin =====

pub(crate) struct Integrate {
    x1: f64,
    y1: f64,
    x2: f64,
    y2: f64,
    area: f64,
    eps: f64,
    state: SplitState,
    left: Eventually<f64>,
    right: Eventually<f64>,
}

impl Integrate {
    pub(crate) fn sin(x1: f64, x2: f64, eps: f64) -> Integrate {
        Integrate::interval(x1, x1.sin(), x2, x2.sin(), 0.0, eps)
    }

    fn interval(x1: f64, y1: f64, x2: f64, y2: f64, area: f64, eps: f64) -> Integrate {
        Integrate {
            x1,
            y1,
            x2,
            y2,
            area,
            eps,
            state: SplitState::Split,
            left: Eventually::empty(),
            right: Eventually::empty(),
        }
    }

    fn split(&self) -> (Integrate, Integrate) {
        let half = (self.x2 - self.x1) / 2.0;
        let x0 = self.x1 + half;
        let y0 = x0.sin();
        let area_left = (self.y1 + y0) / 2.0 * half;
        let area_right = (y0 + self.y2) / 2.0 * half;
        (
            Integrate::interval(self.x1, self.y1, x0, y0, area_left, self.eps),
            Integrate::interval(x0, y0, self.x2, self.y2, area_right, self.eps),
        )
    }
}

impl Coroutine for Integrate {
    type Output = f64;

    fn resume(&mut self, sc: &mut Sc<'_>) -> Step<f64> {
        loop {
            match self.state {
                SplitState::Split => {
                    let (left, right) = self.split();
                    let refined = left.area + right.area;
                    if (refined - self.area).abs() < self.eps {
                        return Step::Done(refined);
                    }
                    self.state = SplitState::ForkedLeft;
                    // Safety: the slots live in this coroutine's state.
                    return Step::Pending(unsafe { sc.fork(&self.left, left) });
                }
                SplitState::ForkedLeft => {
                    self.state = SplitState::CalledRight;
                    let (_, right) = self.split();
                    // Safety: as above.
                    return Step::Pending(unsafe { sc.call(&self.right, right) });
                }
                SplitState::CalledRight => {
                    self.state = SplitState::Joined;
                    if let Some(pending) = sc.join() {
                        return Step::Pending(pending);
                    }
                }
                SplitState::Joined => return Step::Done(self.left.take() + self.right.take()),
            }
        }
    }
}
