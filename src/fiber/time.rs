use std::cell::Cell;
use std::time::Duration;
use std::time::Instant;

/// A clock cached per dispatcher loop iteration.
///
/// All fibers of one dispatcher read time through this without a syscall per
/// read; the dispatcher refreshes it once at the top of every loop.
pub struct Timestamp {
    now: Cell<Instant>,
}

impl Timestamp {
    pub(crate) fn new() -> Self {
        Self {
            now: Cell::new(Instant::now()),
        }
    }

    pub(crate) fn refresh(&self) {
        self.now.set(Instant::now());
    }

    pub fn now(&self) -> Instant {
        self.now.get()
    }

    pub fn elapsed_since(&self, earlier: Instant) -> Duration {
        self.now.get().saturating_duration_since(earlier)
    }
}
