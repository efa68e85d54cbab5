use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Counts live workers and lets a thread block until the count drops to zero.
#[derive(Debug, Default)]
pub(crate) struct WaitGroup {
    count: Mutex<usize>,
    zero: Condvar,
}

impl WaitGroup {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, n: usize) {
        *self.count.lock() += n;
    }

    #[track_caller]
    pub(crate) fn done(&self) {
        let mut count = self.count.lock();
        debug_assert!(*count > 0, "WaitGroup::done called more times than add");
        *count = count.saturating_sub(1);

        if *count == 0 {
            self.zero.notify_all();
        }
    }

    pub(crate) fn count(&self) -> usize {
        *self.count.lock()
    }

    pub(crate) fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.zero.wait(&mut count);
        }
    }

    /// Returns `false` if the count was still above zero when `timeout` elapsed.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();

        while *count > 0 {
            if self.zero.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }

        true
    }
}
