//! Countdown gate that lets one thread wait for a fixed number of others to finish.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A countdown synchronization gate letting a coordinating thread wait for N worker threads
/// to signal completion.
///
/// The typical use is to construct it with the number of reactor threads, have each thread
/// call [`decrease()`][Self::decrease] after its `run_loop()` returns and have the coordinator
/// [`wait()`][Self::wait] for all of them after requesting a stop.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::thread;
/// use std::time::Duration;
///
/// use chain_reactor::ShutdownLatch;
///
/// let latch = Arc::new(ShutdownLatch::new(2));
///
/// for _ in 0..2 {
///     let latch = Arc::clone(&latch);
///     thread::spawn(move || latch.decrease());
/// }
///
/// assert!(latch.wait(Some(Duration::from_secs(5))));
/// ```
#[derive(Debug)]
pub struct ShutdownLatch {
    // Signed because decreasing past zero is permitted.
    count: Mutex<i64>,
    reached_zero: Condvar,
}

impl ShutdownLatch {
    /// Creates a latch that opens after `expected_completions` calls to
    /// [`decrease()`][Self::decrease].
    #[must_use]
    pub fn new(expected_completions: u32) -> Self {
        Self {
            count: Mutex::new(i64::from(expected_completions)),
            reached_zero: Condvar::new(),
        }
    }

    /// Records one completion.
    ///
    /// Waiters are woken only by the transition to zero. Decreasing an already open latch
    /// keeps counting into negative values without waking anyone.
    pub fn decrease(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);

        if *count == 0 {
            self.reached_zero.notify_all();
        }
    }

    /// The number of completions still outstanding. Negative after excess decreases.
    #[must_use]
    pub fn count(&self) -> i64 {
        *self.count.lock()
    }

    /// Waits for the count to reach zero.
    ///
    /// Returns `true` immediately if the count is already at or below zero. With `None`, blocks
    /// until the count reaches zero. With a timeout, returns `true` only if the count is exactly
    /// zero when the wait ends, `false` on timeout.
    #[must_use]
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut count = self.count.lock();

        if *count <= 0 {
            return true;
        }

        let Some(timeout) = timeout else {
            while *count > 0 {
                self.reached_zero.wait(&mut count);
            }

            return true;
        };

        // An overflowing deadline is as good as waiting forever.
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            drop(count);
            return self.wait(None);
        };

        while *count != 0 {
            if self
                .reached_zero
                .wait_until(&mut count, deadline)
                .timed_out()
            {
                break;
            }
        }

        *count == 0
    }
}
