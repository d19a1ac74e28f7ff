#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))] // This is all test code, no need to test it.

//! Private helpers for tests, benchmarks and examples of the reactor packages.

use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// How long a test may run before the watchdog gives up on it.
const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs a test on a separate thread and panics if it does not finish within 10 seconds.
///
/// Reactor tests block on event loops and sockets, so a broken wake-up path shows up as a
/// hang. The watchdog turns that hang into a test failure instead of a stuck CI job.
///
/// When the `MUTATION_TESTING` environment variable is set to "1", the watchdog is disabled
/// and the test function is executed directly, so that mutation testing can detect hanging
/// mutations with its own timeout.
///
/// # Panics
///
/// Panics if the test exceeds the timeout. A panic inside the test is resumed on the calling
/// thread.
///
/// # Example
///
/// ```rust
/// use testing::with_watchdog;
///
/// let answer = with_watchdog(|| 6 * 7);
/// assert_eq!(answer, 42);
/// ```
pub fn with_watchdog<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if std::env::var("MUTATION_TESTING").as_deref() == Ok("1") {
        return test_fn();
    }

    let (tx, rx) = mpsc::channel();

    let test_thread = thread::spawn(move || {
        // If this fails, the watchdog has already given up on us.
        drop(tx.send(test_fn()));
    });

    match rx.recv_timeout(WATCHDOG_TIMEOUT) {
        Ok(result) => {
            test_thread.join().expect("test thread sent a result, so it cannot have panicked");
            result
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            panic!("test did not finish within {WATCHDOG_TIMEOUT:?}, assuming it hangs");
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => match test_thread.join() {
            Ok(()) => panic!("test thread exited without producing a result"),
            Err(payload) => std::panic::resume_unwind(payload),
        },
    }
}

/// Polls `condition` until it returns `true`.
///
/// For waiting on state changes that happen on a reactor thread, such as an event loop
/// becoming active or an event handler having run.
///
/// # Panics
///
/// Panics if `condition` is still `false` once `timeout` has elapsed.
pub fn wait_until<F>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    let started = Instant::now();

    while !condition() {
        assert!(
            started.elapsed() < timeout,
            "condition not satisfied within {timeout:?}"
        );

        thread::sleep(Duration::from_millis(1));
    }
}

/// Creates a connected pair of Unix domain sockets.
///
/// The first element is meant to be handed to an event chain, which takes ownership of it.
/// The second is the peer that the test writes to (to make the first one readable) or
/// reads from (to observe the first one being closed).
///
/// # Panics
///
/// Panics if the operating system cannot create the sockets.
#[must_use]
pub fn socket_pair() -> (OwnedFd, UnixStream) {
    let (socket, peer) = UnixStream::pair().expect("failed to create Unix socket pair");

    socket
        .set_nonblocking(true)
        .expect("failed to make socket non-blocking");

    (OwnedFd::from(socket), peer)
}
