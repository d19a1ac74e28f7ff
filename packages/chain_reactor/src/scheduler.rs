//! The public façade over the event engine of the build target.

use std::num::NonZero;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::{AsyncExecutor, Coroutine, Event, EventChain, EventEngine, Result, pal};

const DEFAULT_MAX_EVENTS: NonZero<usize> = NonZero::new(1024).expect("1024 is not zero");

/// One reactor: a readiness-driven event loop plus the registration table of the event chains
/// it serves.
///
/// A scheduler is driven by exactly one thread, the one that calls
/// [`run_loop()`][Self::run_loop]. Every other method may be called from any thread, which is
/// how other threads post work to the reactor and how a coordinator asks it to stop. Share it
/// via `Arc`.
///
/// The scheduler is also an [`AsyncExecutor`]: a [`Suspend`][crate::Suspend] awaiter given an
/// `Arc<Scheduler>` parks its coroutine on the wake chain of this reactor, which resumes it on
/// the loop thread.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::thread;
/// use std::time::Duration;
///
/// use chain_reactor::{Event, Scheduler};
///
/// let scheduler = Arc::new(Scheduler::new());
///
/// let reactor = thread::spawn({
///     let scheduler = Arc::clone(&scheduler);
///     move || scheduler.run_loop(Some(Duration::from_millis(10)))
/// });
///
/// while !scheduler.is_running() {
///     thread::yield_now();
/// }
///
/// scheduler.post(Event::net_recv(|_wake_fd| println!("hello from the reactor")))?;
///
/// while !scheduler.stop() {
///     thread::yield_now();
/// }
///
/// assert!(reactor.join().unwrap());
/// # Ok::<(), chain_reactor::Error>(())
/// ```
#[derive(Debug)]
pub struct Scheduler {
    engine: Arc<dyn EventEngine>,
    stop_requested: AtomicBool,
}

impl Scheduler {
    /// Creates a scheduler with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates a builder for configuring a scheduler.
    #[must_use]
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }

    fn with_engine(engine: Arc<dyn EventEngine>) -> Self {
        Self {
            engine,
            stop_requested: AtomicBool::new(false),
        }
    }

    /// Runs the event loop on the calling thread until the scheduler is stopped.
    ///
    /// `timeout` bounds each individual readiness wait. `None` blocks until something happens,
    /// which is enough because stopping always wakes the loop.
    ///
    /// Returns `true` after a clean stop and `false` if the loop could not be started, in which
    /// case [`last_error()`][Self::last_error] describes why. A scheduler runs at most once.
    pub fn run_loop(&self, timeout: Option<Duration>) -> bool {
        debug!(?timeout, "starting event loop");
        self.engine.run_loop(timeout)
    }

    /// Whether the event loop is running and has not been asked to stop.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.engine.is_running()
    }

    /// Requests the event loop to stop.
    ///
    /// The request is queued on the wake chain, so work posted before it is still dispatched.
    /// The loop exits once the request has been handled.
    ///
    /// Returns `false` if the loop is not running yet or a stop was already requested. A
    /// coordinator that starts the loop on another thread typically retries until this
    /// returns `true`.
    pub fn stop(&self) -> bool {
        if !self.engine.is_running() {
            return false;
        }

        if self.stop_requested.swap(true, Ordering::AcqRel) {
            return false;
        }

        if let Err(error) = self.post(Event::stop(shut_down)) {
            warn!(%error, "failed to request event loop stop");
            self.stop_requested.store(false, Ordering::Release);
            return false;
        }

        true
    }

    /// Description of the most recent failure, or an empty string if the most recent operation
    /// succeeded.
    #[must_use]
    pub fn last_error(&self) -> String {
        self.engine.last_error()
    }

    /// Takes ownership of `chain` and registers its handle with the event loop.
    ///
    /// The loop must be running.
    ///
    /// # Errors
    ///
    /// Fails if the loop is not running, a chain is already registered for the same handle or
    /// the operating system rejects the registration. The chain is dropped on failure, which
    /// closes its handle.
    pub fn add_event_chain<C>(&self, chain: C) -> Result<()>
    where
        C: EventChain + 'static,
    {
        self.engine.add_event_chain(Box::new(chain))
    }

    /// Re-arms the registration of the chain bound to `fd`, picking up changes to its event
    /// type.
    ///
    /// # Errors
    ///
    /// Fails if no chain is registered for `fd` or the operating system rejects the update.
    pub fn modify_event_chain(&self, fd: RawFd) -> Result<()> {
        self.engine.modify_event_chain(fd)
    }

    /// Appends `event` to the registered chain bound to `fd`.
    ///
    /// The event is dispatched on the loop thread the next time the handle becomes ready, or
    /// as part of the ongoing drain if the chain is being drained right now.
    ///
    /// # Errors
    ///
    /// Fails if no chain is registered for `fd` or the chain rejects the event.
    pub fn add_event(&self, fd: RawFd, event: Event) -> Result<()> {
        self.engine.add_event(fd, event)
    }

    /// Unregisters the chain bound to `fd` and returns it. Dropping the last reference closes
    /// its handle.
    ///
    /// # Errors
    ///
    /// Fails if no chain is registered for `fd`.
    pub fn del_event_chain(&self, fd: RawFd) -> Result<Arc<dyn EventChain>> {
        self.engine.del_event_chain(fd)
    }

    /// Queues `event` on the wake chain and wakes the event loop to dispatch it.
    ///
    /// # Errors
    ///
    /// [`Error::NotRunning`][crate::Error::NotRunning] if the loop is not active.
    pub fn post(&self, event: Event) -> Result<()> {
        self.engine.add_active_event(event)?;
        self.engine.notify_active_event()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncExecutor for Scheduler {
    fn async_execute(&self, coroutine: Coroutine) -> bool {
        if !self.engine.is_running() {
            trace!("declining coroutine because the event loop is not running");
            return false;
        }

        if let Err(error) = self.engine.add_active_event(Event::coroutine(coroutine)) {
            debug!(%error, "declining coroutine that could not be queued");
            return false;
        }

        // Once queued, the coroutine is resumed by whatever wakes the loop next.
        if let Err(error) = self.engine.notify_active_event() {
            warn!(%error, "failed to wake event loop for queued coroutine");
        }

        true
    }
}

/// The stop callback queued by [`Scheduler::stop()`].
fn shut_down(chain: &dyn EventChain, engine: &dyn EventEngine) {
    if let Err(error) = engine.acknowledge_notification() {
        trace!(%error, "failed to acknowledge wake descriptor during stop");
    }

    chain.set_invalid();

    if !engine.stop() {
        debug!("event loop was already stopping");
    }
}

/// Builder for configuring a [`Scheduler`].
#[derive(Debug)]
#[must_use]
pub struct SchedulerBuilder {
    max_events: NonZero<usize>,
}

impl SchedulerBuilder {
    fn new() -> Self {
        Self {
            max_events: DEFAULT_MAX_EVENTS,
        }
    }

    /// Sets the maximum number of readiness notifications retrieved per poll.
    ///
    /// Default is 1024.
    pub fn max_events(mut self, max_events: NonZero<usize>) -> Self {
        self.max_events = max_events;
        self
    }

    /// Builds the scheduler with the configured settings, backed by the event engine of the
    /// build target.
    #[must_use]
    pub fn build(self) -> Scheduler {
        Scheduler::with_engine(pal::build_target_engine(self.max_events))
    }
}
