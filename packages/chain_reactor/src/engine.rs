//! The readiness-driven dispatch loop abstraction.

use std::fmt::Debug;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use crate::{Event, EventChain, Result};

/// A readiness-notification engine that owns a registration table of [`EventChain`]s keyed by
/// OS handle and drains each chain on the loop thread when its handle becomes ready.
///
/// Every engine has a private wake chain bound to a wake descriptor. Events posted through
/// [`add_active_event()`][Self::add_active_event] are queued there and the wake descriptor is
/// signaled so the loop thread dispatches them promptly.
///
/// Events are only ever handled on the thread executing [`run_loop()`][Self::run_loop]. Handlers
/// receive the engine by reference and may call any method on it, including registering or
/// unregistering chains.
pub trait EventEngine: Debug + Send + Sync {
    /// Sets up the OS resources of the engine and runs the dispatch loop on the calling thread
    /// until [`stop()`][Self::stop] takes effect.
    ///
    /// `timeout` bounds each individual readiness wait; `None` blocks until something happens.
    /// The timeout does not bound the lifetime of the loop.
    ///
    /// Returns `true` after a clean stop. Returns `false` if setup failed or the loop was
    /// already started before, with the reason available from
    /// [`last_error()`][Self::last_error]. OS resources are released before returning in
    /// either case.
    fn run_loop(&self, timeout: Option<Duration>) -> bool;

    /// Whether the dispatch loop is executing and has not been asked to stop.
    fn is_running(&self) -> bool;

    /// Asks the dispatch loop to exit after the current iteration.
    ///
    /// Returns `true` if this call moved a running loop into the stopping state.
    fn stop(&self) -> bool;

    /// Description of the most recent failure, or an empty string after a subsequent success.
    fn last_error(&self) -> String;

    /// Queues an event on the wake chain. Pair with
    /// [`notify_active_event()`][Self::notify_active_event] to wake the loop.
    ///
    /// Callable from any thread.
    ///
    /// # Errors
    ///
    /// [`Error::NotRunning`][crate::Error::NotRunning] if no wake chain exists because the
    /// loop is not active.
    fn add_active_event(&self, event: Event) -> Result<()>;

    /// Signals the wake descriptor without queueing anything.
    ///
    /// # Errors
    ///
    /// Fails if the loop is not active or the wake descriptor cannot be written.
    fn notify_active_event(&self) -> Result<()>;

    /// Drains pending signals from the wake descriptor.
    ///
    /// The dispatch loop does this itself before draining the wake chain, so callers only need
    /// it when consuming the descriptor outside of the loop.
    ///
    /// # Errors
    ///
    /// Fails if the loop is not active or the wake descriptor cannot be read.
    fn acknowledge_notification(&self) -> Result<()>;

    /// Takes ownership of a chain and registers its handle for readiness of the chain's
    /// [`EventType`][crate::EventType].
    ///
    /// # Errors
    ///
    /// Fails if the loop is not running, a chain is already registered for the same handle or
    /// the OS rejects the registration. The chain is dropped on failure, closing its handle.
    fn add_event_chain(&self, chain: Box<dyn EventChain>) -> Result<()>;

    /// Appends an event to the registered chain bound to `fd`.
    ///
    /// The event is dispatched the next time the handle becomes ready. If the chain is being
    /// drained at the time of the call, the event joins the ongoing drain instead.
    ///
    /// # Errors
    ///
    /// Fails if no chain is registered for `fd` or the chain rejects the event.
    fn add_event(&self, fd: RawFd, event: Event) -> Result<()>;

    /// Re-arms the OS registration of an already registered chain, updating it to the chain's
    /// current event type.
    ///
    /// # Errors
    ///
    /// Fails if no chain is registered for `fd` or the OS rejects the update.
    fn modify_event_chain(&self, fd: RawFd) -> Result<()>;

    /// Unregisters a chain and hands it back to the caller.
    ///
    /// The loop thread shares the chain while draining it, so a chain unregistered during its
    /// own drain is only destroyed once both references are gone.
    ///
    /// # Errors
    ///
    /// Fails if no chain is registered for `fd`. An OS failure to remove the registration is
    /// logged and recorded but the chain is still removed from the table.
    fn del_event_chain(&self, fd: RawFd) -> Result<Arc<dyn EventChain>>;
}
