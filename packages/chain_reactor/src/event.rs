//! Units of work queued on event chains and executed on the reactor thread.

use std::any::{Any, type_name};
use std::fmt;
use std::os::fd::RawFd;

use tracing::warn;

use crate::{Coroutine, EventChain, EventEngine};

/// The kind of readiness an event chain waits for.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum EventType {
    /// The bound handle has data to read (or the wake descriptor was signaled).
    #[default]
    Read,

    /// The bound handle can accept more data.
    Write,
}

/// A unit of work executed by the reactor thread when the chain holding it is drained.
///
/// An event is owned by the chain it is queued on until the dispatcher takes it out. The
/// dispatcher passes it by value to [`handle()`][Self::handle], after which it is dropped, so
/// an event can be handled at most once.
#[derive(Debug)]
#[non_exhaustive]
pub enum Event {
    /// Runs a shutdown callback. See [`StopEvent`].
    Stop(StopEvent),

    /// Resumes a suspended computation. See [`CoroutineEvent`].
    Coroutine(CoroutineEvent),

    /// Hands the ready socket to a protocol handler. See [`NetRecvEvent`].
    NetRecv(NetRecvEvent),
}

impl Event {
    /// Creates a [`StopEvent`] with the given callback.
    #[must_use]
    pub fn stop<F>(callback: F) -> Self
    where
        F: FnOnce(&dyn EventChain, &dyn EventEngine) + Send + 'static,
    {
        Self::Stop(StopEvent::new(callback))
    }

    /// Creates a [`CoroutineEvent`] that resumes `coroutine`.
    #[must_use]
    pub fn coroutine(coroutine: Coroutine) -> Self {
        Self::Coroutine(CoroutineEvent::new(coroutine))
    }

    /// Creates a [`NetRecvEvent`] with the given handler.
    #[must_use]
    pub fn net_recv<F>(handler: F) -> Self
    where
        F: FnOnce(RawFd) + Send + 'static,
    {
        Self::NetRecv(NetRecvEvent::new(handler))
    }

    /// Human-readable name of the event kind, for diagnostics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Stop(_) => "stop",
            Self::Coroutine(_) => "coroutine",
            Self::NetRecv(_) => "net-recv",
        }
    }

    /// Executes the event. `chain` is the chain the event was queued on.
    pub fn handle(self, chain: &dyn EventChain, engine: &dyn EventEngine) {
        match self {
            Self::Stop(event) => event.handle(chain, engine),
            Self::Coroutine(event) => event.handle(),
            Self::NetRecv(event) => event.handle(chain),
        }
    }
}

impl From<StopEvent> for Event {
    fn from(event: StopEvent) -> Self {
        Self::Stop(event)
    }
}

impl From<CoroutineEvent> for Event {
    fn from(event: CoroutineEvent) -> Self {
        Self::Coroutine(event)
    }
}

impl From<NetRecvEvent> for Event {
    fn from(event: NetRecvEvent) -> Self {
        Self::NetRecv(event)
    }
}

type StopCallback = Box<dyn FnOnce(&dyn EventChain, &dyn EventEngine) + Send>;

/// Invokes a callback with the chain it was queued on and the engine dispatching it.
///
/// The shutdown callback installed by [`Scheduler::stop()`][crate::Scheduler::stop]
/// acknowledges the wake descriptor, invalidates the wake chain and stops the engine.
pub struct StopEvent {
    callback: StopCallback,
}

impl StopEvent {
    /// Creates a stop event with the given callback.
    #[must_use]
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(&dyn EventChain, &dyn EventEngine) + Send + 'static,
    {
        Self {
            callback: Box::new(callback),
        }
    }

    fn handle(self, chain: &dyn EventChain, engine: &dyn EventEngine) {
        (self.callback)(chain, engine);
    }
}

impl fmt::Debug for StopEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>()).finish_non_exhaustive()
    }
}

/// Resumes exactly one suspended computation.
#[derive(Debug)]
pub struct CoroutineEvent {
    coroutine: Coroutine,
    context: Option<Box<dyn Any + Send>>,
}

impl CoroutineEvent {
    /// Creates an event that resumes `coroutine` with whatever its context slot holds.
    #[must_use]
    pub fn new(coroutine: Coroutine) -> Self {
        Self {
            coroutine,
            context: None,
        }
    }

    /// Creates an event that stores `value` in the context slot of `coroutine` right before
    /// resuming it, making `value` the result of the suspension point.
    #[must_use]
    pub fn with_context<T>(coroutine: Coroutine, value: T) -> Self
    where
        T: Any + Send,
    {
        Self {
            coroutine,
            context: Some(Box::new(value)),
        }
    }

    /// The coroutine this event resumes.
    #[must_use]
    pub fn coroutine(&self) -> &Coroutine {
        &self.coroutine
    }

    fn handle(self) {
        if let Some(value) = self.context {
            self.coroutine.set_context_boxed(value);
        }

        if let Err(error) = self.coroutine.notify() {
            warn!(%error, "dispatched coroutine event could not resume its coroutine");
        }
    }
}

/// Hands the bound socket of a ready chain to a protocol-layer handler.
///
/// This is the extension point for network protocol handling. The handler owns all reading
/// from the socket; since readiness is edge-triggered it must read until the socket would
/// block.
pub struct NetRecvEvent {
    handler: Box<dyn FnOnce(RawFd) + Send>,
}

impl NetRecvEvent {
    /// Creates an event with the given handler.
    #[must_use]
    pub fn new<F>(handler: F) -> Self
    where
        F: FnOnce(RawFd) + Send + 'static,
    {
        Self {
            handler: Box::new(handler),
        }
    }

    fn handle(self, chain: &dyn EventChain) {
        (self.handler)(chain.bind_socket());
    }
}

impl fmt::Debug for NetRecvEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>()).finish_non_exhaustive()
    }
}
