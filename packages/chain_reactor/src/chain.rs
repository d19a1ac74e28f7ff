//! Ordered queues of events bound to one OS handle.

use std::any::type_name;
use std::collections::VecDeque;
use std::fmt::{self, Debug};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::warn;

use crate::{Coroutine, CoroutineEvent, Error, Event, EventType, Result};

/// A queue of pending [`Event`]s bound to exactly one OS handle, which is the key the chain is
/// registered under in an event engine.
///
/// The chain owns its handle: dropping the chain closes the handle and drops any events still
/// queued on it.
///
/// All operations take `&self` because the wake chain of an engine is appended to from
/// arbitrary threads while the loop thread drains it.
pub trait EventChain: Debug + Send + Sync {
    /// Queues an event at the back of the chain.
    ///
    /// # Errors
    ///
    /// Chains with restricted capacity or restricted event kinds return an error describing
    /// why the event was rejected. The rejected event is dropped.
    fn add_event(&self, event: Event) -> Result<()>;

    /// Whether any event is queued.
    fn has_event(&self) -> bool;

    /// Removes and returns the event at the front of the chain.
    fn next_event(&self) -> Option<Event>;

    /// The readiness this chain registers for.
    fn event_type(&self) -> EventType;

    /// Whether the chain has been marked for destruction.
    fn is_invalid(&self) -> bool;

    /// Marks the chain for destruction once it has been drained. There is no way back.
    fn set_invalid(&self);

    /// The handle this chain is bound to.
    fn bind_socket(&self) -> RawFd;
}

/// An [`EventChain`] that hands out its events strictly in the order they were added.
///
/// Used for the wake chain of every engine and for per-socket work queues.
///
/// # Example
///
/// ```rust
/// use std::os::fd::OwnedFd;
/// use std::os::unix::net::UnixStream;
///
/// use chain_reactor::{Event, EventChain, EventType, OrderEventChain};
///
/// let (socket, _peer) = UnixStream::pair()?;
/// let chain = OrderEventChain::new(OwnedFd::from(socket), EventType::Read);
///
/// chain.add_event(Event::net_recv(|_fd| {}))?;
/// chain.add_event(Event::stop(|_chain, _engine| {}))?;
///
/// assert_eq!(chain.next_event().map(|e| e.kind()), Some("net-recv"));
/// assert_eq!(chain.next_event().map(|e| e.kind()), Some("stop"));
/// assert!(!chain.has_event());
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct OrderEventChain {
    socket: OwnedFd,
    event_type: EventType,
    events: Mutex<VecDeque<Event>>,
    invalid: AtomicBool,
}

impl OrderEventChain {
    /// Creates an empty chain bound to `socket`.
    #[must_use]
    pub fn new(socket: OwnedFd, event_type: EventType) -> Self {
        Self {
            socket,
            event_type,
            events: Mutex::new(VecDeque::new()),
            invalid: AtomicBool::new(false),
        }
    }

    /// Number of queued events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether no events are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl EventChain for OrderEventChain {
    fn add_event(&self, event: Event) -> Result<()> {
        self.events.lock().push_back(event);
        Ok(())
    }

    fn has_event(&self) -> bool {
        !self.is_empty()
    }

    fn next_event(&self) -> Option<Event> {
        self.events.lock().pop_front()
    }

    fn event_type(&self) -> EventType {
        self.event_type
    }

    fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Acquire)
    }

    fn set_invalid(&self) {
        self.invalid.store(true, Ordering::Release);
    }

    fn bind_socket(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl Debug for OrderEventChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("socket", &self.socket)
            .field("event_type", &self.event_type)
            .field("queued", &self.len())
            .field("invalid", &self.is_invalid())
            .finish()
    }
}

impl Drop for OrderEventChain {
    fn drop(&mut self) {
        let discarded = self.events.get_mut().len();

        if discarded > 0 {
            warn!(
                fd = self.socket.as_raw_fd(),
                discarded, "destroying event chain with queued events"
            );
        }
    }
}

/// An [`EventChain`] without a queue: it holds at most one parked coroutine and resumes it
/// when its handle becomes ready.
///
/// This suits a computation that waits for readiness of one specific socket. Readiness that
/// arrives while no coroutine is parked is not remembered.
///
/// # Example
///
/// ```rust
/// use std::os::fd::OwnedFd;
/// use std::os::unix::net::UnixStream;
///
/// use chain_reactor::{Coroutine, CoroutineEventChain, EventChain, EventType};
///
/// let (socket, _peer) = UnixStream::pair()?;
/// let chain = CoroutineEventChain::new(OwnedFd::from(socket), EventType::Read);
///
/// chain.park(Coroutine::new(async {}))?;
/// assert!(chain.park(Coroutine::new(async {})).is_err());
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct CoroutineEventChain {
    socket: OwnedFd,
    event_type: EventType,
    slot: Mutex<Option<CoroutineEvent>>,
    invalid: AtomicBool,
}

impl CoroutineEventChain {
    /// Creates an empty chain bound to `socket`.
    #[must_use]
    pub fn new(socket: OwnedFd, event_type: EventType) -> Self {
        Self {
            socket,
            event_type,
            slot: Mutex::new(None),
            invalid: AtomicBool::new(false),
        }
    }

    /// Parks a coroutine to be resumed on the next readiness notification.
    ///
    /// # Errors
    ///
    /// [`Error::ChainOccupied`] if a coroutine is already parked.
    pub fn park(&self, coroutine: Coroutine) -> Result<()> {
        self.add_event(Event::coroutine(coroutine))
    }
}

impl EventChain for CoroutineEventChain {
    fn add_event(&self, event: Event) -> Result<()> {
        let fd = self.bind_socket();
        let kind = event.kind();

        let Event::Coroutine(event) = event else {
            return Err(Error::UnsupportedEvent { fd, kind });
        };

        let mut slot = self.slot.lock();

        if slot.is_some() {
            return Err(Error::ChainOccupied { fd });
        }

        *slot = Some(event);
        Ok(())
    }

    fn has_event(&self) -> bool {
        self.slot.lock().is_some()
    }

    fn next_event(&self) -> Option<Event> {
        self.slot.lock().take().map(Event::Coroutine)
    }

    fn event_type(&self) -> EventType {
        self.event_type
    }

    fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Acquire)
    }

    fn set_invalid(&self) {
        self.invalid.store(true, Ordering::Release);
    }

    fn bind_socket(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl Debug for CoroutineEventChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("socket", &self.socket)
            .field("event_type", &self.event_type)
            .field("parked", &self.has_event())
            .field("invalid", &self.is_invalid())
            .finish()
    }
}
