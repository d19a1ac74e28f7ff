use std::any::type_name;
use std::fmt;
use std::io;
use std::mem;
use std::num::NonZero;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use foldhash::{HashMap, HashMapExt};
use libc::{c_int, epoll_event};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, trace, warn};

use crate::pal::linux::{Bindings, BindingsFacade, CtlOp};
use crate::{Error, Event, EventChain, EventEngine, EventType, OrderEventChain, Result};

// Registration tag of the wake chain. Every other chain is tagged with its descriptor number,
// which is never negative and therefore never collides with this.
const WAKE_TOKEN: u64 = u64::MAX;

const STATE_IDLE: u8 = 0;
const STATE_STARTING: u8 = 1;
const STATE_RUNNING: u8 = 2;
const STATE_STOPPING: u8 = 3;
const STATE_FINISHED: u8 = 4;

/// Edge-triggered epoll engine with an eventfd as its wake descriptor.
///
/// The epoll descriptor and the wake chain only exist while `run_loop()` executes. The
/// registration table is keyed by descriptor number and every registered chain is tagged with
/// its own descriptor number, so a readiness notification leads straight to its chain.
///
/// The loop thread holds no lock while draining a ready chain, only a shared reference to it.
/// Event handlers may therefore call back into the engine, including appending to, registering
/// and unregistering chains. A chain that is no longer in the table once its drain ends is
/// neither re-armed nor destroyed by the loop. Readiness for a descriptor whose chain is not in
/// the table is reported and ignored.
pub(crate) struct EpollEventEngine {
    bindings: BindingsFacade,
    max_events: NonZero<usize>,

    state: AtomicU8,

    epoll: RwLock<Option<OwnedFd>>,
    wake_chain: RwLock<Option<Arc<OrderEventChain>>>,
    chains: Mutex<HashMap<RawFd, Arc<dyn EventChain>>>,

    last_error: Mutex<String>,
}

impl EpollEventEngine {
    pub(crate) fn new(bindings: BindingsFacade, max_events: NonZero<usize>) -> Self {
        Self {
            bindings,
            max_events,
            state: AtomicU8::new(STATE_IDLE),
            epoll: RwLock::new(None),
            wake_chain: RwLock::new(None),
            chains: Mutex::new(HashMap::new()),
            last_error: Mutex::new(String::new()),
        }
    }

    /// Creates the epoll descriptor and the wake chain and registers the latter.
    ///
    /// Returns the raw epoll descriptor, which stays valid until `close()`.
    fn open(&self) -> Result<RawFd> {
        let epoll = self
            .bindings
            .epoll_create1()
            .map_err(|source| Error::Setup {
                operation: "epoll_create1",
                source,
            })?;

        let wake = self.bindings.eventfd().map_err(|source| Error::Setup {
            operation: "eventfd",
            source,
        })?;

        let epfd = epoll.as_raw_fd();
        let wake_fd = wake.as_raw_fd();

        self.bindings
            .epoll_ctl(
                epfd,
                CtlOp::Add,
                wake_fd,
                interest_mask(EventType::Read),
                WAKE_TOKEN,
            )
            .map_err(|source| Error::Setup {
                operation: CtlOp::Add.name(),
                source,
            })?;

        debug!(epfd, wake_fd, "created epoll descriptor and wake descriptor");

        *self.epoll.write() = Some(epoll);
        *self.wake_chain.write() = Some(Arc::new(OrderEventChain::new(wake, EventType::Read)));

        Ok(epfd)
    }

    /// Destroys every chain still registered, then the wake chain and the epoll descriptor.
    fn close(&self) {
        let chains = mem::take(&mut *self.chains.lock());

        for (fd, chain) in chains {
            self.deregister(fd);
            debug!(fd, "destroying chain still registered at loop exit");
            drop(chain);
        }

        // Events posted after the stop are dropped together with the wake chain.
        drop(self.wake_chain.write().take());
        drop(self.epoll.write().take());
    }

    fn dispatch(&self, epfd: RawFd, token: u64) {
        if token == WAKE_TOKEN {
            self.dispatch_wake_chain(epfd);
            return;
        }

        let Ok(fd) = RawFd::try_from(token) else {
            warn!(token, "ignoring readiness with unknown registration tag");
            return;
        };

        let Some(chain) = self.chains.lock().get(&fd).map(Arc::clone) else {
            warn!(fd, "ignoring readiness of descriptor without a registered chain");
            return;
        };

        drain(chain.as_ref(), self);

        let mut chains = self.chains.lock();

        // A handler may have unregistered the chain, after which the descriptor number may
        // already belong to a different chain.
        if !chains
            .get(&fd)
            .is_some_and(|registered| Arc::ptr_eq(registered, &chain))
        {
            trace!(fd, "chain was unregistered while being drained");
            return;
        }

        if chain.is_invalid() {
            chains.remove(&fd);
            drop(chains);

            self.deregister(fd);
            debug!(fd, "destroying invalidated chain");
            drop(chain);
            return;
        }

        self.rearm(epfd, fd, interest_mask(chain.event_type()), token_of(fd));
    }

    fn dispatch_wake_chain(&self, epfd: RawFd) {
        let Some(wake_chain) = self.wake_chain.read().clone() else {
            return;
        };

        // Consume the counter first. Anything posted after this point raises a fresh edge.
        if let Err(error) = self.acknowledge_notification() {
            warn!(%error, "failed to acknowledge wake descriptor");
        }

        drain(wake_chain.as_ref(), self);

        // An invalidated wake chain is destroyed when the loop exits, because other threads
        // may still be posting to it until then.
        if !wake_chain.is_invalid() {
            self.rearm(
                epfd,
                wake_chain.bind_socket(),
                interest_mask(EventType::Read),
                WAKE_TOKEN,
            );
        }
    }

    fn rearm(&self, epfd: RawFd, fd: RawFd, interest: u32, token: u64) {
        if let Err(source) = self
            .bindings
            .epoll_ctl(epfd, CtlOp::Modify, fd, interest, token)
        {
            let error = self.record(Error::Registration {
                operation: CtlOp::Modify.name(),
                fd,
                source,
            });

            error!(%error, "failed to re-arm event chain");
        }
    }

    // Failures are logged and recorded. The caller destroys the chain regardless.
    fn deregister(&self, fd: RawFd) {
        let Some(epfd) = self.epoll.read().as_ref().map(AsRawFd::as_raw_fd) else {
            return;
        };

        if let Err(source) = self.bindings.epoll_ctl(epfd, CtlOp::Delete, fd, 0, 0) {
            let error = self.record(Error::Registration {
                operation: CtlOp::Delete.name(),
                fd,
                source,
            });

            warn!(%error, "failed to remove event chain from epoll");
        }
    }

    fn record(&self, error: Error) -> Error {
        *self.last_error.lock() = error.to_string();
        error
    }

    fn clear_error(&self) {
        self.last_error.lock().clear();
    }
}

impl EventEngine for EpollEventEngine {
    fn run_loop(&self, timeout: Option<Duration>) -> bool {
        if self
            .state
            .compare_exchange(
                STATE_IDLE,
                STATE_STARTING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            let error = self.record(Error::AlreadyStarted);
            warn!(%error, "refusing to run event loop");
            return false;
        }

        let epfd = match self.open() {
            Ok(epfd) => epfd,
            Err(error) => {
                let error = self.record(error);
                error!(%error, "failed to set up event loop");

                self.close();
                self.state.store(STATE_FINISHED, Ordering::Release);
                return false;
            }
        };

        let timeout_ms = poll_timeout_ms(timeout);
        let mut events = vec![epoll_event { events: 0, u64: 0 }; self.max_events.get()];

        self.state.store(STATE_RUNNING, Ordering::Release);

        while self.state.load(Ordering::Acquire) == STATE_RUNNING {
            let ready = match self.bindings.epoll_wait(epfd, &mut events, timeout_ms) {
                Ok(ready) => ready,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    error!(%error, "epoll_wait failed, polling again");
                    continue;
                }
            };

            debug!(ready, "epoll_wait returned");

            for event in events.iter().take(ready) {
                // Copied out by value because the struct is packed on some targets.
                let token = event.u64;
                self.dispatch(epfd, token);
            }
        }

        self.close();
        self.state.store(STATE_FINISHED, Ordering::Release);

        info!("event loop exited");
        true
    }

    fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_RUNNING
    }

    fn stop(&self) -> bool {
        let stopped = self
            .state
            .compare_exchange(
                STATE_RUNNING,
                STATE_STOPPING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();

        // Wake the loop in case this was called from outside of it.
        if stopped {
            if let Err(error) = self.notify_active_event() {
                trace!(%error, "failed to wake event loop after stop");
            }
        }

        stopped
    }

    fn last_error(&self) -> String {
        self.last_error.lock().clone()
    }

    fn add_active_event(&self, event: Event) -> Result<()> {
        let wake_chain = self.wake_chain.read();

        let Some(wake_chain) = wake_chain.as_ref() else {
            return Err(Error::NotRunning);
        };

        wake_chain.add_event(event)
    }

    fn notify_active_event(&self) -> Result<()> {
        let wake_chain = self.wake_chain.read();

        let Some(wake_chain) = wake_chain.as_ref() else {
            return Err(Error::NotRunning);
        };

        let fd = wake_chain.bind_socket();

        self.bindings
            .eventfd_write(fd, 1)
            .map_err(|source| Error::Registration {
                operation: "eventfd_write",
                fd,
                source,
            })
    }

    fn acknowledge_notification(&self) -> Result<()> {
        let wake_chain = self.wake_chain.read();

        let Some(wake_chain) = wake_chain.as_ref() else {
            return Err(Error::NotRunning);
        };

        let fd = wake_chain.bind_socket();

        match self.bindings.eventfd_read(fd) {
            Ok(count) => {
                trace!(count, "acknowledged wake descriptor");
                Ok(())
            }
            // Nothing to acknowledge.
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(source) => Err(Error::Registration {
                operation: "eventfd_read",
                fd,
                source,
            }),
        }
    }

    fn add_event_chain(&self, chain: Box<dyn EventChain>) -> Result<()> {
        let fd = chain.bind_socket();

        let epoll = self.epoll.read();

        let Some(epfd) = epoll.as_ref().map(AsRawFd::as_raw_fd) else {
            return Err(self.record(Error::NotRunning));
        };

        let mut chains = self.chains.lock();

        // Once the loop stops running, the table may already have been emptied for teardown.
        if self.state.load(Ordering::Acquire) != STATE_RUNNING {
            return Err(self.record(Error::NotRunning));
        }

        if chains.contains_key(&fd) {
            return Err(self.record(Error::AlreadyRegistered { fd }));
        }

        if let Err(source) = self.bindings.epoll_ctl(
            epfd,
            CtlOp::Add,
            fd,
            interest_mask(chain.event_type()),
            token_of(fd),
        ) {
            return Err(self.record(Error::Registration {
                operation: CtlOp::Add.name(),
                fd,
                source,
            }));
        }

        chains.insert(fd, Arc::from(chain));
        self.clear_error();

        trace!(fd, "registered event chain");
        Ok(())
    }

    fn modify_event_chain(&self, fd: RawFd) -> Result<()> {
        let epoll = self.epoll.read();

        let Some(epfd) = epoll.as_ref().map(AsRawFd::as_raw_fd) else {
            return Err(self.record(Error::NotRunning));
        };

        let Some(interest) = self
            .chains
            .lock()
            .get(&fd)
            .map(|chain| interest_mask(chain.event_type()))
        else {
            return Err(self.record(Error::NotRegistered { fd }));
        };

        self.bindings
            .epoll_ctl(epfd, CtlOp::Modify, fd, interest, token_of(fd))
            .map_err(|source| {
                self.record(Error::Registration {
                    operation: CtlOp::Modify.name(),
                    fd,
                    source,
                })
            })?;

        self.clear_error();
        Ok(())
    }

    fn add_event(&self, fd: RawFd, event: Event) -> Result<()> {
        let chains = self.chains.lock();

        let Some(chain) = chains.get(&fd) else {
            return Err(Error::NotRegistered { fd });
        };

        chain.add_event(event)
    }

    fn del_event_chain(&self, fd: RawFd) -> Result<Arc<dyn EventChain>> {
        let Some(chain) = self.chains.lock().remove(&fd) else {
            return Err(self.record(Error::NotRegistered { fd }));
        };

        self.deregister(fd);

        trace!(fd, "unregistered event chain");
        Ok(chain)
    }
}

impl fmt::Debug for EpollEventEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("bindings", &self.bindings)
            .field("max_events", &self.max_events)
            .field("state", &self.state.load(Ordering::Relaxed))
            .field("registered_chains", &self.chains.lock().len())
            .finish_non_exhaustive()
    }
}

/// Hands every queued event of `chain` to its handler, oldest first, until the chain is empty.
fn drain(chain: &dyn EventChain, engine: &dyn EventEngine) {
    while let Some(event) = chain.next_event() {
        trace!(
            fd = chain.bind_socket(),
            kind = event.kind(),
            "dispatching event"
        );
        event.handle(chain, engine);
    }
}

#[expect(
    clippy::cast_sign_loss,
    reason = "epoll flags are bit masks declared as signed integers"
)]
fn interest_mask(event_type: EventType) -> u32 {
    match event_type {
        EventType::Read => (libc::EPOLLIN | libc::EPOLLET) as u32,
        EventType::Write => (libc::EPOLLOUT | libc::EPOLLET) as u32,
    }
}

#[expect(
    clippy::cast_sign_loss,
    reason = "descriptors owned by a chain are never negative"
)]
fn token_of(fd: RawFd) -> u64 {
    fd as u64
}

/// Converts a poll timeout to whole milliseconds, rounding up so that a short but nonzero
/// timeout never turns into a busy poll. `None` means block indefinitely.
fn poll_timeout_ms(timeout: Option<Duration>) -> c_int {
    timeout.map_or(-1, |timeout| {
        c_int::try_from(timeout.as_nanos().div_ceil(1_000_000)).unwrap_or(c_int::MAX)
    })
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::thread;

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::pal::linux::{BuildTargetBindings, MockBindings};

    assert_impl_all!(EpollEventEngine: Send, Sync);

    const MAX_EVENTS: NonZero<usize> = NonZero::new(16).expect("16 is not zero");

    fn real_engine() -> Arc<EpollEventEngine> {
        Arc::new(EpollEventEngine::new(BindingsFacade::target(), MAX_EVENTS))
    }

    fn read_chain() -> (OrderEventChain, UnixStream) {
        let (socket, peer) = UnixStream::pair().unwrap();
        (
            OrderEventChain::new(OwnedFd::from(socket), EventType::Read),
            peer,
        )
    }

    /// Also returns a duplicate of our end, for handlers that consume input before the chain
    /// is destroyed.
    fn read_chain_with_reader() -> (OrderEventChain, UnixStream, UnixStream) {
        let (socket, peer) = UnixStream::pair().unwrap();
        let reader = socket.try_clone().unwrap();
        (
            OrderEventChain::new(OwnedFd::from(socket), EventType::Read),
            reader,
            peer,
        )
    }

    fn start(engine: &Arc<EpollEventEngine>) -> thread::JoinHandle<bool> {
        let handle = thread::spawn({
            let engine = Arc::clone(engine);
            move || engine.run_loop(Some(Duration::from_millis(10)))
        });

        testing::wait_until(Duration::from_secs(10), || engine.is_running());
        handle
    }

    fn stop(engine: &Arc<EpollEventEngine>, handle: thread::JoinHandle<bool>) {
        assert!(engine.stop());
        assert!(handle.join().unwrap());
        assert!(!engine.is_running());
    }

    fn delegate_setup(bindings: &mut MockBindings) {
        bindings
            .expect_epoll_create1()
            .returning(|| BuildTargetBindings.epoll_create1());
        bindings
            .expect_eventfd()
            .returning(|| BuildTargetBindings.eventfd());
    }

    fn delegate_io(bindings: &mut MockBindings) {
        bindings
            .expect_epoll_wait()
            .returning(|epfd, events, timeout_ms| {
                BuildTargetBindings.epoll_wait(epfd, events, timeout_ms)
            });
        bindings
            .expect_eventfd_write()
            .returning(|fd, value| BuildTargetBindings.eventfd_write(fd, value));
        bindings
            .expect_eventfd_read()
            .returning(|fd| BuildTargetBindings.eventfd_read(fd));
    }

    fn delegate_ctl(bindings: &mut MockBindings) {
        bindings
            .expect_epoll_ctl()
            .returning(|epfd, op, fd, interest, token| {
                BuildTargetBindings.epoll_ctl(epfd, op, fd, interest, token)
            });
    }

    #[test]
    fn timeout_rounds_up_to_whole_milliseconds() {
        assert_eq!(poll_timeout_ms(None), -1);
        assert_eq!(poll_timeout_ms(Some(Duration::ZERO)), 0);
        assert_eq!(poll_timeout_ms(Some(Duration::from_micros(1))), 1);
        assert_eq!(poll_timeout_ms(Some(Duration::from_millis(10))), 10);
        assert_eq!(poll_timeout_ms(Some(Duration::from_micros(10_001))), 11);
        assert_eq!(poll_timeout_ms(Some(Duration::MAX)), c_int::MAX);
    }

    #[test]
    #[expect(clippy::cast_sign_loss, reason = "epoll flags are signed bit masks")]
    fn interest_is_edge_triggered() {
        let read = interest_mask(EventType::Read);
        let write = interest_mask(EventType::Write);

        assert_ne!(read & libc::EPOLLET as u32, 0);
        assert_ne!(write & libc::EPOLLET as u32, 0);
        assert_ne!(read & libc::EPOLLIN as u32, 0);
        assert_eq!(read & libc::EPOLLOUT as u32, 0);
        assert_ne!(write & libc::EPOLLOUT as u32, 0);
        assert_eq!(write & libc::EPOLLIN as u32, 0);
    }

    #[test]
    fn epoll_create_failure_fails_setup() {
        let mut bindings = MockBindings::new();
        bindings
            .expect_epoll_create1()
            .times(1)
            .returning(|| Err(io::Error::from_raw_os_error(libc::EMFILE)));

        let engine = EpollEventEngine::new(BindingsFacade::from_mock(bindings), MAX_EVENTS);

        assert!(!engine.run_loop(None));
        assert!(!engine.is_running());
        assert!(engine.last_error().contains("epoll_create1"));
    }

    #[test]
    fn eventfd_failure_fails_setup() {
        let mut bindings = MockBindings::new();
        bindings
            .expect_epoll_create1()
            .times(1)
            .returning(|| BuildTargetBindings.epoll_create1());
        bindings
            .expect_eventfd()
            .times(1)
            .returning(|| Err(io::Error::from_raw_os_error(libc::ENFILE)));

        let engine = EpollEventEngine::new(BindingsFacade::from_mock(bindings), MAX_EVENTS);

        assert!(!engine.run_loop(Some(Duration::ZERO)));
        assert!(engine.last_error().contains("eventfd"));
        assert!(matches!(
            engine.add_active_event(Event::net_recv(|_| {})),
            Err(Error::NotRunning)
        ));
    }

    #[test]
    fn loop_runs_only_once() {
        let mut bindings = MockBindings::new();
        bindings
            .expect_epoll_create1()
            .times(1)
            .returning(|| Err(io::Error::from_raw_os_error(libc::EMFILE)));

        let engine = EpollEventEngine::new(BindingsFacade::from_mock(bindings), MAX_EVENTS);

        assert!(!engine.run_loop(None));
        assert!(!engine.run_loop(None));
        assert_eq!(engine.last_error(), Error::AlreadyStarted.to_string());
    }

    #[test]
    fn registration_failure_is_recoverable() {
        testing::with_watchdog(|| {
            let fail_next_add = Arc::new(AtomicBool::new(false));

            let mut bindings = MockBindings::new();
            delegate_setup(&mut bindings);
            delegate_io(&mut bindings);
            bindings.expect_epoll_ctl().returning({
                let fail_next_add = Arc::clone(&fail_next_add);
                move |epfd, op, fd, interest, token| {
                    if op == CtlOp::Add && fail_next_add.swap(false, Ordering::Relaxed) {
                        return Err(io::Error::from_raw_os_error(libc::EMFILE));
                    }

                    BuildTargetBindings.epoll_ctl(epfd, op, fd, interest, token)
                }
            });

            let engine = Arc::new(EpollEventEngine::new(
                BindingsFacade::from_mock(bindings),
                MAX_EVENTS,
            ));
            let handle = start(&engine);

            let (rejected, mut rejected_peer) = read_chain();
            let rejected_fd = rejected.bind_socket();
            fail_next_add.store(true, Ordering::Relaxed);

            let result = engine.add_event_chain(Box::new(rejected));
            assert!(matches!(
                result,
                Err(Error::Registration { fd, .. }) if fd == rejected_fd
            ));
            assert!(
                engine
                    .last_error()
                    .contains(&io::Error::from_raw_os_error(libc::EMFILE).to_string())
            );

            // The rejected chain was dropped, closing its socket.
            let mut buffer = [0_u8; 1];
            assert_eq!(rejected_peer.read(&mut buffer).unwrap(), 0);

            let (accepted, _accepted_peer) = read_chain();
            engine.add_event_chain(Box::new(accepted)).unwrap();
            assert_eq!(engine.last_error(), "");

            stop(&engine, handle);
        });
    }

    #[test]
    fn transient_poll_failure_does_not_end_loop() {
        testing::with_watchdog(|| {
            let polls = Arc::new(AtomicUsize::new(0));

            let mut bindings = MockBindings::new();
            delegate_setup(&mut bindings);
            delegate_ctl(&mut bindings);
            bindings.expect_epoll_wait().returning({
                let polls = Arc::clone(&polls);
                move |epfd, events, timeout_ms| {
                    if polls.fetch_add(1, Ordering::Relaxed) == 0 {
                        return Err(io::Error::from_raw_os_error(libc::EBADF));
                    }

                    BuildTargetBindings.epoll_wait(epfd, events, timeout_ms)
                }
            });
            bindings
                .expect_eventfd_write()
                .returning(|fd, value| BuildTargetBindings.eventfd_write(fd, value));
            bindings
                .expect_eventfd_read()
                .returning(|fd| BuildTargetBindings.eventfd_read(fd));

            let engine = Arc::new(EpollEventEngine::new(
                BindingsFacade::from_mock(bindings),
                MAX_EVENTS,
            ));
            let handle = start(&engine);

            testing::wait_until(Duration::from_secs(10), || {
                polls.load(Ordering::Relaxed) >= 2
            });

            // Poll failures are only logged. They are not registration or setup failures.
            assert!(engine.is_running());
            assert_eq!(engine.last_error(), "");

            stop(&engine, handle);
        });
    }

    #[test]
    fn ready_chain_is_drained_in_order() {
        testing::with_watchdog(|| {
            let engine = real_engine();
            let handle = start(&engine);

            let (chain, mut peer) = read_chain();
            let log = Arc::new(Mutex::new(Vec::new()));

            for tag in 0..3 {
                let log = Arc::clone(&log);
                chain
                    .add_event(Event::net_recv(move |_| log.lock().push(tag)))
                    .unwrap();
            }

            engine.add_event_chain(Box::new(chain)).unwrap();
            peer.write_all(b"x").unwrap();

            testing::wait_until(Duration::from_secs(10), || log.lock().len() == 3);
            assert_eq!(*log.lock(), vec![0, 1, 2]);

            stop(&engine, handle);
        });
    }

    #[test]
    fn handler_may_unregister_other_chains() {
        testing::with_watchdog(|| {
            let engine = real_engine();
            let handle = start(&engine);

            let (victim, _victim_peer) = read_chain();
            let victim_fd = victim.bind_socket();
            engine.add_event_chain(Box::new(victim)).unwrap();

            let removed = Arc::new(AtomicBool::new(false));
            engine
                .add_active_event(Event::stop({
                    let removed = Arc::clone(&removed);
                    move |_, engine| {
                        let result = engine.del_event_chain(victim_fd);
                        removed.store(result.is_ok(), Ordering::Relaxed);
                    }
                }))
                .unwrap();
            engine.notify_active_event().unwrap();

            testing::wait_until(Duration::from_secs(10), || removed.load(Ordering::Relaxed));
            assert!(matches!(
                engine.modify_event_chain(victim_fd),
                Err(Error::NotRegistered { .. })
            ));

            stop(&engine, handle);
        });
    }

    /// Claims a descriptor number without owning the descriptor.
    #[derive(Debug)]
    struct BorrowedChain {
        fd: RawFd,
    }

    impl EventChain for BorrowedChain {
        fn add_event(&self, _event: Event) -> Result<()> {
            Ok(())
        }

        fn has_event(&self) -> bool {
            false
        }

        fn next_event(&self) -> Option<Event> {
            None
        }

        fn event_type(&self) -> EventType {
            EventType::Read
        }

        fn is_invalid(&self) -> bool {
            false
        }

        fn set_invalid(&self) {}

        fn bind_socket(&self) -> RawFd {
            self.fd
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        testing::with_watchdog(|| {
            let engine = real_engine();
            let handle = start(&engine);

            let (chain, _peer) = read_chain();
            let fd = chain.bind_socket();
            engine.add_event_chain(Box::new(chain)).unwrap();

            assert!(matches!(
                engine.add_event_chain(Box::new(BorrowedChain { fd })),
                Err(Error::AlreadyRegistered { .. })
            ));
            assert!(!engine.last_error().is_empty());

            engine.modify_event_chain(fd).unwrap();
            assert_eq!(engine.last_error(), "");

            let removed = engine.del_event_chain(fd).unwrap();
            assert_eq!(removed.bind_socket(), fd);
            assert!(matches!(
                engine.del_event_chain(fd),
                Err(Error::NotRegistered { .. })
            ));

            stop(&engine, handle);
        });
    }

    #[test]
    fn registration_requires_running_loop() {
        let engine = real_engine();
        let (chain, _peer) = read_chain();

        assert!(matches!(
            engine.add_event_chain(Box::new(chain)),
            Err(Error::NotRunning)
        ));
        assert!(matches!(
            engine.notify_active_event(),
            Err(Error::NotRunning)
        ));
        assert!(!engine.stop());
    }

    #[test]
    fn invalidated_chain_is_destroyed_after_drain() {
        testing::with_watchdog(|| {
            let engine = real_engine();
            let handle = start(&engine);

            let (chain, mut reader, mut peer) = read_chain_with_reader();
            let fd = chain.bind_socket();

            // The handler consumes the input before invalidating, so that closing our end is
            // seen by the peer as end-of-stream rather than as a reset.
            chain
                .add_event(Event::stop(move |chain, _| {
                    let mut buffer = [0_u8; 1];
                    reader.read_exact(&mut buffer).unwrap();
                    drop(reader);
                    chain.set_invalid();
                }))
                .unwrap();
            engine.add_event_chain(Box::new(chain)).unwrap();

            peer.write_all(b"x").unwrap();

            let mut buffer = [0_u8; 1];
            assert_eq!(peer.read(&mut buffer).unwrap(), 0);
            assert!(matches!(
                engine.del_event_chain(fd),
                Err(Error::NotRegistered { .. })
            ));

            stop(&engine, handle);
        });
    }

    #[test]
    fn added_events_run_on_next_readiness() {
        testing::with_watchdog(|| {
            let engine = real_engine();
            let handle = start(&engine);

            let (chain, mut peer) = read_chain();
            let fd = chain.bind_socket();
            engine.add_event_chain(Box::new(chain)).unwrap();

            let received = Arc::new(Mutex::new(None));
            engine
                .add_event(
                    fd,
                    Event::net_recv({
                        let received = Arc::clone(&received);
                        move |fd| *received.lock() = Some(fd)
                    }),
                )
                .unwrap();

            // Nothing happens until the handle becomes ready.
            thread::sleep(Duration::from_millis(20));
            assert_eq!(*received.lock(), None);

            peer.write_all(b"x").unwrap();

            testing::wait_until(Duration::from_secs(10), || received.lock().is_some());
            assert_eq!(*received.lock(), Some(fd));

            assert!(matches!(
                engine.add_event(fd + 1000, Event::net_recv(|_| {})),
                Err(Error::NotRegistered { .. })
            ));

            stop(&engine, handle);
        });
    }

    #[test]
    fn events_added_while_draining_join_the_drain() {
        testing::with_watchdog(|| {
            let engine = real_engine();
            let handle = start(&engine);

            let (chain, mut peer) = read_chain();
            let appended = Arc::new(AtomicBool::new(false));
            let follow_up_ran = Arc::new(AtomicBool::new(false));

            chain
                .add_event(Event::stop({
                    let appended = Arc::clone(&appended);
                    let follow_up_ran = Arc::clone(&follow_up_ran);
                    move |chain, engine| {
                        engine
                            .add_event(
                                chain.bind_socket(),
                                Event::net_recv(move |_| {
                                    follow_up_ran.store(true, Ordering::Relaxed);
                                }),
                            )
                            .unwrap();

                        // The event went to the chain that is being drained.
                        appended.store(chain.has_event(), Ordering::Relaxed);
                    }
                }))
                .unwrap();

            engine.add_event_chain(Box::new(chain)).unwrap();
            peer.write_all(b"x").unwrap();

            testing::wait_until(Duration::from_secs(10), || {
                follow_up_ran.load(Ordering::Relaxed)
            });
            assert!(appended.load(Ordering::Relaxed));

            stop(&engine, handle);
        });
    }

    #[test]
    fn handler_may_unregister_own_chain() {
        testing::with_watchdog(|| {
            let engine = real_engine();
            let handle = start(&engine);

            let (chain, mut reader, mut peer) = read_chain_with_reader();
            let fd = chain.bind_socket();

            chain
                .add_event(Event::stop(move |_, engine| {
                    let mut buffer = [0_u8; 1];
                    reader.read_exact(&mut buffer).unwrap();
                    drop(reader);

                    // The loop still shares the chain, so it outlives this handler.
                    drop(engine.del_event_chain(fd).unwrap());
                }))
                .unwrap();
            engine.add_event_chain(Box::new(chain)).unwrap();

            peer.write_all(b"x").unwrap();

            // The loop releases its reference after the drain, which closes our end.
            let mut buffer = [0_u8; 1];
            assert_eq!(peer.read(&mut buffer).unwrap(), 0);
            assert!(matches!(
                engine.modify_event_chain(fd),
                Err(Error::NotRegistered { .. })
            ));

            stop(&engine, handle);
        });
    }

    #[test]
    fn registration_after_stop_is_rejected() {
        testing::with_watchdog(|| {
            let engine = real_engine();
            let handle = start(&engine);

            let (chain, mut peer) = read_chain();
            let result = Arc::new(Mutex::new(None));

            engine
                .add_active_event(Event::stop({
                    let result = Arc::clone(&result);
                    move |_, engine| {
                        assert!(engine.stop());
                        *result.lock() = Some(engine.add_event_chain(Box::new(chain)));
                    }
                }))
                .unwrap();
            engine.notify_active_event().unwrap();

            assert!(handle.join().unwrap());

            assert!(matches!(*result.lock(), Some(Err(Error::NotRunning))));

            // The rejected chain was dropped rather than left behind in the table.
            let mut buffer = [0_u8; 1];
            assert_eq!(peer.read(&mut buffer).unwrap(), 0);
            assert_eq!(engine.chains.lock().len(), 0);
        });
    }
}
