#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Readiness-based event reactor that multiplexes socket readiness and drives suspended
//! computations to completion.
//!
//! Each worker thread owns one [`Scheduler`] and runs its event loop. Work reaches a reactor
//! as [`Event`]s queued on [`EventChain`]s, one chain per OS handle. When a handle becomes
//! ready, the reactor drains its chain in order on the loop thread. Every reactor also has a
//! private wake chain that any thread can post to.
//!
//! # Quick start
//!
//! ```rust
//! use std::os::fd::OwnedFd;
//! use std::os::unix::net::UnixStream;
//! use std::sync::Arc;
//! use std::sync::mpsc;
//! use std::thread;
//! use std::io::Write;
//!
//! use chain_reactor::{Event, EventChain, EventType, OrderEventChain, Scheduler};
//!
//! let scheduler = Arc::new(Scheduler::new());
//!
//! let reactor = thread::spawn({
//!     let scheduler = Arc::clone(&scheduler);
//!     move || scheduler.run_loop(None)
//! });
//!
//! while !scheduler.is_running() {
//!     thread::yield_now();
//! }
//!
//! let (socket, mut peer) = UnixStream::pair()?;
//! let (tx, rx) = mpsc::channel();
//!
//! let chain = OrderEventChain::new(OwnedFd::from(socket), EventType::Read);
//! chain.add_event(Event::net_recv(move |fd| tx.send(fd).unwrap()))?;
//! scheduler.add_event_chain(chain)?;
//!
//! // Readiness of the socket makes the reactor drain the chain.
//! peer.write_all(b"ping")?;
//! let _fd = rx.recv()?;
//!
//! while !scheduler.stop() {
//!     thread::yield_now();
//! }
//!
//! assert!(reactor.join().unwrap());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Coroutines
//!
//! A [`Coroutine`] wraps a future that suspends at [`Suspend`] awaiters. The awaiter hands the
//! coroutine to an [`AsyncExecutor`] (such as a [`Scheduler`]), which later resumes it on its
//! loop thread with a value placed in the coroutine's context slot.
//!
//! # Shutdown
//!
//! [`Scheduler::stop()`] queues a stop request behind any work already posted. A coordinator
//! running several reactors waits for all of them with a [`ShutdownLatch`].
//!
//! # Platform support
//!
//! The event loop uses edge-triggered epoll on Linux. On other Unix targets the crate builds
//! but every scheduler fails to start with [`Error::Unsupported`].

#[cfg(not(unix))]
compile_error!("chain_reactor only supports Unix targets");

mod chain;
mod coroutine;
mod engine;
mod error;
mod event;
mod executor;
mod latch;
mod pal;
mod scheduler;

pub use chain::*;
pub use coroutine::*;
pub use engine::*;
pub use error::*;
pub use event::*;
pub use executor::*;
pub use latch::*;
pub use scheduler::*;
