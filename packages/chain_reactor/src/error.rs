use std::io;
use std::os::fd::RawFd;

use thiserror::Error;

/// Errors that can occur when operating an event engine, its chains or its coroutines.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The polling context or the wake descriptor could not be created when starting the loop.
    ///
    /// This is fatal to the `run_loop()` call that encountered it.
    #[error("{operation}: {source}")]
    Setup {
        /// The system operation that failed.
        operation: &'static str,

        /// The error reported by the operating system.
        source: io::Error,
    },

    /// Adding, re-arming or removing the readiness registration of a chain failed.
    ///
    /// The chain is unusable afterwards. The core does not retry.
    #[error("{operation} of descriptor {fd} failed: {source}")]
    Registration {
        /// The registration operation that failed.
        operation: &'static str,

        /// The descriptor the chain is bound to.
        fd: RawFd,

        /// The error reported by the operating system.
        source: io::Error,
    },

    /// A chain bound to the same descriptor is already present in the registration table.
    #[error("descriptor {fd} already has a registered event chain")]
    AlreadyRegistered {
        /// The descriptor the chain is bound to.
        fd: RawFd,
    },

    /// No chain bound to this descriptor is present in the registration table.
    ///
    /// This is also the case for a chain that is being drained by the loop thread at the moment.
    #[error("descriptor {fd} has no registered event chain")]
    NotRegistered {
        /// The descriptor that was looked up.
        fd: RawFd,
    },

    /// The operation requires a running event loop but there is none.
    #[error("the event loop is not running")]
    NotRunning,

    /// The event loop of this engine has already been started once.
    #[error("the event loop has already been started on this engine")]
    AlreadyStarted,

    /// A single-slot chain already holds a parked coroutine.
    #[error("event chain on descriptor {fd} already holds a parked coroutine")]
    ChainOccupied {
        /// The descriptor the chain is bound to.
        fd: RawFd,
    },

    /// The chain does not accept this kind of event.
    #[error("event chain on descriptor {fd} does not accept {kind} events")]
    UnsupportedEvent {
        /// The descriptor the chain is bound to.
        fd: RawFd,

        /// Human-readable name of the rejected event kind.
        kind: &'static str,
    },

    /// The coroutine has already run to completion and cannot be resumed.
    #[error("the coroutine has already completed")]
    CoroutineDone,

    /// The coroutine is running and a resume has already been requested for it.
    #[error("a resume is already pending for this coroutine")]
    ResumeAlreadyPending,

    /// There is no readiness polling backend for the build target.
    #[error("readiness polling is not supported on this platform")]
    Unsupported,
}

/// A specialized `Result` type for event engine operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;
