//! Engine for targets without a readiness notification backend.

use std::num::NonZero;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::error;

use crate::{Error, Event, EventChain, EventEngine, Result};

/// An engine that refuses to run.
///
/// Every operation fails with [`Error::Unsupported`] (or [`Error::NotRunning`] for operations
/// that need an active loop), so code built on schedulers still compiles and reports a clear
/// reason at runtime. Event handling itself does not depend on the engine, which makes this
/// a convenient stand-in where handlers need an engine reference but no loop.
#[derive(Debug, Default)]
pub(crate) struct UnsupportedEventEngine {
    last_error: Mutex<String>,
}

impl UnsupportedEventEngine {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

impl EventEngine for UnsupportedEventEngine {
    fn run_loop(&self, _timeout: Option<Duration>) -> bool {
        let error = Error::Unsupported;
        error!(%error, "cannot run event loop");

        *self.last_error.lock() = error.to_string();
        false
    }

    fn is_running(&self) -> bool {
        false
    }

    fn stop(&self) -> bool {
        false
    }

    fn last_error(&self) -> String {
        self.last_error.lock().clone()
    }

    fn add_active_event(&self, _event: Event) -> Result<()> {
        Err(Error::NotRunning)
    }

    fn notify_active_event(&self) -> Result<()> {
        Err(Error::NotRunning)
    }

    fn acknowledge_notification(&self) -> Result<()> {
        Err(Error::NotRunning)
    }

    fn add_event_chain(&self, _chain: Box<dyn EventChain>) -> Result<()> {
        Err(Error::Unsupported)
    }

    fn modify_event_chain(&self, fd: RawFd) -> Result<()> {
        Err(Error::NotRegistered { fd })
    }

    fn add_event(&self, fd: RawFd, _event: Event) -> Result<()> {
        Err(Error::NotRegistered { fd })
    }

    fn del_event_chain(&self, fd: RawFd) -> Result<Arc<dyn EventChain>> {
        Err(Error::NotRegistered { fd })
    }
}

/// The engine backing every scheduler built for this target.
#[cfg_attr(test, allow(dead_code, reason = "only the primary backend on unsupported targets"))]
pub(crate) fn build_target_engine(_max_events: NonZero<usize>) -> Arc<dyn EventEngine> {
    Arc::new(UnsupportedEventEngine::new())
}
