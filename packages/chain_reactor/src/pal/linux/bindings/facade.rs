#![cfg_attr(coverage_nightly, coverage(off))]

use std::fmt::Debug;
use std::io;
use std::os::fd::{OwnedFd, RawFd};
#[cfg(test)]
use std::sync::Arc;

use libc::{c_int, epoll_event};

#[cfg(test)]
use crate::pal::linux::MockBindings;
use crate::pal::linux::{Bindings, BuildTargetBindings, CtlOp};

/// Enum to hide the real/mock choice behind a single wrapper type.
#[derive(Clone)]
pub(crate) enum BindingsFacade {
    Target(&'static BuildTargetBindings),

    #[cfg(test)]
    Mock(Arc<MockBindings>),
}

impl BindingsFacade {
    pub(crate) const fn target() -> Self {
        Self::Target(&BuildTargetBindings)
    }

    #[cfg(test)]
    pub(crate) fn from_mock(mock: MockBindings) -> Self {
        Self::Mock(Arc::new(mock))
    }
}

impl Bindings for BindingsFacade {
    fn epoll_create1(&self) -> io::Result<OwnedFd> {
        match self {
            Self::Target(bindings) => bindings.epoll_create1(),
            #[cfg(test)]
            Self::Mock(mock) => mock.epoll_create1(),
        }
    }

    fn eventfd(&self) -> io::Result<OwnedFd> {
        match self {
            Self::Target(bindings) => bindings.eventfd(),
            #[cfg(test)]
            Self::Mock(mock) => mock.eventfd(),
        }
    }

    fn epoll_ctl(
        &self,
        epfd: RawFd,
        op: CtlOp,
        fd: RawFd,
        interest: u32,
        token: u64,
    ) -> io::Result<()> {
        match self {
            Self::Target(bindings) => bindings.epoll_ctl(epfd, op, fd, interest, token),
            #[cfg(test)]
            Self::Mock(mock) => mock.epoll_ctl(epfd, op, fd, interest, token),
        }
    }

    fn epoll_wait(
        &self,
        epfd: RawFd,
        events: &mut [epoll_event],
        timeout_ms: c_int,
    ) -> io::Result<usize> {
        match self {
            Self::Target(bindings) => bindings.epoll_wait(epfd, events, timeout_ms),
            #[cfg(test)]
            Self::Mock(mock) => mock.epoll_wait(epfd, events, timeout_ms),
        }
    }

    fn eventfd_write(&self, fd: RawFd, value: u64) -> io::Result<()> {
        match self {
            Self::Target(bindings) => bindings.eventfd_write(fd, value),
            #[cfg(test)]
            Self::Mock(mock) => mock.eventfd_write(fd, value),
        }
    }

    fn eventfd_read(&self, fd: RawFd) -> io::Result<u64> {
        match self {
            Self::Target(bindings) => bindings.eventfd_read(fd),
            #[cfg(test)]
            Self::Mock(mock) => mock.eventfd_read(fd),
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))] // No API contract to test.
impl Debug for BindingsFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Target(inner) => inner.fmt(f),
            #[cfg(test)]
            Self::Mock(inner) => inner.fmt(f),
        }
    }
}
