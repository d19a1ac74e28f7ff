use std::fmt::Debug;
use std::io;
use std::os::fd::{OwnedFd, RawFd};

use libc::{c_int, epoll_event};

/// The `op` argument of `epoll_ctl()`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum CtlOp {
    Add,
    Modify,
    Delete,
}

impl CtlOp {
    pub(crate) const fn as_raw(self) -> c_int {
        match self {
            Self::Add => libc::EPOLL_CTL_ADD,
            Self::Modify => libc::EPOLL_CTL_MOD,
            Self::Delete => libc::EPOLL_CTL_DEL,
        }
    }

    pub(crate) const fn name(self) -> &'static str {
        match self {
            Self::Add => "epoll_ctl(EPOLL_CTL_ADD)",
            Self::Modify => "epoll_ctl(EPOLL_CTL_MOD)",
            Self::Delete => "epoll_ctl(EPOLL_CTL_DEL)",
        }
    }
}

/// Bindings for FFI calls into the operating system.
///
/// All PAL FFI calls must go through this trait, enabling them to be mocked.
#[cfg_attr(test, mockall::automock)]
pub(crate) trait Bindings: Debug + Send + Sync + 'static {
    // epoll_create1(EPOLL_CLOEXEC)
    fn epoll_create1(&self) -> io::Result<OwnedFd>;

    // eventfd(0, EFD_CLOEXEC | EFD_NONBLOCK)
    fn eventfd(&self) -> io::Result<OwnedFd>;

    fn epoll_ctl(
        &self,
        epfd: RawFd,
        op: CtlOp,
        fd: RawFd,
        interest: u32,
        token: u64,
    ) -> io::Result<()>;

    // Returns the number of entries at the front of `events` that were filled in.
    fn epoll_wait(
        &self,
        epfd: RawFd,
        events: &mut [epoll_event],
        timeout_ms: c_int,
    ) -> io::Result<usize>;

    fn eventfd_write(&self, fd: RawFd, value: u64) -> io::Result<()>;

    fn eventfd_read(&self, fd: RawFd) -> io::Result<u64>;
}
