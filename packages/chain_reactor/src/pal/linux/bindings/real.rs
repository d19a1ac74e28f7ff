use std::fmt::Debug;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use libc::{c_int, epoll_event};

use crate::pal::linux::{Bindings, CtlOp};

/// FFI bindings that target the real operating system that the build is targeting.
///
/// You would only use different bindings in PAL unit tests that need to use mock bindings.
/// Even then, whenever possible, unit tests should use real bindings for maximum realism.
#[derive(Debug, Default)]
pub(crate) struct BuildTargetBindings;

// Real OS bindings are excluded from coverage measurement because:
// 1. They are tested via integration tests running on actual Linux.
// 2. Error paths require OS-level failures that are impractical to trigger in tests.
#[cfg_attr(coverage_nightly, coverage(off))]
impl Bindings for BuildTargetBindings {
    fn epoll_create1(&self) -> io::Result<OwnedFd> {
        // SAFETY: No safety requirements beyond passing valid arguments.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };

        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: The descriptor was just created and nothing else owns it.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    fn eventfd(&self) -> io::Result<OwnedFd> {
        // SAFETY: No safety requirements beyond passing valid arguments.
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };

        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: The descriptor was just created and nothing else owns it.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    fn epoll_ctl(
        &self,
        epfd: RawFd,
        op: CtlOp,
        fd: RawFd,
        interest: u32,
        token: u64,
    ) -> io::Result<()> {
        let mut event = epoll_event {
            events: interest,
            u64: token,
        };

        // SAFETY: No safety requirements beyond passing valid arguments. The kernel ignores
        // the event argument for EPOLL_CTL_DEL but it must still be a valid pointer.
        let result = unsafe { libc::epoll_ctl(epfd, op.as_raw(), fd, &raw mut event) };

        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn epoll_wait(
        &self,
        epfd: RawFd,
        events: &mut [epoll_event],
        timeout_ms: c_int,
    ) -> io::Result<usize> {
        let capacity = c_int::try_from(events.len()).unwrap_or(c_int::MAX);

        // SAFETY: The kernel writes at most `capacity` entries, which fit into `events`.
        let result = unsafe { libc::epoll_wait(epfd, events.as_mut_ptr(), capacity, timeout_ms) };

        if result < 0 {
            return Err(io::Error::last_os_error());
        }

        #[expect(clippy::cast_sign_loss, reason = "checked for negative values above")]
        let ready = result as usize;

        Ok(ready)
    }

    fn eventfd_write(&self, fd: RawFd, value: u64) -> io::Result<()> {
        // SAFETY: No safety requirements beyond passing a valid descriptor.
        let result = unsafe { libc::eventfd_write(fd, value) };

        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn eventfd_read(&self, fd: RawFd) -> io::Result<u64> {
        let mut value: libc::eventfd_t = 0;

        // SAFETY: No safety requirements beyond passing a valid descriptor and a valid pointer.
        let result = unsafe { libc::eventfd_read(fd, &raw mut value) };

        if result == 0 {
            Ok(value)
        } else {
            Err(io::Error::last_os_error())
        }
    }
}
