//! Platform Abstraction Layer (PAL). This is private API.
//!
//! Every event engine backend lives here. The scheduler picks the build target backend at
//! compile time and only ever sees it through the [`EventEngine`][crate::EventEngine] trait.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub(crate) use linux::*;

// The fallback module is compiled in test mode on all platforms and as the primary
// implementation on unsupported platforms. On Linux in test mode it must be accessed via the
// explicit path `fallback::` to avoid ambiguity with the platform-specific implementation.
#[cfg(any(test, not(target_os = "linux")))]
pub(crate) mod fallback;

#[cfg(not(target_os = "linux"))]
pub(crate) use fallback::*;
