//! Suspended computations that a reactor can resume.

use std::any::{Any, type_name};
use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::future::BoxFuture;
use futures::task::{self as future_task, ArcWake};
use parking_lot::Mutex;
use tracing::{error, trace};

use crate::{Error, Result};

thread_local! {
    static CURRENT: RefCell<Option<Coroutine>> = const { RefCell::new(None) };
}

/// Lifecycle state of a [`Coroutine`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum CoroutineState {
    /// The body has not been polled yet.
    Created,

    /// The body is being polled by some thread.
    Running,

    /// The body returned from its last poll without completing and waits for a resume.
    Suspended,

    /// The body has completed, either normally or by panicking.
    Done,
}

#[derive(Debug)]
struct Lifecycle {
    state: CoroutineState,

    // A resume that arrived while the body was still running. The running thread polls
    // again instead of parking.
    resume_pending: bool,
}

struct CoroutineInner {
    lifecycle: Mutex<Lifecycle>,

    // `None` once the body has completed. Only the thread that moved the lifecycle to
    // `Running` ever locks this.
    body: Mutex<Option<BoxFuture<'static, ()>>>,

    context: Mutex<Option<Box<dyn Any + Send>>>,
    failure: Mutex<Option<String>>,
}

impl ArcWake for CoroutineInner {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        let coroutine = Coroutine {
            inner: Arc::clone(arc_self),
        };

        if let Err(error) = coroutine.notify() {
            trace!(%error, "ignoring wake of coroutine that cannot be resumed");
        }
    }
}

/// A handle to a paused unit of work plus a one-slot context used to pass a value between a
/// suspension point and whatever resumes it.
///
/// The body is an ordinary future. It runs on whichever thread calls
/// [`notify()`][Self::notify], typically a reactor thread dispatching a
/// [`CoroutineEvent`][crate::CoroutineEvent]. Suspension points inside the body are
/// [`Suspend`][crate::Suspend] awaiters, which hand the coroutine to an
/// [`AsyncExecutor`][crate::AsyncExecutor] and return control to the caller of `notify()`.
///
/// Cloning the handle is cheap and every clone refers to the same computation. The body is
/// dropped as soon as it completes.
///
/// # Failures
///
/// A panic inside the body is caught at the poll boundary, logged and recorded; it is available
/// from [`failure()`][Self::failure] and the coroutine is considered done. The panic never
/// reaches the thread that resumed the coroutine.
///
/// # Example
///
/// ```rust
/// use chain_reactor::{Coroutine, CoroutineState};
///
/// let coroutine = Coroutine::spawn(async {
///     let coroutine = Coroutine::current().unwrap();
///     coroutine.set_context(42_i32);
/// });
///
/// assert_eq!(coroutine.state(), CoroutineState::Done);
/// assert_eq!(coroutine.take_context::<i32>(), Some(42));
/// ```
#[derive(Clone)]
pub struct Coroutine {
    inner: Arc<CoroutineInner>,
}

impl Coroutine {
    /// Creates a coroutine without running any of its body.
    ///
    /// The first [`notify()`][Self::notify] starts it.
    #[must_use]
    pub fn new<F>(body: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            inner: Arc::new(CoroutineInner {
                lifecycle: Mutex::new(Lifecycle {
                    state: CoroutineState::Created,
                    resume_pending: false,
                }),
                body: Mutex::new(Some(body.boxed())),
                context: Mutex::new(None),
                failure: Mutex::new(None),
            }),
        }
    }

    /// Creates a coroutine and runs its body on the current thread until it first suspends
    /// or completes.
    #[must_use]
    pub fn spawn<F>(body: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let coroutine = Self::new(body);

        coroutine
            .notify()
            .expect("a freshly created coroutine is always resumable");

        coroutine
    }

    /// The coroutine whose body is being polled on the current thread, if any.
    #[must_use]
    pub fn current() -> Option<Self> {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// Resumes the coroutine, polling its body on the current thread until it suspends again
    /// or completes.
    ///
    /// If the body is in the middle of being polled on another thread (it handed itself to an
    /// executor that resumed it before the poll returned), the resume is recorded and that
    /// thread polls again. At most one such early resume is accepted per suspension.
    ///
    /// # Errors
    ///
    /// [`Error::CoroutineDone`] if the body has already completed.
    /// [`Error::ResumeAlreadyPending`] if an early resume has already been recorded.
    pub fn notify(&self) -> Result<()> {
        {
            let mut lifecycle = self.inner.lifecycle.lock();

            match lifecycle.state {
                CoroutineState::Created | CoroutineState::Suspended => {
                    lifecycle.state = CoroutineState::Running;
                }
                CoroutineState::Running if !lifecycle.resume_pending => {
                    lifecycle.resume_pending = true;
                    return Ok(());
                }
                CoroutineState::Running => return Err(Error::ResumeAlreadyPending),
                CoroutineState::Done => return Err(Error::CoroutineDone),
            }
        }

        self.run();
        Ok(())
    }

    /// Whether the body has run to completion (or panicked).
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state() == CoroutineState::Done
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> CoroutineState {
        self.inner.lifecycle.lock().state
    }

    /// Stores a value in the context slot, replacing any previous value.
    pub fn set_context<T>(&self, value: T)
    where
        T: Any + Send,
    {
        self.set_context_boxed(Box::new(value));
    }

    pub(crate) fn set_context_boxed(&self, value: Box<dyn Any + Send>) {
        *self.inner.context.lock() = Some(value);
    }

    /// Returns a copy of the context value if it is of type `T`, leaving it in place.
    #[must_use]
    pub fn context<T>(&self) -> Option<T>
    where
        T: Any + Send + Clone,
    {
        self.inner
            .context
            .lock()
            .as_ref()
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
    }

    /// Removes and returns the context value if it is of type `T`.
    ///
    /// A value of any other type is left in place.
    #[must_use]
    pub fn take_context<T>(&self) -> Option<T>
    where
        T: Any + Send,
    {
        let mut context = self.inner.context.lock();

        if !context.as_ref().is_some_and(|value| value.is::<T>()) {
            return None;
        }

        context
            .take()
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }

    /// The panic message of the body, if it panicked.
    #[must_use]
    pub fn failure(&self) -> Option<String> {
        self.inner.failure.lock().clone()
    }

    fn run(&self) {
        let waker = future_task::waker(Arc::clone(&self.inner));
        let mut cx = Context::from_waker(&waker);

        let _current = CurrentGuard::enter(self.clone());
        let mut body = self.inner.body.lock();

        loop {
            let Some(future) = body.as_mut() else {
                self.inner.lifecycle.lock().state = CoroutineState::Done;
                return;
            };

            match panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx))) {
                Ok(Poll::Pending) => {
                    let mut lifecycle = self.inner.lifecycle.lock();

                    if mem::take(&mut lifecycle.resume_pending) {
                        continue;
                    }

                    lifecycle.state = CoroutineState::Suspended;
                    return;
                }
                Ok(Poll::Ready(())) => {
                    *body = None;
                    self.inner.lifecycle.lock().state = CoroutineState::Done;
                    trace!("coroutine completed");
                    return;
                }
                Err(payload) => {
                    *body = None;

                    let message = panic_message(&payload);
                    error!(panic_message = %message, "coroutine body panicked");

                    *self.inner.failure.lock() = Some(message);
                    self.inner.lifecycle.lock().state = CoroutineState::Done;
                    return;
                }
            }
        }
    }
}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("state", &self.state())
            .field("failed", &self.inner.failure.lock().is_some())
            .finish_non_exhaustive()
    }
}

/// Marks a coroutine as current on this thread for as long as it is being polled.
struct CurrentGuard {
    previous: Option<Coroutine>,
}

impl CurrentGuard {
    fn enter(coroutine: Coroutine) -> Self {
        let previous = CURRENT.with(|current| current.replace(Some(coroutine)));
        Self { previous }
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
