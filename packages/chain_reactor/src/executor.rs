//! The bridge through which a suspension point hands its coroutine to a reactor.

use std::any::{Any, type_name};
use std::fmt;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tracing::warn;

use crate::Coroutine;

/// Something that can schedule a suspended coroutine for later resumption.
///
/// [`Scheduler`][crate::Scheduler] implements this by queueing a
/// [`CoroutineEvent`][crate::CoroutineEvent] on its wake chain.
pub trait AsyncExecutor: Send + Sync {
    /// Takes responsibility for eventually resuming `coroutine`.
    ///
    /// Returns `true` if the calling coroutine must suspend now, `false` if the executor
    /// declined and the caller should continue immediately without yielding.
    fn async_execute(&self, coroutine: Coroutine) -> bool;
}

/// A suspension point that hands the current coroutine to an [`AsyncExecutor`] and, once
/// resumed, yields the value of type `T` found in the coroutine's context slot.
///
/// Awaiting it outside of a [`Coroutine`] body completes immediately with `None`.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
///
/// use chain_reactor::{AsyncExecutor, Coroutine, Suspend};
/// use parking_lot::Mutex;
///
/// #[derive(Default)]
/// struct Parking {
///     parked: Mutex<Option<Coroutine>>,
/// }
///
/// impl AsyncExecutor for Parking {
///     fn async_execute(&self, coroutine: Coroutine) -> bool {
///         *self.parked.lock() = Some(coroutine);
///         true
///     }
/// }
///
/// let executor = Arc::new(Parking::default());
/// let result = Arc::new(Mutex::new(None));
///
/// let _coroutine = Coroutine::spawn({
///     let executor = Arc::clone(&executor);
///     let result = Arc::clone(&result);
///     async move {
///         *result.lock() = Suspend::<i32>::new(executor, true).await;
///     }
/// });
///
/// let parked = executor.parked.lock().take().unwrap();
/// parked.set_context(42_i32);
/// parked.notify().unwrap();
///
/// assert_eq!(*result.lock(), Some(42));
/// ```
pub struct Suspend<T> {
    executor: Arc<dyn AsyncExecutor>,
    suspend: bool,
    handed_over: bool,
    _value: PhantomData<fn() -> T>,
}

impl<T> Suspend<T>
where
    T: Any + Send,
{
    /// Creates a suspension point.
    ///
    /// If `suspend` is `false`, awaiting completes synchronously with the current context value
    /// and the executor is never involved.
    #[must_use]
    pub fn new(executor: Arc<dyn AsyncExecutor>, suspend: bool) -> Self {
        Self {
            executor,
            suspend,
            handed_over: false,
            _value: PhantomData,
        }
    }
}

impl<T> Future for Suspend<T>
where
    T: Any + Send,
{
    type Output = Option<T>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(coroutine) = Coroutine::current() else {
            warn!("suspension point awaited outside of a coroutine, continuing without suspending");
            return Poll::Ready(None);
        };

        if self.handed_over || !self.suspend {
            return Poll::Ready(coroutine.take_context());
        }

        if self.executor.async_execute(coroutine.clone()) {
            self.handed_over = true;
            Poll::Pending
        } else {
            Poll::Ready(coroutine.take_context())
        }
    }
}

impl<T> fmt::Debug for Suspend<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("suspend", &self.suspend)
            .field("handed_over", &self.handed_over)
            .finish_non_exhaustive()
    }
}
