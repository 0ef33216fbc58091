//! Bridging between senders and Rust futures.
//!
//! Two adapters connect the sender/receiver world to `async` code:
//!
//! * [`SenderFuture`] makes any [`Sender`] awaitable. If the operation
//!   completes inline, the first poll resolves without suspending.
//! * [`FutureSender`] (via [`from_future`]) wraps any [`Future`] as a
//!   sender, so `async` blocks compose with the rest of the crate. An atomic
//!   control-flow cell arbitrates wakes racing the initial poll, delivering
//!   the completion in the correct inline/noinline variant.
//!
//! # Example
//!
//! ```rust
//! use tether::{SenderExt, from_future, run};
//!
//! let value = run(from_future(async { 21 * 2 }));
//! assert_eq!(value, 42);
//! ```

use std::future::Future;
use std::marker::PhantomPinned;
use std::pin::Pin;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use parking_lot::Mutex;

use crate::execution::{Operation, Receiver, Sender, connect};

// ############## SenderFuture ##############

#[derive(Debug)]
struct Slot<T> {
    inner: Mutex<SlotInner<T>>,
}

#[derive(Debug)]
struct SlotInner<T> {
    value: Option<T>,
    waker: Option<Waker>,
    done: bool,
}

struct SlotReceiver<T> {
    slot: NonNull<Slot<T>>,
}

// SAFETY: the receiver is a pointer to state inside the pinned future; all
// access goes through the slot's mutex.
unsafe impl<T: Send> Send for SlotReceiver<T> {}

impl<T> Receiver for SlotReceiver<T> {
    type Value = T;

    fn set_value_inline(&mut self, value: T) {
        // SAFETY: the slot lives in the `SenderFuture`, which outlives its
        // operation.
        let slot = unsafe { self.slot.as_ref() };
        let mut inner = slot.inner.lock();
        inner.value = Some(value);
        inner.done = true;
        // No wake needed: we are still inside the first poll.
    }

    fn set_value_noinline(&mut self, value: T) {
        // SAFETY: as above.
        let slot = unsafe { self.slot.as_ref() };
        let waker = {
            let mut inner = slot.inner.lock();
            inner.value = Some(value);
            inner.done = true;
            inner.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Makes a [`Sender`] awaitable.
///
/// The operation is built in place inside the future on first poll; an
/// inline completion resolves that poll immediately, otherwise the task is
/// woken when the noinline completion arrives.
///
/// # Panics
///
/// Dropping the future while its operation is armed but not yet complete
/// panics: operations cannot be abandoned.
#[must_use = "futures do nothing unless polled"]
pub struct SenderFuture<S: Sender> {
    sender: Option<S>,
    operation: Option<S::Operation<SlotReceiver<S::Value>>>,
    slot: Slot<S::Value>,
    started: bool,
    _pin: PhantomPinned,
}

impl<S: Sender> SenderFuture<S> {
    /// Wraps `sender`.
    pub fn new(sender: S) -> Self {
        Self {
            sender: Some(sender),
            operation: None,
            slot: Slot {
                inner: Mutex::new(SlotInner {
                    value: None,
                    waker: None,
                    done: false,
                }),
            },
            started: false,
            _pin: PhantomPinned,
        }
    }
}

impl<S: Sender> Future for SenderFuture<S> {
    type Output = S::Value;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<S::Value> {
        // SAFETY: we never move out of the future; the operation stays in
        // place once constructed.
        let this = unsafe { self.get_unchecked_mut() };

        if !this.started {
            this.started = true;

            // Publish the waker before starting: a noinline completion may
            // arrive from another thread the instant the operation is armed.
            this.slot.inner.lock().waker = Some(cx.waker().clone());

            let receiver = SlotReceiver {
                slot: NonNull::from(&this.slot),
            };
            let sender = this.sender.take().expect("future polled after start");
            this.operation = Some(connect(sender, receiver));

            // SAFETY: the operation lives in this pinned future and is never
            // moved after being started.
            let operation =
                unsafe { Pin::new_unchecked(this.operation.as_mut().expect("just stored")) };
            if operation.start_inline() {
                let value = {
                    let mut inner = this.slot.inner.lock();
                    debug_assert!(inner.done);
                    inner.waker = None;
                    inner.value.take()
                };
                // The completion has returned; the operation may be dropped.
                this.operation = None;
                return Poll::Ready(value.expect("operation completed without a value"));
            }
            return Poll::Pending;
        }

        let mut inner = this.slot.inner.lock();
        if inner.done {
            let value = inner
                .value
                .take()
                .expect("sender future polled after completion");
            drop(inner);
            this.operation = None;
            Poll::Ready(value)
        } else {
            inner.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

impl<S: Sender> Drop for SenderFuture<S> {
    fn drop(&mut self) {
        if self.operation.is_some() {
            let done = self.slot.inner.lock().done;
            assert!(
                done,
                "sender future dropped while its operation is armed; \
                 operations cannot be abandoned"
            );
        }
    }
}

/// Extension methods for senders.
pub trait SenderExt: Sender + Sized {
    /// Converts this sender into a future so it can be `.await`ed.
    ///
    /// # Example
    ///
    /// ```rust
    /// use tether::{SenderExt, from_future, invocable, run};
    ///
    /// let value = run(from_future(async { invocable(|| 5).into_future().await + 2 }));
    /// assert_eq!(value, 7);
    /// ```
    fn into_future(self) -> SenderFuture<Self> {
        SenderFuture::new(self)
    }
}

impl<S: Sender + Sized> SenderExt for S {}

// ############## FutureSender ##############

/// Wraps `future` as a sender.
///
/// The future runs on whichever thread starts or wakes the operation; its
/// completion is delivered inline iff the future finishes during
/// `start_inline` (including via a wake that lands while the initial poll is
/// still running).
#[must_use]
pub fn from_future<F: Future>(future: F) -> FutureSender<F> {
    FutureSender { future }
}

/// Sender of [`from_future`].
#[must_use = "senders do nothing unless connected and started"]
pub struct FutureSender<F: Future> {
    future: F,
}

impl<F: Future> Sender for FutureSender<F> {
    type Value = F::Output;
    type Operation<R: Receiver<Value = F::Output>> = FutureOperation<F, R>;

    fn connect<R: Receiver<Value = F::Output>>(self, receiver: R) -> Self::Operation<R> {
        FutureOperation {
            future: Some(self.future),
            receiver,
            flow: AtomicU8::new(IDLE),
            _pin: PhantomPinned,
        }
    }
}

/// Control-flow position of the embedded future.
///
/// This is the handshake that distinguishes "future finished inside start"
/// from "future suspended and completes later", even when the finishing wake
/// arrives on another thread while the starting thread is still polling.
const IDLE: u8 = 0;
const POLLING: u8 = 1;
const NOTIFIED: u8 = 2;
const DONE: u8 = 3;

/// Operation state of [`FutureSender`].
pub struct FutureOperation<F: Future, R> {
    future: Option<F>,
    receiver: R,
    flow: AtomicU8,
    _pin: PhantomPinned,
}

impl<F, R> FutureOperation<F, R>
where
    F: Future,
    R: Receiver<Value = F::Output>,
{
    const VTABLE: RawWakerVTable = RawWakerVTable::new(
        |data| RawWaker::new(data, &Self::VTABLE),
        // wake
        |data| {
            // SAFETY: the waker points at the pinned operation, which stays
            // alive until its completion; see the module docs for the
            // no-wake-after-completion contract.
            unsafe { Self::wake(data.cast::<Self>().cast_mut()) }
        },
        // wake_by_ref
        |data| {
            // SAFETY: as above.
            unsafe { Self::wake(data.cast::<Self>().cast_mut()) }
        },
        // drop
        |_| {},
    );

    /// Polls the future until it is pending with no notification outstanding
    /// or it produces a value.
    ///
    /// # Safety
    ///
    /// `this` must point to the pinned, alive operation, and the caller must
    /// have won the transition into `POLLING`.
    unsafe fn poll_to_quiescence(this: *mut Self) -> Option<F::Output> {
        loop {
            // SAFETY: the operation is pinned, so the embedded future is too.
            let future = unsafe {
                Pin::new_unchecked(
                    (*this)
                        .future
                        .as_mut()
                        .expect("future polled after completion"),
                )
            };

            // SAFETY: the vtable keeps the raw pointer alive per the module
            // contract.
            let waker = unsafe {
                Waker::from_raw(RawWaker::new(this.cast::<()>().cast_const(), &Self::VTABLE))
            };
            let mut cx = Context::from_waker(&waker);

            match future.poll(&mut cx) {
                Poll::Ready(value) => {
                    // SAFETY: we own the polling state; nobody else touches
                    // the future slot.
                    unsafe {
                        (*this).flow.store(DONE, Ordering::Release);
                        (*this).future = None;
                    }
                    return Some(value);
                }
                Poll::Pending => {
                    // SAFETY: `flow` is a plain atomic field of the alive
                    // operation.
                    let flow = unsafe { &(*this).flow };
                    match flow.compare_exchange(
                        POLLING,
                        IDLE,
                        Ordering::Release,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return None,
                        Err(state) => {
                            debug_assert_eq!(state, NOTIFIED);
                            flow.store(POLLING, Ordering::Relaxed);
                        }
                    }
                }
            }
        }
    }

    /// Waker entry point.
    ///
    /// # Safety
    ///
    /// `this` must point to the operation; the operation stays alive until
    /// its completion has been delivered.
    unsafe fn wake(this: *mut Self) {
        // SAFETY: per this function's contract.
        let flow = unsafe { &(*this).flow };
        loop {
            match flow.load(Ordering::Acquire) {
                IDLE => {
                    if flow
                        .compare_exchange(IDLE, POLLING, Ordering::Acquire, Ordering::Acquire)
                        .is_ok()
                    {
                        // We own the poll now; a completion here is noinline.
                        //
                        // SAFETY: per this function's contract.
                        if let Some(value) = unsafe { Self::poll_to_quiescence(this) } {
                            // SAFETY: delivering the completion is the last
                            // access to the operation.
                            unsafe { (*this).receiver.set_value_noinline(value) };
                        }
                        return;
                    }
                }
                POLLING => {
                    if flow
                        .compare_exchange(POLLING, NOTIFIED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    }
                }
                // A wake while already notified or after completion is a
                // no-op.
                NOTIFIED | DONE => return,
                state => unreachable!("invalid control-flow state: {state}"),
            }
        }
    }
}

impl<F, R> Operation for FutureOperation<F, R>
where
    F: Future,
    R: Receiver<Value = F::Output>,
{
    fn start_inline(self: Pin<&mut Self>) -> bool {
        // SAFETY: we never move out of the operation; all further access
        // goes through the raw pointer so that concurrent wakes and this
        // frame do not hold overlapping references.
        let this: *mut Self = unsafe { self.get_unchecked_mut() };

        // SAFETY: `flow` is a field of the alive operation.
        unsafe { &(*this).flow }.store(POLLING, Ordering::Relaxed);

        // SAFETY: the operation is pinned and we won the POLLING transition.
        if let Some(value) = unsafe { Self::poll_to_quiescence(this) } {
            // SAFETY: still inside `start_inline`, so the inline variant is
            // correct; the operation is alive.
            unsafe { (*this).receiver.set_value_inline(value) };
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;

    use super::*;
    use crate::algorithm::invocable;
    use crate::execution::run;
    use crate::test_utils::with_watchdog;

    #[test]
    fn sender_future_resolves_inline() {
        let value = block_on(invocable(|| 11).into_future());
        assert_eq!(value, 11);
    }

    #[test]
    fn from_future_completes_inline() {
        let value = run(from_future(async { 42 }));
        assert_eq!(value, 42);
    }

    #[test]
    fn nested_bridging_round_trips() {
        let value = run(from_future(async {
            let a = invocable(|| 20).into_future().await;
            let b = invocable(|| 22).into_future().await;
            a + b
        }));
        assert_eq!(value, 42);
    }

    #[test]
    fn noinline_completion_wakes_the_future() {
        use crate::OneshotEvent;

        with_watchdog(|| {
            static EVENT: OneshotEvent = OneshotEvent::new();

            let waiter = std::thread::spawn(|| {
                run(from_future(async {
                    EVENT.wait().into_future().await;
                    5
                }))
            });

            std::thread::sleep(std::time::Duration::from_millis(10));
            EVENT.raise();
            assert_eq!(waiter.join().unwrap(), 5);
        });
    }
}
