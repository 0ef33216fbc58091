//! A multiple-consumer result slot.
//!
//! A [`Promise`] is the producing end of a heap-shared, set-once value; a
//! [`Future`] is a consuming handle. Any number of futures may observe the
//! same value: each completed `get` hands back a [`SharedValue`] that
//! borrows the one shared slot, so the payload is never copied.
//!
//! # Example
//!
//! ```rust
//! use tether::{Promise, run};
//!
//! let promise = Promise::new();
//! let future = promise.future();
//! promise.set_value(3);
//!
//! let value = run(future.get_unchecked());
//! assert_eq!(*value, 3);
//! ```

use std::cell::UnsafeCell;
use std::marker::PhantomPinned;
use std::mem;
use std::ops::Deref;
use std::pin::Pin;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::algorithm::{Transform, transform};
use crate::cancellation::{CancellationObserver, CancellationToken};
use crate::execution::{Operation, Receiver, Sender};
use crate::list::{Linked, List, OpNode};

#[derive(Debug)]
struct SharedState<T> {
    waiters: Mutex<List<OpNode>>,
    /// Release-published by `set_value`; once observed with acquire
    /// ordering, the slot below is immutable and safe to read.
    has_value: AtomicBool,
    value: UnsafeCell<Option<T>>,
}

// SAFETY: the slot is written once, under the waiter lock, before
// `has_value` is released; afterwards it is only read.
unsafe impl<T: Send> Send for SharedState<T> {}
// SAFETY: as above; concurrent readers only take shared references.
unsafe impl<T: Send + Sync> Sync for SharedState<T> {}

impl<T> SharedState<T> {
    fn new() -> Self {
        Self {
            waiters: Mutex::new(List::new()),
            has_value: AtomicBool::new(false),
            value: UnsafeCell::new(None),
        }
    }

    fn has_value(&self) -> bool {
        self.has_value.load(Ordering::Acquire)
    }
}

/// The producing end of a shared result slot.
#[derive(Debug)]
pub struct Promise<T> {
    state: Arc<SharedState<T>>,
}

impl<T> Promise<T> {
    /// Creates a promise with an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(SharedState::new()),
        }
    }

    /// Returns a consuming handle; may be called any number of times.
    #[must_use]
    pub fn future(&self) -> Future<T> {
        Future {
            state: Arc::clone(&self.state),
        }
    }

    /// Stores the value and wakes every waiting consumer.
    ///
    /// Consumes the promise; the slot can only be set once.
    pub fn set_value(self, value: T) {
        let mut drained = {
            let mut waiters = self.state.waiters.lock();
            // SAFETY: the slot is written exactly once — `set_value`
            // consumes the only promise handle — under the lock, before
            // the flag is released.
            unsafe {
                *self.state.value.get() = Some(value);
            }
            self.state.has_value.store(true, Ordering::Release);
            waiters.take()
        };

        while let Some(node) = drained.pop_front() {
            // SAFETY: the node was detached under the lock; its operation
            // is armed and alive.
            unsafe { OpNode::complete(node) };
        }
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A consuming handle to a [`Promise`]'s slot.
///
/// Futures are freely clonable; every consumer observes the same value.
#[derive(Debug)]
pub struct Future<T> {
    state: Arc<SharedState<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> Future<T> {
    /// Returns a sender that completes with `Some(handle)` once the value
    /// is set, or with `None` if `token` is cancelled first.
    ///
    /// Completes inline if the value is already present.
    pub fn get(&self, token: CancellationToken) -> FutureGetSender<T> {
        FutureGetSender {
            state: Arc::clone(&self.state),
            token,
        }
    }

    /// Returns a sender that completes with the value's handle.
    pub fn get_unchecked(&self) -> Transform<FutureGetSender<T>, GetUnchecked<T>, SharedValue<T>> {
        transform(self.get(CancellationToken::none()), unwrap_present)
    }
}

type GetUnchecked<T> = fn(Option<SharedValue<T>>) -> SharedValue<T>;

fn unwrap_present<T>(value: Option<SharedValue<T>>) -> SharedValue<T> {
    value.expect("uncancellable future get reported cancellation")
}

/// A zero-copy view of the promised value; derefs to the payload.
#[derive(Debug)]
pub struct SharedValue<T> {
    state: Arc<SharedState<T>>,
}

impl<T> Clone for SharedValue<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> Deref for SharedValue<T> {
    type Target = T;

    fn deref(&self) -> &T {
        debug_assert!(self.state.has_value());
        // SAFETY: a `SharedValue` is only constructed after `has_value` was
        // observed with acquire ordering; the slot is immutable from then
        // on.
        unsafe { &*self.state.value.get() }
            .as_ref()
            .expect("shared value handle without a stored value")
    }
}

/// Sender of [`Future::get`].
#[derive(Debug)]
#[must_use = "senders do nothing unless connected and started"]
pub struct FutureGetSender<T> {
    state: Arc<SharedState<T>>,
    token: CancellationToken,
}

impl<T> Sender for FutureGetSender<T> {
    type Value = Option<SharedValue<T>>;
    type Operation<R: Receiver<Value = Option<SharedValue<T>>>> = FutureGetOperation<T, R>;

    fn connect<R: Receiver<Value = Option<SharedValue<T>>>>(
        self,
        receiver: R,
    ) -> Self::Operation<R> {
        FutureGetOperation {
            state: self.state,
            token: self.token,
            node: OpNode::new(),
            observer: CancellationObserver::new(),
            receiver,
            _pin: PhantomPinned,
        }
    }
}

/// Operation state of [`Future::get`].
pub struct FutureGetOperation<T, R> {
    state: Arc<SharedState<T>>,
    token: CancellationToken,
    node: OpNode,
    observer: CancellationObserver,
    receiver: R,
    _pin: PhantomPinned,
}

impl<T, R: Receiver<Value = Option<SharedValue<T>>>> FutureGetOperation<T, R> {
    fn shared_value(state: &Arc<SharedState<T>>) -> SharedValue<T> {
        SharedValue {
            state: Arc::clone(state),
        }
    }

    /// Completion from `set_value`'s drain.
    unsafe fn awakened(node: NonNull<OpNode>) {
        // SAFETY: the node is embedded in an alive, pinned operation.
        let this = unsafe {
            node.byte_sub(mem::offset_of!(Self, node))
                .cast::<Self>()
                .as_ptr()
        };
        // SAFETY: the operation is alive; if the observer cannot be reset
        // the raced cancellation handler owns the completion instead.
        unsafe {
            if (*this).observer.try_reset() {
                let value = Self::shared_value(&(*this).state);
                (*this).receiver.set_value_noinline(Some(value));
            }
        }
    }

    /// Completion from the cancellation handler.
    unsafe fn on_cancel(target: NonNull<()>) {
        let this = target.cast::<Self>().as_ptr();
        let value;
        {
            // SAFETY: the operation is alive while armed.
            let state = unsafe { &(*this).state };
            let mut waiters = state.waiters.lock();
            // SAFETY: as above.
            let node = unsafe { &(*this).node };
            if node.links().is_linked() {
                // SAFETY: a linked node is a member of this slot's list.
                unsafe {
                    waiters.remove(NonNull::from(node));
                }
            }
            // A cancellation that raced the value's arrival still observes
            // the value.
            value = state.has_value().then(|| Self::shared_value(state));
        }
        // SAFETY: delivering the completion is the last access.
        unsafe { (*this).receiver.set_value_noinline(value) };
    }
}

impl<T, R: Receiver<Value = Option<SharedValue<T>>>> Operation for FutureGetOperation<T, R> {
    fn start_inline(self: Pin<&mut Self>) -> bool {
        // SAFETY: nothing is moved out of the pinned operation.
        let this = unsafe { self.get_unchecked_mut() };
        let target = NonNull::from(&mut *this).cast();

        let immediate;
        {
            let mut waiters = this.state.waiters.lock();
            if this.state.has_value() {
                immediate = Some(Self::shared_value(&this.state));
            } else {
                // SAFETY: the operation is pinned and stays alive while
                // armed; the handler's last access is the completion.
                let armed = unsafe { this.observer.try_set(&this.token, target, Self::on_cancel) };
                if armed {
                    this.node.set_complete(Self::awakened);
                    // SAFETY: as above.
                    unsafe {
                        waiters.push_back(NonNull::from(&this.node));
                    }
                    return false;
                }
                immediate = None;
            }
        }

        this.receiver.set_value_inline(immediate);
        true
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::cancellation::CancellationEvent;
    use crate::execution::run;
    use crate::test_utils::with_watchdog;

    #[test]
    fn unit_valued_promise() {
        let promise = Promise::new();
        let future = promise.future();
        promise.set_value(());
        run(future.get_unchecked());
    }

    #[test]
    fn value_set_before_get() {
        let promise = Promise::new();
        let future = promise.future();
        promise.set_value(3);

        let value = run(future.get_unchecked());
        assert_eq!(*value, 3);
    }

    #[test]
    fn non_copyable_value_is_shared_not_copied() {
        struct NonCopy(i32);

        let promise = Promise::new();
        let future = promise.future();
        promise.set_value(NonCopy(3));

        let value = run(future.get_unchecked());
        assert_eq!(value.0, 3);
    }

    #[test]
    fn multiple_futures_observe_the_same_value() {
        let promise = Promise::new();
        let f1 = promise.future();
        let f2 = f1.clone();
        let f3 = promise.future();
        promise.set_value(3);

        let v1 = run(f1.get_unchecked());
        let v2 = run(f2.get_unchecked());
        let v3 = run(f3.get_unchecked());

        assert!(std::ptr::eq(&*v1, &*v2));
        assert!(std::ptr::eq(&*v1, &*v3));
        assert_eq!(*v1, 3);
    }

    #[test]
    fn cancelled_get_returns_none() {
        let cancel = CancellationEvent::new();
        cancel.cancel();

        let promise = Promise::<u32>::new();
        let future = promise.future();
        assert!(run(future.get(cancel.token())).is_none());
        promise.set_value(1);
    }

    #[test]
    fn cross_thread_set_wakes_getters() {
        with_watchdog(|| {
            let promise = Promise::new();
            let future = promise.future();

            let setter = std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(10));
                promise.set_value(11);
            });

            let value = run(future.get_unchecked());
            assert_eq!(*value, 11);
            setter.join().unwrap();
        });
    }

    #[test]
    fn thread_safe_surface() {
        assert_impl_all!(Promise<u32>: Send, Sync);
        assert_impl_all!(Future<u32>: Send, Sync, Clone);
        assert_impl_all!(SharedValue<u32>: Send, Sync, Clone);
    }
}
