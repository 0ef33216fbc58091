//! An unbounded FIFO queue with cancellable consumers.
//!
//! Producers never block. When a consumer is already waiting, a produced
//! value is handed to the oldest one directly, without touching the buffer;
//! otherwise it is buffered in FIFO order.
//!
//! A consumer's value type is always an `Option`: `None` means the wait was
//! cancelled before a producer arrived.
//!
//! # Example
//!
//! ```rust
//! use tether::{Queue, run};
//!
//! let queue = Queue::new();
//! queue.put(42);
//! queue.put(21);
//! assert_eq!(run(queue.async_get(Default::default())), Some(42));
//! assert_eq!(run(queue.async_get(Default::default())), Some(21));
//! ```

use std::cell::{Cell, UnsafeCell};
use std::collections::VecDeque;
use std::marker::PhantomPinned;
use std::mem;
use std::pin::Pin;
use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::cancellation::{CancellationObserver, CancellationToken};
use crate::execution::{Operation, Receiver, Sender};
use crate::list::{Linked, Links, List};

/// A waiter node carrying the hand-off slot and the waiter's observer, so
/// the producer can attempt the hand-off without knowing the operation
/// type.
#[derive(Debug)]
struct SinkNode<T> {
    links: Links<SinkNode<T>>,
    complete: Cell<Option<unsafe fn(NonNull<SinkNode<T>>)>>,
    /// Written by the producer under the queue lock during hand-off.
    value: UnsafeCell<Option<T>>,
    observer: CancellationObserver,
}

// SAFETY: all access is serialized by the queue's internal mutex; the
// completion runs after detachment.
unsafe impl<T: Send> Send for SinkNode<T> {}
// SAFETY: as above.
unsafe impl<T: Send> Sync for SinkNode<T> {}

impl<T> SinkNode<T> {
    fn new() -> Self {
        Self {
            links: Links::new(),
            complete: Cell::new(None),
            value: UnsafeCell::new(None),
            observer: CancellationObserver::new(),
        }
    }
}

// SAFETY: `links` returns the embedded field of the same node.
unsafe impl<T> Linked for SinkNode<T> {
    fn links(&self) -> &Links<Self> {
        &self.links
    }
}

#[derive(Debug)]
struct QueueInner<T> {
    buffer: VecDeque<T>,
    sinks: List<SinkNode<T>>,
}

/// An unbounded FIFO with direct hand-off to waiting consumers.
#[derive(Debug)]
pub struct Queue<T> {
    inner: Mutex<QueueInner<T>>,
}

// SAFETY: the inner state is only touched under the mutex; waiter nodes are
// kept alive by the armed operations that own them.
unsafe impl<T: Send> Send for Queue<T> {}
// SAFETY: as above.
unsafe impl<T: Send> Sync for Queue<T> {}

impl<T> Queue<T> {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                buffer: VecDeque::new(),
                sinks: List::new(),
            }),
        }
    }

    /// Produces a value.
    ///
    /// If a consumer is waiting, the value is handed to the oldest one
    /// directly. A waiter that lost the race to its own cancellation keeps
    /// the value but completes with `None`; see
    /// [`CancellationObserver::try_reset`].
    pub fn put(&self, value: T) {
        let handed_off = {
            let mut inner = self.inner.lock();
            match inner.sinks.pop_front() {
                Some(node) => {
                    // SAFETY: queued nodes belong to armed, alive
                    // operations; the value slot is only touched under this
                    // lock until the completion runs.
                    let node_ref = unsafe { node.as_ref() };
                    unsafe {
                        *node_ref.value.get() = Some(value);
                    }
                    if node_ref.observer.try_reset() {
                        Some(node)
                    } else {
                        // The waiter is being cancelled; its handler
                        // delivers the "no value" completion and the value
                        // stays with the retired waiter.
                        None
                    }
                }
                None => {
                    inner.buffer.push_back(value);
                    None
                }
            }
        };

        if let Some(node) = handed_off {
            // SAFETY: the node was detached and its observer disarmed; this
            // is the operation's only completion.
            let complete = unsafe { node.as_ref() }
                .complete
                .get()
                .expect("queued consumer without a completion");
            // SAFETY: as above.
            unsafe { complete(node) };
        }
    }

    /// Pops the head of the buffer without waiting.
    #[must_use]
    pub fn maybe_get(&self) -> Option<T> {
        self.inner.lock().buffer.pop_front()
    }

    /// Returns a sender that completes with `Some(value)` once a value is
    /// available, or with `None` if `token` is cancelled first.
    ///
    /// Completes inline if the buffer is non-empty (or the token was
    /// already cancelled).
    pub fn async_get(&self, token: CancellationToken) -> GetSender<'_, T> {
        GetSender { queue: self, token }
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        assert!(
            self.inner.get_mut().sinks.is_empty(),
            "queue dropped with outstanding consumers"
        );
    }
}

/// Sender of [`Queue::async_get`].
#[must_use = "senders do nothing unless connected and started"]
pub struct GetSender<'q, T> {
    queue: &'q Queue<T>,
    token: CancellationToken,
}

impl<'q, T> Sender for GetSender<'q, T> {
    type Value = Option<T>;
    type Operation<R: Receiver<Value = Option<T>>> = GetOperation<'q, T, R>;

    fn connect<R: Receiver<Value = Option<T>>>(self, receiver: R) -> Self::Operation<R> {
        GetOperation {
            queue: self.queue,
            token: self.token,
            node: SinkNode::new(),
            receiver,
            _pin: PhantomPinned,
        }
    }
}

/// Operation state of [`Queue::async_get`].
pub struct GetOperation<'q, T, R> {
    queue: &'q Queue<T>,
    token: CancellationToken,
    node: SinkNode<T>,
    receiver: R,
    _pin: PhantomPinned,
}

impl<T, R: Receiver<Value = Option<T>>> GetOperation<'_, T, R> {
    /// Completion from a producer's hand-off.
    unsafe fn receive(node: NonNull<SinkNode<T>>) {
        // SAFETY: the node is embedded in an alive, pinned operation.
        let this = unsafe {
            node.byte_sub(mem::offset_of!(Self, node))
                .cast::<Self>()
                .as_ptr()
        };
        // SAFETY: the producer stored the value before detaching the node;
        // delivering the completion is the last access.
        unsafe {
            let value = (*(*this).node.value.get())
                .take()
                .expect("hand-off completion without a value");
            (*this).receiver.set_value_noinline(Some(value));
        }
    }

    /// Completion from the cancellation handler.
    unsafe fn on_cancel(target: NonNull<()>) {
        let this = target.cast::<Self>().as_ptr();
        {
            // SAFETY: the operation is alive while armed.
            let queue = unsafe { (*this).queue };
            let mut inner = queue.inner.lock();
            // SAFETY: as above.
            let node = unsafe { &(*this).node };
            if node.links().is_linked() {
                // SAFETY: a linked node is a member of this queue's list.
                unsafe {
                    inner.sinks.remove(NonNull::from(node));
                }
            }
        }
        // A cancelled get always reports "no value", even when it raced a
        // hand-off; the handed value is dropped with the operation.
        //
        // SAFETY: delivering the completion is the last access.
        unsafe { (*this).receiver.set_value_noinline(None) };
    }
}

impl<T, R: Receiver<Value = Option<T>>> Operation for GetOperation<'_, T, R> {
    fn start_inline(self: Pin<&mut Self>) -> bool {
        // SAFETY: nothing is moved out of the pinned operation.
        let this = unsafe { self.get_unchecked_mut() };
        let target = NonNull::from(&mut *this).cast();

        let immediate;
        {
            let mut inner = this.queue.inner.lock();
            if let Some(value) = inner.buffer.pop_front() {
                immediate = Some(value);
            } else {
                // SAFETY: the operation is pinned and stays alive while
                // armed; the handler's last access is the completion.
                let armed =
                    unsafe { this.node.observer.try_set(&this.token, target, Self::on_cancel) };
                if armed {
                    this.node.complete.set(Some(Self::receive));
                    // SAFETY: as above.
                    unsafe {
                        inner.sinks.push_back(NonNull::from(&this.node));
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
    fn put_then_get_preserves_fifo_order() {
        let queue = Queue::new();
        queue.put(42);
        queue.put(21);
        assert_eq!(run(queue.async_get(CancellationToken::none())), Some(42));
        assert_eq!(run(queue.async_get(CancellationToken::none())), Some(21));
    }

    #[test]
    fn cancelled_get_returns_none() {
        let cancel = CancellationEvent::new();
        cancel.cancel();

        let queue = Queue::<u32>::new();
        assert_eq!(run(queue.async_get(cancel.token())), None);
    }

    #[test]
    fn maybe_get_is_non_blocking() {
        let queue = Queue::new();
        assert_eq!(queue.maybe_get(), None);
        queue.put(5);
        assert_eq!(queue.maybe_get(), Some(5));
        assert_eq!(queue.maybe_get(), None);
    }

    #[test]
    fn waiting_consumer_gets_the_value_directly() {
        with_watchdog(|| {
            static QUEUE: std::sync::OnceLock<Queue<u32>> = std::sync::OnceLock::new();
            let queue = QUEUE.get_or_init(Queue::new);

            let producer = std::thread::spawn(|| {
                std::thread::sleep(std::time::Duration::from_millis(10));
                QUEUE.get().unwrap().put(7);
            });

            assert_eq!(run(queue.async_get(CancellationToken::none())), Some(7));
            producer.join().unwrap();
        });
    }

    #[test]
    fn values_move_without_copying() {
        let queue = Queue::new();
        queue.put(Box::new(3));
        let boxed = run(queue.async_get(CancellationToken::none())).unwrap();
        assert_eq!(*boxed, 3);
    }

    #[test]
    fn thread_safe_surface() {
        assert_impl_all!(Queue<u32>: Send, Sync);
    }
}
