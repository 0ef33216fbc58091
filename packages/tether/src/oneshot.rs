//! One-shot events.
//!
//! Two flavors:
//!
//! * [`OneshotPrimitive`] — the minimal lock-free building block: a single
//!   atomic word that is either the head of the waiter list or the fired
//!   sentinel. No cancellation support.
//! * [`OneshotEvent`] — the full-featured event, layered on a
//!   [`WaitGroup`](crate::WaitGroup) with an initial count of one, which is
//!   what gives its waits cancellation support for free.
//!
//! Raising either event twice is a contract violation.
//!
//! # Example
//!
//! ```rust
//! use tether::{OneshotEvent, run};
//!
//! let event = OneshotEvent::new();
//! event.raise();
//! run(event.wait());
//! ```

use std::cell::Cell;
use std::marker::PhantomPinned;
use std::mem;
use std::pin::Pin;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::algorithm::Transform;
use crate::cancellation::CancellationToken;
use crate::execution::{Operation, Receiver, Sender};
use crate::wait_group::{GroupWaitSender, WaitGroup};

// ############## OneshotPrimitive ##############

/// A waiter in the primitive's lock-free singly-linked list.
#[derive(Debug)]
struct ChainNode {
    next: Cell<*mut ChainNode>,
    complete: Cell<Option<unsafe fn(NonNull<ChainNode>)>>,
}

// SAFETY: the node is published by a release compare-and-swap and consumed
// by exactly one raise, which acquires it.
unsafe impl Send for ChainNode {}
// SAFETY: as above.
unsafe impl Sync for ChainNode {}

/// The fired sentinel. Any non-null, non-node value works; `raise` swaps it
/// in and every later wait observes it.
fn fired() -> *mut ChainNode {
    ptr::without_provenance_mut(1)
}

/// A minimal, allocation-free, lock-free one-shot event.
///
/// `wait` operations prepend themselves to an atomic list; `raise` detaches
/// the whole list with one swap and completes it in detachment order. Waits
/// that begin after the raise complete inline.
#[derive(Debug)]
pub struct OneshotPrimitive {
    /// Null: no waiters. [`fired`]: raised. Otherwise: list head.
    state: AtomicPtr<ChainNode>,
}

// SAFETY: see `ChainNode`; the head pointer itself is atomic.
unsafe impl Send for OneshotPrimitive {}
// SAFETY: as above.
unsafe impl Sync for OneshotPrimitive {}

impl OneshotPrimitive {
    /// Creates an unraised event.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Raises the event, completing every current waiter.
    ///
    /// # Panics
    ///
    /// Panics if the event was already raised.
    pub fn raise(&self) {
        let mut head = self.state.swap(fired(), Ordering::AcqRel);
        assert!(head != fired(), "one-shot primitive raised twice");

        while let Some(node) = NonNull::new(head) {
            // SAFETY: nodes on the chain belong to armed, alive operations;
            // the chain was detached in one swap, so nobody else walks it.
            head = unsafe { node.as_ref() }.next.get();
            // SAFETY: as above; the completion is the last access to the
            // node.
            let complete = unsafe { node.as_ref() }
                .complete
                .get()
                .expect("queued waiter without a completion");
            // SAFETY: as above.
            unsafe { complete(node) };
        }
    }

    /// Returns a sender that completes once the event has been raised.
    pub fn wait(&self) -> PrimitiveWaitSender<'_> {
        PrimitiveWaitSender { event: self }
    }
}

impl Default for OneshotPrimitive {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for OneshotPrimitive {
    fn drop(&mut self) {
        let state = *self.state.get_mut();
        assert!(
            state.is_null() || state == fired(),
            "one-shot primitive dropped with outstanding waiters"
        );
    }
}

/// Sender of [`OneshotPrimitive::wait`].
#[derive(Debug)]
#[must_use = "senders do nothing unless connected and started"]
pub struct PrimitiveWaitSender<'e> {
    event: &'e OneshotPrimitive,
}

impl<'e> Sender for PrimitiveWaitSender<'e> {
    type Value = ();
    type Operation<R: Receiver<Value = ()>> = PrimitiveWaitOperation<'e, R>;

    fn connect<R: Receiver<Value = ()>>(self, receiver: R) -> Self::Operation<R> {
        PrimitiveWaitOperation {
            event: self.event,
            node: ChainNode {
                next: Cell::new(ptr::null_mut()),
                complete: Cell::new(None),
            },
            receiver,
            _pin: PhantomPinned,
        }
    }
}

/// Operation state of [`OneshotPrimitive::wait`].
pub struct PrimitiveWaitOperation<'e, R> {
    event: &'e OneshotPrimitive,
    node: ChainNode,
    receiver: R,
    _pin: PhantomPinned,
}

impl<R: Receiver<Value = ()>> PrimitiveWaitOperation<'_, R> {
    unsafe fn complete(node: NonNull<ChainNode>) {
        // SAFETY: the node is embedded in an alive, pinned operation.
        let this = unsafe {
            node.byte_sub(mem::offset_of!(Self, node))
                .cast::<Self>()
                .as_ptr()
        };
        // SAFETY: delivering the completion is the last access.
        unsafe { (*this).receiver.set_value_noinline(()) };
    }
}

impl<R: Receiver<Value = ()>> Operation for PrimitiveWaitOperation<'_, R> {
    fn start_inline(self: Pin<&mut Self>) -> bool {
        // SAFETY: nothing is moved out of the pinned operation.
        let this = unsafe { self.get_unchecked_mut() };
        this.node.complete.set(Some(Self::complete));

        let node = NonNull::from(&this.node).as_ptr();
        let mut current = this.event.state.load(Ordering::Acquire);
        loop {
            if current == fired() {
                this.receiver.set_value_inline(());
                return true;
            }
            this.node.next.set(current);
            // Release publishes the node's fields; acquire on failure so a
            // concurrently observed `fired` is fully visible.
            match this.event.state.compare_exchange_weak(
                current,
                node,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return false,
                Err(now) => current = now,
            }
        }
    }
}

// ############## OneshotEvent ##############

/// A one-shot event with cancellable waits.
///
/// Layered on a [`WaitGroup`] with an initial count of one: raising the
/// event is the group's final `done`.
#[derive(Debug)]
pub struct OneshotEvent {
    group: WaitGroup,
}

impl OneshotEvent {
    /// Creates an unraised event.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            group: WaitGroup::new(1),
        }
    }

    /// Raises the event, waking all waiters.
    ///
    /// # Panics
    ///
    /// Panics if the event was already raised.
    pub fn raise(&self) {
        self.group.done();
    }

    /// Returns a sender that completes with `true` once the event is
    /// raised, or with `false` if `token` is cancelled first.
    pub fn wait_cancellable(&self, token: CancellationToken) -> GroupWaitSender<'_> {
        self.group.wait_cancellable(token)
    }

    /// Returns a sender that completes once the event is raised.
    ///
    /// Waits that begin after the raise complete inline.
    pub fn wait(&self) -> Transform<GroupWaitSender<'_>, fn(bool), ()> {
        self.group.wait()
    }
}

impl Default for OneshotEvent {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::cancellation::CancellationEvent;
    use crate::execution::{detach, run};
    use crate::test_utils::with_watchdog;

    #[test]
    fn primitive_raise_before_wait() {
        let event = OneshotPrimitive::new();
        event.raise();
        run(event.wait());
    }

    #[test]
    fn primitive_wait_before_raise() {
        static EVENT: OneshotPrimitive = OneshotPrimitive::new();
        static DONE: AtomicBool = AtomicBool::new(false);

        detach(crate::transform(EVENT.wait(), |()| {
            DONE.store(true, Ordering::SeqCst);
        }));

        assert!(!DONE.load(Ordering::SeqCst));
        EVENT.raise();
        assert!(DONE.load(Ordering::SeqCst));
    }

    #[test]
    #[should_panic(expected = "one-shot primitive raised twice")]
    fn primitive_double_raise_panics() {
        let event = OneshotPrimitive::new();
        event.raise();
        event.raise();
    }

    #[test]
    fn primitive_cross_thread() {
        with_watchdog(|| {
            static EVENT: OneshotPrimitive = OneshotPrimitive::new();

            let raiser = std::thread::spawn(|| {
                std::thread::sleep(std::time::Duration::from_millis(10));
                EVENT.raise();
            });

            run(EVENT.wait());
            raiser.join().unwrap();
        });
    }

    #[test]
    fn event_raise_then_wait_completes_inline() {
        let event = OneshotEvent::new();
        event.raise();
        run(event.wait());
        // Late waits keep completing immediately.
        run(event.wait());
    }

    #[test]
    fn event_cancelled_wait_reports_false() {
        let cancel = CancellationEvent::new();
        cancel.cancel();

        let event = OneshotEvent::new();
        assert!(!run(event.wait_cancellable(cancel.token())));
        event.raise();
    }

    #[test]
    #[should_panic(expected = "wait group done() without outstanding work")]
    fn event_double_raise_panics() {
        let event = OneshotEvent::new();
        event.raise();
        event.raise();
    }

    #[test]
    fn thread_safe_surface() {
        assert_impl_all!(OneshotPrimitive: Send, Sync);
        assert_impl_all!(OneshotEvent: Send, Sync);
    }
}
