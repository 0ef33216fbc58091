//! An event with a monotonic sequence counter.
//!
//! Every raise increments a 64-bit sequence. Waiters pass in the last
//! sequence they observed and complete with a newer one as soon as it
//! exists; a cancelled wait completes with the newest value it can vouch
//! for, which may be the caller's own stale one.
//!
//! # Example
//!
//! ```rust
//! use tether::{SequencedEvent, run};
//!
//! let event = SequencedEvent::new();
//! event.raise();
//! let seq = run(event.async_wait(0, Default::default()));
//! assert_eq!(seq, 1);
//! ```

use std::marker::PhantomPinned;
use std::mem;
use std::pin::Pin;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::cancellation::{CancellationObserver, CancellationToken};
use crate::execution::{Operation, Receiver, Sender};
use crate::list::{Linked, List, OpNode};

/// A monotonic event: waiters wake on any sequence newer than their own.
#[derive(Debug)]
pub struct SequencedEvent {
    sequence: AtomicU64,
    waiters: parking_lot::Mutex<List<OpNode>>,
}

// SAFETY: the waiter list is only touched under the internal mutex; nodes
// are kept alive by the armed operations that own them.
unsafe impl Send for SequencedEvent {}
// SAFETY: as above.
unsafe impl Sync for SequencedEvent {}

impl SequencedEvent {
    /// Creates an event at sequence zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            sequence: AtomicU64::new(0),
            waiters: parking_lot::Mutex::new(List::new()),
        }
    }

    /// Returns the current sequence number.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    /// Advances the sequence and wakes every current waiter.
    pub fn raise(&self) {
        self.sequence.fetch_add(1, Ordering::AcqRel);

        let mut drained = self.waiters.lock().take();
        while let Some(node) = drained.pop_front() {
            // SAFETY: the node was detached under the lock; its operation is
            // armed and alive.
            unsafe { OpNode::complete(node) };
        }
    }

    /// Returns a sender completing with a sequence newer than `seen` — or,
    /// if `token` is cancelled first, with the newest sequence the wait can
    /// vouch for (possibly `seen` itself).
    ///
    /// Completes inline if the sequence has already advanced past `seen`.
    pub fn async_wait(&self, seen: u64, token: CancellationToken) -> SequenceWaitSender<'_> {
        SequenceWaitSender {
            event: self,
            seen,
            token,
        }
    }
}

impl Default for SequencedEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SequencedEvent {
    fn drop(&mut self) {
        assert!(
            self.waiters.get_mut().is_empty(),
            "sequenced event dropped with outstanding waiters"
        );
    }
}

/// Sender of [`SequencedEvent::async_wait`].
#[derive(Debug)]
#[must_use = "senders do nothing unless connected and started"]
pub struct SequenceWaitSender<'e> {
    event: &'e SequencedEvent,
    seen: u64,
    token: CancellationToken,
}

impl<'e> Sender for SequenceWaitSender<'e> {
    type Value = u64;
    type Operation<R: Receiver<Value = u64>> = SequenceWaitOperation<'e, R>;

    fn connect<R: Receiver<Value = u64>>(self, receiver: R) -> Self::Operation<R> {
        SequenceWaitOperation {
            event: self.event,
            seen: self.seen,
            token: self.token,
            node: OpNode::new(),
            observer: CancellationObserver::new(),
            receiver,
            _pin: PhantomPinned,
        }
    }
}

/// Operation state of [`SequencedEvent::async_wait`].
pub struct SequenceWaitOperation<'e, R> {
    event: &'e SequencedEvent,
    seen: u64,
    token: CancellationToken,
    node: OpNode,
    observer: CancellationObserver,
    receiver: R,
    _pin: PhantomPinned,
}

impl<R: Receiver<Value = u64>> SequenceWaitOperation<'_, R> {
    /// Completion from a raise.
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
                let sequence = (*this).event.sequence();
                (*this).receiver.set_value_noinline(sequence);
            }
        }
    }

    /// Completion from the cancellation handler.
    unsafe fn on_cancel(target: NonNull<()>) {
        let this = target.cast::<Self>().as_ptr();
        let observed;
        {
            // SAFETY: the operation is alive while armed.
            let event = unsafe { (*this).event };
            let mut waiters = event.waiters.lock();
            // SAFETY: as above.
            let node = unsafe { &(*this).node };
            if node.links().is_linked() {
                // SAFETY: a linked node is a member of this event's list.
                unsafe {
                    waiters.remove(NonNull::from(node));
                }
            }
            observed = event.sequence();
        }
        // A cancelled wait reports the newest sequence it can vouch for.
        // SAFETY: delivering the completion is the last access.
        unsafe {
            let seen = (*this).seen;
            (*this).receiver.set_value_noinline(observed.max(seen));
        }
    }
}

impl<R: Receiver<Value = u64>> Operation for SequenceWaitOperation<'_, R> {
    fn start_inline(self: Pin<&mut Self>) -> bool {
        // SAFETY: nothing is moved out of the pinned operation.
        let this = unsafe { self.get_unchecked_mut() };
        let target = NonNull::from(&mut *this).cast();

        let completed;
        {
            let mut waiters = this.event.waiters.lock();
            let current = this.event.sequence();

            if current > this.seen {
                completed = current;
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
                completed = this.seen;
            }
        }

        this.receiver.set_value_inline(completed);
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
    fn wait_one() {
        let event = SequencedEvent::new();
        event.raise();
        let seq = run(event.async_wait(0, CancellationToken::none()));
        assert_eq!(seq, 1);
    }

    #[test]
    fn wait_multiple() {
        let event = SequencedEvent::new();
        event.raise();
        let seq1 = run(event.async_wait(0, CancellationToken::none()));
        event.raise();
        event.raise();
        let seq2 = run(event.async_wait(seq1, CancellationToken::none()));
        assert_eq!(seq1, 1);
        assert_eq!(seq2, 3);
    }

    #[test]
    fn cancelled_wait_returns_the_stale_sequence() {
        let cancel = CancellationEvent::new();
        cancel.cancel();

        let event = SequencedEvent::new();
        let seq = run(event.async_wait(0, cancel.token()));
        assert_eq!(seq, 0);
    }

    #[test]
    fn cross_thread_raise_wakes_with_newer_sequence() {
        with_watchdog(|| {
            static EVENT: SequencedEvent = SequencedEvent::new();

            let raiser = std::thread::spawn(|| {
                std::thread::sleep(std::time::Duration::from_millis(10));
                EVENT.raise();
            });

            let seq = run(EVENT.async_wait(0, CancellationToken::none()));
            assert!(seq > 0);
            raiser.join().unwrap();
        });
    }

    #[test]
    fn thread_safe_surface() {
        assert_impl_all!(SequencedEvent: Send, Sync);
    }
}
