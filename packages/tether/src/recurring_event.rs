//! An event that can be raised repeatedly.
//!
//! Each raise wakes exactly the waiters that were enqueued at that moment;
//! later waiters wait for the next raise. Waits are predicated: the waiter
//! supplies a condition evaluated under the event's lock, and a wait whose
//! condition fails completes immediately without enqueueing — the primitive
//! behind condition-variable patterns.

use std::cell::Cell;
use std::marker::PhantomPinned;
use std::mem;
use std::pin::Pin;
use std::ptr::NonNull;

use crate::algorithm::{Transform, transform};
use crate::cancellation::{CancellationObserver, CancellationToken};
use crate::execution::{Operation, Receiver, Sender};
use crate::list::{Linked, Links, List};

/// Outcome of a predicated wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The event was raised while the waiter was enqueued.
    Awaited,
    /// The condition was false at wait time; the waiter never enqueued.
    ConditionFailed,
    /// The wait was cancelled before the event was raised.
    Cancelled,
}

/// Local state machine of a waiter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WaiterState {
    None,
    /// Enqueued, waiting for a raise. Protected by the event lock.
    Submitted,
    /// Detached by a raise or a cancellation; completion is in flight.
    Pending,
    /// Completed.
    Retired,
}

/// A waiter node with the per-waiter state machine.
#[derive(Debug)]
struct RecurringNode {
    links: Links<RecurringNode>,
    complete: Cell<Option<unsafe fn(NonNull<RecurringNode>)>>,
    state: Cell<WaiterState>,
}

// SAFETY: all cell access is serialized by the event's lock, except the
// post-splice completion, which runs after detachment.
unsafe impl Send for RecurringNode {}
// SAFETY: as above.
unsafe impl Sync for RecurringNode {}

impl RecurringNode {
    const fn new() -> Self {
        Self {
            links: Links::new(),
            complete: Cell::new(None),
            state: Cell::new(WaiterState::None),
        }
    }
}

// SAFETY: `links` returns the embedded field of the same node.
unsafe impl Linked for RecurringNode {
    fn links(&self) -> &Links<Self> {
        &self.links
    }
}

/// A repeatedly raisable notification event with predicated waits.
///
/// # Example
///
/// ```rust
/// use tether::{RecurringEvent, run};
///
/// let event = RecurringEvent::new();
/// // A wait whose condition fails completes immediately.
/// assert!(!run(event.async_wait_if(|| false)));
/// ```
#[derive(Debug)]
pub struct RecurringEvent {
    waiters: parking_lot::Mutex<List<RecurringNode>>,
}

// SAFETY: the waiter list is only touched under the internal mutex; nodes
// are kept alive by the armed operations that own them.
unsafe impl Send for RecurringEvent {}
// SAFETY: as above.
unsafe impl Sync for RecurringEvent {}

impl RecurringEvent {
    /// Creates an event with no waiters.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            waiters: parking_lot::Mutex::new(List::new()),
        }
    }

    /// Wakes every currently enqueued waiter.
    ///
    /// The queue is detached atomically: waiters that enqueue during the
    /// raise wait for the next one.
    pub fn raise(&self) {
        let mut drained = {
            let mut waiters = self.waiters.lock();
            // Mark the detached waiters while still holding the lock so
            // racing cancellations see their completion is in flight.
            //
            // SAFETY: the lock is held; nothing is unlinked here.
            unsafe {
                waiters.for_each(|node| {
                    // SAFETY: every queued node belongs to an armed, alive
                    // operation.
                    let node = unsafe { node.as_ref() };
                    debug_assert_eq!(node.state.get(), WaiterState::Submitted);
                    node.state.set(WaiterState::Pending);
                });
            }
            waiters.take()
        };

        while let Some(node) = drained.pop_front() {
            // SAFETY: the node was detached under the lock; its operation
            // is armed and alive.
            let complete = unsafe { node.as_ref() }
                .complete
                .get()
                .expect("queued waiter without a completion");
            // SAFETY: as above.
            unsafe { complete(node) };
        }
    }

    /// Returns a sender that enqueues iff `condition` is true (evaluated
    /// under the event's lock) and completes with the [`WaitOutcome`].
    pub fn async_wait_if_cancellable<C>(
        &self,
        condition: C,
        token: CancellationToken,
    ) -> WaitIfSender<'_, C>
    where
        C: FnOnce() -> bool,
    {
        WaitIfSender {
            event: self,
            condition,
            token,
        }
    }

    /// Like [`async_wait_if_cancellable`](Self::async_wait_if_cancellable)
    /// without a token; completes with `true` iff the event was awaited
    /// (`false` means the condition failed).
    pub fn async_wait_if<C>(
        &self,
        condition: C,
    ) -> Transform<WaitIfSender<'_, C>, fn(WaitOutcome) -> bool, bool>
    where
        C: FnOnce() -> bool,
    {
        transform(
            self.async_wait_if_cancellable(condition, CancellationToken::none()),
            |outcome| match outcome {
                WaitOutcome::Awaited => true,
                WaitOutcome::ConditionFailed => false,
                WaitOutcome::Cancelled => {
                    unreachable!("uncancellable wait reported cancellation")
                }
            },
        )
    }

    /// Waits unconditionally; completes with `true` on a raise and `false`
    /// on cancellation.
    ///
    /// Only really useful in single-threaded code, or when a missed wakeup
    /// cannot cause confusion.
    pub fn async_wait(
        &self,
        token: CancellationToken,
    ) -> Transform<WaitIfSender<'_, fn() -> bool>, fn(WaitOutcome) -> bool, bool> {
        transform(
            self.async_wait_if_cancellable(|| true, token),
            |outcome| match outcome {
                WaitOutcome::Awaited => true,
                WaitOutcome::Cancelled => false,
                WaitOutcome::ConditionFailed => {
                    unreachable!("constant-true condition failed")
                }
            },
        )
    }
}

impl Default for RecurringEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RecurringEvent {
    fn drop(&mut self) {
        assert!(
            self.waiters.get_mut().is_empty(),
            "recurring event dropped with outstanding waiters"
        );
    }
}

/// Sender of the recurring event's predicated waits.
#[must_use = "senders do nothing unless connected and started"]
pub struct WaitIfSender<'e, C> {
    event: &'e RecurringEvent,
    condition: C,
    token: CancellationToken,
}

impl<'e, C> Sender for WaitIfSender<'e, C>
where
    C: FnOnce() -> bool,
{
    type Value = WaitOutcome;
    type Operation<R: Receiver<Value = WaitOutcome>> = WaitIfOperation<'e, C, R>;

    fn connect<R: Receiver<Value = WaitOutcome>>(self, receiver: R) -> Self::Operation<R> {
        WaitIfOperation {
            event: self.event,
            condition: Some(self.condition),
            token: self.token,
            node: RecurringNode::new(),
            observer: CancellationObserver::new(),
            receiver,
            _pin: PhantomPinned,
        }
    }
}

/// Operation state of the recurring event's predicated waits.
pub struct WaitIfOperation<'e, C, R> {
    event: &'e RecurringEvent,
    condition: Option<C>,
    token: CancellationToken,
    node: RecurringNode,
    observer: CancellationObserver,
    receiver: R,
    _pin: PhantomPinned,
}

impl<R: Receiver<Value = WaitOutcome>, C> WaitIfOperation<'_, C, R>
where
    C: FnOnce() -> bool,
{
    /// Completion from a raise.
    unsafe fn awaited(node: NonNull<RecurringNode>) {
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
                (*this).node.state.set(WaiterState::Retired);
                (*this).receiver.set_value_noinline(WaitOutcome::Awaited);
            }
        }
    }

    /// Completion from the cancellation handler.
    unsafe fn on_cancel(target: NonNull<()>) {
        let this = target.cast::<Self>().as_ptr();
        {
            // SAFETY: the operation is alive while armed.
            let event = unsafe { (*this).event };
            let mut waiters = event.waiters.lock();
            // SAFETY: as above.
            let node = unsafe { &(*this).node };
            match node.state.get() {
                WaiterState::Submitted => {
                    node.state.set(WaiterState::Pending);
                    // SAFETY: a submitted node is a member of this event's
                    // list.
                    unsafe {
                        waiters.remove(NonNull::from(node));
                    }
                }
                // A raise already detached us and is completing elsewhere —
                // it lost the observer race, so the completion is ours.
                WaiterState::Pending => {}
                state => unreachable!("cancelled waiter in state {state:?}"),
            }
        }
        // SAFETY: delivering the completion is the last access.
        unsafe {
            (*this).node.state.set(WaiterState::Retired);
            (*this).receiver.set_value_noinline(WaitOutcome::Cancelled);
        }
    }
}

impl<C, R> Operation for WaitIfOperation<'_, C, R>
where
    C: FnOnce() -> bool,
    R: Receiver<Value = WaitOutcome>,
{
    fn start_inline(self: Pin<&mut Self>) -> bool {
        // SAFETY: nothing is moved out of the pinned operation.
        let this = unsafe { self.get_unchecked_mut() };
        let target = NonNull::from(&mut *this).cast();
        debug_assert_eq!(this.node.state.get(), WaiterState::None);

        let condition = this.condition.take().expect("operation started twice");
        let outcome;
        {
            let mut waiters = this.event.waiters.lock();

            if !condition() {
                outcome = WaitOutcome::ConditionFailed;
            } else {
                // SAFETY: the operation is pinned and stays alive while
                // armed; the handler's last access is the completion.
                let armed = unsafe { this.observer.try_set(&this.token, target, Self::on_cancel) };
                if armed {
                    this.node.state.set(WaiterState::Submitted);
                    this.node.complete.set(Some(Self::awaited));
                    // SAFETY: as above.
                    unsafe {
                        waiters.push_back(NonNull::from(&this.node));
                    }
                    return false;
                }
                outcome = WaitOutcome::Cancelled;
            }
        }

        this.node.state.set(WaiterState::Retired);
        this.receiver.set_value_inline(outcome);
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::cancellation::CancellationEvent;
    use crate::execution::{detach, run};
    use crate::test_utils::with_watchdog;

    #[test]
    fn condition_failure_completes_without_enqueueing() {
        let event = RecurringEvent::new();
        assert!(!run(event.async_wait_if(|| false)));
    }

    #[test]
    fn raise_wakes_enqueued_waiters() {
        static EVENT: RecurringEvent = RecurringEvent::new();
        static AWAKENED: AtomicU32 = AtomicU32::new(0);

        for _ in 0..3 {
            detach(crate::transform(
                EVENT.async_wait(CancellationToken::none()),
                |awaited| {
                    assert!(awaited);
                    AWAKENED.fetch_add(1, Ordering::SeqCst);
                },
            ));
        }

        assert_eq!(AWAKENED.load(Ordering::SeqCst), 0);
        EVENT.raise();
        assert_eq!(AWAKENED.load(Ordering::SeqCst), 3);

        // The next raise finds an empty queue.
        EVENT.raise();
        assert_eq!(AWAKENED.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn cancelled_wait_reports_cancellation() {
        let cancel = CancellationEvent::new();
        cancel.cancel();

        let event = RecurringEvent::new();
        assert!(!run(event.async_wait(cancel.token())));
    }

    #[test]
    fn cancellation_removes_the_waiter() {
        static EVENT: RecurringEvent = RecurringEvent::new();
        static OUTCOMES: [AtomicU32; 2] = [AtomicU32::new(0), AtomicU32::new(0)];

        let cancel = CancellationEvent::new();

        detach(crate::transform(
            EVENT.async_wait(cancel.token()),
            |awaited| {
                OUTCOMES[usize::from(awaited)].fetch_add(1, Ordering::SeqCst);
            },
        ));

        cancel.cancel();
        // The waiter completed as cancelled and left the queue.
        assert_eq!(OUTCOMES[0].load(Ordering::SeqCst), 1);
        EVENT.raise();
        assert_eq!(OUTCOMES[1].load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cross_thread_raise() {
        with_watchdog(|| {
            static EVENT: RecurringEvent = RecurringEvent::new();

            let raiser = std::thread::spawn(|| {
                std::thread::sleep(std::time::Duration::from_millis(10));
                EVENT.raise();
            });

            assert!(run(EVENT.async_wait(CancellationToken::none())));
            raiser.join().unwrap();
        });
    }

    #[test]
    fn thread_safe_surface() {
        assert_impl_all!(RecurringEvent: Send, Sync);
    }
}
