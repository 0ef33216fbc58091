//! Counting group of outstanding work.
//!
//! A [`WaitGroup`] counts outstanding work items; waiters complete when the
//! counter reaches zero. Only the `done` call that takes the counter to zero
//! drains the waiter list.
//!
//! # Example
//!
//! ```rust
//! use tether::{WaitGroup, run};
//!
//! let group = WaitGroup::new(2);
//! group.done();
//! group.done();
//! run(group.wait());
//! ```

use std::marker::PhantomPinned;
use std::mem;
use std::pin::Pin;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::algorithm::{Transform, transform};
use crate::cancellation::{CancellationObserver, CancellationToken};
use crate::execution::{Operation, Receiver, Sender, connect, start_inline};
use crate::list::{Linked, List, OpNode};

/// A counter that completes its waiters when it reaches zero.
#[derive(Debug)]
pub struct WaitGroup {
    counter: AtomicUsize,
    waiters: parking_lot::Mutex<List<OpNode>>,
}

// SAFETY: the waiter list is only touched under the internal mutex; nodes
// are kept alive by the armed operations that own them.
unsafe impl Send for WaitGroup {}
// SAFETY: as above.
unsafe impl Sync for WaitGroup {}

impl WaitGroup {
    /// Creates a group with `count` outstanding work items.
    #[must_use]
    pub const fn new(count: usize) -> Self {
        Self {
            counter: AtomicUsize::new(count),
            waiters: parking_lot::Mutex::new(List::new()),
        }
    }

    /// Adds `count` work items to the group.
    pub fn add(&self, count: usize) {
        self.counter.fetch_add(count, Ordering::AcqRel);
    }

    /// Marks one work item as finished.
    ///
    /// The call that takes the counter to zero wakes every waiter. Calling
    /// `done` more often than items were added is a contract violation.
    pub fn done(&self) {
        let mut current = self.counter.load(Ordering::Acquire);
        loop {
            assert!(current > 0, "wait group done() without outstanding work");
            match self.counter.compare_exchange(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(now) => current = now,
            }
        }
        if current != 1 {
            return;
        }

        let mut drained = self.waiters.lock().take();
        while let Some(node) = drained.pop_front() {
            // SAFETY: the node was detached under the lock; its operation is
            // armed and alive.
            unsafe { OpNode::complete(node) };
        }
    }

    /// Registers one work item for the lifetime of the returned guard.
    #[must_use]
    pub fn work(&self) -> WorkGuard<'_> {
        self.add(1);
        WorkGuard { group: self }
    }

    /// Returns a sender that completes with `true` once the counter reaches
    /// zero, or with `false` if `token` is cancelled first.
    ///
    /// Completes inline if the counter is already zero.
    pub fn wait_cancellable(&self, token: CancellationToken) -> GroupWaitSender<'_> {
        GroupWaitSender { group: self, token }
    }

    /// Returns a sender that completes once the counter reaches zero.
    pub fn wait(&self) -> Transform<GroupWaitSender<'_>, fn(bool), ()> {
        transform(self.wait_cancellable(CancellationToken::none()), |done| {
            assert!(done, "uncancellable wait reported cancellation");
        })
    }
}

impl Drop for WaitGroup {
    fn drop(&mut self) {
        assert!(
            self.waiters.get_mut().is_empty(),
            "wait group dropped with outstanding waiters"
        );
    }
}

/// Keeps one [`WaitGroup`] work item registered while alive.
#[derive(Debug)]
pub struct WorkGuard<'g> {
    group: &'g WaitGroup,
}

impl Drop for WorkGuard<'_> {
    fn drop(&mut self) {
        self.group.done();
    }
}

/// Sender of [`WaitGroup::wait_cancellable`].
#[derive(Debug)]
#[must_use = "senders do nothing unless connected and started"]
pub struct GroupWaitSender<'g> {
    group: &'g WaitGroup,
    token: CancellationToken,
}

impl<'g> Sender for GroupWaitSender<'g> {
    type Value = bool;
    type Operation<R: Receiver<Value = bool>> = GroupWaitOperation<'g, R>;

    fn connect<R: Receiver<Value = bool>>(self, receiver: R) -> Self::Operation<R> {
        GroupWaitOperation {
            group: self.group,
            token: self.token,
            node: OpNode::new(),
            observer: CancellationObserver::new(),
            receiver,
            _pin: PhantomPinned,
        }
    }
}

/// Operation state of [`WaitGroup::wait_cancellable`].
pub struct GroupWaitOperation<'g, R> {
    group: &'g WaitGroup,
    token: CancellationToken,
    node: OpNode,
    observer: CancellationObserver,
    receiver: R,
    _pin: PhantomPinned,
}

impl<R: Receiver<Value = bool>> GroupWaitOperation<'_, R> {
    /// Completion from the draining `done` call.
    unsafe fn drained(node: NonNull<OpNode>) {
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
                (*this).receiver.set_value_noinline(true);
            }
        }
    }

    /// Completion from the cancellation handler.
    unsafe fn on_cancel(target: NonNull<()>) {
        let this = target.cast::<Self>().as_ptr();
        let cancelled;
        {
            // SAFETY: the operation is alive while armed; list state is
            // inspected under the group's lock.
            let group = unsafe { (*this).group };
            let mut waiters = group.waiters.lock();
            // SAFETY: as above.
            let node = unsafe { &(*this).node };
            if node.links().is_linked() {
                // SAFETY: a linked node is a member of this group's list.
                unsafe {
                    waiters.remove(NonNull::from(node));
                }
            }
            // A counter that already hit zero means the group completed
            // before the cancellation won; report success in that case.
            cancelled = group.counter.load(Ordering::Acquire) > 0;
        }
        // SAFETY: delivering the completion is the last access.
        unsafe { (*this).receiver.set_value_noinline(!cancelled) };
    }
}

impl<R: Receiver<Value = bool>> Operation for GroupWaitOperation<'_, R> {
    fn start_inline(self: Pin<&mut Self>) -> bool {
        // SAFETY: nothing is moved out of the pinned operation.
        let this = unsafe { self.get_unchecked_mut() };
        let target = NonNull::from(&mut *this).cast();
        let mut cancelled = false;
        {
            let mut waiters = this.group.waiters.lock();
            if this.group.counter.load(Ordering::Acquire) > 0 {
                // SAFETY: the operation is pinned and stays alive while
                // armed; the handler's last access is the completion.
                let armed = unsafe { this.observer.try_set(&this.token, target, Self::on_cancel) };
                if armed {
                    this.node.set_complete(Self::drained);
                    // SAFETY: as above.
                    unsafe {
                        waiters.push_back(NonNull::from(&this.node));
                    }
                    return false;
                }
                cancelled = true;
            }
        }
        this.receiver.set_value_inline(!cancelled);
        true
    }
}

// ############## wait_in_group ##############

/// Wraps `sender` so that its lifetime is tracked by `group`: the group
/// gains one work item when the operation starts and releases it when the
/// operation completes, in either completion mode.
#[must_use]
pub fn wait_in_group<'g, S: Sender>(group: &'g WaitGroup, sender: S) -> WaitInGroup<'g, S> {
    WaitInGroup { group, sender }
}

/// Sender of [`wait_in_group`].
#[must_use = "senders do nothing unless connected and started"]
pub struct WaitInGroup<'g, S> {
    group: &'g WaitGroup,
    sender: S,
}

impl<'g, S: Sender> Sender for WaitInGroup<'g, S> {
    type Value = S::Value;
    type Operation<R: Receiver<Value = S::Value>> = WaitInGroupOperation<'g, S, R>;

    fn connect<R: Receiver<Value = S::Value>>(self, receiver: R) -> Self::Operation<R> {
        WaitInGroupOperation {
            group: self.group,
            inner: connect(
                self.sender,
                GroupedReceiver {
                    group: self.group,
                    downstream: receiver,
                },
            ),
            _pin: PhantomPinned,
        }
    }
}

/// Operation state of [`wait_in_group`].
pub struct WaitInGroupOperation<'g, S, R>
where
    S: Sender,
    R: Receiver<Value = S::Value>,
{
    group: &'g WaitGroup,
    inner: S::Operation<GroupedReceiver<'g, R>>,
    _pin: PhantomPinned,
}

impl<S, R> Operation for WaitInGroupOperation<'_, S, R>
where
    S: Sender,
    R: Receiver<Value = S::Value>,
{
    fn start_inline(self: Pin<&mut Self>) -> bool {
        // SAFETY: the child is pinned along with this operation and is not
        // moved.
        let this = unsafe { self.get_unchecked_mut() };
        this.group.add(1);
        // SAFETY: as above.
        start_inline(unsafe { Pin::new_unchecked(&mut this.inner) })
    }
}

/// Receiver installed by [`wait_in_group`]; releases the work item before
/// forwarding the completion.
pub struct GroupedReceiver<'g, R> {
    group: &'g WaitGroup,
    downstream: R,
}

impl<R: Receiver> Receiver for GroupedReceiver<'_, R> {
    type Value = R::Value;

    fn set_value_inline(&mut self, value: R::Value) {
        self.group.done();
        self.downstream.set_value_inline(value);
    }

    fn set_value_noinline(&mut self, value: R::Value) {
        self.group.done();
        self.downstream.set_value_noinline(value);
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
    fn wait_completes_when_counter_reaches_zero() {
        let group = WaitGroup::new(3);
        group.done();
        group.done();
        group.done();
        run(group.wait());
    }

    #[test]
    fn wait_on_zero_counter_completes_inline() {
        let group = WaitGroup::new(0);
        assert!(run(group.wait_cancellable(CancellationToken::none())));
    }

    #[test]
    fn cancelled_wait_reports_false() {
        let event = CancellationEvent::new();
        event.cancel();

        let group = WaitGroup::new(1);
        assert!(!run(group.wait_cancellable(event.token())));
        group.done();
    }

    #[test]
    fn cross_thread_completion() {
        with_watchdog(|| {
            static GROUP: WaitGroup = WaitGroup::new(2);

            let workers: Vec<_> = (0..2)
                .map(|_| {
                    std::thread::spawn(|| {
                        std::thread::sleep(std::time::Duration::from_millis(5));
                        GROUP.done();
                    })
                })
                .collect();

            run(GROUP.wait());
            for worker in workers {
                worker.join().unwrap();
            }
        });
    }

    #[test]
    fn work_guard_counts_as_outstanding_work() {
        let group = WaitGroup::new(0);
        let guard = group.work();
        // The guard holds the counter at one; waiting now would block.
        drop(guard);
        run(group.wait());
    }

    #[test]
    fn wait_in_group_tracks_the_operation() {
        use crate::algorithm::invocable;

        let group = WaitGroup::new(0);
        let value = run(wait_in_group(&group, invocable(|| 9)));
        assert_eq!(value, 9);
        // The work item was released on completion.
        run(group.wait());
    }

    #[test]
    #[should_panic(expected = "wait group done() without outstanding work")]
    fn done_below_zero_panics() {
        let group = WaitGroup::new(0);
        group.done();
    }

    #[test]
    fn thread_safe_surface() {
        assert_impl_all!(WaitGroup: Send, Sync);
    }
}
