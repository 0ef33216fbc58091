//! Cooperative FIFO resumption queue.
//!
//! A [`RunQueue`] is an optional embedder integration: operations post
//! caller-owned [`RunQueueItem`]s, and the embedder drains them on a thread
//! of its choosing with [`RunQueue::run_iteration`]. The queue is passed
//! explicitly wherever it is needed; there is no implicit current queue.
//!
//! # Example
//!
//! ```rust
//! use tether::{RunQueue, run_on, yield_now};
//!
//! let queue = RunQueue::new();
//! run_on(&queue, yield_now(&queue));
//! ```

use std::cell::Cell;
use std::marker::PhantomPinned;
use std::pin::Pin;
use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::execution::{Operation, Receiver, Sender};
use crate::list::{Linked, Links, List};

/// A caller-owned queue entry holding a callback.
///
/// Items are armed with a callback and posted to a [`RunQueue`]; the queue
/// invokes the callback from `run_iteration`. An item must stay alive and
/// pinned from post until its callback has run.
#[derive(Debug)]
pub struct RunQueueItem {
    links: Links<RunQueueItem>,
    callback: Cell<Option<(NonNull<()>, unsafe fn(NonNull<()>))>>,
    _pin: PhantomPinned,
}

// SAFETY: all access to the cells is serialized by the owning queue's mutex
// (while linked) or confined to the posting/invoking thread (while not).
unsafe impl Send for RunQueueItem {}
// SAFETY: as above.
unsafe impl Sync for RunQueueItem {}

// SAFETY: `links` returns the embedded field of the same node.
unsafe impl Linked for RunQueueItem {
    fn links(&self) -> &Links<Self> {
        &self.links
    }
}

impl RunQueueItem {
    /// Creates an unarmed item.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            links: Links::new(),
            callback: Cell::new(None),
            _pin: PhantomPinned,
        }
    }

    /// Arms the item with a callback.
    ///
    /// # Panics
    ///
    /// Panics if the item is already armed.
    ///
    /// # Safety
    ///
    /// `target` must remain valid for `callback` until the callback has run
    /// or the item is known to never be posted.
    pub unsafe fn arm(&self, target: NonNull<()>, callback: unsafe fn(NonNull<()>)) {
        assert!(
            self.callback.get().is_none(),
            "run queue item is already armed"
        );
        self.callback.set(Some((target, callback)));
    }
}

impl Default for RunQueueItem {
    fn default() -> Self {
        Self::new()
    }
}

/// A FIFO of posted items, drained cooperatively.
#[derive(Debug)]
pub struct RunQueue {
    items: Mutex<List<RunQueueItem>>,
}

impl RunQueue {
    /// Creates an empty queue.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            items: Mutex::new(List::new()),
        }
    }

    /// Posts an armed item to the back of the queue.
    ///
    /// # Panics
    ///
    /// Panics if the item has not been armed.
    pub fn post(&self, item: Pin<&RunQueueItem>) {
        let item = item.get_ref();
        assert!(
            item.callback.get().is_some(),
            "run queue item posted without a callback"
        );
        // SAFETY: the item is pinned and, per `RunQueueItem`'s contract,
        // outlives its time on the queue.
        unsafe {
            self.items.lock().push_back(NonNull::from(item));
        }
    }

    /// Runs posted callbacks on the calling thread until the queue is empty.
    pub fn run_iteration(&self) {
        loop {
            let Some(item) = self.items.lock().pop_front() else {
                return;
            };
            // SAFETY: the item was armed before posting and stays alive
            // until its callback has run; the callback is taken so the item
            // may be immediately re-armed from within it.
            let (target, callback) = unsafe { item.as_ref() }
                .callback
                .take()
                .expect("posted run queue item lost its callback");
            // SAFETY: target validity is the arming caller's contract.
            unsafe { callback(target) };
        }
    }

    /// Returns whether the queue currently holds no items.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RunQueue {
    fn drop(&mut self) {
        assert!(
            self.items.get_mut().is_empty(),
            "run queue dropped with posted items"
        );
    }
}

/// Returns a sender that completes from `queue`'s next iteration,
/// rescheduling the continuation cooperatively.
#[must_use]
pub fn yield_now(queue: &RunQueue) -> YieldSender<'_> {
    YieldSender { queue }
}

/// Sender of [`yield_now`].
#[derive(Debug)]
#[must_use = "senders do nothing unless connected and started"]
pub struct YieldSender<'q> {
    queue: &'q RunQueue,
}

impl<'q> Sender for YieldSender<'q> {
    type Value = ();
    type Operation<R: Receiver<Value = ()>> = YieldOperation<'q, R>;

    fn connect<R: Receiver<Value = ()>>(self, receiver: R) -> Self::Operation<R> {
        YieldOperation {
            queue: self.queue,
            item: RunQueueItem::new(),
            receiver,
            _pin: PhantomPinned,
        }
    }
}

/// Operation state of [`yield_now`].
pub struct YieldOperation<'q, R> {
    queue: &'q RunQueue,
    item: RunQueueItem,
    receiver: R,
    _pin: PhantomPinned,
}

impl<R: Receiver<Value = ()>> YieldOperation<'_, R> {
    unsafe fn resume(target: NonNull<()>) {
        let this = target.cast::<Self>().as_ptr();
        // SAFETY: the operation is alive until this completion returns.
        unsafe { (*this).receiver.set_value_noinline(()) };
    }
}

impl<R: Receiver<Value = ()>> Operation for YieldOperation<'_, R> {
    fn start_inline(self: Pin<&mut Self>) -> bool {
        // SAFETY: the operation is pinned and stays alive until the posted
        // callback has delivered its completion.
        let this = unsafe { self.get_unchecked_mut() };
        let target = NonNull::from(&mut *this).cast();
        // SAFETY: as above.
        unsafe {
            this.item.arm(target, Self::resume);
            this.queue.post(Pin::new_unchecked(&this.item));
        }
        false
    }
}

/// Drives `sender` by draining `queue` on the calling thread until the
/// operation completes.
///
/// All progress must come from the queue; the call panics if the queue runs
/// dry while the operation is still pending.
pub fn run_on<S: Sender>(queue: &RunQueue, sender: S) -> S::Value {
    crate::execution::run_with(sender, || {
        assert!(
            !queue.is_drained(),
            "run queue drained while the operation is still pending"
        );
        queue.run_iteration();
    })
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::execution::run_with;

    #[test]
    fn yield_completes_from_the_queue() {
        let queue = RunQueue::new();
        run_on(&queue, yield_now(&queue));
    }

    #[test]
    fn posted_items_run_in_fifo_order() {
        let queue = RunQueue::new();

        let order = Cell::new(0);
        let slots = [Cell::new(-1), Cell::new(-1)];

        struct Record<'a> {
            order: &'a Cell<i32>,
            slot: &'a Cell<i32>,
        }

        unsafe fn record(target: NonNull<()>) {
            // SAFETY: target points at a Record that outlives the drain.
            let record = unsafe { target.cast::<Record<'static>>().as_ref() };
            record.slot.set(record.order.get());
            record.order.set(record.order.get() + 1);
        }

        let record_a = Record {
            order: &order,
            slot: &slots[0],
        };
        let record_b = Record {
            order: &order,
            slot: &slots[1],
        };

        let item_a = std::pin::pin!(RunQueueItem::new());
        let item_b = std::pin::pin!(RunQueueItem::new());

        // SAFETY: the records outlive the queue drain below.
        unsafe {
            item_a.as_ref().arm(NonNull::from(&record_a).cast(), record);
            item_b.as_ref().arm(NonNull::from(&record_b).cast(), record);
        }

        queue.post(item_a.as_ref());
        queue.post(item_b.as_ref());
        assert!(!queue.is_drained());

        queue.run_iteration();
        assert!(queue.is_drained());
        assert_eq!(slots[0].get(), 0);
        assert_eq!(slots[1].get(), 1);
    }

    #[test]
    fn run_with_drives_the_queue() {
        let queue = RunQueue::new();
        let value = run_with(
            crate::transform(yield_now(&queue), |()| 17),
            || queue.run_iteration(),
        );
        assert_eq!(value, 17);
    }
}
