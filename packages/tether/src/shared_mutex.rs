//! Shared/exclusive (reader-writer) asynchronous locking.
//!
//! The lock word is a single 8-byte atomic packing a contention tag and the
//! shared-holder count, so uncontended exclusive locks and reader stacking
//! are lock-free. Once a waiter queues, the tag becomes contended and all
//! transitions out of that state go through the internal mutex.
//!
//! Fairness is FIFO with writer preference: a reader never overtakes an
//! already-queued writer. On release, a head writer is woken alone; a run of
//! head readers is woken together.

use std::cell::Cell;
use std::marker::PhantomPinned;
use std::mem;
use std::pin::Pin;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::execution::{Operation, Receiver, Sender};
use crate::list::{Linked, Links, List};

const TAG_MASK: u64 = 0b11;
const TAG_NONE: u64 = 0;
const TAG_LOCKED: u64 = 1;
const TAG_CONTENDED: u64 = 2;
const COUNT_UNIT: u64 = 0b100;

const fn pack(tag: u64, shared_count: u64) -> u64 {
    shared_count * COUNT_UNIT | tag
}

const fn tag(state: u64) -> u64 {
    state & TAG_MASK
}

const fn shared_count(state: u64) -> u64 {
    state / COUNT_UNIT
}

/// A waiter node tagged with the mode it is waiting for.
#[derive(Debug)]
struct ModeNode {
    links: Links<ModeNode>,
    complete: Cell<Option<unsafe fn(NonNull<ModeNode>)>>,
    exclusive: Cell<bool>,
}

// SAFETY: access is serialized by the shared mutex's internal lock; the
// completion runs only after the node has been detached.
unsafe impl Send for ModeNode {}
// SAFETY: as above.
unsafe impl Sync for ModeNode {}

impl ModeNode {
    const fn new() -> Self {
        Self {
            links: Links::new(),
            complete: Cell::new(None),
            exclusive: Cell::new(false),
        }
    }
}

// SAFETY: `links` returns the embedded field of the same node.
unsafe impl Linked for ModeNode {
    fn links(&self) -> &Links<Self> {
        &self.links
    }
}

/// A shared/exclusive async mutex.
///
/// Like [`Mutex`](crate::Mutex), locking does not hand out guards; holders
/// call [`unlock`](SharedMutex::unlock) or
/// [`unlock_shared`](SharedMutex::unlock_shared) explicitly.
#[derive(Debug)]
pub struct SharedMutex {
    state: AtomicU64,
    waiters: parking_lot::Mutex<List<ModeNode>>,
}

// SAFETY: the waiter list is only touched under the internal mutex; nodes
// are kept alive by the armed operations that own them.
unsafe impl Send for SharedMutex {}
// SAFETY: as above.
unsafe impl Sync for SharedMutex {}

impl SharedMutex {
    /// Creates an unlocked shared mutex.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU64::new(pack(TAG_NONE, 0)),
            waiters: parking_lot::Mutex::new(List::new()),
        }
    }

    /// Attempts to acquire the lock exclusively without waiting.
    #[must_use]
    pub fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(
                pack(TAG_NONE, 0),
                pack(TAG_LOCKED, 0),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Attempts to acquire the lock shared without waiting.
    ///
    /// Fails while a writer holds the lock or any waiter is queued.
    #[must_use]
    pub fn try_lock_shared(&self) -> bool {
        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            let new = if state == pack(TAG_NONE, 0) {
                pack(TAG_LOCKED, 1)
            } else if tag(state) == TAG_LOCKED && shared_count(state) > 0 {
                state + COUNT_UNIT
            } else {
                return false;
            };

            match self
                .state
                .compare_exchange(state, new, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(current) => state = current,
            }
        }
    }

    /// Returns a sender that completes once the lock is held exclusively.
    pub fn async_lock(&self) -> SharedLockSender<'_> {
        SharedLockSender {
            mutex: self,
            exclusive: true,
        }
    }

    /// Returns a sender that completes once the lock is held shared.
    pub fn async_lock_shared(&self) -> SharedLockSender<'_> {
        SharedLockSender {
            mutex: self,
            exclusive: false,
        }
    }

    /// Releases an exclusive hold.
    pub fn unlock(&self) {
        loop {
            let state = self.state.load(Ordering::Relaxed);
            match tag(state) {
                TAG_LOCKED => {
                    debug_assert_eq!(
                        shared_count(state),
                        0,
                        "exclusive unlock while readers hold the lock"
                    );
                    if self
                        .state
                        .compare_exchange(
                            state,
                            pack(TAG_NONE, 0),
                            Ordering::Release,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                    {
                        return;
                    }
                }
                TAG_CONTENDED => {
                    self.wake_from_contended();
                    return;
                }
                _ => panic!("unlock of a shared mutex that is not locked"),
            }
        }
    }

    /// Releases a shared hold.
    pub fn unlock_shared(&self) {
        loop {
            let state = self.state.load(Ordering::Relaxed);
            let count = shared_count(state);
            assert!(count > 0, "shared unlock with no shared holders");

            match tag(state) {
                TAG_LOCKED => {
                    let new = if count == 1 {
                        pack(TAG_NONE, 0)
                    } else {
                        state - COUNT_UNIT
                    };
                    if self
                        .state
                        .compare_exchange(state, new, Ordering::Release, Ordering::Relaxed)
                        .is_ok()
                    {
                        return;
                    }
                }
                TAG_CONTENDED => {
                    if count > 1 {
                        // Not the last reader: decrement and stay contended.
                        if self
                            .state
                            .compare_exchange(
                                state,
                                state - COUNT_UNIT,
                                Ordering::Release,
                                Ordering::Relaxed,
                            )
                            .is_ok()
                        {
                            return;
                        }
                    } else {
                        self.wake_from_contended();
                        return;
                    }
                }
                _ => panic!("shared unlock of a shared mutex that is not locked"),
            }
        }
    }

    /// Contended release: pops the head writer, or the maximal run of head
    /// readers, hands the lock over and completes them outside the lock.
    fn wake_from_contended(&self) {
        let mut woken = List::new();
        {
            let mut waiters = self.waiters.lock();

            let head = waiters
                .pop_front()
                .expect("contended shared mutex with no waiters");
            // SAFETY: list members are alive while their operations are
            // armed.
            let head_exclusive = unsafe { head.as_ref() }.exclusive.get();
            let mut new_count = 0;
            // SAFETY: as above; `woken` keeps the detached nodes.
            unsafe {
                woken.push_back(head);
            }

            if head_exclusive {
                // A head writer is woken alone; the count stays zero.
            } else {
                new_count = 1;
                while let Some(next) = waiters.front() {
                    // SAFETY: as above.
                    if unsafe { next.as_ref() }.exclusive.get() {
                        break;
                    }
                    let node = waiters.pop_front().expect("front() returned a node");
                    // SAFETY: as above.
                    unsafe {
                        woken.push_back(node);
                    }
                    new_count += 1;
                }
            }

            let new_tag = if waiters.is_empty() {
                TAG_LOCKED
            } else {
                TAG_CONTENDED
            };
            // Hand-off: the woken waiters synchronize by observing their own
            // wake, so no release fence is needed here.
            self.state.store(pack(new_tag, new_count), Ordering::Relaxed);
        }

        while let Some(node) = woken.pop_front() {
            // SAFETY: the node was detached under the lock; its operation is
            // armed and alive, and this is its only completion.
            let complete = unsafe { node.as_ref() }
                .complete
                .get()
                .expect("queued shared-mutex waiter without a completion");
            // SAFETY: as above.
            unsafe { complete(node) };
        }
    }
}

impl Default for SharedMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SharedMutex {
    fn drop(&mut self) {
        assert!(
            self.waiters.get_mut().is_empty(),
            "shared mutex dropped with outstanding waiters"
        );
    }
}

/// Sender of [`SharedMutex::async_lock`] and
/// [`SharedMutex::async_lock_shared`].
#[derive(Debug)]
#[must_use = "senders do nothing unless connected and started"]
pub struct SharedLockSender<'m> {
    mutex: &'m SharedMutex,
    exclusive: bool,
}

impl<'m> Sender for SharedLockSender<'m> {
    type Value = ();
    type Operation<R: Receiver<Value = ()>> = SharedLockOperation<'m, R>;

    fn connect<R: Receiver<Value = ()>>(self, receiver: R) -> Self::Operation<R> {
        let node = ModeNode::new();
        node.exclusive.set(self.exclusive);
        SharedLockOperation {
            mutex: self.mutex,
            node,
            receiver,
            _pin: PhantomPinned,
        }
    }
}

/// Operation state of the shared-mutex lock senders.
pub struct SharedLockOperation<'m, R> {
    mutex: &'m SharedMutex,
    node: ModeNode,
    receiver: R,
    _pin: PhantomPinned,
}

impl<R: Receiver<Value = ()>> SharedLockOperation<'_, R> {
    unsafe fn granted(node: NonNull<ModeNode>) {
        // SAFETY: the node is embedded in an alive, pinned operation.
        let this = unsafe {
            node.byte_sub(mem::offset_of!(Self, node))
                .cast::<Self>()
                .as_ptr()
        };
        // SAFETY: delivering the completion is the last access.
        unsafe { (*this).receiver.set_value_noinline(()) };
    }

    fn enqueue(&self, waiters: &mut List<ModeNode>) {
        self.node.complete.set(Some(Self::granted));
        // SAFETY: the operation is pinned and stays alive while armed.
        unsafe {
            waiters.push_back(NonNull::from(&self.node));
        }
    }
}

impl<R: Receiver<Value = ()>> Operation for SharedLockOperation<'_, R> {
    fn start_inline(self: Pin<&mut Self>) -> bool {
        // SAFETY: nothing is moved out of the pinned operation.
        let this = unsafe { self.get_unchecked_mut() };
        let mutex = this.mutex;
        let exclusive = this.node.exclusive.get();

        // Uncontended fast path.
        let fast = if exclusive {
            mutex.try_lock()
        } else {
            mutex.try_lock_shared()
        };
        if fast {
            this.receiver.set_value_inline(());
            return true;
        }

        let mut waiters = mutex.waiters.lock();
        loop {
            let state = mutex.state.load(Ordering::Relaxed);
            match (tag(state), exclusive) {
                (TAG_NONE, true) => {
                    if mutex
                        .state
                        .compare_exchange(
                            state,
                            pack(TAG_LOCKED, 0),
                            Ordering::Acquire,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                    {
                        drop(waiters);
                        this.receiver.set_value_inline(());
                        return true;
                    }
                }
                (TAG_NONE, false) => {
                    if mutex
                        .state
                        .compare_exchange(
                            state,
                            pack(TAG_LOCKED, 1),
                            Ordering::Acquire,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                    {
                        drop(waiters);
                        this.receiver.set_value_inline(());
                        return true;
                    }
                }
                (TAG_LOCKED, false) if shared_count(state) > 0 => {
                    // Readers stack while no waiter is queued.
                    if mutex
                        .state
                        .compare_exchange(
                            state,
                            state + COUNT_UNIT,
                            Ordering::Acquire,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                    {
                        drop(waiters);
                        this.receiver.set_value_inline(());
                        return true;
                    }
                }
                (TAG_LOCKED, _) => {
                    // Exclusive intent, or a reader blocked by a writer:
                    // mark contention and queue FIFO.
                    if mutex
                        .state
                        .compare_exchange(
                            state,
                            (state & !TAG_MASK) | TAG_CONTENDED,
                            Ordering::Relaxed,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                    {
                        this.enqueue(&mut waiters);
                        return false;
                    }
                }
                (TAG_CONTENDED, _) => {
                    this.enqueue(&mut waiters);
                    return false;
                }
                (state, _) => unreachable!("invalid shared mutex state: {state}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI32, AtomicU32};

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::execution::run;
    use crate::test_utils::with_watchdog;

    #[test]
    fn exclusive_excludes_everything() {
        let mutex = SharedMutex::new();

        run(mutex.async_lock());
        assert!(!mutex.try_lock());
        assert!(!mutex.try_lock_shared());
        mutex.unlock();

        assert!(mutex.try_lock());
        mutex.unlock();
    }

    #[test]
    fn readers_stack_on_the_fast_path() {
        let mutex = SharedMutex::new();

        run(mutex.async_lock_shared());
        run(mutex.async_lock_shared());
        assert!(mutex.try_lock_shared());

        assert!(!mutex.try_lock());

        mutex.unlock_shared();
        mutex.unlock_shared();
        mutex.unlock_shared();

        assert!(mutex.try_lock());
        mutex.unlock();
    }

    #[test]
    fn writer_waits_for_readers_and_readers_queue_behind_writer() {
        with_watchdog(|| {
            static MUTEX: SharedMutex = SharedMutex::new();
            static PHASE: AtomicI32 = AtomicI32::new(0);

            run(MUTEX.async_lock_shared());

            let writer = std::thread::spawn(|| {
                run(MUTEX.async_lock());
                PHASE.store(1, Ordering::SeqCst);
                MUTEX.unlock();
            });

            // Give the writer time to queue.
            std::thread::sleep(std::time::Duration::from_millis(20));
            assert_eq!(PHASE.load(Ordering::SeqCst), 0);

            // A late reader must not overtake the queued writer.
            assert!(!MUTEX.try_lock_shared());

            MUTEX.unlock_shared();
            writer.join().unwrap();
            assert_eq!(PHASE.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn concurrent_readers_and_writers_never_mix() {
        with_watchdog(|| {
            static MUTEX: SharedMutex = SharedMutex::new();
            static READERS: AtomicU32 = AtomicU32::new(0);
            static WRITERS: AtomicU32 = AtomicU32::new(0);

            let spawn_reader = || {
                std::thread::spawn(|| {
                    for _ in 0..50 {
                        run(MUTEX.async_lock_shared());
                        READERS.fetch_add(1, Ordering::AcqRel);
                        assert_eq!(WRITERS.load(Ordering::Acquire), 0);
                        READERS.fetch_sub(1, Ordering::AcqRel);
                        MUTEX.unlock_shared();
                    }
                })
            };
            let spawn_writer = || {
                std::thread::spawn(|| {
                    for _ in 0..50 {
                        run(MUTEX.async_lock());
                        assert_eq!(WRITERS.fetch_add(1, Ordering::AcqRel), 0);
                        assert_eq!(READERS.load(Ordering::Acquire), 0);
                        WRITERS.fetch_sub(1, Ordering::AcqRel);
                        MUTEX.unlock();
                    }
                })
            };

            let threads = vec![spawn_reader(), spawn_writer(), spawn_reader(), spawn_writer()];
            for thread in threads {
                thread.join().unwrap();
            }
        });
    }

    #[test]
    fn thread_safe_surface() {
        assert_impl_all!(SharedMutex: Send, Sync);
    }
}
