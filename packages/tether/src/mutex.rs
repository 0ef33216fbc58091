//! Asynchronous mutual exclusion.
//!
//! The lock word has three states: free, locked, and contended. Uncontended
//! lock and unlock are a single compare-and-swap and never touch the
//! internal mutex; only contention pays for the waiter list.
//!
//! # Example
//!
//! ```rust
//! use tether::{Mutex, run};
//!
//! let mutex = Mutex::new();
//! run(mutex.async_lock());
//! assert!(!mutex.try_lock());
//! mutex.unlock();
//! assert!(mutex.try_lock());
//! mutex.unlock();
//! ```

use std::marker::PhantomPinned;
use std::mem;
use std::pin::Pin;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::execution::{Operation, Receiver, Sender};
use crate::list::{List, OpNode};

const FREE: u8 = 0;
const LOCKED: u8 = 1;
const CONTENDED: u8 = 2;

/// An async mutex with an uncontended fast path.
///
/// Locking does not hand out a guard: the holder calls
/// [`unlock`](Mutex::unlock) explicitly, which is what lets the lock be
/// released from a different execution context than the one that acquired
/// it. Unlocking a mutex that is not held is a contract violation.
#[derive(Debug)]
pub struct Mutex {
    state: AtomicU8,
    waiters: parking_lot::Mutex<List<OpNode>>,
}

// SAFETY: the waiter list is only touched under the internal mutex; waiter
// nodes are kept alive by the armed operations that own them.
unsafe impl Send for Mutex {}
// SAFETY: as above.
unsafe impl Sync for Mutex {}

impl Mutex {
    /// Creates an unlocked mutex.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(FREE),
            waiters: parking_lot::Mutex::new(List::new()),
        }
    }

    /// Attempts to acquire the lock without waiting.
    #[must_use]
    pub fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(FREE, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Returns a sender that completes once the lock has been acquired.
    ///
    /// Uncontended acquisition completes inline.
    pub fn async_lock(&self) -> LockSender<'_> {
        LockSender { mutex: self }
    }

    /// Releases the lock, handing it to the oldest waiter if there is one.
    ///
    /// # Panics
    ///
    /// Panics if the mutex is not locked.
    pub fn unlock(&self) {
        loop {
            match self.state.load(Ordering::Relaxed) {
                FREE => panic!("unlock of a mutex that is not locked"),
                LOCKED => {
                    if self
                        .state
                        .compare_exchange(LOCKED, FREE, Ordering::Release, Ordering::Relaxed)
                        .is_ok()
                    {
                        return;
                    }
                }
                CONTENDED => {
                    let node = {
                        let mut waiters = self.waiters.lock();
                        let node = waiters
                            .pop_front()
                            .expect("contended mutex with no waiters");
                        if waiters.is_empty() {
                            // Hand-off: the lock stays held, now by the
                            // popped waiter. The waiter synchronizes by
                            // observing its own wake, so no release fence is
                            // needed here.
                            self.state.store(LOCKED, Ordering::Relaxed);
                        }
                        node
                    };
                    // SAFETY: the node was detached under the lock; its
                    // operation is armed and alive.
                    unsafe { OpNode::complete(node) };
                    return;
                }
                state => unreachable!("invalid mutex state: {state}"),
            }
        }
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Mutex {
    fn drop(&mut self) {
        assert!(
            self.waiters.get_mut().is_empty(),
            "mutex dropped with outstanding waiters"
        );
    }
}

/// Sender of [`Mutex::async_lock`].
#[derive(Debug)]
#[must_use = "senders do nothing unless connected and started"]
pub struct LockSender<'m> {
    mutex: &'m Mutex,
}

impl<'m> Sender for LockSender<'m> {
    type Value = ();
    type Operation<R: Receiver<Value = ()>> = LockOperation<'m, R>;

    fn connect<R: Receiver<Value = ()>>(self, receiver: R) -> Self::Operation<R> {
        LockOperation {
            mutex: self.mutex,
            node: OpNode::new(),
            receiver,
            _pin: PhantomPinned,
        }
    }
}

/// Operation state of [`Mutex::async_lock`].
pub struct LockOperation<'m, R> {
    mutex: &'m Mutex,
    node: OpNode,
    receiver: R,
    _pin: PhantomPinned,
}

impl<R: Receiver<Value = ()>> LockOperation<'_, R> {
    unsafe fn granted(node: NonNull<OpNode>) {
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

impl<R: Receiver<Value = ()>> Operation for LockOperation<'_, R> {
    fn start_inline(self: Pin<&mut Self>) -> bool {
        // SAFETY: nothing is moved out of the pinned operation.
        let this = unsafe { self.get_unchecked_mut() };
        let mutex = this.mutex;

        // Uncontended fast path.
        if mutex.try_lock() {
            this.receiver.set_value_inline(());
            return true;
        }

        let mut waiters = mutex.waiters.lock();
        loop {
            match mutex.state.load(Ordering::Relaxed) {
                FREE => {
                    if mutex
                        .state
                        .compare_exchange(FREE, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                        .is_ok()
                    {
                        drop(waiters);
                        this.receiver.set_value_inline(());
                        return true;
                    }
                }
                LOCKED => {
                    if mutex
                        .state
                        .compare_exchange(LOCKED, CONTENDED, Ordering::Relaxed, Ordering::Relaxed)
                        .is_ok()
                    {
                        this.node.set_complete(Self::granted);
                        // SAFETY: the operation is pinned and stays alive
                        // while armed.
                        unsafe {
                            waiters.push_back(NonNull::from(&this.node));
                        }
                        return false;
                    }
                }
                CONTENDED => {
                    this.node.set_complete(Self::granted);
                    // SAFETY: as above.
                    unsafe {
                        waiters.push_back(NonNull::from(&this.node));
                    }
                    return false;
                }
                state => unreachable!("invalid mutex state: {state}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, AtomicUsize};

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::execution::run;
    use crate::test_utils::with_watchdog;

    #[test]
    fn try_lock_after_async_lock() {
        let mutex = Mutex::new();

        run(mutex.async_lock());
        assert!(!mutex.try_lock());
        mutex.unlock();
        assert!(mutex.try_lock());
        mutex.unlock();
    }

    #[test]
    fn uncontended_lock_completes_inline() {
        let mutex = Mutex::new();
        // `run` would park forever on a noinline path with nobody to unlock.
        run(mutex.async_lock());
        mutex.unlock();
    }

    #[test]
    #[should_panic(expected = "unlock of a mutex that is not locked")]
    fn unlock_of_free_mutex_panics() {
        let mutex = Mutex::new();
        mutex.unlock();
    }

    #[test]
    fn contended_critical_sections_are_exclusive() {
        with_watchdog(|| {
            static MUTEX: Mutex = Mutex::new();
            static IN_SECTION: AtomicU32 = AtomicU32::new(0);

            let entries = Arc::new(AtomicUsize::new(0));

            let threads: Vec<_> = (0..4)
                .map(|_| {
                    let entries = Arc::clone(&entries);
                    std::thread::spawn(move || {
                        for _ in 0..100 {
                            run(MUTEX.async_lock());
                            assert_eq!(IN_SECTION.fetch_add(1, Ordering::AcqRel), 0);
                            entries.fetch_add(1, Ordering::Relaxed);
                            assert_eq!(IN_SECTION.fetch_sub(1, Ordering::AcqRel), 1);
                            MUTEX.unlock();
                        }
                    })
                })
                .collect();

            for thread in threads {
                thread.join().unwrap();
            }
            assert_eq!(entries.load(Ordering::Relaxed), 400);
        });
    }

    #[test]
    fn thread_safe_surface() {
        assert_impl_all!(Mutex: Send, Sync);
    }
}
