//! The sender/receiver execution protocol.
//!
//! Asynchronous work is described by a [`Sender`]: a movable value that
//! carries the recipe for a computation. Connecting a sender to a
//! [`Receiver`] produces an [`Operation`]: the in-place state machine that
//! ties the two together. Operations are pinned before they are started and
//! must not be moved afterwards; primitives store pointers into them.
//!
//! Starting an operation either completes it synchronously — signalled by
//! [`Operation::start_inline`] returning `true`, in which case the receiver
//! has already observed [`Receiver::set_value_inline`] — or arms it, after
//! which it completes exactly once, later, through
//! [`Receiver::set_value_noinline`], possibly from another thread.
//!
//! The two completion entry points deliver the same value. The split is a
//! performance and stack-safety hint: the inline variant promises the caller
//! is still inside `start_inline`, which lets composed operations
//! short-circuit without bouncing through a scheduler, while receivers that
//! only care about the value implement the noinline variant and inherit the
//! default routing.
//!
//! # Example
//!
//! ```rust
//! use tether::{invocable, run};
//!
//! let value = run(invocable(|| 21 * 2));
//! assert_eq!(value, 42);
//! ```

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::pin::{Pin, pin};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::{self, Thread};

/// Sink for the value of a completed operation.
pub trait Receiver {
    /// The value this receiver accepts.
    type Value;

    /// Delivers the value while the operation is still inside
    /// [`Operation::start_inline`].
    ///
    /// Implementing this is optional; the default routes to
    /// [`Receiver::set_value_noinline`], which is always correct.
    fn set_value_inline(&mut self, value: Self::Value) {
        self.set_value_noinline(value);
    }

    /// Delivers the value after `start_inline` has returned `false`.
    fn set_value_noinline(&mut self, value: Self::Value);
}

/// The non-movable state produced by [`Sender::connect`].
pub trait Operation {
    /// Starts the computation.
    ///
    /// Returns `true` iff the operation completed synchronously, in which
    /// case the receiver has already been invoked. Returns `false` if the
    /// operation is armed: it will then complete exactly once via
    /// [`Receiver::set_value_noinline`], and the operation must stay alive
    /// and pinned until that call has returned.
    fn start_inline(self: Pin<&mut Self>) -> bool;
}

/// A factory of operations: the description of a deferred computation.
///
/// A sender is consumed exactly once, by [`Sender::connect`]. Connecting is
/// strictly value-forwarding and has no side effects; all work happens in
/// [`Operation::start_inline`] and later.
#[must_use = "senders do nothing unless connected and started"]
pub trait Sender {
    /// The type of the value this sender eventually produces.
    type Value;

    /// The operation produced by connecting to a receiver of type `R`.
    type Operation<R: Receiver<Value = Self::Value>>: Operation;

    /// Ties this sender to `receiver`, producing the operation state.
    fn connect<R: Receiver<Value = Self::Value>>(self, receiver: R) -> Self::Operation<R>;
}

/// Free-function form of [`Sender::connect`].
pub fn connect<S, R>(sender: S, receiver: R) -> S::Operation<R>
where
    S: Sender,
    R: Receiver<Value = S::Value>,
{
    sender.connect(receiver)
}

/// Free-function form of [`Operation::start_inline`].
pub fn start_inline<O: Operation>(operation: Pin<&mut O>) -> bool {
    operation.start_inline()
}

// ############## run() ##############

struct RunState<T> {
    done: AtomicBool,
    value: UnsafeCell<Option<T>>,
    thread: Thread,
}

struct RunReceiver<T> {
    state: NonNull<RunState<T>>,
}

impl<T> Receiver for RunReceiver<T> {
    type Value = T;

    fn set_value_inline(&mut self, value: T) {
        // SAFETY: the state outlives the operation (it is declared before it
        // on `run`'s stack) and an inline completion happens on the running
        // thread itself, so the slot access is unsynchronized but exclusive.
        unsafe {
            *self.state.as_ref().value.get() = Some(value);
        }
        self.state_ref().done.store(true, Ordering::Release);
    }

    fn set_value_noinline(&mut self, value: T) {
        // SAFETY: as above; a noinline completion may arrive from another
        // thread, but the running thread only reads the slot after observing
        // `done` with acquire ordering.
        unsafe {
            *self.state.as_ref().value.get() = Some(value);
        }
        let state = self.state_ref();
        state.done.store(true, Ordering::Release);
        state.thread.unpark();
    }
}

impl<T> RunReceiver<T> {
    fn state_ref(&self) -> &RunState<T> {
        // SAFETY: see the completion methods; the state outlives the receiver.
        unsafe { self.state.as_ref() }
    }
}

/// Builds the operation on the stack, starts it, and blocks the calling
/// thread until it completes, returning the value.
///
/// If the operation completes inline no blocking happens at all; otherwise
/// the thread parks until the completion (possibly from another thread)
/// unparks it.
///
/// # Example
///
/// ```rust
/// use tether::{Queue, run};
///
/// let queue = Queue::new();
/// queue.put(7);
/// assert_eq!(run(queue.async_get(Default::default())), Some(7));
/// ```
pub fn run<S: Sender>(sender: S) -> S::Value {
    let state = RunState {
        done: AtomicBool::new(false),
        value: UnsafeCell::new(None),
        thread: thread::current(),
    };

    let mut operation = pin!(connect(
        sender,
        RunReceiver {
            state: NonNull::from(&state),
        }
    ));

    if !operation.as_mut().start_inline() {
        while !state.done.load(Ordering::Acquire) {
            thread::park();
        }
    }

    // SAFETY: `done` was observed with acquire ordering (or the completion
    // was inline); the completing thread no longer touches the slot.
    unsafe { (*state.value.get()).take() }.expect("operation completed without a value")
}

/// Like [`run`], but blocks through the embedder's `waiter` callback instead
/// of parking the thread.
///
/// `waiter` is called repeatedly while the operation has not completed; it is
/// expected to block until external progress is possible (an interrupt, an
/// I/O completion, another thread's wakeup).
pub fn run_with<S, W>(sender: S, mut waiter: W) -> S::Value
where
    S: Sender,
    W: FnMut(),
{
    let state = RunState {
        done: AtomicBool::new(false),
        value: UnsafeCell::new(None),
        thread: thread::current(),
    };

    let mut operation = pin!(connect(
        sender,
        RunReceiver {
            state: NonNull::from(&state),
        }
    ));

    if !operation.as_mut().start_inline() {
        while !state.done.load(Ordering::Acquire) {
            waiter();
        }
    }

    // SAFETY: as in `run`.
    unsafe { (*state.value.get()).take() }.expect("operation completed without a value")
}

// ############## Detached operations ##############

const BLOCK_PARTIES: u8 = 2;

struct DetachBlock<O> {
    /// Two parties hold the block: the starting call site and the completing
    /// receiver. Whoever decrements this to zero frees the block, which is
    /// what keeps the inline-completion case from freeing the operation while
    /// `start_inline` is still on the stack.
    releases: AtomicU8,
    operation: Option<O>,
}

/// Releases one party's hold on `block`, freeing it when both are done.
///
/// # Safety
///
/// `block` must come from [`Box::into_raw`] and each party may release at
/// most once.
unsafe fn release_block<O>(block: *mut DetachBlock<O>) {
    // SAFETY: the block stays allocated until the second release, and the
    // counter is the last field either party touches.
    if unsafe { (*block).releases.fetch_sub(1, Ordering::AcqRel) } == BLOCK_PARTIES - 1 {
        // SAFETY: both parties are done; nothing references the block. The
        // operation has completed, so dropping it is permitted.
        drop(unsafe { Box::from_raw(block) });
    }
}

struct DetachReceiver<S, C>
where
    S: Sender<Value = ()>,
    C: FnOnce(),
{
    block: *mut DetachBlock<S::Operation<DetachReceiver<S, C>>>,
    continuation: Option<C>,
}

impl<S, C> Receiver for DetachReceiver<S, C>
where
    S: Sender<Value = ()>,
    C: FnOnce(),
{
    type Value = ();

    fn set_value_noinline(&mut self, (): ()) {
        let block = self.block;
        let continuation = self
            .continuation
            .take()
            .expect("detached operation completed twice");
        continuation();
        // SAFETY: this receiver's party has not released yet; no field of
        // `self` is accessed after this point.
        unsafe { release_block(block) };
    }
}

/// Starts `sender` detached from the caller: the operation is placed on the
/// heap and freed once it completes.
///
/// The value type must be `()`; a detached value would have nowhere to go.
pub fn detach<S>(sender: S)
where
    S: Sender<Value = ()>,
{
    detach_and_then(sender, || ());
}

/// Like [`detach`], but runs `continuation` once the operation completes.
pub fn detach_and_then<S, C>(sender: S, continuation: C)
where
    S: Sender<Value = ()>,
    C: FnOnce(),
{
    let block: *mut DetachBlock<S::Operation<DetachReceiver<S, C>>> =
        Box::into_raw(Box::new(DetachBlock {
            releases: AtomicU8::new(BLOCK_PARTIES),
            operation: None,
        }));

    let receiver = DetachReceiver {
        block,
        continuation: Some(continuation),
    };

    // SAFETY: the block was just allocated and is exclusively ours until the
    // operation is started.
    unsafe {
        (*block).operation = Some(connect(sender, receiver));
        // The operation now lives at a stable heap address and is never moved
        // again, which upholds the pinning contract.
        let operation = Pin::new_unchecked((*block).operation.as_mut().expect("just stored"));
        let _ = operation.start_inline();
        release_block(block);
    }
}

struct SpawnReceiver<S, R>
where
    S: Sender,
    R: Receiver<Value = S::Value>,
{
    block: *mut DetachBlock<S::Operation<SpawnReceiver<S, R>>>,
    downstream: Option<R>,
}

impl<S, R> Receiver for SpawnReceiver<S, R>
where
    S: Sender,
    R: Receiver<Value = S::Value>,
{
    type Value = S::Value;

    fn set_value_noinline(&mut self, value: S::Value) {
        let block = self.block;
        let mut downstream = self
            .downstream
            .take()
            .expect("spawned operation completed twice");
        downstream.set_value_noinline(value);
        drop(downstream);
        // SAFETY: as in `DetachReceiver`; no field of `self` is accessed
        // after this point.
        unsafe { release_block(block) };
    }
}

/// Starts `sender` on the heap and forwards its value to `receiver` when it
/// completes; the heap block is freed afterwards.
///
/// The downstream receiver always observes a noinline completion, because by
/// the time it runs the spawning call site may long have returned.
pub fn spawn_detached<S, R>(sender: S, receiver: R)
where
    S: Sender,
    R: Receiver<Value = S::Value>,
{
    let block: *mut DetachBlock<S::Operation<SpawnReceiver<S, R>>> =
        Box::into_raw(Box::new(DetachBlock {
            releases: AtomicU8::new(BLOCK_PARTIES),
            operation: None,
        }));

    let final_receiver = SpawnReceiver {
        block,
        downstream: Some(receiver),
    };

    // SAFETY: as in `detach_and_then`.
    unsafe {
        (*block).operation = Some(connect(sender, final_receiver));
        let operation = Pin::new_unchecked((*block).operation.as_mut().expect("just stored"));
        let _ = operation.start_inline();
        release_block(block);
    }
}

// ############## AnyReceiver ##############

/// A word-sized type-erased receiver.
///
/// This is the one narrow piece of dynamic dispatch in the crate: it erases a
/// `Copy` receiver no larger than a pointer behind a function pointer, which
/// lets non-generic code hold "some receiver of `T`" without a heap
/// allocation.
pub struct AnyReceiver<T> {
    storage: MaybeUninit<*mut ()>,
    set_value: unsafe fn(*mut (), T),
    _value: PhantomData<T>,
}

impl<T> AnyReceiver<T> {
    /// Erases `receiver`.
    ///
    /// The receiver must be `Copy`, at most pointer-sized and at most
    /// pointer-aligned; this is enforced at compile time.
    pub fn new<R>(receiver: R) -> Self
    where
        R: Receiver<Value = T> + Copy,
    {
        const {
            assert!(size_of::<R>() <= size_of::<*mut ()>());
            assert!(align_of::<R>() <= align_of::<*mut ()>());
        }

        unsafe fn call<R, T>(storage: *mut (), value: T)
        where
            R: Receiver<Value = T> + Copy,
        {
            // SAFETY: `storage` points at the bytes of an `R` written in
            // `new`; size and alignment were checked at compile time.
            let receiver = unsafe { &mut *storage.cast::<R>() };
            receiver.set_value_noinline(value);
        }

        let mut storage: MaybeUninit<*mut ()> = MaybeUninit::uninit();
        // SAFETY: `R` fits in the storage per the compile-time checks.
        unsafe {
            storage.as_mut_ptr().cast::<R>().write(receiver);
        }

        Self {
            storage,
            set_value: call::<R, T>,
            _value: PhantomData,
        }
    }
}

impl<T> Receiver for AnyReceiver<T> {
    type Value = T;

    fn set_value_noinline(&mut self, value: T) {
        // SAFETY: the storage holds the receiver written in `new`.
        unsafe { (self.set_value)(self.storage.as_mut_ptr().cast(), value) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::invocable;
    use crate::test_utils::with_watchdog;

    #[test]
    fn run_inline_completion() {
        let value = run(invocable(|| 7));
        assert_eq!(value, 7);
    }

    #[test]
    fn run_with_never_waits_for_inline_completion() {
        let value = run_with(invocable(|| "done"), || {
            panic!("waiter must not be called for an inline completion")
        });
        assert_eq!(value, "done");
    }

    #[test]
    fn run_parks_until_cross_thread_completion() {
        use crate::OneshotEvent;

        with_watchdog(|| {
            static EVENT: OneshotEvent = OneshotEvent::new();

            let raiser = std::thread::spawn(|| {
                std::thread::sleep(std::time::Duration::from_millis(10));
                EVENT.raise();
            });

            run(EVENT.wait());
            raiser.join().unwrap();
        });
    }

    #[test]
    fn detach_runs_to_completion() {
        use std::sync::atomic::AtomicBool;

        static DONE: AtomicBool = AtomicBool::new(false);

        detach_and_then(invocable(|| ()), || DONE.store(true, Ordering::SeqCst));
        assert!(DONE.load(Ordering::SeqCst));
    }

    #[test]
    fn spawn_detached_forwards_value() {
        use std::sync::atomic::AtomicU32;

        static VALUE: AtomicU32 = AtomicU32::new(0);

        #[derive(Clone, Copy)]
        struct Store;

        impl Receiver for Store {
            type Value = u32;

            fn set_value_noinline(&mut self, value: u32) {
                VALUE.store(value, Ordering::SeqCst);
            }
        }

        spawn_detached(invocable(|| 42), Store);
        assert_eq!(VALUE.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn any_receiver_round_trip() {
        use std::sync::atomic::AtomicU32;

        static SEEN: AtomicU32 = AtomicU32::new(0);

        #[derive(Clone, Copy)]
        struct IntoStatic;

        impl Receiver for IntoStatic {
            type Value = u32;

            fn set_value_noinline(&mut self, value: u32) {
                SEEN.store(value, Ordering::SeqCst);
            }
        }

        let mut erased = AnyReceiver::new(IntoStatic);
        erased.set_value_noinline(17);
        assert_eq!(SEEN.load(Ordering::SeqCst), 17);
    }
}
