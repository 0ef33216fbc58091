//! The cancellation substrate.
//!
//! A [`CancellationEvent`] is a multi-listener signal with two states,
//! pristine and raised. Raising it requests cancellation: every registered
//! listener fires at most once per raise, and a listener that registers
//! against an already-raised event fires synchronously during registration.
//!
//! Cancellation is cooperative. Primitives observe it through a
//! [`CancellationObserver`], an armable handler slot whose `try_set` /
//! `try_reset` pair is what makes teardown race-free: `try_reset` returning
//! `false` means the handler has fired or is about to, and the handler then
//! owns delivering the operation's completion.
//!
//! The raise path splices the listener list out under the event's lock and
//! invokes the handlers only after releasing it, so a handler may re-enter
//! the event (or take a primitive's lock) without deadlocking.
//!
//! # Example
//!
//! ```rust
//! use tether::{CancellationEvent, Queue, run};
//!
//! let event = CancellationEvent::new();
//! let queue = Queue::<u32>::new();
//!
//! event.cancel();
//! assert_eq!(run(queue.async_get(event.token())), None);
//! ```

use std::cell::{Cell, UnsafeCell};
use std::hint;
use std::marker::PhantomPinned;
use std::mem;
use std::pin::Pin;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::execution::{Operation, Receiver, Sender, connect, start_inline};
use crate::list::{Linked, Links, List};

// ############## Event core ##############

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NodeState {
    Unarmed,
    Armed,
    /// Spliced out by a raise; the handler has run or is about to.
    Fired,
}

/// A listener node, embedded in a [`CancellationCallback`] or
/// [`CancellationObserver`].
#[derive(Debug)]
struct CallbackNode {
    links: Links<CallbackNode>,
    /// Transitions are protected by the event lock.
    state: Cell<NodeState>,
    invoke: Cell<Option<unsafe fn(NonNull<CallbackNode>)>>,
    /// Set by the raising thread once the handler has finished; lets a
    /// racing deregistration wait out an in-flight handler.
    done: AtomicBool,
}

// SAFETY: all cell access is serialized by the owning event's lock, except
// the post-splice handler invocation, which happens after the node has been
// detached and is ordered by the lock release.
unsafe impl Send for CallbackNode {}
// SAFETY: as above.
unsafe impl Sync for CallbackNode {}

impl CallbackNode {
    const fn new() -> Self {
        Self {
            links: Links::new(),
            state: Cell::new(NodeState::Unarmed),
            invoke: Cell::new(None),
            done: AtomicBool::new(false),
        }
    }
}

// SAFETY: `links` returns the embedded field of the same node.
unsafe impl Linked for CallbackNode {
    fn links(&self) -> &Links<Self> {
        &self.links
    }
}

#[derive(Debug)]
struct CoreInner {
    was_requested: bool,
    callbacks: List<CallbackNode>,
}

#[derive(Debug)]
struct EventCore {
    inner: Mutex<CoreInner>,
}

impl EventCore {
    fn new() -> Self {
        Self {
            inner: Mutex::new(CoreInner {
                was_requested: false,
                callbacks: List::new(),
            }),
        }
    }
}

// ############## CancellationEvent ##############

/// A raisable, resettable cancellation signal.
///
/// Tokens handed out by [`CancellationEvent::token`] stay valid for as long
/// as any of them exist; the event's core is reference-counted.
#[derive(Debug)]
pub struct CancellationEvent {
    core: Arc<EventCore>,
}

impl CancellationEvent {
    /// Creates a pristine event.
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: Arc::new(EventCore::new()),
        }
    }

    /// Returns a token referring to this event.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            core: Some(Arc::clone(&self.core)),
        }
    }

    /// Requests cancellation.
    ///
    /// Marks the event raised, detaches every registered listener under the
    /// lock, then invokes them in registration order with no lock held.
    /// Listeners registered while the event is raised fire synchronously
    /// inside their registration instead.
    pub fn cancel(&self) {
        let mut fired = {
            let mut inner = self.core.inner.lock();
            inner.was_requested = true;
            // Mark every node as fired while still holding the lock so a
            // racing `try_reset` knows its handler is now in flight.
            //
            // SAFETY: the lock is held; no node is unlinked here.
            unsafe {
                inner.callbacks.for_each(|node| {
                    // SAFETY: every reachable node is a valid registration.
                    unsafe { node.as_ref() }.state.set(NodeState::Fired);
                });
            }
            inner.callbacks.take()
        };

        while let Some(node) = fired.pop_front() {
            // SAFETY: the node was detached under the lock and its owner may
            // not tear it down until `done` is observed or its completion has
            // been delivered; see the listener types below.
            let invoke = unsafe { node.as_ref() }
                .invoke
                .get()
                .expect("registered cancellation listener has no handler");
            // SAFETY: as above.
            unsafe { invoke(node) };
        }
    }

    /// Clears the raised state.
    ///
    /// Callers must ensure no handlers are concurrently running.
    pub fn reset(&self) {
        self.core.inner.lock().was_requested = false;
    }
}

impl Default for CancellationEvent {
    fn default() -> Self {
        Self::new()
    }
}

// ############## CancellationToken ##############

/// A non-owning reference to zero or one [`CancellationEvent`].
///
/// Cloning a token is an atomic increment. The default token refers to no
/// event and never reports cancellation.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    core: Option<Arc<EventCore>>,
}

impl CancellationToken {
    /// A token that is never cancelled.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Returns whether the referenced event is currently raised.
    #[must_use]
    pub fn is_cancellation_requested(&self) -> bool {
        match &self.core {
            Some(core) => core.inner.lock().was_requested,
            None => false,
        }
    }
}

impl From<&CancellationEvent> for CancellationToken {
    fn from(event: &CancellationEvent) -> Self {
        event.token()
    }
}

// ############## CancellationCallback ##############

/// RAII registration of a cancellation handler.
///
/// Create it unarmed, pin it, then [`arm`](Self::arm) it: if the event is
/// already raised the handler fires synchronously from `arm`, otherwise it is
/// registered and fires from a later [`CancellationEvent::cancel`]. Dropping
/// the callback deregisters it; a drop that races an in-flight raise waits
/// for the handler to finish first.
#[derive(Debug)]
pub struct CancellationCallback<F: FnOnce()> {
    node: CallbackNode,
    core: Option<Arc<EventCore>>,
    handler: UnsafeCell<Option<F>>,
    _pin: PhantomPinned,
}

impl<F: FnOnce()> CancellationCallback<F> {
    /// Creates an unarmed callback for `token`.
    #[must_use]
    pub fn new(token: CancellationToken, handler: F) -> Self {
        Self {
            node: CallbackNode::new(),
            core: token.core,
            handler: UnsafeCell::new(Some(handler)),
            _pin: PhantomPinned,
        }
    }

    /// Registers the callback with its event.
    ///
    /// Fires the handler synchronously if the event is already raised.
    /// Arming twice is a contract violation.
    pub fn arm(self: Pin<&Self>) {
        let this = self.get_ref();
        let Some(core) = &this.core else {
            return;
        };

        assert_eq!(
            this.node.state.get(),
            NodeState::Unarmed,
            "cancellation callback armed twice"
        );

        {
            let mut inner = core.inner.lock();
            if !inner.was_requested {
                this.node.invoke.set(Some(Self::invoke));
                this.node.state.set(NodeState::Armed);
                // SAFETY: `this` is pinned and the node lives inside it; the
                // drop impl unlinks before the node's storage goes away.
                unsafe {
                    inner.callbacks.push_back(NonNull::from(&this.node));
                }
                return;
            }
        }

        // Already raised: fire synchronously, outside the lock.
        //
        // SAFETY: the callback is not registered, so no other thread touches
        // the handler slot.
        let handler = unsafe { &mut *this.handler.get() }
            .take()
            .expect("cancellation handler fired twice");
        handler();
    }

    unsafe fn invoke(node: NonNull<CallbackNode>) {
        // SAFETY: the node is embedded in a `CancellationCallback<F>`; the
        // owner keeps it alive until `done` is set below.
        let this = unsafe {
            node.byte_sub(mem::offset_of!(Self, node))
                .cast::<Self>()
                .as_ref()
        };
        // SAFETY: the node has been spliced out, so registration cannot touch
        // the slot, and drop waits on `done` before touching anything.
        let handler = unsafe { &mut *this.handler.get() }
            .take()
            .expect("cancellation handler fired twice");
        handler();
        // Last touch of the node: after this store the owner may free it.
        this.node.done.store(true, Ordering::Release);
    }
}

impl<F: FnOnce()> Drop for CancellationCallback<F> {
    fn drop(&mut self) {
        let Some(core) = &self.core else {
            return;
        };

        let state = {
            let mut inner = core.inner.lock();
            let state = self.node.state.get();
            if state == NodeState::Armed {
                // SAFETY: an armed node is a member of the event's list.
                unsafe {
                    inner.callbacks.remove(NonNull::from(&self.node));
                }
                self.node.state.set(NodeState::Unarmed);
            }
            state
        };

        if state == NodeState::Fired {
            // The raise already detached us; wait out the handler so its
            // storage is not pulled out from under it.
            while !self.node.done.load(Ordering::Acquire) {
                hint::spin_loop();
            }
        }
    }
}

// ############## CancellationObserver ##############

/// An armable cancellation-handler slot for operations that wait.
///
/// Unlike a [`CancellationCallback`], the observer supports a deferred
/// arm/disarm pair that primitives drive from inside their own locks:
///
/// * [`try_set`](Self::try_set) arms the observer with a token; `false`
///   means cancellation was already requested and the caller must complete
///   with its cancellation sentinel instead of enqueueing.
/// * [`try_reset`](Self::try_reset) disarms it; `false` means the raced
///   handler has fired or will fire, and that handler now owns delivering
///   the operation's completion.
///
/// This is a low-level building block; all of this crate's primitives use it
/// for their cancellable wait operations.
#[derive(Debug)]
pub struct CancellationObserver {
    node: CallbackNode,
    core: UnsafeCell<Option<Arc<EventCore>>>,
    target: Cell<Option<NonNull<()>>>,
    on_cancel: Cell<Option<unsafe fn(NonNull<()>)>>,
    _pin: PhantomPinned,
}

// SAFETY: the observer is driven from multiple threads (the arming operation
// and the raising event) with all shared state transitions serialized by the
// event lock.
unsafe impl Send for CancellationObserver {}
// SAFETY: as above.
unsafe impl Sync for CancellationObserver {}

impl CancellationObserver {
    /// Creates an idle observer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            node: CallbackNode::new(),
            core: UnsafeCell::new(None),
            target: Cell::new(None),
            on_cancel: Cell::new(None),
            _pin: PhantomPinned,
        }
    }

    /// Attempts to arm the observer with `token`.
    ///
    /// Returns `false` iff cancellation has already been requested; the
    /// observer is then left idle. On success the observer is registered and
    /// `on_cancel(target)` will be invoked, once, if the event is raised
    /// before a successful [`try_reset`](Self::try_reset).
    ///
    /// # Safety
    ///
    /// `self` must be pinned and must outlive its registration, and `target`
    /// must be valid for `on_cancel` until the observer is disarmed or the
    /// handler has delivered the operation's completion. The handler must
    /// not touch the observer after delivering that completion.
    pub unsafe fn try_set(
        &self,
        token: &CancellationToken,
        target: NonNull<()>,
        on_cancel: unsafe fn(NonNull<()>),
    ) -> bool {
        let Some(core) = &token.core else {
            return true;
        };

        let mut inner = core.inner.lock();
        if inner.was_requested {
            return false;
        }

        debug_assert_eq!(
            self.node.state.get(),
            NodeState::Unarmed,
            "cancellation observer armed while already armed"
        );

        self.target.set(Some(target));
        self.on_cancel.set(Some(on_cancel));
        self.node.invoke.set(Some(Self::invoke));
        self.node.state.set(NodeState::Armed);
        // SAFETY: the caller guarantees the observer is pinned and outlives
        // the registration.
        unsafe {
            inner.callbacks.push_back(NonNull::from(&self.node));
        }
        // SAFETY: the slot is only written under the event lock while the
        // observer is unarmed.
        *unsafe { &mut *self.core.get() } = Some(Arc::clone(core));
        true
    }

    /// Attempts to disarm the observer.
    ///
    /// Returns `true` if the observer was idle or was disarmed before its
    /// handler fired; the caller then owns the operation's completion.
    /// Returns `false` if the handler has fired or is in flight — the
    /// handler owns the completion and the caller must back off.
    pub fn try_reset(&self) -> bool {
        // SAFETY: armed state implies the slot was set under the lock and is
        // stable until cleared below; unarmed observers race with nothing.
        let Some(core) = unsafe { &*self.core.get() }.clone() else {
            return true;
        };

        let mut inner = core.inner.lock();
        match self.node.state.get() {
            NodeState::Unarmed => true,
            NodeState::Armed => {
                // SAFETY: an armed node is a member of the event's list.
                unsafe {
                    inner.callbacks.remove(NonNull::from(&self.node));
                }
                self.node.state.set(NodeState::Unarmed);
                drop(inner);
                // SAFETY: the node is unlinked; only this thread touches the
                // observer now.
                *unsafe { &mut *self.core.get() } = None;
                true
            }
            NodeState::Fired => false,
        }
    }

    unsafe fn invoke(node: NonNull<CallbackNode>) {
        // SAFETY: the node is embedded in a `CancellationObserver` that stays
        // alive until its operation's completion has been delivered, which
        // only happens inside `on_cancel` below.
        let this = unsafe {
            node.byte_sub(mem::offset_of!(Self, node))
                .cast::<Self>()
                .as_ref()
        };
        let target = this.target.get().expect("armed observer without a target");
        let on_cancel = this
            .on_cancel
            .get()
            .expect("armed observer without a handler");
        // The handler delivers the operation's completion; the observer (and
        // the whole operation) may be torn down once it returns, so it is the
        // last thing this function does.
        //
        // SAFETY: validity of `target` is the `try_set` caller's contract.
        unsafe { on_cancel(target) };
    }
}

impl Default for CancellationObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CancellationObserver {
    fn drop(&mut self) {
        assert_ne!(
            self.node.state.get(),
            NodeState::Armed,
            "cancellation observer dropped while armed; its operation was abandoned"
        );
    }
}

// ############## suspend_indefinitely ##############

/// Returns a sender that completes only when `token` is cancelled.
///
/// If cancellation was already requested the operation completes inline.
#[must_use]
pub fn suspend_indefinitely(token: CancellationToken) -> SuspendIndefinitely {
    SuspendIndefinitely { token }
}

/// Sender of [`suspend_indefinitely`].
#[derive(Debug)]
#[must_use = "senders do nothing unless connected and started"]
pub struct SuspendIndefinitely {
    token: CancellationToken,
}

impl Sender for SuspendIndefinitely {
    type Value = ();
    type Operation<R: Receiver<Value = ()>> = SuspendIndefinitelyOperation<R>;

    fn connect<R: Receiver<Value = ()>>(self, receiver: R) -> Self::Operation<R> {
        SuspendIndefinitelyOperation {
            token: self.token,
            observer: CancellationObserver::new(),
            receiver,
            _pin: PhantomPinned,
        }
    }
}

/// Operation state of [`suspend_indefinitely`].
#[derive(Debug)]
pub struct SuspendIndefinitelyOperation<R: Receiver<Value = ()>> {
    token: CancellationToken,
    observer: CancellationObserver,
    receiver: R,
    _pin: PhantomPinned,
}

impl<R: Receiver<Value = ()>> SuspendIndefinitelyOperation<R> {
    unsafe fn on_cancel(target: NonNull<()>) {
        let this = target.cast::<Self>().as_ptr();
        // SAFETY: the operation is alive until this completion returns; this
        // is its only completion path after a successful arm.
        unsafe { (*this).receiver.set_value_noinline(()) };
    }
}

impl<R: Receiver<Value = ()>> Operation for SuspendIndefinitelyOperation<R> {
    fn start_inline(self: Pin<&mut Self>) -> bool {
        // SAFETY: we never move out of the operation.
        let this = unsafe { self.get_unchecked_mut() };
        let target = NonNull::from(&mut *this).cast();

        // SAFETY: the operation is pinned; after a successful arm the only
        // completer is the handler, which does not touch the operation after
        // delivering the completion.
        let armed = unsafe { this.observer.try_set(&this.token, target, Self::on_cancel) };

        if armed {
            false
        } else {
            this.receiver.set_value_inline(());
            true
        }
    }
}

// ############## with_cancel_cb ##############

/// Runs `sender` with a cancellation callback armed for its whole duration.
///
/// `handler` fires if `token` is raised while the operation is alive — or
/// synchronously at start if the token was already cancelled. The sender's
/// value passes through unchanged, preserving the inline path.
#[must_use]
pub fn with_cancel_cb<S, F>(sender: S, handler: F, token: CancellationToken) -> WithCancelCb<S, F>
where
    S: Sender,
    F: FnOnce(),
{
    WithCancelCb {
        sender,
        handler,
        token,
    }
}

/// Sender of [`with_cancel_cb`].
#[must_use = "senders do nothing unless connected and started"]
pub struct WithCancelCb<S, F>
where
    S: Sender,
    F: FnOnce(),
{
    sender: S,
    handler: F,
    token: CancellationToken,
}

impl<S, F> Sender for WithCancelCb<S, F>
where
    S: Sender,
    F: FnOnce(),
{
    type Value = S::Value;
    type Operation<R: Receiver<Value = S::Value>> = WithCancelCbOperation<S, F, R>;

    fn connect<R: Receiver<Value = S::Value>>(self, receiver: R) -> Self::Operation<R> {
        WithCancelCbOperation {
            callback: CancellationCallback::new(self.token, self.handler),
            sender: Some(self.sender),
            receiver: Some(receiver),
            inner: None,
            _pin: PhantomPinned,
        }
    }
}

/// Operation state of [`with_cancel_cb`].
pub struct WithCancelCbOperation<S, F, R>
where
    S: Sender,
    F: FnOnce(),
    R: Receiver<Value = S::Value>,
{
    callback: CancellationCallback<F>,
    sender: Option<S>,
    receiver: Option<R>,
    inner: Option<S::Operation<R>>,
    _pin: PhantomPinned,
}

impl<S, F, R> Operation for WithCancelCbOperation<S, F, R>
where
    S: Sender,
    F: FnOnce(),
    R: Receiver<Value = S::Value>,
{
    fn start_inline(self: Pin<&mut Self>) -> bool {
        // SAFETY: we never move out of the operation.
        let this = unsafe { self.get_unchecked_mut() };

        // SAFETY: the callback is a field of this pinned operation.
        unsafe { Pin::new_unchecked(&this.callback) }.arm();

        let sender = this.sender.take().expect("operation started twice");
        let receiver = this.receiver.take().expect("operation started twice");
        this.inner = Some(connect(sender, receiver));
        // SAFETY: the child lives in this pinned operation and is never
        // moved after being started.
        let inner = unsafe { Pin::new_unchecked(this.inner.as_mut().expect("just stored")) };
        start_inline(inner)
    }
}

#[cfg(test)]
mod tests {
    use std::pin::pin;
    use std::sync::atomic::AtomicU32;

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::algorithm::invocable;
    use crate::execution::run;

    #[test]
    fn token_without_event_is_never_cancelled() {
        let token = CancellationToken::none();
        assert!(!token.is_cancellation_requested());
    }

    #[test]
    fn cancel_and_reset_round_trip() {
        let event = CancellationEvent::new();
        let token = event.token();

        assert!(!token.is_cancellation_requested());
        event.cancel();
        assert!(token.is_cancellation_requested());
        event.reset();
        assert!(!token.is_cancellation_requested());
    }

    #[test]
    fn callback_fires_on_cancel() {
        static FIRED: AtomicU32 = AtomicU32::new(0);

        let event = CancellationEvent::new();
        let callback = pin!(CancellationCallback::new(event.token(), || {
            FIRED.fetch_add(1, Ordering::SeqCst);
        }));
        callback.as_ref().arm();

        assert_eq!(FIRED.load(Ordering::SeqCst), 0);
        event.cancel();
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_fires_synchronously_when_already_raised() {
        let fired = Cell::new(false);

        let event = CancellationEvent::new();
        event.cancel();

        let callback = pin!(CancellationCallback::new(event.token(), || {
            fired.set(true);
        }));
        callback.as_ref().arm();
        assert!(fired.get());
    }

    #[test]
    fn dropped_callback_does_not_fire() {
        let fired = Cell::new(false);

        let event = CancellationEvent::new();
        {
            let callback = pin!(CancellationCallback::new(event.token(), || {
                fired.set(true);
            }));
            callback.as_ref().arm();
        }
        event.cancel();
        assert!(!fired.get());
    }

    #[test]
    fn observer_try_set_fails_when_cancelled() {
        let event = CancellationEvent::new();
        event.cancel();

        let observer = pin!(CancellationObserver::new());

        unsafe fn never(_: NonNull<()>) {
            unreachable!("handler must not fire for a failed arm");
        }

        // SAFETY: the observer is pinned and the arm fails, so the handler
        // never runs.
        let armed = unsafe {
            observer
                .as_ref()
                .try_set(&event.token(), NonNull::dangling(), never)
        };
        assert!(!armed);
        assert!(observer.try_reset());
    }

    #[test]
    fn observer_try_reset_wins_before_cancel() {
        let event = CancellationEvent::new();
        let observer = pin!(CancellationObserver::new());

        unsafe fn never(_: NonNull<()>) {
            unreachable!("handler must not fire after a successful reset");
        }

        // SAFETY: the observer is pinned, outlives the registration, and is
        // disarmed before the event is raised.
        let armed = unsafe {
            observer
                .as_ref()
                .try_set(&event.token(), NonNull::dangling(), never)
        };
        assert!(armed);
        assert!(observer.try_reset());
        event.cancel();
    }

    #[test]
    fn suspend_indefinitely_completes_inline_when_cancelled() {
        let event = CancellationEvent::new();
        event.cancel();
        run(suspend_indefinitely(event.token()));
    }

    #[test]
    fn with_cancel_cb_happy_path() {
        let called = Cell::new(false);
        let event = CancellationEvent::new();

        let value = run(with_cancel_cb(
            invocable(|| 42),
            || called.set(true),
            event.token(),
        ));

        assert_eq!(value, 42);
        assert!(!called.get());
    }

    #[test]
    fn with_cancel_cb_cancelled_before() {
        let called = Cell::new(false);
        let event = CancellationEvent::new();
        event.cancel();

        let value = run(with_cancel_cb(
            invocable(|| 42),
            || called.set(true),
            event.token(),
        ));

        assert_eq!(value, 42);
        assert!(called.get());
    }

    #[test]
    fn thread_safe_surface() {
        assert_impl_all!(CancellationEvent: Send, Sync);
        assert_impl_all!(CancellationToken: Send, Sync, Clone);
        assert_impl_all!(CancellationObserver: Send, Sync);
    }
}
