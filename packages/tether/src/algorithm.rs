//! Sender composition algorithms.
//!
//! Everything here composes operations without allocating: child operations
//! live inside their parent's operation state. Children are connected and
//! started from the parent's `start_inline`, once the parent is pinned and
//! its address is stable — that is the moment a child's receiver can be
//! given a pointer back into the parent.
//!
//! The inline fast path is preserved throughout: when every child completes
//! synchronously, the whole composition completes synchronously, without
//! recursion into receivers that prefer a scheduler hop.
//!
//! # Example
//!
//! ```rust
//! use tether::{invocable, run, transform};
//!
//! let value = run(transform(invocable(|| 6), |x| x * 7));
//! assert_eq!(value, 42);
//! ```

use std::cell::Cell;
use std::future::Future;
use std::marker::{PhantomData, PhantomPinned};
use std::pin::Pin;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::bridge::{FutureOperation, from_future};
use crate::cancellation::{CancellationEvent, CancellationToken};
use crate::execution::{Operation, Receiver, Sender, connect, start_inline};

// ############## invocable ##############

/// Wraps a nullary function as a sender that completes inline with its
/// return value.
#[must_use]
pub fn invocable<F, T>(f: F) -> Invocable<F, T>
where
    F: FnOnce() -> T,
{
    Invocable {
        f,
        _value: PhantomData,
    }
}

/// Sender of [`invocable`].
#[must_use = "senders do nothing unless connected and started"]
pub struct Invocable<F, T> {
    f: F,
    _value: PhantomData<fn() -> T>,
}

impl<F, T> Sender for Invocable<F, T>
where
    F: FnOnce() -> T,
{
    type Value = T;
    type Operation<R: Receiver<Value = T>> = InvocableOperation<F, T, R>;

    fn connect<R: Receiver<Value = T>>(self, receiver: R) -> Self::Operation<R> {
        InvocableOperation {
            f: Some(self.f),
            receiver,
            _value: PhantomData,
        }
    }
}

/// Operation state of [`invocable`].
pub struct InvocableOperation<F, T, R> {
    f: Option<F>,
    receiver: R,
    _value: PhantomData<fn() -> T>,
}

impl<F, T, R> Operation for InvocableOperation<F, T, R>
where
    F: FnOnce() -> T,
    R: Receiver<Value = T>,
{
    fn start_inline(self: Pin<&mut Self>) -> bool {
        // SAFETY: nothing is moved out of the operation itself.
        let this = unsafe { self.get_unchecked_mut() };
        let f = this.f.take().expect("operation started twice");
        this.receiver.set_value_inline(f());
        true
    }
}

// ############## transform ##############

/// Maps the value of `sender` through `f`.
///
/// The completion mode matches the upstream sender's: an inline upstream
/// completion stays inline.
#[must_use]
pub fn transform<S, F, U>(sender: S, f: F) -> Transform<S, F, U>
where
    S: Sender,
    F: FnOnce(S::Value) -> U,
{
    Transform {
        sender,
        f,
        _value: PhantomData,
    }
}

/// Sender of [`transform`].
#[must_use = "senders do nothing unless connected and started"]
pub struct Transform<S, F, U> {
    sender: S,
    f: F,
    _value: PhantomData<fn() -> U>,
}

impl<S, F, U> Sender for Transform<S, F, U>
where
    S: Sender,
    F: FnOnce(S::Value) -> U,
{
    type Value = U;
    type Operation<R: Receiver<Value = U>> = S::Operation<TransformReceiver<R, F, S::Value>>;

    fn connect<R: Receiver<Value = U>>(self, receiver: R) -> Self::Operation<R> {
        connect(
            self.sender,
            TransformReceiver {
                downstream: receiver,
                f: Some(self.f),
                _value: PhantomData,
            },
        )
    }
}

/// Receiver installed by [`transform`] between the upstream operation and
/// the downstream receiver.
pub struct TransformReceiver<R, F, V> {
    downstream: R,
    f: Option<F>,
    _value: PhantomData<fn(V)>,
}

impl<R, F, V> Receiver for TransformReceiver<R, F, V>
where
    R: Receiver,
    F: FnOnce(V) -> R::Value,
{
    type Value = V;

    fn set_value_inline(&mut self, value: V) {
        let f = self.f.take().expect("value delivered twice");
        self.downstream.set_value_inline(f(value));
    }

    fn set_value_noinline(&mut self, value: V) {
        let f = self.f.take().expect("value delivered twice");
        self.downstream.set_value_noinline(f(value));
    }
}

// ############## ite ##############

/// If-then-else over senders: `cond` is evaluated at start and picks which
/// child runs. The unchosen child is never connected.
#[must_use]
pub fn ite<C, ST, SE>(cond: C, then_sender: ST, else_sender: SE) -> Ite<C, ST, SE>
where
    C: FnOnce() -> bool,
    ST: Sender,
    SE: Sender<Value = ST::Value>,
{
    Ite {
        cond,
        then_sender,
        else_sender,
    }
}

/// Sender of [`ite`].
#[must_use = "senders do nothing unless connected and started"]
pub struct Ite<C, ST, SE> {
    cond: C,
    then_sender: ST,
    else_sender: SE,
}

impl<C, ST, SE> Sender for Ite<C, ST, SE>
where
    C: FnOnce() -> bool,
    ST: Sender,
    SE: Sender<Value = ST::Value>,
{
    type Value = ST::Value;
    type Operation<R: Receiver<Value = ST::Value>> = IteOperation<C, ST, SE, R>;

    fn connect<R: Receiver<Value = ST::Value>>(self, receiver: R) -> Self::Operation<R> {
        IteOperation {
            cond: Some(self.cond),
            then_sender: Some(self.then_sender),
            else_sender: Some(self.else_sender),
            receiver: Some(receiver),
            then_op: None,
            else_op: None,
            _pin: PhantomPinned,
        }
    }
}

/// Operation state of [`ite`].
pub struct IteOperation<C, ST, SE, R>
where
    ST: Sender,
    SE: Sender<Value = ST::Value>,
    R: Receiver<Value = ST::Value>,
{
    cond: Option<C>,
    then_sender: Option<ST>,
    else_sender: Option<SE>,
    receiver: Option<R>,
    then_op: Option<ST::Operation<R>>,
    else_op: Option<SE::Operation<R>>,
    _pin: PhantomPinned,
}

impl<C, ST, SE, R> Operation for IteOperation<C, ST, SE, R>
where
    C: FnOnce() -> bool,
    ST: Sender,
    SE: Sender<Value = ST::Value>,
    R: Receiver<Value = ST::Value>,
{
    fn start_inline(self: Pin<&mut Self>) -> bool {
        // SAFETY: nothing is moved out of the operation; children are
        // constructed in place and never moved once started.
        let this = unsafe { self.get_unchecked_mut() };
        let cond = this.cond.take().expect("operation started twice");
        let receiver = this.receiver.take().expect("operation started twice");

        if cond() {
            let sender = this.then_sender.take().expect("operation started twice");
            this.then_op = Some(connect(sender, receiver));
            // SAFETY: the child lives in this pinned operation.
            start_inline(unsafe { Pin::new_unchecked(this.then_op.as_mut().expect("just stored")) })
        } else {
            let sender = this.else_sender.take().expect("operation started twice");
            this.else_op = Some(connect(sender, receiver));
            // SAFETY: as above.
            start_inline(unsafe { Pin::new_unchecked(this.else_op.as_mut().expect("just stored")) })
        }
    }
}

// ############## repeat_while ##############

/// Repeatedly connects and starts a fresh operation of `factory()` while
/// `cond()` is true.
///
/// Inline child completions loop without stack growth; a noinline child
/// completion continues the loop from the completion callback, and the loop
/// then finishes with a noinline completion downstream.
#[must_use]
pub fn repeat_while<C, SF, S>(cond: C, factory: SF) -> RepeatWhile<C, SF, S>
where
    C: FnMut() -> bool,
    SF: FnMut() -> S,
    S: Sender<Value = ()>,
{
    RepeatWhile {
        cond,
        factory,
        _sender: PhantomData,
    }
}

/// Sender of [`repeat_while`].
#[must_use = "senders do nothing unless connected and started"]
pub struct RepeatWhile<C, SF, S> {
    cond: C,
    factory: SF,
    _sender: PhantomData<fn() -> S>,
}

impl<C, SF, S> Sender for RepeatWhile<C, SF, S>
where
    C: FnMut() -> bool,
    SF: FnMut() -> S,
    S: Sender<Value = ()>,
{
    type Value = ();
    type Operation<R: Receiver<Value = ()>> = RepeatWhileOperation<C, SF, S, R>;

    fn connect<R: Receiver<Value = ()>>(self, receiver: R) -> Self::Operation<R> {
        RepeatWhileOperation {
            cond: self.cond,
            factory: self.factory,
            receiver,
            child: None,
            _pin: PhantomPinned,
        }
    }
}

/// Operation state of [`repeat_while`].
pub struct RepeatWhileOperation<C, SF, S, R>
where
    C: FnMut() -> bool,
    SF: FnMut() -> S,
    S: Sender<Value = ()>,
    R: Receiver<Value = ()>,
{
    cond: C,
    factory: SF,
    receiver: R,
    child: Option<S::Operation<RepeatWhileReceiver<C, SF, S, R>>>,
    _pin: PhantomPinned,
}

impl<C, SF, S, R> RepeatWhileOperation<C, SF, S, R>
where
    C: FnMut() -> bool,
    SF: FnMut() -> S,
    S: Sender<Value = ()>,
    R: Receiver<Value = ()>,
{
    /// Runs iterations while children complete inline. Returns `true` when
    /// the loop finished, `false` when a child went asynchronous.
    ///
    /// # Safety
    ///
    /// `this` must point to the pinned, alive operation and the child slot
    /// must be empty.
    unsafe fn drive(this: *mut Self) -> bool {
        // SAFETY: per this function's contract; the raw pointer is used so
        // that the child's receiver may point back at the operation.
        unsafe {
            while ((*this).cond)() {
                let sender = ((*this).factory)();
                (*this).child = Some(connect(
                    sender,
                    RepeatWhileReceiver {
                        op: NonNull::new_unchecked(this),
                    },
                ));
                let child = Pin::new_unchecked((*this).child.as_mut().expect("just stored"));
                if !child.start_inline() {
                    return false;
                }
                (*this).child = None;
            }
            true
        }
    }
}

impl<C, SF, S, R> Operation for RepeatWhileOperation<C, SF, S, R>
where
    C: FnMut() -> bool,
    SF: FnMut() -> S,
    S: Sender<Value = ()>,
    R: Receiver<Value = ()>,
{
    fn start_inline(self: Pin<&mut Self>) -> bool {
        // SAFETY: the operation is pinned; nothing is moved out of it.
        let this: *mut Self = unsafe { self.get_unchecked_mut() };
        // SAFETY: the child slot starts empty.
        if unsafe { Self::drive(this) } {
            // SAFETY: the operation is alive until its completion returns.
            unsafe { (*this).receiver.set_value_inline(()) };
            true
        } else {
            false
        }
    }
}

/// Receiver installed on each iteration's child operation.
pub struct RepeatWhileReceiver<C, SF, S, R>
where
    C: FnMut() -> bool,
    SF: FnMut() -> S,
    S: Sender<Value = ()>,
    R: Receiver<Value = ()>,
{
    op: NonNull<RepeatWhileOperation<C, SF, S, R>>,
}

impl<C, SF, S, R> Receiver for RepeatWhileReceiver<C, SF, S, R>
where
    C: FnMut() -> bool,
    SF: FnMut() -> S,
    S: Sender<Value = ()>,
    R: Receiver<Value = ()>,
{
    type Value = ();

    fn set_value_inline(&mut self, (): ()) {
        // Nothing to do: execution continues in `drive`.
    }

    fn set_value_noinline(&mut self, (): ()) {
        let this = self.op.as_ptr();
        // SAFETY: the child has delivered its completion; dropping it is the
        // loop's responsibility and nothing touches it afterwards. The
        // parent operation stays alive until its own completion below.
        unsafe {
            (*this).child = None;
            if RepeatWhileOperation::drive(this) {
                (*this).receiver.set_value_noinline(());
            }
        }
    }
}

// ############## sequence ##############

/// Runs `first`, then `second`; the first sender's value must be `()` and
/// the sequence's value is the second's.
///
/// Longer chains fold with the [`sequence!`](crate::sequence!) macro.
#[must_use]
pub fn sequence<A, B>(first: A, second: B) -> Sequence<A, B>
where
    A: Sender<Value = ()>,
    B: Sender,
{
    Sequence { first, second }
}

/// Runs senders in order; all but the last must have value `()` and the
/// chain completes with the last sender's value.
///
/// The inline fast path is preserved: if every link completes inline, the
/// whole chain does.
///
/// # Example
///
/// ```rust
/// use tether::{invocable, run};
///
/// let value = run(tether::sequence!(
///     invocable(|| ()),
///     invocable(|| ()),
///     invocable(|| 3),
/// ));
/// assert_eq!(value, 3);
/// ```
#[macro_export]
macro_rules! sequence {
    ($last:expr $(,)?) => { $last };
    ($first:expr, $($rest:expr),+ $(,)?) => {
        $crate::sequence($first, $crate::sequence!($($rest),+))
    };
}

/// Sender of [`sequence`].
#[must_use = "senders do nothing unless connected and started"]
pub struct Sequence<A, B> {
    first: A,
    second: B,
}

impl<A, B> Sender for Sequence<A, B>
where
    A: Sender<Value = ()>,
    B: Sender,
{
    type Value = B::Value;
    type Operation<R: Receiver<Value = B::Value>> = SequenceOperation<A, B, R>;

    fn connect<R: Receiver<Value = B::Value>>(self, receiver: R) -> Self::Operation<R> {
        SequenceOperation {
            first: Some(self.first),
            second: Some(self.second),
            receiver: Some(receiver),
            first_op: None,
            second_op: None,
            _pin: PhantomPinned,
        }
    }
}

/// Operation state of [`sequence`].
pub struct SequenceOperation<A, B, R>
where
    A: Sender<Value = ()>,
    B: Sender,
    R: Receiver<Value = B::Value>,
{
    first: Option<A>,
    second: Option<B>,
    receiver: Option<R>,
    first_op: Option<A::Operation<SequenceFirstReceiver<A, B, R>>>,
    second_op: Option<B::Operation<SequenceTailReceiver<R>>>,
    _pin: PhantomPinned,
}

impl<A, B, R> SequenceOperation<A, B, R>
where
    A: Sender<Value = ()>,
    B: Sender,
    R: Receiver<Value = B::Value>,
{
    /// Connects and starts the second sender.
    ///
    /// `inline_path` records whether we are still inside the outer
    /// `start_inline`; off the inline path, an inline completion of the
    /// second child is demoted to a noinline completion downstream.
    ///
    /// # Safety
    ///
    /// `this` must point to the pinned, alive operation, after the first
    /// child has completed and been dropped.
    unsafe fn start_second(this: *mut Self, inline_path: bool) -> bool {
        // SAFETY: per this function's contract.
        unsafe {
            let second = (*this).second.take().expect("sequence tail started twice");
            let downstream = (*this).receiver.take().expect("sequence tail started twice");
            (*this).second_op = Some(connect(
                second,
                SequenceTailReceiver {
                    downstream,
                    inline_path,
                },
            ));
            let child = Pin::new_unchecked((*this).second_op.as_mut().expect("just stored"));
            child.start_inline()
        }
    }
}

impl<A, B, R> Operation for SequenceOperation<A, B, R>
where
    A: Sender<Value = ()>,
    B: Sender,
    R: Receiver<Value = B::Value>,
{
    fn start_inline(self: Pin<&mut Self>) -> bool {
        // SAFETY: the operation is pinned; nothing is moved out of it.
        let this: *mut Self = unsafe { self.get_unchecked_mut() };

        // SAFETY: children are constructed in place in the pinned operation.
        unsafe {
            let first = (*this).first.take().expect("operation started twice");
            (*this).first_op = Some(connect(
                first,
                SequenceFirstReceiver {
                    op: NonNull::new_unchecked(this),
                },
            ));
            let child = Pin::new_unchecked((*this).first_op.as_mut().expect("just stored"));
            if child.start_inline() {
                (*this).first_op = None;
                Self::start_second(this, true)
            } else {
                false
            }
        }
    }
}

/// Receiver installed on the first child of a [`Sequence`].
pub struct SequenceFirstReceiver<A, B, R>
where
    A: Sender<Value = ()>,
    B: Sender,
    R: Receiver<Value = B::Value>,
{
    op: NonNull<SequenceOperation<A, B, R>>,
}

impl<A, B, R> Receiver for SequenceFirstReceiver<A, B, R>
where
    A: Sender<Value = ()>,
    B: Sender,
    R: Receiver<Value = B::Value>,
{
    type Value = ();

    fn set_value_inline(&mut self, (): ()) {
        // Nothing to do: execution continues in `start_inline`.
    }

    fn set_value_noinline(&mut self, (): ()) {
        let this = self.op.as_ptr();
        // SAFETY: the first child has delivered its completion; it is
        // dropped here and never touched again. We have left the inline
        // path, so the tail runs with `inline_path = false`.
        unsafe {
            (*this).first_op = None;
            let _ = SequenceOperation::start_second(this, false);
        }
    }
}

/// Receiver installed on the last child of a [`Sequence`], carrying the
/// inline/noinline path flag.
pub struct SequenceTailReceiver<R> {
    downstream: R,
    inline_path: bool,
}

impl<R: Receiver> Receiver for SequenceTailReceiver<R> {
    type Value = R::Value;

    fn set_value_inline(&mut self, value: R::Value) {
        if self.inline_path {
            self.downstream.set_value_inline(value);
        } else {
            self.downstream.set_value_noinline(value);
        }
    }

    fn set_value_noinline(&mut self, value: R::Value) {
        self.downstream.set_value_noinline(value);
    }
}

// ############## when_all ##############

/// State shared between a `when_all` operation and its children's
/// receivers.
struct JoinShared {
    pending: AtomicUsize,
    /// Target operation and completion trampoline; written before any child
    /// is started.
    complete: Cell<Option<(NonNull<()>, unsafe fn(NonNull<()>))>>,
}

// SAFETY: `pending` is atomic and `complete` is written once, before any
// child is started, and read only by the final completer, which is ordered
// after that write by the countdown's acquire-release chain.
unsafe impl Send for JoinShared {}
// SAFETY: as above.
unsafe impl Sync for JoinShared {}

impl JoinShared {
    fn new() -> Self {
        Self {
            pending: AtomicUsize::new(0),
            complete: Cell::new(None),
        }
    }

    /// Records `n` completions; delivers the downstream completion if that
    /// was the last one. Returns `true` iff this call was the last.
    ///
    /// # Safety
    ///
    /// The shared state must have been initialized by the owning operation's
    /// start and the operation must be alive.
    unsafe fn complete_many(&self, n: usize) -> bool {
        let previous = self.pending.fetch_sub(n, Ordering::AcqRel);
        debug_assert!(previous >= n);
        if previous == n {
            let (target, complete) = self
                .complete
                .get()
                .expect("join completed before initialization");
            // SAFETY: the final completion is the last access to the
            // operation.
            unsafe { complete(target) };
            true
        } else {
            false
        }
    }
}

/// Receiver installed on every child of a `when_all` operation.
pub struct JoinReceiver {
    shared: NonNull<JoinShared>,
}

// SAFETY: the receiver is an opaque pointer into the pinned parent
// operation; all shared access is through `JoinShared`.
unsafe impl Send for JoinReceiver {}

impl Receiver for JoinReceiver {
    type Value = ();

    fn set_value_inline(&mut self, (): ()) {
        // Nothing to do: inline completions are counted by the parent's
        // start.
    }

    fn set_value_noinline(&mut self, (): ()) {
        // SAFETY: the shared state lives in the parent operation, which is
        // alive until its downstream completion has been delivered.
        unsafe {
            let _ = self.shared.as_ref().complete_many(1);
        }
    }
}

macro_rules! define_when_all {
    ($(#[$doc:meta])* $name:ident, $opname:ident, $count:literal, $(($S:ident, $sender:ident, $op:ident)),+) => {
        $(#[$doc])*
        #[must_use = "senders do nothing unless connected and started"]
        pub struct $name<$($S),+>
        where
            $($S: Sender<Value = ()>),+
        {
            $($sender: $S),+
        }

        impl<$($S),+> $name<$($S),+>
        where
            $($S: Sender<Value = ()>),+
        {
            /// Creates the joined sender; prefer the
            /// [`when_all!`](crate::when_all!) macro.
            pub fn new($($sender: $S),+) -> Self {
                Self { $($sender),+ }
            }
        }

        impl<$($S),+> Sender for $name<$($S),+>
        where
            $($S: Sender<Value = ()>),+
        {
            type Value = ();
            type Operation<R: Receiver<Value = ()>> = $opname<$($S,)+ R>;

            fn connect<R: Receiver<Value = ()>>(self, receiver: R) -> Self::Operation<R> {
                $opname {
                    shared: JoinShared::new(),
                    receiver: Some(receiver),
                    $($sender: Some(self.$sender),)+
                    $($op: None,)+
                    _pin: PhantomPinned,
                }
            }
        }

        /// Operation state of the matching `when_all` sender.
        pub struct $opname<$($S,)+ R>
        where
            $($S: Sender<Value = ()>,)+
            R: Receiver<Value = ()>,
        {
            shared: JoinShared,
            receiver: Option<R>,
            $($sender: Option<$S>,)+
            $($op: Option<$S::Operation<JoinReceiver>>,)+
            _pin: PhantomPinned,
        }

        impl<$($S,)+ R> $opname<$($S,)+ R>
        where
            $($S: Sender<Value = ()>,)+
            R: Receiver<Value = ()>,
        {
            unsafe fn complete_downstream(target: NonNull<()>) {
                let this = target.cast::<Self>().as_ptr();
                // SAFETY: the operation is alive until this completion
                // returns; the receiver is taken exactly once.
                unsafe {
                    let mut receiver = (*this)
                        .receiver
                        .take()
                        .expect("join completed twice");
                    receiver.set_value_noinline(());
                }
            }
        }

        impl<$($S,)+ R> Operation for $opname<$($S,)+ R>
        where
            $($S: Sender<Value = ()>,)+
            R: Receiver<Value = ()>,
        {
            fn start_inline(self: Pin<&mut Self>) -> bool {
                // SAFETY: the operation is pinned; children are constructed
                // in place and never moved after starting.
                let this: *mut Self = unsafe { self.get_unchecked_mut() };

                // SAFETY: initialization happens before any child starts.
                unsafe {
                    (*this).shared.pending.store($count, Ordering::Relaxed);
                    (*this).shared.complete.set(Some((
                        NonNull::new_unchecked(this).cast(),
                        Self::complete_downstream,
                    )));
                }

                let mut inline_completions = 0;
                $(
                    // SAFETY: children live in the pinned operation.
                    unsafe {
                        let sender = (*this).$sender.take().expect("operation started twice");
                        (*this).$op = Some(connect(
                            sender,
                            JoinReceiver {
                                shared: NonNull::from(&(*this).shared),
                            },
                        ));
                        let child =
                            Pin::new_unchecked((*this).$op.as_mut().expect("just stored"));
                        if child.start_inline() {
                            inline_completions += 1;
                        }
                    }
                )+

                if inline_completions > 0 {
                    let previous = unsafe { &(*this).shared }
                        .pending
                        .fetch_sub(inline_completions, Ordering::AcqRel);
                    debug_assert!(previous >= inline_completions);
                    if previous == inline_completions {
                        // Every child completed inside this start.
                        //
                        // SAFETY: the operation is alive; the receiver is
                        // taken exactly once.
                        unsafe {
                            let mut receiver = (*this)
                                .receiver
                                .take()
                                .expect("join completed twice");
                            receiver.set_value_inline(());
                        }
                        return true;
                    }
                }
                false
            }
        }
    };
}

define_when_all!(
    /// Joins two senders; completes when both have completed.
    WhenAll2, WhenAll2Operation, 2, (S1, s1, op1), (S2, s2, op2)
);
define_when_all!(
    /// Joins three senders; completes when all have completed.
    WhenAll3, WhenAll3Operation, 3, (S1, s1, op1), (S2, s2, op2), (S3, s3, op3)
);
define_when_all!(
    /// Joins four senders; completes when all have completed.
    WhenAll4, WhenAll4Operation, 4, (S1, s1, op1), (S2, s2, op2), (S3, s3, op3), (S4, s4, op4)
);
define_when_all!(
    /// Joins five senders; completes when all have completed.
    WhenAll5, WhenAll5Operation, 5,
    (S1, s1, op1), (S2, s2, op2), (S3, s3, op3), (S4, s4, op4), (S5, s5, op5)
);

/// Starts all child senders and completes when every one of them has
/// completed. Children must have value `()`.
///
/// # Example
///
/// ```rust
/// use std::sync::atomic::{AtomicU32, Ordering};
///
/// use tether::{invocable, run};
///
/// let hits = AtomicU32::new(0);
/// run(tether::when_all!(
///     invocable(|| { hits.fetch_add(1, Ordering::SeqCst); }),
///     invocable(|| { hits.fetch_add(1, Ordering::SeqCst); }),
/// ));
/// assert_eq!(hits.load(Ordering::SeqCst), 2);
/// ```
#[macro_export]
macro_rules! when_all {
    ($s1:expr, $s2:expr $(,)?) => { $crate::WhenAll2::new($s1, $s2) };
    ($s1:expr, $s2:expr, $s3:expr $(,)?) => { $crate::WhenAll3::new($s1, $s2, $s3) };
    ($s1:expr, $s2:expr, $s3:expr, $s4:expr $(,)?) => { $crate::WhenAll4::new($s1, $s2, $s3, $s4) };
    ($s1:expr, $s2:expr, $s3:expr, $s4:expr, $s5:expr $(,)?) => {
        $crate::WhenAll5::new($s1, $s2, $s3, $s4, $s5)
    };
}

// ############## race_and_cancel ##############

/// State shared between a race operation and its children's receivers.
struct RaceShared<const N: usize> {
    completed: AtomicUsize,
    /// Base of the per-child cancellation event array; written before any
    /// child is started.
    events: Cell<Option<NonNull<[CancellationEvent; N]>>>,
    complete: Cell<Option<(NonNull<()>, unsafe fn(NonNull<()>))>>,
}

// SAFETY: the cells are written once, before any child is started; all
// later reads are ordered after that write by the completion counter's
// acquire-release chain.
unsafe impl<const N: usize> Send for RaceShared<N> {}
// SAFETY: as above.
unsafe impl<const N: usize> Sync for RaceShared<N> {}

impl<const N: usize> RaceShared<N> {
    fn new() -> Self {
        Self {
            completed: AtomicUsize::new(0),
            events: Cell::new(None),
            complete: Cell::new(None),
        }
    }

    /// Records `n` child completions: the first completion anywhere issues
    /// the cancel storm, and the last delivers the downstream completion.
    /// Returns `true` iff this call was the last.
    ///
    /// `winner` suppresses cancelling the completing child's own event on
    /// the noinline path; the start path cancels every event, matching the
    /// race semantics (a cancel signal to an already-complete child is
    /// idle).
    ///
    /// # Safety
    ///
    /// The shared state must be initialized and the owning operation alive.
    unsafe fn complete_many(&self, n: usize, winner: Option<usize>) -> bool {
        let previous = self.completed.fetch_add(n, Ordering::AcqRel);
        if previous == 0 {
            let events = self
                .events
                .get()
                .expect("race completed before initialization");
            // SAFETY: the event array lives in the alive operation.
            for (index, event) in unsafe { events.as_ref() }.iter().enumerate() {
                if Some(index) != winner {
                    event.cancel();
                }
            }
        }
        if previous + n == N {
            let (target, complete) = self
                .complete
                .get()
                .expect("race completed before initialization");
            // SAFETY: the final completion is the last access.
            unsafe { complete(target) };
            true
        } else {
            false
        }
    }
}

/// Receiver installed on every child of a race operation.
pub struct RaceReceiver<const N: usize> {
    shared: NonNull<RaceShared<N>>,
    index: usize,
}

// SAFETY: opaque pointer into the pinned parent operation; shared access is
// through `RaceShared`.
unsafe impl<const N: usize> Send for RaceReceiver<N> {}

impl<const N: usize> Receiver for RaceReceiver<N> {
    type Value = ();

    fn set_value_inline(&mut self, (): ()) {
        // Nothing to do: inline completions are counted by the parent's
        // start.
    }

    fn set_value_noinline(&mut self, (): ()) {
        // SAFETY: the shared state lives in the parent operation, which is
        // alive until its downstream completion has been delivered.
        unsafe {
            let _ = self.shared.as_ref().complete_many(1, Some(self.index));
        }
    }
}

macro_rules! define_race_and_cancel {
    ($(#[$doc:meta])* $name:ident, $opname:ident, $count:literal,
     $(($F:ident, $S:ident, $f:ident, $op:ident, $index:literal)),+) => {
        $(#[$doc])*
        #[must_use = "senders do nothing unless connected and started"]
        pub struct $name<$($F, $S),+>
        where
            $($F: FnOnce(CancellationToken) -> $S, $S: Sender<Value = ()>),+
        {
            $($f: $F,)+
            _senders: PhantomData<($(fn() -> $S),+)>,
        }

        impl<$($F, $S),+> $name<$($F, $S),+>
        where
            $($F: FnOnce(CancellationToken) -> $S, $S: Sender<Value = ()>),+
        {
            /// Creates the racing sender; prefer the
            /// [`race_and_cancel!`](crate::race_and_cancel!) macro.
            pub fn new($($f: $F),+) -> Self {
                Self {
                    $($f,)+
                    _senders: PhantomData,
                }
            }
        }

        impl<$($F, $S),+> Sender for $name<$($F, $S),+>
        where
            $($F: FnOnce(CancellationToken) -> $S, $S: Sender<Value = ()>),+
        {
            type Value = ();
            type Operation<R: Receiver<Value = ()>> = $opname<$($F, $S,)+ R>;

            fn connect<R: Receiver<Value = ()>>(self, receiver: R) -> Self::Operation<R> {
                $opname {
                    shared: RaceShared::new(),
                    events: [$({
                        // One cancellation event per child.
                        let _ = stringify!($F);
                        CancellationEvent::new()
                    }),+],
                    receiver: Some(receiver),
                    $($f: Some(self.$f),)+
                    $($op: None,)+
                    _pin: PhantomPinned,
                }
            }
        }

        /// Operation state of the matching race sender.
        pub struct $opname<$($F, $S,)+ R>
        where
            $($F: FnOnce(CancellationToken) -> $S, $S: Sender<Value = ()>,)+
            R: Receiver<Value = ()>,
        {
            shared: RaceShared<$count>,
            events: [CancellationEvent; $count],
            receiver: Option<R>,
            $($f: Option<$F>,)+
            $($op: Option<$S::Operation<RaceReceiver<$count>>>,)+
            _pin: PhantomPinned,
        }

        impl<$($F, $S,)+ R> $opname<$($F, $S,)+ R>
        where
            $($F: FnOnce(CancellationToken) -> $S, $S: Sender<Value = ()>,)+
            R: Receiver<Value = ()>,
        {
            unsafe fn complete_downstream(target: NonNull<()>) {
                let this = target.cast::<Self>().as_ptr();
                // SAFETY: the operation is alive until this completion
                // returns; the receiver is taken exactly once.
                unsafe {
                    let mut receiver = (*this)
                        .receiver
                        .take()
                        .expect("race completed twice");
                    receiver.set_value_noinline(());
                }
            }
        }

        impl<$($F, $S,)+ R> Operation for $opname<$($F, $S,)+ R>
        where
            $($F: FnOnce(CancellationToken) -> $S, $S: Sender<Value = ()>,)+
            R: Receiver<Value = ()>,
        {
            fn start_inline(self: Pin<&mut Self>) -> bool {
                // SAFETY: the operation is pinned; children are constructed
                // in place and never moved after starting.
                let this: *mut Self = unsafe { self.get_unchecked_mut() };

                // SAFETY: initialization happens before any child starts.
                unsafe {
                    (*this).shared.events.set(Some(NonNull::from(&(*this).events)));
                    (*this).shared.complete.set(Some((
                        NonNull::new_unchecked(this).cast(),
                        Self::complete_downstream,
                    )));
                }

                let mut inline_completions = 0;
                $(
                    // SAFETY: children live in the pinned operation; each
                    // child gets a token of its own cancellation event.
                    unsafe {
                        let token = (*this).events[$index].token();
                        let f = (*this).$f.take().expect("operation started twice");
                        (*this).$op = Some(connect(
                            f(token),
                            RaceReceiver {
                                shared: NonNull::from(&(*this).shared),
                                index: $index,
                            },
                        ));
                        let child =
                            Pin::new_unchecked((*this).$op.as_mut().expect("just stored"));
                        if child.start_inline() {
                            inline_completions += 1;
                        }
                    }
                )+

                if inline_completions > 0 {
                    // SAFETY: the shared state was initialized above and the
                    // operation is alive.
                    unsafe {
                        if (*this).shared.complete_many(inline_completions, None) {
                            return true;
                        }
                    }
                }
                false
            }
        }
    };
}

define_race_and_cancel!(
    /// Races one cancellable sender (degenerate but well-formed).
    RaceAndCancel1, RaceAndCancel1Operation, 1, (F1, S1, f1, op1, 0)
);
define_race_and_cancel!(
    /// Races two cancellable senders.
    RaceAndCancel2, RaceAndCancel2Operation, 2, (F1, S1, f1, op1, 0), (F2, S2, f2, op2, 1)
);
define_race_and_cancel!(
    /// Races three cancellable senders.
    RaceAndCancel3, RaceAndCancel3Operation, 3,
    (F1, S1, f1, op1, 0), (F2, S2, f2, op2, 1), (F3, S3, f3, op3, 2)
);
define_race_and_cancel!(
    /// Races four cancellable senders.
    RaceAndCancel4, RaceAndCancel4Operation, 4,
    (F1, S1, f1, op1, 0), (F2, S2, f2, op2, 1), (F3, S3, f3, op3, 2), (F4, S4, f4, op4, 3)
);

/// Races child senders with independent cancellation.
///
/// Each argument is a function from a [`CancellationToken`] to a sender.
/// When the first child completes, every other child's token is cancelled;
/// the race completes once all children have completed (possibly via
/// cancellation).
///
/// # Example
///
/// ```rust
/// use tether::{Queue, SenderExt, from_future, run};
///
/// let filled = Queue::new();
/// let empty = Queue::<u32>::new();
/// filled.put(42);
///
/// run(tether::race_and_cancel!(
///     |token| from_future(async { filled.async_get(token).into_future().await; }),
///     |token| from_future(async { empty.async_get(token).into_future().await; }),
/// ));
/// ```
#[macro_export]
macro_rules! race_and_cancel {
    ($f1:expr $(,)?) => { $crate::RaceAndCancel1::new($f1) };
    ($f1:expr, $f2:expr $(,)?) => { $crate::RaceAndCancel2::new($f1, $f2) };
    ($f1:expr, $f2:expr, $f3:expr $(,)?) => { $crate::RaceAndCancel3::new($f1, $f2, $f3) };
    ($f1:expr, $f2:expr, $f3:expr, $f4:expr $(,)?) => {
        $crate::RaceAndCancel4::new($f1, $f2, $f3, $f4)
    };
}

// ############## let_value ##############

/// Runs `producer` to obtain an owned value, then runs the sender of
/// `body(value)`; the value lives inside the operation (inside the body's
/// future) for the whole duration of the body.
///
/// # Example
///
/// ```rust
/// use tether::{let_value, run};
///
/// let value = run(let_value(|| 21, |v| async move { v * 2 }));
/// assert_eq!(value, 42);
/// ```
#[must_use]
pub fn let_value<P, V, B, F>(producer: P, body: B) -> LetValue<P, B, V, F>
where
    P: FnOnce() -> V,
    B: FnOnce(V) -> F,
    F: Future,
{
    LetValue {
        producer,
        body,
        _value: PhantomData,
    }
}

/// Sender of [`let_value`].
#[must_use = "senders do nothing unless connected and started"]
pub struct LetValue<P, B, V, F> {
    producer: P,
    body: B,
    _value: PhantomData<fn(V) -> F>,
}

impl<P, V, B, F> Sender for LetValue<P, B, V, F>
where
    P: FnOnce() -> V,
    B: FnOnce(V) -> F,
    F: Future,
{
    type Value = F::Output;
    type Operation<R: Receiver<Value = F::Output>> = LetValueOperation<P, B, V, F, R>;

    fn connect<R: Receiver<Value = F::Output>>(self, receiver: R) -> Self::Operation<R> {
        LetValueOperation {
            producer: Some(self.producer),
            body: Some(self.body),
            receiver: Some(receiver),
            inner: None,
            _value: PhantomData,
            _pin: PhantomPinned,
        }
    }
}

/// Operation state of [`let_value`].
pub struct LetValueOperation<P, B, V, F, R>
where
    F: Future,
    R: Receiver<Value = F::Output>,
{
    producer: Option<P>,
    body: Option<B>,
    receiver: Option<R>,
    inner: Option<FutureOperation<F, R>>,
    _value: PhantomData<fn(V)>,
    _pin: PhantomPinned,
}

impl<P, V, B, F, R> Operation for LetValueOperation<P, B, V, F, R>
where
    P: FnOnce() -> V,
    B: FnOnce(V) -> F,
    F: Future,
    R: Receiver<Value = F::Output>,
{
    fn start_inline(self: Pin<&mut Self>) -> bool {
        // SAFETY: the child operation is constructed in place in the pinned
        // operation and never moved after being started.
        let this = unsafe { self.get_unchecked_mut() };
        let producer = this.producer.take().expect("operation started twice");
        let body = this.body.take().expect("operation started twice");
        let receiver = this.receiver.take().expect("operation started twice");

        let future = body(producer());
        this.inner = Some(connect(from_future(future), receiver));
        // SAFETY: as above.
        start_inline(unsafe { Pin::new_unchecked(this.inner.as_mut().expect("just stored")) })
    }
}

// ############## lambda ##############

/// Makes a sender from a callable that returns a sender.
///
/// The callable runs at start time; arguments are captured by value when the
/// closure is created, which keeps them alive inside the operation.
#[must_use]
pub fn lambda<F, S>(f: F) -> Lambda<F, S>
where
    F: FnOnce() -> S,
    S: Sender,
{
    Lambda {
        f,
        _sender: PhantomData,
    }
}

/// Sender of [`lambda`].
#[must_use = "senders do nothing unless connected and started"]
pub struct Lambda<F, S> {
    f: F,
    _sender: PhantomData<fn() -> S>,
}

impl<F, S> Sender for Lambda<F, S>
where
    F: FnOnce() -> S,
    S: Sender,
{
    type Value = S::Value;
    type Operation<R: Receiver<Value = S::Value>> = LambdaOperation<F, S, R>;

    fn connect<R: Receiver<Value = S::Value>>(self, receiver: R) -> Self::Operation<R> {
        LambdaOperation {
            f: Some(self.f),
            receiver: Some(receiver),
            inner: None,
            _pin: PhantomPinned,
        }
    }
}

/// Operation state of [`lambda`].
pub struct LambdaOperation<F, S, R>
where
    S: Sender,
    R: Receiver<Value = S::Value>,
{
    f: Option<F>,
    receiver: Option<R>,
    inner: Option<S::Operation<R>>,
    _pin: PhantomPinned,
}

impl<F, S, R> Operation for LambdaOperation<F, S, R>
where
    F: FnOnce() -> S,
    S: Sender,
    R: Receiver<Value = S::Value>,
{
    fn start_inline(self: Pin<&mut Self>) -> bool {
        // SAFETY: the child operation is constructed in place in the pinned
        // operation and never moved after being started.
        let this = unsafe { self.get_unchecked_mut() };
        let f = this.f.take().expect("operation started twice");
        let receiver = this.receiver.take().expect("operation started twice");

        this.inner = Some(connect(f(), receiver));
        // SAFETY: as above.
        start_inline(unsafe { Pin::new_unchecked(this.inner.as_mut().expect("just stored")) })
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::sync::atomic::AtomicU32;

    use super::*;
    use crate::execution::run;

    #[test]
    fn invocable_completes_inline() {
        assert_eq!(run(invocable(|| 5)), 5);
    }

    #[test]
    fn transform_maps_the_value() {
        assert_eq!(run(transform(invocable(|| 6), |x| x * 7)), 42);
    }

    #[test]
    fn transform_of_unit_sender() {
        assert_eq!(run(transform(invocable(|| ()), |()| "done")), "done");
    }

    #[test]
    fn ite_picks_the_then_branch() {
        let value = run(ite(|| true, invocable(|| 1), invocable(|| 2)));
        assert_eq!(value, 1);
    }

    #[test]
    fn ite_picks_the_else_branch() {
        let value = run(ite(|| false, invocable(|| 1), invocable(|| 2)));
        assert_eq!(value, 2);
    }

    #[test]
    fn repeat_while_counts_down() {
        let mut remaining = 5;
        let hits = AtomicU32::new(0);
        run(repeat_while(
            move || {
                let keep_going = remaining > 0;
                remaining -= 1;
                keep_going
            },
            || {
                invocable(|| {
                    hits.fetch_add(1, Ordering::SeqCst);
                })
            },
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn sequence_runs_in_order_and_yields_last_value() {
        let order = Cell::new(0);
        let steps = [Cell::new(0), Cell::new(0), Cell::new(0), Cell::new(0)];

        let step = |i: usize| {
            let steps = &steps;
            let order = &order;
            invocable(move || {
                steps[i].set(order.get());
                order.set(order.get() + 1);
            })
        };

        let value = run(sequence!(step(0), step(1), step(2), invocable(|| {
            steps[3].set(order.get());
            order.set(order.get() + 1);
            order.get()
        })));

        assert_eq!(value, 4);
        for (i, step) in steps.iter().enumerate() {
            assert_eq!(step.get(), i as i32);
        }
    }

    #[test]
    fn when_all_completes_after_every_child() {
        let hits = AtomicU32::new(0);
        run(when_all!(
            invocable(|| {
                hits.fetch_add(1, Ordering::SeqCst);
            }),
            invocable(|| {
                hits.fetch_add(1, Ordering::SeqCst);
            }),
            invocable(|| {
                hits.fetch_add(1, Ordering::SeqCst);
            }),
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn race_and_cancel_cancels_the_loser() {
        use crate::bridge::SenderExt;
        use crate::queue::Queue;

        let filled = Queue::new();
        let empty = Queue::<u32>::new();
        filled.put(42);

        run(race_and_cancel!(
            |token| from_future(async {
                let value = filled.async_get(token).into_future().await;
                assert_eq!(value, Some(42));
            }),
            |token| from_future(async {
                // Loses the race; completes through cancellation.
                let value = empty.async_get(token).into_future().await;
                assert_eq!(value, None);
            }),
        ));
    }

    #[test]
    fn race_and_cancel_of_inline_children() {
        let hits = AtomicU32::new(0);
        run(race_and_cancel!(
            |_token| invocable(|| {
                hits.fetch_add(1, Ordering::SeqCst);
            }),
            |_token| invocable(|| {
                hits.fetch_add(1, Ordering::SeqCst);
            }),
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn let_value_keeps_the_value_for_the_body() {
        let value = run(let_value(|| 21, |v| async move { v * 2 }));
        assert_eq!(value, 42);
    }

    #[test]
    fn lambda_defers_sender_creation() {
        let created = Cell::new(false);
        let sender = lambda(|| {
            created.set(true);
            invocable(|| 9)
        });
        assert!(!created.get());
        assert_eq!(run(sender), 9);
        assert!(created.get());
    }
}
