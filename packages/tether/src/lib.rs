//! Structured sender/receiver concurrency primitives with race-free
//! cancellation.
//!
//! This crate implements a small, allocation-averse execution model aimed at
//! freestanding environments: asynchronous work is described by
//! [`Sender`]s, which are connected to [`Receiver`]s to produce pinned,
//! non-movable [`Operation`] state machines. Starting an operation either
//! completes it synchronously — the *inline* path, signalled by
//! [`Operation::start_inline`] returning `true` — or arms it to complete
//! exactly once later, possibly from another thread.
//!
//! On top of that protocol the crate provides:
//!
//! * **Composition** — [`invocable`], [`transform`], [`ite`],
//!   [`repeat_while`], [`sequence`], [`when_all!`], [`race_and_cancel!`],
//!   [`let_value`], [`lambda`].
//! * **A cancellation substrate** — [`CancellationEvent`],
//!   [`CancellationToken`], [`CancellationCallback`],
//!   [`CancellationObserver`], [`suspend_indefinitely`], [`with_cancel_cb`].
//!   Cancellation is cooperative and observed as distinguished values
//!   (`None`, `false`, [`WaitOutcome::Cancelled`]), never as an error
//!   channel.
//! * **Primitives** — [`Mutex`], [`SharedMutex`], [`OneshotPrimitive`],
//!   [`OneshotEvent`], [`RecurringEvent`], [`SequencedEvent`],
//!   [`WaitGroup`], [`Barrier`], [`Queue`], [`Promise`]/[`Future`], and the
//!   post-ack broadcast ([`PostAckMechanism`], [`PostAckAgent`],
//!   [`PostAckHandle`]).
//! * **Bridging to `async`** — any sender can be awaited through
//!   [`SenderExt::into_future`], and any Rust future becomes a sender
//!   through [`from_future`].
//! * **Entry points** — [`run`], [`run_with`], [`run_on`], [`detach`],
//!   [`detach_and_then`], [`spawn_detached`], plus an optional cooperative
//!   [`RunQueue`].
//!
//! Waiter bookkeeping is intrusive: each waiting operation embeds its own
//! queue node, so the primitives themselves never allocate. The only
//! heap users are the cancellation event's shared core, the
//! promise/future slot, and detached operations.
//!
//! # Example
//!
//! ```rust
//! use tether::{Queue, SenderExt, from_future, run};
//!
//! let queue = Queue::new();
//!
//! queue.put(40);
//! let value = run(from_future(async {
//!     let first = queue.async_get(Default::default()).into_future().await;
//!     first.expect("queue get was not cancelled") + 2
//! }));
//! assert_eq!(value, 42);
//! ```
//!
//! # Contract violations
//!
//! Misuse the library cannot recover from — raising a one-shot event twice,
//! unlocking a mutex that is not held, dropping an unacked post handle,
//! dropping a primitive with outstanding waiters, dropping an armed
//! operation — panics. Cancellation is the only soft-failure mode.

pub mod algorithm;
pub mod barrier;
pub mod bridge;
pub mod cancellation;
pub mod execution;
mod list;
pub mod mutex;
pub mod oneshot;
pub mod post_ack;
pub mod promise;
pub mod queue;
pub mod recurring_event;
pub mod run_queue;
pub mod sequenced_event;
pub mod shared_mutex;
mod test_utils;
pub mod wait_group;

pub use algorithm::{
    Invocable, Ite, Lambda, LetValue, RaceAndCancel1, RaceAndCancel2, RaceAndCancel3,
    RaceAndCancel4, RepeatWhile, Sequence, Transform, WhenAll2, WhenAll3, WhenAll4, WhenAll5,
    invocable, ite, lambda, let_value, repeat_while, sequence, transform,
};
pub use barrier::{ArrivalToken, Barrier};
pub use bridge::{FutureSender, SenderExt, SenderFuture, from_future};
pub use cancellation::{
    CancellationCallback, CancellationEvent, CancellationObserver, CancellationToken,
    SuspendIndefinitely, WithCancelCb, suspend_indefinitely, with_cancel_cb,
};
pub use execution::{
    AnyReceiver, Operation, Receiver, Sender, connect, detach, detach_and_then, run, run_with,
    spawn_detached, start_inline,
};
pub use mutex::Mutex;
pub use oneshot::{OneshotEvent, OneshotPrimitive};
pub use post_ack::{PostAckAgent, PostAckHandle, PostAckMechanism};
pub use promise::{Future, Promise, SharedValue};
pub use queue::Queue;
pub use recurring_event::{RecurringEvent, WaitOutcome};
pub use run_queue::{RunQueue, RunQueueItem, run_on, yield_now};
pub use sequenced_event::SequencedEvent;
pub use shared_mutex::SharedMutex;
pub use wait_group::{WaitGroup, WorkGuard, wait_in_group};
