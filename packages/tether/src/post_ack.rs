//! Broadcast with acknowledgement.
//!
//! A [`PostAckMechanism`] broadcasts each posted value to every attached
//! [`PostAckAgent`]; the post's operation completes only once every agent
//! has acknowledged it through its [`PostAckHandle`] (or detached). Agents
//! observe posts strictly in emission order, starting from their moment of
//! attachment.
//!
//! Posts are keyed by a per-mechanism sequence; each agent keeps a polling
//! cursor aligned to it. Detaching retires the agent's outstanding
//! acknowledgements, which keeps pending posts from waiting forever.

use std::cell::{Cell, UnsafeCell};
use std::marker::PhantomPinned;
use std::mem;
use std::ops::Deref;
use std::pin::Pin;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::cancellation::{CancellationObserver, CancellationToken};
use crate::execution::{Operation, Receiver, Sender};
use crate::list::{Linked, Links, List};

/// A pending post, embedded in its post operation.
#[derive(Debug)]
struct PostNode<T> {
    links: Links<PostNode<T>>,
    /// Assigned under the mechanism lock when the post starts.
    seq: Cell<u64>,
    acks_left: AtomicU32,
    value: UnsafeCell<Option<T>>,
    complete: Cell<Option<unsafe fn(NonNull<PostNode<T>>)>>,
}

// SAFETY: list and cell access is serialized by the mechanism lock; the
// value is written before the node is published and only read (shared)
// afterwards; the countdown is atomic.
unsafe impl<T: Send> Send for PostNode<T> {}
// SAFETY: as above.
unsafe impl<T: Send + Sync> Sync for PostNode<T> {}

// SAFETY: `links` returns the embedded field of the same node.
unsafe impl<T> Linked for PostNode<T> {
    fn links(&self) -> &Links<Self> {
        &self.links
    }
}

/// A waiting poll, embedded in its poll operation.
#[derive(Debug)]
struct PollNode<T> {
    links: Links<PollNode<T>>,
    complete: Cell<Option<unsafe fn(NonNull<PollNode<T>>, NonNull<PostNode<T>>)>>,
}

// SAFETY: as for `PostNode`.
unsafe impl<T: Send> Send for PollNode<T> {}
// SAFETY: as above.
unsafe impl<T: Send> Sync for PollNode<T> {}

// SAFETY: `links` returns the embedded field of the same node.
unsafe impl<T> Linked for PollNode<T> {
    fn links(&self) -> &Links<Self> {
        &self.links
    }
}

#[derive(Debug)]
struct MechanismInner<T> {
    post_seq: u64,
    active_agents: u32,
    posts: List<PostNode<T>>,
    poll_waiters: List<PollNode<T>>,
}

/// Broadcast-with-acknowledgement to every attached agent.
#[derive(Debug)]
pub struct PostAckMechanism<T> {
    inner: Mutex<MechanismInner<T>>,
}

// SAFETY: the inner state is only touched under the mutex; nodes are kept
// alive by the armed operations that own them.
unsafe impl<T: Send> Send for PostAckMechanism<T> {}
// SAFETY: as above; values are read shared through handles.
unsafe impl<T: Send + Sync> Sync for PostAckMechanism<T> {}

impl<T> PostAckMechanism<T> {
    /// Creates a mechanism with no agents.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MechanismInner {
                post_seq: 0,
                active_agents: 0,
                posts: List::new(),
                poll_waiters: List::new(),
            }),
        }
    }

    /// Returns a sender that broadcasts `value` and completes once every
    /// currently attached agent has acknowledged it.
    ///
    /// With no agents attached the post completes inline.
    pub fn post(&self, value: T) -> PostSender<'_, T> {
        PostSender { mech: self, value }
    }
}

impl<T> Default for PostAckMechanism<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for PostAckMechanism<T> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        assert!(
            inner.posts.is_empty() && inner.poll_waiters.is_empty(),
            "post-ack mechanism dropped with outstanding posts or polls"
        );
    }
}

/// Sender of [`PostAckMechanism::post`].
#[must_use = "senders do nothing unless connected and started"]
pub struct PostSender<'m, T> {
    mech: &'m PostAckMechanism<T>,
    value: T,
}

impl<'m, T> Sender for PostSender<'m, T> {
    type Value = ();
    type Operation<R: Receiver<Value = ()>> = PostOperation<'m, T, R>;

    fn connect<R: Receiver<Value = ()>>(self, receiver: R) -> Self::Operation<R> {
        PostOperation {
            mech: self.mech,
            node: PostNode {
                links: Links::new(),
                seq: Cell::new(0),
                acks_left: AtomicU32::new(0),
                value: UnsafeCell::new(Some(self.value)),
                complete: Cell::new(None),
            },
            receiver,
            _pin: PhantomPinned,
        }
    }
}

/// Operation state of [`PostAckMechanism::post`].
pub struct PostOperation<'m, T, R> {
    mech: &'m PostAckMechanism<T>,
    node: PostNode<T>,
    receiver: R,
    _pin: PhantomPinned,
}

impl<T, R: Receiver<Value = ()>> PostOperation<'_, T, R> {
    /// Completion from the final acknowledgement (or retirement).
    unsafe fn acked(node: NonNull<PostNode<T>>) {
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

impl<T, R: Receiver<Value = ()>> Operation for PostOperation<'_, T, R> {
    fn start_inline(self: Pin<&mut Self>) -> bool {
        // SAFETY: nothing is moved out of the pinned operation.
        let this = unsafe { self.get_unchecked_mut() };

        let mut woken_polls = {
            let mut inner = this.mech.inner.lock();

            this.node.seq.set(inner.post_seq);
            inner.post_seq += 1;

            if inner.active_agents == 0 {
                // No agent can be polling without being attached.
                assert!(
                    inner.poll_waiters.is_empty(),
                    "poll waiters on a mechanism with no agents"
                );
                drop(inner);
                this.receiver.set_value_inline(());
                return true;
            }

            this.node
                .acks_left
                .store(inner.active_agents, Ordering::Relaxed);
            this.node.complete.set(Some(Self::acked));
            // SAFETY: the operation is pinned and stays alive until the
            // last acknowledgement completes it.
            unsafe {
                inner.posts.push_back(NonNull::from(&this.node));
            }
            inner.poll_waiters.take()
        };

        // Wake every poller that was waiting for the next post, outside the
        // lock. Each of them was waiting for exactly this sequence number.
        while let Some(poll) = woken_polls.pop_front() {
            // SAFETY: detached under the lock; the poll operation is armed
            // and alive.
            let complete = unsafe { poll.as_ref() }
                .complete
                .get()
                .expect("queued poll without a completion");
            // SAFETY: as above.
            unsafe { complete(poll, NonNull::from(&this.node)) };
        }
        false
    }
}

// ############## PostAckHandle ##############

/// A view of one post, handed to one agent; derefs to the posted value.
///
/// Every handle must be [`ack`](PostAckHandle::ack)ed; dropping an unacked
/// handle is a contract violation.
#[derive(Debug)]
pub struct PostAckHandle<'m, T> {
    mech: &'m PostAckMechanism<T>,
    node: NonNull<PostNode<T>>,
    acked: bool,
}

// SAFETY: the handle only reads the post's value (shared) and drives the
// atomic countdown; list surgery happens under the mechanism lock.
unsafe impl<T: Send + Sync> Send for PostAckHandle<'_, T> {}
// SAFETY: as above.
unsafe impl<T: Send + Sync> Sync for PostAckHandle<'_, T> {}

impl<T> PostAckHandle<'_, T> {
    /// Acknowledges the post. The last acknowledgement unlinks the post and
    /// completes its operation.
    pub fn ack(mut self) {
        self.acked = true;

        // SAFETY: the node stays alive until the last acknowledgement has
        // delivered the post's completion, and we hold one outstanding ack.
        let node_ref = unsafe { self.node.as_ref() };
        let outstanding = node_ref.acks_left.fetch_sub(1, Ordering::AcqRel);
        assert!(outstanding >= 1, "post acknowledged more often than polled");
        if outstanding == 1 {
            {
                let mut inner = self.mech.inner.lock();
                // SAFETY: an incompletely acked post is a member of the
                // mechanism's list.
                unsafe {
                    inner.posts.remove(self.node);
                }
            }
            let complete = node_ref
                .complete
                .get()
                .expect("pending post without a completion");
            // SAFETY: the post's completion is the last access to the node.
            unsafe { complete(self.node) };
        }
    }
}

impl<T> Deref for PostAckHandle<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the value was stored before the node was published and is
        // not touched again until the post completes, which cannot happen
        // before this handle acks.
        unsafe { &*self.node.as_ref().value.get() }
            .as_ref()
            .expect("post handle without a stored value")
    }
}

impl<T> Drop for PostAckHandle<'_, T> {
    fn drop(&mut self) {
        assert!(self.acked, "post-ack handle dropped without acknowledging");
    }
}

// ############## PostAckAgent ##############

/// One consumer of a [`PostAckMechanism`]'s broadcasts.
///
/// An agent must be [`attach`](Self::attach)ed before polling and
/// [`detach`](Self::detach)ed before being dropped.
#[derive(Debug)]
pub struct PostAckAgent<'m, T> {
    mech: Option<&'m PostAckMechanism<T>>,
    poll_seq: u64,
}

impl<'m, T> PostAckAgent<'m, T> {
    /// Creates a detached agent.
    #[must_use]
    pub fn new() -> Self {
        Self {
            mech: None,
            poll_seq: 0,
        }
    }

    /// Attaches to `mech`; the agent starts observing at the next post.
    pub fn attach(&mut self, mech: &'m PostAckMechanism<T>) {
        assert!(self.mech.is_none(), "agent attached twice");
        self.mech = Some(mech);

        let mut inner = mech.inner.lock();
        self.poll_seq = inner.post_seq;
        inner.active_agents += 1;
    }

    /// Detaches from the mechanism, acknowledging every post the agent has
    /// not yet observed.
    pub fn detach(&mut self) {
        let mech = self.mech.take().expect("detach of a detached agent");

        let mut inner = mech.inner.lock();
        inner.active_agents -= 1;
        let retire_to = inner.post_seq;

        while self.poll_seq < retire_to {
            let seq = self.poll_seq;
            let mut found = None;
            // SAFETY: the lock is held; nothing is unlinked during the
            // scan.
            unsafe {
                inner.posts.for_each(|node| {
                    // SAFETY: every queued node belongs to an armed post.
                    if unsafe { node.as_ref() }.seq.get() == seq {
                        found = Some(node);
                    }
                });
            }
            let node = found.expect("detaching agent's cursor names no pending post");
            self.poll_seq += 1;

            // SAFETY: the node is alive until its completion below.
            let outstanding = unsafe { node.as_ref() }
                .acks_left
                .fetch_sub(1, Ordering::AcqRel);
            assert!(outstanding >= 1, "retired post with no outstanding acks");
            if outstanding == 1 {
                // SAFETY: the node is a member of the list.
                unsafe {
                    inner.posts.remove(node);
                }
                // Run the completion without the lock.
                drop(inner);
                // SAFETY: detached under the lock; the completion is the
                // last access.
                let complete = unsafe { node.as_ref() }
                    .complete
                    .get()
                    .expect("pending post without a completion");
                // SAFETY: as above.
                unsafe { complete(node) };

                if self.poll_seq >= retire_to {
                    return;
                }
                inner = mech.inner.lock();
            }
        }
    }

    /// Returns a sender that completes with `Some(handle)` for the next
    /// post after the agent's cursor, or with `None` if `token` is
    /// cancelled first.
    ///
    /// Completes inline if a post is already pending at the cursor. The
    /// borrow of the agent lasts until the poll completes, so an agent runs
    /// one poll at a time.
    pub fn poll(&mut self, token: CancellationToken) -> PollSender<'_, 'm, T> {
        assert!(self.mech.is_some(), "poll on a detached agent");
        PollSender { agent: self, token }
    }
}

impl<T> Default for PostAckAgent<'_, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for PostAckAgent<'_, T> {
    fn drop(&mut self) {
        assert!(self.mech.is_none(), "agent dropped while attached");
    }
}

/// Sender of [`PostAckAgent::poll`].
#[must_use = "senders do nothing unless connected and started"]
pub struct PollSender<'a, 'm, T> {
    agent: &'a mut PostAckAgent<'m, T>,
    token: CancellationToken,
}

impl<'a, 'm, T> Sender for PollSender<'a, 'm, T> {
    type Value = Option<PostAckHandle<'m, T>>;
    type Operation<R: Receiver<Value = Option<PostAckHandle<'m, T>>>> =
        PollOperation<'a, 'm, T, R>;

    fn connect<R: Receiver<Value = Option<PostAckHandle<'m, T>>>>(
        self,
        receiver: R,
    ) -> Self::Operation<R> {
        PollOperation {
            agent: self.agent,
            token: self.token,
            node: PollNode {
                links: Links::new(),
                complete: Cell::new(None),
            },
            observer: CancellationObserver::new(),
            receiver,
            _pin: PhantomPinned,
        }
    }
}

/// Operation state of [`PostAckAgent::poll`].
pub struct PollOperation<'a, 'm, T, R> {
    agent: &'a mut PostAckAgent<'m, T>,
    token: CancellationToken,
    node: PollNode<T>,
    observer: CancellationObserver,
    receiver: R,
    _pin: PhantomPinned,
}

impl<'m, T, R: Receiver<Value = Option<PostAckHandle<'m, T>>>> PollOperation<'_, 'm, T, R> {
    fn handle(mech: &'m PostAckMechanism<T>, node: NonNull<PostNode<T>>) -> PostAckHandle<'m, T> {
        PostAckHandle {
            mech,
            node,
            acked: false,
        }
    }

    /// Completion from a post's wake of pending pollers.
    unsafe fn posted(poll: NonNull<PollNode<T>>, post: NonNull<PostNode<T>>) {
        // SAFETY: the poll node is embedded in an alive, pinned operation.
        let this = unsafe {
            poll.byte_sub(mem::offset_of!(Self, node))
                .cast::<Self>()
                .as_ptr()
        };
        // SAFETY: the operation is alive; if the observer cannot be reset
        // the raced cancellation handler owns the completion (and rolls the
        // cursor back so the post is not lost).
        unsafe {
            if (*this).observer.try_reset() {
                let mech = (*this)
                    .agent
                    .mech
                    .expect("poll completed on a detached agent");
                let handle = Self::handle(mech, post);
                (*this).receiver.set_value_noinline(Some(handle));
            }
        }
    }

    /// Completion from the cancellation handler.
    unsafe fn on_cancel(target: NonNull<()>) {
        let this = target.cast::<Self>().as_ptr();
        {
            // SAFETY: the operation is alive while armed.
            let mech = unsafe { (*this).agent.mech.expect("cancelled poll without a mechanism") };
            let mut inner = mech.inner.lock();
            // SAFETY: as above.
            let node = unsafe { &(*this).node };
            if node.links().is_linked() {
                // SAFETY: a linked node is a member of the poll list.
                unsafe {
                    inner.poll_waiters.remove(NonNull::from(node));
                }
            }
            // Roll the cursor back so the sequence this poll claimed is
            // observed by the agent's next poll (or by detach).
            //
            // SAFETY: cursor updates are serialized by the mechanism lock.
            unsafe {
                (*this).agent.poll_seq -= 1;
            }
        }
        // SAFETY: delivering the completion is the last access.
        unsafe { (*this).receiver.set_value_noinline(None) };
    }
}

impl<'m, T, R: Receiver<Value = Option<PostAckHandle<'m, T>>>> Operation
    for PollOperation<'_, 'm, T, R>
{
    fn start_inline(self: Pin<&mut Self>) -> bool {
        // SAFETY: nothing is moved out of the pinned operation.
        let this = unsafe { self.get_unchecked_mut() };
        let target = NonNull::from(&mut *this).cast();
        let mech = this.agent.mech.expect("poll on a detached agent");

        let immediate;
        {
            let mut inner = mech.inner.lock();
            let seq = this.agent.poll_seq;

            if inner.post_seq > seq {
                this.agent.poll_seq = seq + 1;

                let mut found = None;
                // SAFETY: the lock is held; nothing is unlinked during the
                // scan.
                unsafe {
                    inner.posts.for_each(|node| {
                        // SAFETY: every queued node belongs to an armed
                        // post.
                        if unsafe { node.as_ref() }.seq.get() == seq {
                            found = Some(node);
                        }
                    });
                }
                let node = found.expect("agent cursor names no pending post");
                immediate = Some(Self::handle(mech, node));
            } else {
                // SAFETY: the operation is pinned and stays alive while
                // armed; the handler's last access is the completion.
                let armed = unsafe { this.observer.try_set(&this.token, target, Self::on_cancel) };
                if armed {
                    this.node.complete.set(Some(Self::posted));
                    this.agent.poll_seq = seq + 1;
                    // SAFETY: as above.
                    unsafe {
                        inner.poll_waiters.push_back(NonNull::from(&this.node));
                    }
                    return false;
                }
                immediate = None;
            }
        }

        this.receiver.set_value_inline(immediate);
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::OnceLock;
    use std::sync::atomic::{AtomicU32, Ordering};

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::bridge::{SenderExt, from_future};
    use crate::cancellation::CancellationEvent;
    use crate::execution::{detach, run};

    fn consumer(
        mech: &'static PostAckMechanism<u32>,
        ok1: &'static AtomicU32,
        ok2: &'static AtomicU32,
    ) {
        detach(from_future(async move {
            let mut agent = PostAckAgent::new();
            agent.attach(mech);

            let handle = agent
                .poll(CancellationToken::none())
                .into_future()
                .await
                .expect("uncancelled poll completed empty");
            if *handle == 1 {
                ok1.fetch_add(1, Ordering::SeqCst);
            }
            handle.ack();

            let handle = agent
                .poll(CancellationToken::none())
                .into_future()
                .await
                .expect("uncancelled poll completed empty");
            if *handle == 2 {
                ok2.fetch_add(1, Ordering::SeqCst);
            }
            handle.ack();

            agent.detach();
        }));
    }

    #[test]
    fn broadcast_reaches_every_agent() {
        static MECH: OnceLock<PostAckMechanism<u32>> = OnceLock::new();
        static OK1: AtomicU32 = AtomicU32::new(0);
        static OK2: AtomicU32 = AtomicU32::new(0);

        let mech = MECH.get_or_init(PostAckMechanism::new);

        consumer(mech, &OK1, &OK2);
        consumer(mech, &OK1, &OK2);
        consumer(mech, &OK1, &OK2);

        run(from_future(async {
            mech.post(1).into_future().await;
            mech.post(2).into_future().await;
        }));

        assert_eq!(OK1.load(Ordering::SeqCst), 3);
        assert_eq!(OK2.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn post_with_no_agents_completes_inline() {
        let mech = PostAckMechanism::new();
        run(mech.post(7));
    }

    #[test]
    fn detach_acknowledges_outstanding_posts() {
        static MECH: OnceLock<PostAckMechanism<u32>> = OnceLock::new();
        static POSTED: AtomicU32 = AtomicU32::new(0);

        let mech = MECH.get_or_init(PostAckMechanism::new);

        let mut agent = PostAckAgent::new();
        agent.attach(mech);

        detach(crate::transform(mech.post(5), |()| {
            POSTED.fetch_add(1, Ordering::SeqCst);
        }));

        // The agent never polls; detaching must retire its pending ack.
        assert_eq!(POSTED.load(Ordering::SeqCst), 0);
        agent.detach();
        assert_eq!(POSTED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelled_poll_completes_empty_and_keeps_the_post() {
        static MECH: OnceLock<PostAckMechanism<u32>> = OnceLock::new();
        let mech = MECH.get_or_init(PostAckMechanism::new);

        let cancel = CancellationEvent::new();
        cancel.cancel();

        let mut agent = PostAckAgent::new();
        agent.attach(mech);

        assert!(run(agent.poll(cancel.token())).is_none());

        // The cursor did not advance: a later post is still observed.
        static SEEN: AtomicU32 = AtomicU32::new(0);
        detach(from_future(async {
            MECH.get().unwrap().post(9).into_future().await;
            SEEN.fetch_add(1, Ordering::SeqCst);
        }));

        let handle = run(agent.poll(CancellationToken::none())).expect("post is pending");
        assert_eq!(*handle, 9);
        handle.ack();
        assert_eq!(SEEN.load(Ordering::SeqCst), 1);

        agent.detach();
    }

    #[test]
    fn values_are_shared_not_moved() {
        static MECH: OnceLock<PostAckMechanism<Box<u32>>> = OnceLock::new();
        let mech = MECH.get_or_init(PostAckMechanism::new);

        let mut agent = PostAckAgent::new();
        agent.attach(mech);

        detach(mech.post(Box::new(12)));

        let handle = run(agent.poll(CancellationToken::none())).expect("post is pending");
        assert_eq!(**handle, 12);
        handle.ack();

        agent.detach();
    }

    #[test]
    fn thread_safe_surface() {
        assert_impl_all!(PostAckMechanism<u32>: Send, Sync);
    }
}
