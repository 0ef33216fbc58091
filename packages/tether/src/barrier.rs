//! A reusable phase barrier.
//!
//! Participants arrive; when the arrival count matches the expected count
//! the barrier advances to the next phase and wakes the phase's waiters.
//! Arrival hands back a token naming the phase it arrived in, which the
//! waiter presents to [`Barrier::async_wait`].

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::algorithm::Transform;
use crate::recurring_event::{RecurringEvent, WaitIfSender, WaitOutcome};

/// Names the phase a participant arrived in.
pub type ArrivalToken = u64;

#[derive(Debug)]
struct Counts {
    /// Expected number of arrivals for the current phase.
    expected: i64,
    /// Arrivals so far; reset to zero when the phase advances.
    arrived: i64,
}

/// A reusable barrier for a dynamic set of participants.
#[derive(Debug)]
pub struct Barrier {
    counts: Mutex<Counts>,
    /// Phase number; write-protected by `counts`, readable without it.
    phase: AtomicU64,
    event: RecurringEvent,
}

impl Barrier {
    /// Creates a barrier expecting `expected` arrivals per phase.
    #[must_use]
    pub fn new(expected: i64) -> Self {
        assert!(expected >= 0, "barrier with a negative arrival count");
        Self {
            counts: Mutex::new(Counts {
                expected,
                arrived: 0,
            }),
            phase: AtomicU64::new(0),
            event: RecurringEvent::new(),
        }
    }

    /// Registers `n` arrivals for the current phase.
    pub fn arrive(&self, n: i64) -> ArrivalToken {
        self.advance(n, 0)
    }

    /// Registers `n` arrivals and adds `n` expected participants to every
    /// later phase.
    pub fn arrive_and_join(&self, n: i64) -> ArrivalToken {
        self.advance(n, n)
    }

    /// Removes `n` expected participants without arriving.
    pub fn arrive_and_drop(&self, n: i64) -> ArrivalToken {
        self.advance(0, -n)
    }

    /// Returns a sender that completes once the phase named by `token` is
    /// over (immediately, if it already is).
    pub fn async_wait(
        &self,
        token: ArrivalToken,
    ) -> Transform<WaitIfSender<'_, impl FnOnce() -> bool>, fn(WaitOutcome) -> bool, bool> {
        self.event
            .async_wait_if(move || self.phase.load(Ordering::Relaxed) == token)
    }

    fn advance(&self, arrivals: i64, joined: i64) -> ArrivalToken {
        let phase;
        let advanced;
        {
            let mut counts = self.counts.lock();

            phase = self.phase.load(Ordering::Relaxed);
            counts.expected += joined;
            counts.arrived += arrivals;
            assert!(counts.expected >= 0, "barrier dropped below zero members");

            if counts.arrived == counts.expected {
                self.phase.store(phase + 1, Ordering::Relaxed);
                counts.arrived = 0;
                advanced = true;
            } else {
                assert!(
                    counts.arrived < counts.expected,
                    "barrier arrivals exceed the expected count"
                );
                advanced = false;
            }
        }
        if advanced {
            self.event.raise();
        }
        phase
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;
    use crate::execution::run;
    use crate::test_utils::with_watchdog;

    #[test]
    fn single_participant_never_blocks() {
        let barrier = Barrier::new(1);
        let token = barrier.arrive(1);
        assert!(!run(barrier.async_wait(token)));
    }

    #[test]
    fn wait_on_a_finished_phase_completes_immediately() {
        let barrier = Barrier::new(2);
        let token = barrier.arrive(1);
        barrier.arrive(1);
        // The phase advanced; the predicate fails and the wait never
        // enqueues.
        assert!(!run(barrier.async_wait(token)));
    }

    #[test]
    fn two_threads_meet_at_the_barrier() {
        with_watchdog(|| {
            static BARRIER: std::sync::OnceLock<Barrier> = std::sync::OnceLock::new();
            static MET: AtomicU32 = AtomicU32::new(0);

            let barrier = BARRIER.get_or_init(|| Barrier::new(2));

            let other = std::thread::spawn(|| {
                let barrier = BARRIER.get().unwrap();
                std::thread::sleep(std::time::Duration::from_millis(10));
                let token = barrier.arrive(1);
                MET.fetch_add(1, Ordering::SeqCst);
                run(barrier.async_wait(token));
            });

            let token = barrier.arrive(1);
            run(barrier.async_wait(token));
            MET.fetch_add(1, Ordering::SeqCst);

            other.join().unwrap();
            assert_eq!(MET.load(Ordering::SeqCst), 2);
        });
    }

    #[test]
    fn dropping_a_member_advances_a_full_phase() {
        let barrier = Barrier::new(2);
        let token = barrier.arrive(1);
        // The second participant leaves instead of arriving; the phase
        // completes with the remaining arrivals.
        barrier.arrive_and_drop(1);
        assert!(!run(barrier.async_wait(token)));
    }
}
