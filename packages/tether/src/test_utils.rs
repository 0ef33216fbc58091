//! Shared helpers for this crate's tests.

#[cfg(test)]
use std::process;
#[cfg(test)]
use std::sync::Arc;
#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(test)]
use std::thread;
#[cfg(test)]
use std::time::Duration;

/// How long a test may run before the sentinel gives up on it.
#[cfg(test)]
const WATCHDOG_LIMIT: Duration = Duration::from_secs(10);

/// Disarms the sentinel when dropped, so a panicking test disarms it too.
#[cfg(test)]
struct Disarm(Arc<AtomicBool>);

#[cfg(test)]
impl Drop for Disarm {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Runs `test_fn` on the calling thread under a deadline.
///
/// Most of this crate's blocking tests park the calling thread until some
/// other completion path wakes it; a bug in that path would hang the test
/// run forever. The sentinel thread spawned here polls a disarm flag and
/// aborts the process with a diagnostic if the test is still running when
/// [`WATCHDOG_LIMIT`] expires. Panics propagate normally: unwinding drops
/// the disarm guard, which also stands the sentinel down.
#[cfg(test)]
pub(crate) fn with_watchdog<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R,
{
    let finished = Arc::new(AtomicBool::new(false));

    let sentinel = {
        let finished = Arc::clone(&finished);
        thread::spawn(move || {
            let tick = Duration::from_millis(100);
            let mut remaining = WATCHDOG_LIMIT;
            while !finished.load(Ordering::Acquire) {
                if remaining.is_zero() {
                    eprintln!(
                        "watchdog: test still running after {WATCHDOG_LIMIT:?} - \
                         a completion never arrived; aborting"
                    );
                    process::abort();
                }
                thread::sleep(tick);
                remaining = remaining.saturating_sub(tick);
            }
        })
    };

    let disarm = Disarm(Arc::clone(&finished));
    let result = test_fn();
    drop(disarm);

    sentinel.join().expect("watchdog sentinel panicked");
    result
}
