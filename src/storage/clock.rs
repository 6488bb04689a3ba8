//! Wall-clock time for expiry decisions.
//!
//! Deadlines are absolute Unix milliseconds. Every expiry check in the engine
//! reads the time through [`now_ms`], which normally returns the system clock.
//! [`at`] pins the clock for the current thread while a closure runs, so a
//! mutation can be applied, logged, and later replayed against the same
//! instant.

use std::cell::Cell;
use std::time::{SystemTime, UNIX_EPOCH};

thread_local! {
    static PINNED: Cell<Option<u64>> = const { Cell::new(None) };
}

/// Milliseconds since the Unix epoch, or the pinned time inside [`at`].
pub fn now_ms() -> u64 {
    PINNED.with(Cell::get).unwrap_or_else(system_ms)
}

/// The system clock, ignoring any pinned time.
pub fn system_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Runs `f` with [`now_ms`] fixed at `now` on this thread.
///
/// Nests; the previous value comes back when `f` returns or unwinds.
pub fn at<T>(now: u64, f: impl FnOnce() -> T) -> T {
    struct Restore(Option<u64>);

    impl Drop for Restore {
        fn drop(&mut self) {
            PINNED.with(|pinned| pinned.set(self.0));
        }
    }

    let _restore = Restore(PINNED.with(|pinned| pinned.replace(Some(now))));
    f()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unpinned_follows_system_clock() {
        let before = system_ms();
        let now = now_ms();
        assert!(now >= before);
        assert!(now - before < 1_000);
    }

    #[test]
    fn test_pinned_time_nests_and_restores() {
        at(5_000, || {
            assert_eq!(now_ms(), 5_000);
            at(9_000, || assert_eq!(now_ms(), 9_000));
            assert_eq!(now_ms(), 5_000);
        });
        assert!(now_ms() > 9_000);
    }

    #[test]
    fn test_pin_is_per_thread() {
        at(1, || {
            let other = std::thread::spawn(now_ms).join().unwrap();
            assert!(other > 1);
            assert_eq!(now_ms(), 1);
        });
    }
}
