//! A futex-shaped wait/notify cell.
//!
//! The runtime has no raw `atomic.wait`, so the cell pairs the word with a
//! mutex and condvar: stores are sequentially consistent with respect to
//! waiters, and every other header field is ordered by the store that
//! releases the lock word.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Why a wait returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The word changed away from the expected value while waiting.
    Woken,
    /// The word already differed from the expected value; no wait
    /// happened. Carries the observed value.
    NotEqual(u32),
    /// The timeout expired with the word still at the expected value.
    TimedOut,
}

/// A 32-bit word with blocking wait and notify.
pub struct Futex {
    state: Mutex<u32>,
    cond: Condvar,
}

impl Futex {
    /// A cell holding `initial`.
    pub fn new(initial: u32) -> Futex {
        Futex {
            state: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    /// The current value.
    pub fn load(&self) -> u32 {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stores without waking waiters.
    pub fn store(&self, value: u32) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = value;
    }

    /// Stores and wakes all waiters.
    pub fn store_notify(&self, value: u32) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = value;
        self.cond.notify_all();
    }

    /// Blocks while the word equals `expected`, up to `timeout`.
    pub fn wait(&self, expected: u32, timeout: Option<Duration>) -> WaitOutcome {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != expected {
            return WaitOutcome::NotEqual(*state);
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        while *state == expected {
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return WaitOutcome::TimedOut;
                    }
                    let (guard, result) = self
                        .cond
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|e| e.into_inner());
                    state = guard;
                    if result.timed_out() && *state == expected {
                        return WaitOutcome::TimedOut;
                    }
                }
                None => {
                    state = self.cond.wait(state).unwrap_or_else(|e| e.into_inner());
                }
            }
        }
        WaitOutcome::Woken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn not_equal_returns_immediately() {
        let futex = Futex::new(1);
        assert_eq!(futex.wait(0, None), WaitOutcome::NotEqual(1));
    }

    #[test]
    fn timeout_expires() {
        let futex = Futex::new(0);
        assert_eq!(
            futex.wait(0, Some(Duration::from_millis(20))),
            WaitOutcome::TimedOut
        );
    }

    #[test]
    fn store_notify_wakes_a_waiter() {
        let futex = Arc::new(Futex::new(0));
        let waiter = {
            let futex = futex.clone();
            std::thread::spawn(move || futex.wait(0, Some(Duration::from_secs(5))))
        };
        // Give the waiter a moment to park.
        std::thread::sleep(Duration::from_millis(10));
        futex.store_notify(1);
        assert_eq!(waiter.join().unwrap(), WaitOutcome::Woken);
        assert_eq!(futex.load(), 1);
    }
}
