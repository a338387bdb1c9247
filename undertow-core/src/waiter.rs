//! Wake primitive shared by transports and the tick scheduler.
//!
//! An atomic flag carries the signal on the fast path; the mutex/condvar pair
//! is only touched when a waiter actually sleeps.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// One-shot, re-armable event notification.
///
/// `event_occurred` may be called from any thread. A signal raised while no
/// one is waiting is retained until the next `wait_timeout` consumes it.
#[derive(Debug, Default)]
pub struct EventWaiter {
    signalled: AtomicBool,
    sleeping: Mutex<bool>,
    condvar: Condvar,
}

impl EventWaiter {
    /// Creates an unsignalled waiter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the signal and wakes a sleeping waiter, if any.
    pub fn event_occurred(&self) {
        self.signalled.store(true, Ordering::Release);

        let sleeping = self.sleeping.lock();
        if *sleeping {
            self.condvar.notify_one();
        }
    }

    /// Returns whether a signal is pending, without consuming it.
    pub fn is_signalled(&self) -> bool {
        self.signalled.load(Ordering::Acquire)
    }

    /// Blocks until signalled or until `timeout` elapses.
    ///
    /// Returns `true` if a signal was consumed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.signalled.swap(false, Ordering::Acquire) {
            return true;
        }

        let mut sleeping = self.sleeping.lock();

        // Re-check under the lock: event_occurred takes the same lock before notifying.
        if self.signalled.swap(false, Ordering::Acquire) {
            return true;
        }

        *sleeping = true;
        let _ = self.condvar.wait_for(&mut sleeping, timeout);
        *sleeping = false;

        self.signalled.swap(false, Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    use super::*;

    #[test]
    fn test_signal_before_wait_is_retained() {
        let waiter = EventWaiter::new();
        waiter.event_occurred();

        assert!(waiter.is_signalled());
        assert!(waiter.wait_timeout(Duration::from_millis(1)));
        assert!(!waiter.is_signalled());
    }

    #[test]
    fn test_wait_times_out_without_signal() {
        let waiter = EventWaiter::new();
        let start = Instant::now();

        assert!(!waiter.wait_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_cross_thread_wake() {
        let waiter = Arc::new(EventWaiter::new());
        let waiter_clone = Arc::clone(&waiter);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            waiter_clone.event_occurred();
        });

        assert!(waiter.wait_timeout(Duration::from_secs(5)));
        handle.join().unwrap();
    }
}
