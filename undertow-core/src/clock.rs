//! Monotonic time sources for the tick scheduler and transports.
//!
//! All engine timestamps are milliseconds on a monotonic timeline. A clock can
//! also act as a periodic tick generator: subscribers are invoked with the
//! current time whenever the clock steps, and are dropped once they return
//! false.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Callback invoked with the monotonic time of each clock step.
///
/// Returns whether the consumer stays subscribed.
pub type TickConsumer = Box<dyn Fn(u64) -> bool + Send + Sync>;

/// Monotonic, subscribable time source.
pub trait ClockSource: Send + Sync {
    /// Returns the current monotonic time in milliseconds.
    fn monotonic_millis(&self) -> u64;

    /// Registers a consumer notified on every clock step.
    fn subscribe(&self, consumer: TickConsumer);
}

/// Wall-clock backed monotonic clock.
///
/// Time starts at an arbitrary non-zero offset so that callers can use zero
/// as a "never" sentinel.
pub struct SystemClock {
    origin: Instant,
    consumers: Mutex<Vec<TickConsumer>>,
}

/// Offset added to every reading so the timeline never starts at zero.
const SYSTEM_CLOCK_BASE_MILLIS: u64 = 1_000_000;

impl SystemClock {
    /// Creates a clock without a ticker; subscribers are never invoked.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            origin: Instant::now(),
            consumers: Mutex::new(Vec::new()),
        })
    }

    /// Creates a clock whose subscribers fire every `tick_interval`.
    ///
    /// The ticker thread holds only a weak reference and exits once the last
    /// strong reference to the clock is dropped.
    ///
    /// # Errors
    ///
    /// - `std::io::Error` - If the ticker thread cannot be spawned
    pub fn with_ticker(tick_interval: Duration) -> std::io::Result<Arc<Self>> {
        let clock = Self::new();
        let weak: Weak<Self> = Arc::downgrade(&clock);

        thread::Builder::new()
            .name("undertow-clock".to_string())
            .spawn(move || {
                loop {
                    thread::sleep(tick_interval);
                    let Some(clock) = weak.upgrade() else {
                        break;
                    };
                    clock.fire();
                }
            })?;

        Ok(clock)
    }

    fn fire(&self) {
        let now = self.monotonic_millis();
        self.consumers.lock().retain(|consumer| consumer(now));
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.consumers.lock().len()
    }
}

impl ClockSource for SystemClock {
    fn monotonic_millis(&self) -> u64 {
        SYSTEM_CLOCK_BASE_MILLIS + self.origin.elapsed().as_millis() as u64
    }

    fn subscribe(&self, consumer: TickConsumer) {
        self.consumers.lock().push(consumer);
    }
}

/// Manually driven clock for deterministic tests and simulations.
///
/// Time only moves forward. Every change notifies subscribers.
pub struct ManualClock {
    now: AtomicU64,
    consumers: Mutex<Vec<TickConsumer>>,
}

impl ManualClock {
    /// Creates a clock reading `start_millis`.
    pub fn new(start_millis: u64) -> Arc<Self> {
        Arc::new(Self {
            now: AtomicU64::new(start_millis),
            consumers: Mutex::new(Vec::new()),
        })
    }

    /// Moves time forward by `duration` and notifies subscribers.
    pub fn advance(&self, duration: Duration) {
        let step = duration.as_millis() as u64;
        let now = self.now.fetch_add(step, Ordering::AcqRel) + step;
        self.notify(now);
    }

    /// Moves time forward to `millis`; earlier targets are ignored.
    pub fn set(&self, millis: u64) {
        let previous = self.now.fetch_max(millis, Ordering::AcqRel);
        if millis > previous {
            self.notify(millis);
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.consumers.lock().len()
    }

    fn notify(&self, now: u64) {
        self.consumers.lock().retain(|consumer| consumer(now));
    }
}

impl ClockSource for ManualClock {
    fn monotonic_millis(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }

    fn subscribe(&self, consumer: TickConsumer) {
        self.consumers.lock().push(consumer);
    }
}
