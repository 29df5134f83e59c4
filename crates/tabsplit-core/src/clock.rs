//! Time sources for record timestamps.
//!
//! Records carry `createdAt`/`updatedAt` instants at millisecond precision.
//! `MonotonicClock` guarantees that every reading is strictly later than the
//! previous one, so an update issued in the same millisecond as a create
//! still yields `updatedAt > createdAt`, and createdAt ordering is total.

use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

/// A source of the current UTC instant.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
///
/// Used by tests that need records of a specific age without sleeping.
#[derive(Debug, Clone)]
pub struct ManualClock {
    current_ms: Arc<AtomicI64>,
}

impl ManualClock {
    /// Create a clock frozen at the given instant.
    pub fn at(instant: DateTime<Utc>) -> Self {
        Self {
            current_ms: Arc::new(AtomicI64::new(instant.timestamp_millis())),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        self.current_ms
            .fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }

    /// Jump to an absolute instant. Moving backwards is allowed here;
    /// `MonotonicClock` still never reports an earlier time.
    pub fn set(&self, instant: DateTime<Utc>) {
        self.current_ms
            .store(instant.timestamp_millis(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        from_millis(self.current_ms.load(Ordering::SeqCst))
    }
}

/// Wraps another clock and makes successive readings strictly increasing.
#[derive(Debug)]
pub struct MonotonicClock {
    inner: Arc<dyn Clock>,
    last_ms: AtomicI64,
}

impl MonotonicClock {
    pub fn new(inner: Arc<dyn Clock>) -> Self {
        Self {
            inner,
            last_ms: AtomicI64::new(i64::MIN),
        }
    }

    /// Current instant, at least one millisecond after the previous reading.
    pub fn now(&self) -> DateTime<Utc> {
        let wall = self.inner.now().timestamp_millis();
        let mut last = self.last_ms.load(Ordering::SeqCst);
        loop {
            let next = if wall > last { wall } else { last + 1 };
            match self
                .last_ms
                .compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return from_millis(next),
                Err(observed) => last = observed,
            }
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let start = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let clock = ManualClock::at(start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::days(2));
        assert_eq!(clock.now(), start + Duration::days(2));
    }

    #[test]
    fn test_monotonic_clock_strictly_increases_on_frozen_source() {
        let start = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let clock = MonotonicClock::new(Arc::new(ManualClock::at(start)));

        let a = clock.now();
        let b = clock.now();
        let c = clock.now();
        assert_eq!(a, start);
        assert!(b > a);
        assert!(c > b);
    }

    #[test]
    fn test_monotonic_clock_ignores_backwards_jumps() {
        let start = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let manual = ManualClock::at(start);
        let clock = MonotonicClock::new(Arc::new(manual.clone()));

        let first = clock.now();
        manual.set(start - Duration::hours(1));
        assert!(clock.now() > first);
    }

    #[test]
    fn test_monotonic_clock_follows_source_forward() {
        let start = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let manual = ManualClock::at(start);
        let clock = MonotonicClock::new(Arc::new(manual.clone()));

        clock.now();
        manual.advance(Duration::days(40));
        assert_eq!(clock.now(), start + Duration::days(40));
    }
}
