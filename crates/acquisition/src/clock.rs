use std::fmt;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Microseconds since an arbitrary but fixed epoch. Used both to schedule
/// measurements and to tag samples and results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(i64);

impl Timestamp {
    #[must_use]
    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    #[must_use]
    pub const fn as_micros(self) -> i64 {
        self.0
    }

    #[must_use]
    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// Time left until `later`, zero if `later` already passed.
    #[must_use]
    pub fn until(self, later: Timestamp) -> Duration {
        let micros = later.0.saturating_sub(self.0).max(0);
        Duration::from_micros(micros.unsigned_abs())
    }

    #[must_use]
    pub fn saturating_add(self, duration: Duration) -> Self {
        let micros = i64::try_from(duration.as_micros()).unwrap_or(i64::MAX);
        Self(self.0.saturating_add(micros))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}s", self.as_secs_f64())
    }
}

pub trait Clock {
    /// Never goes backwards within one process.
    fn now(&self) -> Timestamp;
    /// Blocks for at least `duration` unless shutdown was requested.
    fn sleep(&self, duration: Duration);
}

impl<T: Clock + ?Sized> Clock for &T {
    fn now(&self) -> Timestamp {
        (**self).now()
    }
    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration)
    }
}

#[derive(Debug, Default)]
struct StopInner {
    requested: Mutex<bool>,
    wake: Condvar,
}

/// Requests the acquisition loop to stop. Wakes a pending
/// [`MonotonicClock::sleep`] so shutdown does not wait out the interval.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<StopInner>);

impl StopSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        let mut requested = self
            .0
            .requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *requested = true;
        self.0.wake.notify_all();
    }

    #[must_use]
    pub fn is_requested(&self) -> bool {
        *self
            .0
            .requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns true if the wait ended because a stop was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let requested = self
            .0
            .requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (requested, _) = self
            .0
            .wake
            .wait_timeout_while(requested, timeout, |requested| !*requested)
            .unwrap_or_else(PoisonError::into_inner);
        *requested
    }
}

/// Monotonic clock anchored to the wall clock at creation so timestamps
/// read as unix time while never jumping with NTP adjustments.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    started: Instant,
    anchor: i64,
    stop: StopSignal,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::with_stop(StopSignal::new())
    }
}

impl MonotonicClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_stop(stop: StopSignal) -> Self {
        Self {
            started: Instant::now(),
            anchor: jiff::Timestamp::now().as_microsecond(),
            stop,
        }
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Timestamp {
        let elapsed = i64::try_from(self.started.elapsed().as_micros()).unwrap_or(i64::MAX);
        Timestamp(self.anchor.saturating_add(elapsed))
    }

    fn sleep(&self, duration: Duration) {
        if self.stop.wait_timeout(duration) {
            tracing::debug!("sleep cut short, stop requested");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn until_floors_at_zero() {
        let now = Timestamp::from_micros(5_000_000);
        assert_eq!(now.until(Timestamp::from_micros(4_000_000)), Duration::ZERO);
        assert_eq!(
            now.until(Timestamp::from_micros(6_500_000)),
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn monotonic_never_decreases() {
        let clock = MonotonicClock::new();
        let mut last = clock.now();
        for _ in 0..1000 {
            let now = clock.now();
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn sleep_waits_at_least_duration() {
        let clock = MonotonicClock::new();
        let start = Instant::now();
        clock.sleep(Duration::from_millis(20));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn stop_interrupts_sleep() {
        let stop = StopSignal::new();
        let clock = MonotonicClock::with_stop(stop.clone());

        let waker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            stop.request();
        });

        let start = Instant::now();
        clock.sleep(Duration::from_secs(60));
        assert!(start.elapsed() < Duration::from_secs(10));
        waker.join().unwrap();
    }
}
