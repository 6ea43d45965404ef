//! Time source and cancellation.
//!
//! Workers never call `Utc::now()` or `thread::sleep` directly. They go through
//! [`Clock`], so tests can drive many poll cycles instantly with [`FakeClock`].

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use chrono::Utc;

/// Granularity of interruptible sleeps.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Shared stop flag. Cloning yields a handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

pub trait Clock: Send + Sync {
    /// Current time in Unix epoch seconds.
    fn now(&self) -> i64;

    /// Sleeps for `duration` or until `cancel` fires.
    ///
    /// Returns `false` if the sleep was cut short by cancellation.
    fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> bool;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        Utc::now().timestamp()
    }

    fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        let mut remaining = duration;
        while !remaining.is_zero() {
            if cancel.is_cancelled() {
                return false;
            }
            let slice = remaining.min(SLEEP_SLICE);
            thread::sleep(slice);
            remaining -= slice;
        }
        !cancel.is_cancelled()
    }
}

/// Virtual clock: `sleep` advances time instead of blocking.
#[derive(Debug, Clone)]
pub struct FakeClock {
    now: Arc<AtomicI64>,
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl FakeClock {
    pub fn new(start: i64) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(start)),
            sleeps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.now
            .fetch_add(duration.as_secs() as i64, Ordering::SeqCst);
    }

    /// Every sleep requested so far.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }

    fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        self.sleeps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(duration);
        self.advance(duration);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_shared_between_clones() {
        let token = CancellationToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn test_fake_clock_sleep_advances() {
        let clock = FakeClock::new(1_000);
        let token = CancellationToken::new();

        assert!(clock.sleep(Duration::from_secs(5), &token));
        assert!(clock.sleep(Duration::from_secs(5), &token));
        assert_eq!(clock.now(), 1_010);
        assert_eq!(clock.sleeps().len(), 2);

        token.cancel();
        assert!(!clock.sleep(Duration::from_secs(5), &token));
        assert_eq!(clock.now(), 1_010);
    }

    #[test]
    fn test_system_clock_sleep_interrupted() {
        let clock = SystemClock;
        let token = CancellationToken::new();
        token.cancel();

        let start = std::time::Instant::now();
        assert!(!clock.sleep(Duration::from_secs(10), &token));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_system_clock_now() {
        let now = SystemClock.now();
        // 2020-01-01
        assert!(now > 1_577_836_800);
    }
}
