//! Wall-clock access for the background loops and HTTP handlers.
//!
//! Core scheduling logic never reads the time itself: callers fetch `now`
//! from a [`Clock`] once and pass it down.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::{Arc, Mutex};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests.
#[derive(Clone)]
pub struct FakeClock {
    current: Arc<Mutex<DateTime<Utc>>>,
}

impl FakeClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    /// Advance the clock by the given duration
    pub fn advance(&self, by: Duration) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        *current += by;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        // 2026-01-01T00:00:00Z keeps test arithmetic readable.
        Self::new(Utc.timestamp_opt(1_767_225_600, 0).single().unwrap_or_default())
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_advances_and_is_shared_between_clones() {
        let clock = FakeClock::default();
        let other = clock.clone();
        let start = clock.now();

        clock.advance(Duration::seconds(90));

        assert_eq!(other.now() - start, Duration::seconds(90));
    }

    #[test]
    fn fake_clock_set_overrides_current_time() {
        let clock = FakeClock::default();
        let target = Utc.timestamp_opt(2_000_000_000, 0).single().unwrap();
        clock.set(target);
        assert_eq!(clock.now(), target);
    }
}
